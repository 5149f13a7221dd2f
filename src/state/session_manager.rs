//! Session manager
//!
//! Owns the account pool, the unlocked identity and the one active
//! session. A supervisor task consumes session lifecycle events; events from
//! a session that has since been replaced are ignored by generation.

use flume::{Receiver, Sender};
use pgp::composed::SignedPublicKey;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::encryption::{
    decrypt_from, derive_unlock_key, is_armored_message, parse_public_key, unlock_identity, KeyPair,
    UnlockedIdentity,
};
use crate::error::{GatewayError, Result};
use crate::probe::{MailServerProbe, NetworkProbe, TransportProber};
use crate::services::account_service;
use crate::services::status_emit::{emit_connect, StatusNotifier, StatusUpdate};
use crate::session::{
    ChannelConnector, Fallback, Introduction, IntroductionMailer, Orchestrator, SessionEvent,
    SessionHandle, SessionParams, SessionState, SmtpIntroductionMailer, TaggedEvent,
};
use crate::store::{AccountPoolStore, FileAccountStore};
use crate::types::{
    AccountPool, AccountRecord, AccountSubmission, Command, CommandMessage, ConnectPhase,
    ProbeReport,
};

/// Collaborators and starting state for a [`SessionManager`]
pub struct ManagerDeps {
    pub config: AppConfig,
    /// Where to persist config changes; `None` keeps them in memory
    pub config_path: Option<PathBuf>,
    pub identity: Arc<UnlockedIdentity>,
    pub peer_key: Arc<SignedPublicKey>,
    pub store: Arc<dyn AccountPoolStore>,
    pub connector: Arc<dyn ChannelConnector>,
    pub mailer: Arc<dyn IntroductionMailer>,
    pub probe: Arc<dyn MailServerProbe>,
    pub notifier: Arc<dyn StatusNotifier>,
}

impl ManagerDeps {
    /// Unlock the stored identity with `passphrase` and wire the network
    /// collaborators. The account pool lives next to the config file.
    pub fn from_config(
        config: AppConfig,
        config_path: PathBuf,
        passphrase: &str,
        connector: Arc<dyn ChannelConnector>,
        notifier: Arc<dyn StatusNotifier>,
    ) -> Result<Self> {
        let unlock_key = derive_unlock_key(passphrase, &config.unlock)?;
        let keypair = config.keypair.as_ref().ok_or(GatewayError::NoKeyPair)?;
        let identity = Arc::new(unlock_identity(&keypair.private_key, &unlock_key)?);
        let peer_key = Arc::new(parse_public_key(&config.peer.read_public_key()?)?);
        info!(key_id = %keypair.public_key_id, peer = %config.peer.email, "Identity unlocked");

        let data_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
        let store = Arc::new(FileAccountStore::new(data_dir, identity.clone()));
        let mailer = Arc::new(SmtpIntroductionMailer::new(
            config.peer.email.clone(),
            config.session.probe_timeout(),
        ));

        Ok(Self {
            config,
            config_path: Some(config_path),
            identity,
            peer_key,
            store,
            connector,
            mailer,
            probe: Arc::new(NetworkProbe),
            notifier,
        })
    }
}

pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: RwLock<AppConfig>,
    config_path: Option<PathBuf>,
    identity: RwLock<Option<Arc<UnlockedIdentity>>>,
    peer_key: Arc<SignedPublicKey>,
    store: Arc<dyn AccountPoolStore>,
    connector: Arc<dyn ChannelConnector>,
    mailer: Arc<dyn IntroductionMailer>,
    prober: TransportProber,
    notifier: Arc<dyn StatusNotifier>,
    pool: RwLock<AccountPool>,
    session: RwLock<Option<SessionHandle>>,
    generation: AtomicU64,
    /// Whether the active session nudges the peer at its deadline. Carried
    /// over when the session is recreated.
    nudge_on_timeout: AtomicBool,
    events: Sender<TaggedEvent>,
}

impl SessionManager {
    /// Load the account pool and start the supervisor
    pub async fn start(deps: ManagerDeps) -> Result<Self> {
        let pool = deps.store.load()?;
        info!(accounts = pool.len(), "Starting session manager");

        let prober = TransportProber::from_config(deps.probe, &deps.config.session);
        let (events_tx, events_rx) = flume::unbounded();
        let inner = Arc::new(Inner {
            config: RwLock::new(deps.config),
            config_path: deps.config_path,
            identity: RwLock::new(Some(deps.identity)),
            peer_key: deps.peer_key,
            store: deps.store,
            connector: deps.connector,
            mailer: deps.mailer,
            prober,
            notifier: deps.notifier,
            pool: RwLock::new(pool),
            session: RwLock::new(None),
            generation: AtomicU64::new(0),
            nudge_on_timeout: AtomicBool::new(false),
            events: events_tx,
        });

        tokio::spawn(supervise(Arc::downgrade(&inner), events_rx));
        Ok(Self { inner })
    }

    pub async fn pool(&self) -> AccountPool {
        self.inner.pool.read().await.clone()
    }

    pub async fn session_state(&self) -> Option<SessionState> {
        self.inner.session.read().await.as_ref().map(|h| h.state())
    }

    pub async fn key_pair(&self) -> Option<KeyPair> {
        self.inner.config.read().await.keypair.clone()
    }

    /// Record and probe a submitted account, then connect through it when
    /// both legs pass
    pub async fn check_account(&self, submission: AccountSubmission) -> Result<ProbeReport> {
        let uuid = submission.uuid.clone();
        let report = account_service::check_account(
            &self.inner.pool,
            self.inner.store.as_ref(),
            &self.inner.prober,
            self.inner.notifier.as_ref(),
            submission,
        )
        .await?;

        if report.passed() {
            self.connect(Some(&uuid)).await?;
        }
        Ok(report)
    }

    /// Open the peer session through `uuid`, or through the first verified
    /// account. The first time an account is used the introduction is sent
    /// and the session waits for the peer without a fallback nudge.
    pub async fn connect(&self, uuid: Option<&str>) -> Result<()> {
        let inner = &self.inner;
        let identity = inner.identity().await?;
        let verified = inner.keypair_verified().await;

        let chosen = {
            let pool = inner.pool.read().await;
            account_service::choose_account(&pool, uuid)
        };
        let uuid = match chosen {
            Ok(uuid) => uuid,
            Err(e) => {
                emit_connect(inner.notifier.as_ref(), None, ConnectPhase::AwaitingConfirmation, verified, None);
                return Err(e);
            }
        };
        emit_connect(inner.notifier.as_ref(), Some(&uuid), ConnectPhase::Connecting, verified, None);

        {
            let mut config = inner.config.write().await;
            config.connect_account_uuid = Some(uuid.clone());
        }
        inner.save_config().await?;

        let record = {
            let mut pool = inner.pool.write().await;
            let record = pool
                .get_mut(&uuid)
                .ok_or_else(|| GatewayError::AccountNotFound(uuid.clone()))?;
            if record.prepare_for_connection() {
                debug!(uuid = %uuid, "Assigned channel folders");
            }
            let record = record.clone();
            inner.store.save(&pool)?;
            record
        };

        if record.send_to_peer {
            inner.start_session(record, true).await;
            return Ok(());
        }

        let fallback = inner.fallback_for(&record, &identity).await?;
        if let Err(e) = fallback.dispatch(&record, &inner.peer_key, &identity).await {
            let e = GatewayError::from(e);
            emit_connect(inner.notifier.as_ref(), Some(&uuid), ConnectPhase::Failed, verified, Some(e.error_code()));
            return Err(e);
        }

        let record = {
            let mut pool = inner.pool.write().await;
            if let Some(r) = pool.get_mut(&uuid) {
                r.send_to_peer = true;
            }
            inner.store.save(&pool)?;
            pool.get(&uuid).cloned().unwrap_or(record)
        };
        emit_connect(inner.notifier.as_ref(), Some(&uuid), ConnectPhase::AwaitingPeer, verified, None);
        inner.start_session(record, false).await;
        Ok(())
    }

    pub async fn request(&self, command: Command) -> Result<CommandMessage> {
        let handle = self.inner.current_handle().await?;
        Ok(handle.request(command).await?)
    }

    /// Re-validate the active session. True when the peer answered in time.
    pub async fn check_connect(&self) -> Result<bool> {
        let handle = self.inner.current_handle().await?;
        Ok(handle.check_connect().await?)
    }

    /// Forward a pasted activation message to the peer. A response carrying
    /// a re-certified public key replaces ours.
    pub async fn activate_with_armored_reply(&self, armored: &str) -> Result<CommandMessage> {
        if !is_armored_message(armored) {
            return Err(GatewayError::InvalidInput("not an armored message".to_string()));
        }
        let identity = self.inner.identity().await?;
        let plain = decrypt_from(armored, &self.inner.peer_key, &identity)?;
        let plain = String::from_utf8(plain)
            .map_err(|_| GatewayError::InvalidInput("activation is not text".to_string()))?;

        let response = self.request(Command::ActivePassword(Value::String(plain))).await?;
        if response.is_error() {
            warn!(error = ?response.error, "Activation refused by peer");
            return Ok(response);
        }

        if let Some(Value::String(encoded)) = response.args.first() {
            let summary = {
                let mut config = self.inner.config.write().await;
                let keypair = config.keypair.as_mut().ok_or(GatewayError::NoKeyPair)?;
                keypair.replace_public_key(encoded)?;
                keypair.summary()
            };
            self.inner.save_config().await?;
            self.inner.notifier.notify(StatusUpdate::KeyPair(Some(summary)));
        }
        Ok(response)
    }

    /// Remove an account that is not bound to the active session
    pub async fn delete_account(&self, uuid: &str) -> Result<()> {
        if let Some(handle) = self.inner.session.read().await.as_ref() {
            if handle.account_uuid() == uuid && handle.state().is_live() {
                return Err(crate::types::PoolError::InUse(uuid.to_string()).into());
            }
        }
        let mut pool = self.inner.pool.write().await;
        account_service::delete_account(&mut pool, self.inner.store.as_ref(), uuid)
    }

    /// Close the session and forget the identity and every account
    pub async fn reset_identity(&self) -> Result<()> {
        info!("Resetting identity");
        self.inner.close_session().await;
        {
            let mut pool = self.inner.pool.write().await;
            pool.clear();
            self.inner.store.save(&pool)?;
        }
        {
            let mut config = self.inner.config.write().await;
            config.reset_identity();
        }
        self.inner.save_config().await?;
        *self.inner.identity.write().await = None;
        self.inner.notifier.notify(StatusUpdate::KeyPair(None));
        Ok(())
    }

    pub async fn shutdown(&self) {
        info!("Session manager shutting down");
        self.inner.close_session().await;
    }

    #[cfg(test)]
    fn inject_event(&self, event: TaggedEvent) {
        let _ = self.inner.events.send(event);
    }
}

impl Inner {
    async fn identity(&self) -> Result<Arc<UnlockedIdentity>> {
        self.identity
            .read()
            .await
            .clone()
            .ok_or(GatewayError::IdentityLocked)
    }

    async fn keypair_verified(&self) -> bool {
        self.config
            .read()
            .await
            .keypair
            .as_ref()
            .is_some_and(|k| k.verified)
    }

    async fn current_handle(&self) -> Result<SessionHandle> {
        self.session
            .read()
            .await
            .clone()
            .ok_or(GatewayError::NoActiveSession)
    }

    async fn save_config(&self) -> Result<()> {
        if let Some(path) = &self.config_path {
            self.config.read().await.save(path)?;
        }
        Ok(())
    }

    async fn fallback_for(&self, record: &AccountRecord, identity: &UnlockedIdentity) -> Result<Fallback> {
        let config = self.config.read().await;
        let account = config.account.clone().unwrap_or_else(|| record.email.clone());
        Ok(Fallback {
            mailer: self.mailer.clone(),
            introduction: Introduction::new(
                &account,
                &config.version,
                record.clone(),
                identity.armored_public_key()?,
            ),
        })
    }

    /// Replace the active session with a new one for `record`
    async fn start_session(&self, record: AccountRecord, with_fallback: bool) {
        let identity = match self.identity().await {
            Ok(identity) => identity,
            Err(_) => {
                warn!(uuid = %record.uuid, "Identity locked, not starting session");
                return;
            }
        };
        let fallback = if with_fallback {
            match self.fallback_for(&record, &identity).await {
                Ok(fallback) => Some(fallback),
                Err(e) => {
                    warn!("Fallback unavailable: {}", e);
                    None
                }
            }
        } else {
            None
        };
        let keep_alive = self.config.read().await.session.keep_alive();

        let mut session = self.session.write().await;
        if let Some(old) = session.take() {
            old.shutdown().await;
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.nudge_on_timeout.store(with_fallback, Ordering::SeqCst);
        info!(uuid = %record.uuid, generation, with_fallback, "Starting session");
        let handle = Orchestrator::spawn(
            SessionParams {
                generation,
                account: record,
                identity,
                peer_key: self.peer_key.clone(),
                keep_alive,
                fallback,
            },
            self.connector.clone(),
            self.events.clone(),
        );
        *session = Some(handle);
    }

    async fn close_session(&self) {
        if let Some(handle) = self.session.write().await.take() {
            handle.shutdown().await;
        }
    }

    async fn is_current(&self, generation: u64) -> bool {
        self.session
            .read()
            .await
            .as_ref()
            .is_some_and(|h| h.generation() == generation)
    }

    async fn handle_event(self: &Arc<Self>, event: TaggedEvent) {
        if !self.is_current(event.generation).await {
            debug!(generation = event.generation, event = ?event.event, "Ignoring event from replaced session");
            return;
        }
        let generation = event.generation;
        let uuid = event.account_uuid;
        let verified = self.keypair_verified().await;

        match event.event {
            SessionEvent::Ready => {
                self.update_record(&uuid, |r| r.can_do_delete = false).await;
                emit_connect(self.notifier.as_ref(), Some(&uuid), ConnectPhase::Connected, verified, None);
            }
            SessionEvent::Degraded => {
                emit_connect(self.notifier.as_ref(), Some(&uuid), ConnectPhase::AwaitingPeer, verified, None);
            }
            SessionEvent::Disconnected => {
                let record = self.update_record(&uuid, |r| r.send_to_peer = false).await;
                emit_connect(self.notifier.as_ref(), Some(&uuid), ConnectPhase::Connecting, verified, None);
                if let Some(record) = record {
                    self.replace_if_current(generation, record).await;
                }
            }
            SessionEvent::Closed(code) => {
                emit_connect(self.notifier.as_ref(), Some(&uuid), ConnectPhase::Failed, verified, Some(code));
                let delay = self.config.read().await.session.reconnect_delay();
                let weak = Arc::downgrade(self);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let Some(inner) = weak.upgrade() else { return };
                    let record = inner.pool.read().await.get(&uuid).cloned();
                    match record {
                        Some(record) => inner.replace_if_current(generation, record).await,
                        None => warn!(uuid = %uuid, "Account gone, not reconnecting"),
                    }
                });
            }
        }
    }

    /// Recreate the session unless it was replaced or closed meanwhile. The
    /// new session keeps the fallback setting of the one it replaces.
    async fn replace_if_current(&self, generation: u64, record: AccountRecord) {
        if self.is_current(generation).await {
            let with_fallback = self.nudge_on_timeout.load(Ordering::SeqCst);
            self.start_session(record, with_fallback).await;
        } else {
            debug!(generation, "Session replaced meanwhile, not recreating");
        }
    }

    /// Apply `f` to a record and persist the pool
    async fn update_record(&self, uuid: &str, f: impl FnOnce(&mut AccountRecord)) -> Option<AccountRecord> {
        let mut pool = self.pool.write().await;
        let record = pool.get_mut(uuid).map(|r| {
            f(r);
            r.clone()
        });
        if let Err(e) = self.store.save(&pool) {
            warn!(uuid = %uuid, "Failed to persist account pool: {}", e);
        }
        record
    }
}

async fn supervise(inner: Weak<Inner>, events: Receiver<TaggedEvent>) {
    while let Ok(event) = events.recv_async().await {
        let Some(inner) = inner.upgrade() else { break };
        inner.handle_event(event).await;
    }
    debug!("Session supervisor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::encrypt_for;
    use crate::types::ErrorCode;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use crate::encryption::envelope::fixtures::{party, Party};
    use crate::probe::mock::ScriptedProbe;
    use crate::services::status_emit::ChannelNotifier;
    use crate::session::channel::mock::MockConnector;
    use crate::session::fallback::mock::RecordingMailer;
    use crate::session::orchestrator::tests::answer;
    use crate::session::ChannelEvent;
    use crate::store::MemoryAccountStore;
    use crate::types::fixtures::submission;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        local: Party,
        peer: Party,
        manager: SessionManager,
        connector: MockConnector,
        mailer: Arc<RecordingMailer>,
        store: Arc<MemoryAccountStore>,
        updates: Receiver<StatusUpdate>,
    }

    fn ready_pool() -> AccountPool {
        let mut pool = AccountPool::default();
        pool.upsert(submission("u1", "a@example.com")).unwrap();
        let r = pool.get_mut("u1").unwrap();
        r.imap_check = true;
        r.smtp_check = true;
        r.imap_test_result = Some(80);
        pool
    }

    async fn fixture(pool: AccountPool) -> Fixture {
        fixture_with_probe(pool, ScriptedProbe::passing()).await
    }

    async fn fixture_with_probe(pool: AccountPool, probe: ScriptedProbe) -> Fixture {
        let local = party("local");
        let peer = party("peer");
        let mut config = AppConfig::new("1.0.0");
        config.keypair = Some(local.pair.clone());
        config.account = Some("me@example.com".to_string());

        let connector = MockConnector::default();
        let mailer = Arc::new(RecordingMailer::default());
        let store = Arc::new(MemoryAccountStore::new(pool));
        let (notifier, updates) = ChannelNotifier::channel();

        let manager = SessionManager::start(ManagerDeps {
            config,
            config_path: None,
            identity: Arc::new(local.identity.clone()),
            peer_key: Arc::new(peer.identity.public_key().clone()),
            store: store.clone(),
            connector: Arc::new(connector.clone()),
            mailer: mailer.clone(),
            probe: Arc::new(probe),
            notifier: Arc::new(notifier),
        })
        .await
        .unwrap();

        Fixture {
            local,
            peer,
            manager,
            connector,
            mailer,
            store,
            updates,
        }
    }

    async fn wait_phase(updates: &Receiver<StatusUpdate>, phase: ConnectPhase) -> Option<ErrorCode> {
        loop {
            if let StatusUpdate::Connect(status) = updates.recv_async().await.unwrap() {
                if status.phase == phase {
                    return status.error;
                }
            }
        }
    }

    async fn wait_links(connector: &MockConnector, count: usize) {
        // sleeping lets the paused clock advance to pending timers
        while connector.links().len() < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn connect_ready(f: &Fixture) {
        f.manager.connect(None).await.unwrap();
        wait_links(&f.connector, 1).await;
        f.connector.last().unwrap().emit(ChannelEvent::Ready);
        wait_phase(&f.updates, ConnectPhase::Connected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_connect_sends_introduction() {
        let f = fixture(ready_pool()).await;
        f.manager.connect(None).await.unwrap();

        assert_eq!(wait_phase(&f.updates, ConnectPhase::Connecting).await, None);
        wait_phase(&f.updates, ConnectPhase::AwaitingPeer).await;
        assert_eq!(f.mailer.count(), 1);

        let stored = f.store.load().unwrap();
        let record = stored.get("u1").unwrap();
        assert!(record.send_to_peer);
        assert!(!record.can_do_delete);
        assert!(record.server_folder.is_some());

        // First session waits for the peer without a nudge
        wait_links(&f.connector, 1).await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(f.mailer.count(), 1);
        assert_eq!(f.manager.session_state().await, Some(SessionState::Degraded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_persists_and_reports_connected() {
        let f = fixture(ready_pool()).await;
        connect_ready(&f).await;
        assert_eq!(f.manager.session_state().await, Some(SessionState::Ready));
        assert!(!f.store.load().unwrap().get("u1").unwrap().can_do_delete);
    }

    #[tokio::test(start_paused = true)]
    async fn test_folders_survive_reconnects() {
        let f = fixture(ready_pool()).await;
        connect_ready(&f).await;
        let first = f.connector.last().unwrap();
        f.manager.connect(Some("u1")).await.unwrap();
        wait_links(&f.connector, 2).await;
        let second = f.connector.last().unwrap();
        assert_eq!(first.server_folder, second.server_folder);
        assert_eq!(first.client_folder, second.client_folder);
        assert!(first.is_closed());
        // already introduced, no second mail
        assert_eq!(f.mailer.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_through_manager() {
        let f = fixture(ready_pool()).await;
        connect_ready(&f).await;
        let link = f.connector.last().unwrap();

        let manager = &f.manager;
        let request = manager.request(Command::GetAvailableRegion);
        let reply = async {
            while link.sent().is_empty() {
                tokio::task::yield_now().await;
            }
            answer(&f.local, &f.peer, &link, vec![json!("eu")]);
        };
        let (response, ()) = tokio::join!(request, reply);
        assert_eq!(response.unwrap().args, vec![json!("eu")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_recreates_session() {
        let f = fixture(ready_pool()).await;
        connect_ready(&f).await;
        let old = f.connector.last().unwrap();

        let request = f.manager.request(Command::GetAvailableRegion);
        let disconnect = async {
            while old.sent().is_empty() {
                tokio::task::yield_now().await;
            }
            old.emit(ChannelEvent::Disconnected);
        };
        let (response, ()) = tokio::join!(request, disconnect);
        assert!(matches!(
            response,
            Err(GatewayError::Session(crate::session::SessionError::Closed))
        ));

        wait_links(&f.connector, 2).await;
        let record = f.store.load().unwrap().get("u1").cloned().unwrap();
        assert!(!record.send_to_peer);
        let new = f.connector.last().unwrap();
        assert_eq!(new.account_uuid, "u1");
        assert_eq!(new.server_folder, old.server_folder);

        // a late answer on the old channel resolves nothing
        answer(&f.local, &f.peer, &old, vec![json!("late")]);
        assert!(new.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_error_reconnects_after_delay() {
        let f = fixture(ready_pool()).await;
        connect_ready(&f).await;
        f.connector
            .last()
            .unwrap()
            .emit(ChannelEvent::Error("Connection timed out".to_string()));

        assert_eq!(
            wait_phase(&f.updates, ConnectPhase::Failed).await,
            Some(ErrorCode::Timeout)
        );
        assert_eq!(f.connector.links().len(), 1);
        wait_links(&f.connector, 2).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_generation_is_ignored() {
        let f = fixture(ready_pool()).await;
        connect_ready(&f).await;
        f.manager.inject_event(TaggedEvent {
            generation: 99,
            account_uuid: "u1".to_string(),
            event: SessionEvent::Disconnected,
        });
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(f.connector.links().len(), 1);
        assert!(f.store.load().unwrap().get("u1").unwrap().send_to_peer);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_account_connects_when_probes_pass() {
        let f = fixture(AccountPool::default()).await;
        let report = f
            .manager
            .check_account(submission("u9", "z@example.com"))
            .await
            .unwrap();
        assert!(report.passed());
        wait_links(&f.connector, 1).await;
        assert_eq!(f.connector.last().unwrap().account_uuid, "u9");
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_without_accounts_awaits_confirmation() {
        let f = fixture(AccountPool::default()).await;
        assert!(f.manager.connect(None).await.is_err());
        wait_phase(&f.updates, ConnectPhase::AwaitingConfirmation).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_refused_while_bound() {
        let f = fixture(ready_pool()).await;
        connect_ready(&f).await;
        assert!(f.manager.delete_account("u1").await.is_err());
        assert_eq!(f.manager.pool().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_identity_tears_down() {
        let f = fixture(ready_pool()).await;
        connect_ready(&f).await;
        let link = f.connector.last().unwrap();

        f.manager.reset_identity().await.unwrap();
        assert!(link.is_closed());
        assert!(f.manager.pool().await.is_empty());
        assert!(f.store.load().unwrap().is_empty());
        assert!(f.manager.key_pair().await.is_none());
        assert!(matches!(
            f.manager.connect(None).await,
            Err(GatewayError::IdentityLocked)
        ));
        assert!(matches!(
            f.manager.request(Command::GetAvailableRegion).await,
            Err(GatewayError::NoActiveSession)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_activation_replaces_public_key() {
        let f = fixture(ready_pool()).await;
        connect_ready(&f).await;
        let link = f.connector.last().unwrap();

        let activation = encrypt_for(b"activation-code", f.local.identity.public_key(), &f.peer.identity).unwrap();
        let recertified = BASE64.encode(f.local.pair.public_key.as_bytes());
        let activate = f.manager.activate_with_armored_reply(&activation);
        let reply = async {
            while link.sent().is_empty() {
                tokio::task::yield_now().await;
            }
            answer(&f.local, &f.peer, &link, vec![json!(recertified)]);
        };
        let (response, ()) = tokio::join!(activate, reply);
        assert_eq!(response.unwrap().command, "activePassword");

        let summary = loop {
            if let StatusUpdate::KeyPair(summary) = f.updates.recv_async().await.unwrap() {
                break summary;
            }
        };
        assert_eq!(summary.unwrap().public_key_id, f.local.pair.public_key_id);
        assert!(f.manager.activate_with_armored_reply("hello").await.is_err());
    }

    /// Pool whose record was introduced earlier: folders assigned and the
    /// peer already told about them
    fn introduced_pool() -> AccountPool {
        let mut pool = ready_pool();
        let r = pool.get_mut("u1").unwrap();
        r.prepare_for_connection();
        r.send_to_peer = true;
        pool
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_refuses_unverified_account() {
        let mut pool = AccountPool::default();
        pool.upsert(submission("u1", "a@example.com")).unwrap();
        let f = fixture(pool).await;

        assert!(matches!(
            f.manager.connect(Some("u1")).await,
            Err(GatewayError::InvalidInput(_))
        ));
        wait_phase(&f.updates, ConnectPhase::AwaitingConfirmation).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(f.mailer.count(), 0);
        assert!(f.connector.links().is_empty());
        assert!(f.store.load().unwrap().get("u1").unwrap().server_folder.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probing_does_not_stall_session_events() {
        let slow = ScriptedProbe::new(vec![(10_000, Ok(()))], Ok(()));
        let f = fixture_with_probe(ready_pool(), slow).await;
        f.manager.connect(None).await.unwrap();
        wait_links(&f.connector, 1).await;

        let started = tokio::time::Instant::now();
        let check = f.manager.check_account(submission("u2", "b@example.com"));
        let ready = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            f.connector.links()[0].emit(ChannelEvent::Ready);
            wait_phase(&f.updates, ConnectPhase::Connected).await;
            started.elapsed()
        };
        let (report, elapsed) = tokio::join!(check, ready);
        assert!(report.unwrap().passed());
        assert!(elapsed < Duration::from_secs(1), "ready surfaced after {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recreated_session_after_introduction_stays_quiet() {
        let f = fixture(ready_pool()).await;
        connect_ready(&f).await;
        assert_eq!(f.mailer.count(), 1);

        f.connector.last().unwrap().emit(ChannelEvent::Disconnected);
        wait_links(&f.connector, 2).await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(f.manager.session_state().await, Some(SessionState::Degraded));
        assert_eq!(f.mailer.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recreated_session_keeps_nudging() {
        let f = fixture(introduced_pool()).await;
        connect_ready(&f).await;
        assert_eq!(f.mailer.count(), 0);

        f.connector.last().unwrap().emit(ChannelEvent::Disconnected);
        wait_links(&f.connector, 2).await;
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(f.mailer.count(), 1);
    }

    fn bootstrap_config(dir: &Path, peer: &Party) -> (AppConfig, PathBuf) {
        let mut config = AppConfig::new("1.0.0");
        let unlock_key = derive_unlock_key("correct horse", &config.unlock).unwrap();
        config.keypair = Some(KeyPair::generate("Me", "me@example.com", &unlock_key).unwrap());
        let peer_path = dir.join("peer.asc");
        std::fs::write(&peer_path, &peer.pair.public_key).unwrap();
        config.peer.public_key_path = Some(peer_path);
        (config, dir.join("config.toml"))
    }

    #[tokio::test]
    async fn test_from_config_unlocks_and_starts() {
        use pgp::types::KeyTrait;

        let dir = tempfile::tempdir().unwrap();
        let peer = party("peer");
        let (config, path) = bootstrap_config(dir.path(), &peer);
        let (notifier, _updates) = ChannelNotifier::channel();

        let deps = ManagerDeps::from_config(
            config,
            path.clone(),
            "correct horse",
            Arc::new(MockConnector::default()),
            Arc::new(notifier),
        )
        .unwrap();
        assert_eq!(deps.config_path.as_deref(), Some(path.as_path()));
        assert_eq!(deps.peer_key.fingerprint(), peer.identity.public_key().fingerprint());

        let manager = SessionManager::start(deps).await.unwrap();
        assert!(manager.pool().await.is_empty());
        assert!(matches!(
            manager.connect(None).await,
            Err(GatewayError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_from_config_rejects_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let peer = party("peer");
        let (config, path) = bootstrap_config(dir.path(), &peer);
        let (notifier, _updates) = ChannelNotifier::channel();
        let notifier: Arc<dyn StatusNotifier> = Arc::new(notifier);
        let connector: Arc<dyn ChannelConnector> = Arc::new(MockConnector::default());

        let wrong = ManagerDeps::from_config(config.clone(), path.clone(), "wrong", connector.clone(), notifier.clone());
        assert!(matches!(
            wrong,
            Err(GatewayError::Codec(crate::encryption::CodecError::WrongPassphrase))
        ));

        let mut no_peer = config.clone();
        no_peer.peer.public_key_path = None;
        assert!(matches!(
            ManagerDeps::from_config(no_peer, path.clone(), "correct horse", connector.clone(), notifier.clone()),
            Err(GatewayError::Config(crate::config::ConfigError::NoPeerKey))
        ));

        let mut no_keypair = config;
        no_keypair.keypair = None;
        assert!(matches!(
            ManagerDeps::from_config(no_keypair, path, "correct horse", connector, notifier),
            Err(GatewayError::NoKeyPair)
        ));
    }
}
