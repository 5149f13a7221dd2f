//! Account pool operations
//!
//! Probing and bookkeeping for mail-relay accounts, independent of any
//! running session.

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{GatewayError, Result};
use crate::probe::TransportProber;
use crate::services::status_emit::{emit_probe, StatusNotifier};
use crate::store::AccountPoolStore;
use crate::types::{AccountPool, AccountRecord, AccountSubmission, ProbeReport};

/// Record a submission and probe both legs. The pool is persisted after
/// every step so a crash mid-probe loses nothing. The pool lock is only
/// held to write results, never across a probe.
pub async fn check_account(
    pool: &RwLock<AccountPool>,
    store: &dyn AccountPoolStore,
    prober: &TransportProber,
    notifier: &dyn StatusNotifier,
    submission: AccountSubmission,
) -> Result<ProbeReport> {
    let uuid = submission.uuid.clone();
    info!(uuid = %uuid, email = %submission.email, "Checking account");

    let record = {
        let mut pool = pool.write().await;
        pool.upsert(submission)?;
        let record = pool
            .get_mut(&uuid)
            .ok_or_else(|| GatewayError::AccountNotFound(uuid.clone()))?;
        record.imap_check = false;
        record.smtp_check = false;
        record.imap_test_result = None;
        let record = record.clone();
        store.save(&pool)?;
        record
    };

    let imap = prober.probe_imap(&record).await.map_err(|e| e.code());
    record_result(pool, store, &uuid, |r| {
        r.imap_check = imap.is_ok();
        r.imap_test_result = imap.ok();
    })
    .await?;

    let smtp = if imap.is_ok() {
        let smtp = prober.probe_smtp(&record).await.map_err(|e| e.code());
        record_result(pool, store, &uuid, |r| r.smtp_check = smtp.is_ok()).await?;
        Some(smtp)
    } else {
        None
    };

    let report = ProbeReport { uuid, imap, smtp };
    emit_probe(notifier, report.clone());
    Ok(report)
}

async fn record_result(
    pool: &RwLock<AccountPool>,
    store: &dyn AccountPoolStore,
    uuid: &str,
    f: impl FnOnce(&mut AccountRecord),
) -> Result<()> {
    let mut pool = pool.write().await;
    match pool.get_mut(uuid) {
        Some(record) => f(record),
        // Deleted while the probe ran
        None => debug!(uuid = %uuid, "Account gone before its probe finished"),
    }
    store.save(&pool)?;
    Ok(())
}

/// Delete a record that is not bound to a session
pub fn delete_account(pool: &mut AccountPool, store: &dyn AccountPoolStore, uuid: &str) -> Result<()> {
    pool.remove(uuid)?;
    store.save(pool)?;
    info!(uuid = %uuid, "Account deleted");
    Ok(())
}

/// Pick the record a connection should use: the requested one, otherwise
/// the first channel-ready record. Only records that passed both probes
/// qualify.
pub fn choose_account(pool: &AccountPool, uuid: Option<&str>) -> Result<String> {
    match uuid {
        Some(uuid) => {
            let record = pool
                .get(uuid)
                .ok_or_else(|| GatewayError::AccountNotFound(uuid.to_string()))?;
            if !record.is_channel_ready() {
                return Err(GatewayError::InvalidInput(format!("account {} is not verified", uuid)));
            }
            Ok(record.uuid.clone())
        }
        None => pool
            .records()
            .iter()
            .find(|r| r.is_channel_ready())
            .map(|r| r.uuid.clone())
            .ok_or_else(|| GatewayError::InvalidInput("no verified account".to_string())),
    }
}
