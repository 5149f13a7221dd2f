//! Session state machine
//!
//! One orchestrator task owns one session. Channel events, owner commands
//! and the keep-alive deadline are all consumed by a single `select!` loop,
//! so transitions never run concurrently.
//!
//! ```text
//! Idle -> Connecting -> KeepAliveWait -> Ready
//!                            |  ^          |
//!               deadline     v  | check    | disconnected / error
//!                         Degraded         v
//!                                      Reconnecting
//! any live state -> Closed on shutdown
//! ```

use flume::{Receiver, Sender};
use pgp::composed::SignedPublicKey;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use super::channel::{ChannelConnector, ChannelEvent, MailChannel};
use super::correlator::{Correlator, Responder};
use super::fallback::Fallback;
use super::{SessionError, SessionEvent, SessionState, TaggedEvent};
use crate::encryption::{decode_command, encrypt_for, UnlockedIdentity};
use crate::types::{classify_error, AccountRecord, Command, CommandMessage};

/// Inputs for one session
pub struct SessionParams {
    pub generation: u64,
    /// Must already carry its folder pair
    pub account: AccountRecord,
    pub identity: Arc<UnlockedIdentity>,
    pub peer_key: Arc<SignedPublicKey>,
    pub keep_alive: Duration,
    /// Sent when the keep-alive deadline passes; `None` disables the nudge
    pub fallback: Option<Fallback>,
}

enum SessionCommand {
    Request {
        message: CommandMessage,
        responder: Responder,
        accepted: oneshot::Sender<Result<(), SessionError>>,
    },
    CheckConnect {
        alive: oneshot::Sender<bool>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Owner-side handle. Dropping every handle shuts the session down.
#[derive(Clone)]
pub struct SessionHandle {
    generation: u64,
    account_uuid: String,
    commands: Sender<SessionCommand>,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn account_uuid(&self) -> &str {
        &self.account_uuid
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Send `command` to the peer and wait for its response. Pending requests
    /// are dropped when the session ends; that surfaces as
    /// [`SessionError::Closed`].
    pub async fn request(&self, command: Command) -> Result<CommandMessage, SessionError> {
        let message = command.into_message();
        let (responder, response) = oneshot::channel();
        let (accepted_tx, accepted) = oneshot::channel();
        self.commands
            .send_async(SessionCommand::Request {
                message,
                responder,
                accepted: accepted_tx,
            })
            .await
            .map_err(|_| SessionError::Closed)?;

        accepted.await.map_err(|_| SessionError::Closed)??;
        response.await.map_err(|_| SessionError::Closed)
    }

    /// Re-arm the keep-alive deadline and ping. Resolves to true when the
    /// peer answers before the deadline, false when it does not.
    pub async fn check_connect(&self) -> Result<bool, SessionError> {
        let (alive_tx, alive) = oneshot::channel();
        self.commands
            .send_async(SessionCommand::CheckConnect { alive: alive_tx })
            .await
            .map_err(|_| SessionError::Closed)?;
        alive.await.map_err(|_| SessionError::Closed)
    }

    /// Tear the session down and wait until it is Closed
    pub async fn shutdown(&self) {
        let (done_tx, done) = oneshot::channel();
        if self
            .commands
            .send_async(SessionCommand::Shutdown { done: done_tx })
            .await
            .is_ok()
        {
            let _ = done.await;
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

pub struct Orchestrator {
    generation: u64,
    account: AccountRecord,
    identity: Arc<UnlockedIdentity>,
    peer_key: Arc<SignedPublicKey>,
    keep_alive: Duration,
    fallback: Option<Fallback>,
    channel: Box<dyn MailChannel>,
    events: Receiver<ChannelEvent>,
    commands: Receiver<SessionCommand>,
    owner: Sender<TaggedEvent>,
    state: watch::Sender<SessionState>,
    correlator: Correlator,
    deadline: Option<Instant>,
    check_waiters: Vec<oneshot::Sender<bool>>,
}

impl Orchestrator {
    /// Start a session task. The channel is opened inside the task; the
    /// returned handle is usable immediately.
    pub fn spawn(
        params: SessionParams,
        connector: Arc<dyn ChannelConnector>,
        owner: Sender<TaggedEvent>,
    ) -> SessionHandle {
        let (commands_tx, commands) = flume::unbounded();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let handle = SessionHandle {
            generation: params.generation,
            account_uuid: params.account.uuid.clone(),
            commands: commands_tx,
            state: state_rx,
        };

        tokio::spawn(async move {
            let generation = params.generation;
            let uuid = params.account.uuid.clone();
            state_tx.send_replace(SessionState::Connecting);
            info!(uuid = %uuid, generation, "Opening session channel");

            let opened = connector.open(&params.account).await;
            let opened = match opened {
                Ok(opened) => opened,
                Err(e) => {
                    error!(uuid = %uuid, generation, "Channel open failed: {}", e);
                    state_tx.send_replace(SessionState::Reconnecting);
                    let _ = owner.send(TaggedEvent {
                        generation,
                        account_uuid: uuid,
                        event: SessionEvent::Closed(e.code()),
                    });
                    return;
                }
            };

            let orchestrator = Orchestrator {
                generation,
                account: params.account,
                identity: params.identity,
                peer_key: params.peer_key,
                keep_alive: params.keep_alive,
                fallback: params.fallback,
                channel: opened.channel,
                events: opened.events,
                commands,
                owner,
                state: state_tx,
                correlator: Correlator::new(),
                deadline: None,
                check_waiters: Vec::new(),
            };
            orchestrator.run().await;
        });

        handle
    }

    async fn run(mut self) {
        if let Err(e) = self.channel.ping().await {
            self.fail(e.to_string()).await;
            return;
        }
        self.arm_deadline();
        self.transition(SessionState::KeepAliveWait);

        loop {
            let deadline = self.deadline;
            let flow = tokio::select! {
                command = self.commands.recv_async() => match command {
                    Ok(command) => self.handle_command(command).await,
                    Err(_) => {
                        debug!(uuid = %self.account.uuid, "All session handles dropped");
                        self.teardown(SessionState::Closed).await;
                        Flow::Stop
                    }
                },
                event = self.events.recv_async() => match event {
                    Ok(event) => self.handle_channel_event(event).await,
                    // The collaborator went away without a word
                    Err(_) => self.handle_channel_event(ChannelEvent::Disconnected).await,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_deadline();
                    Flow::Continue
                }
            };
            if let Flow::Stop = flow {
                break;
            }
        }
        debug!(uuid = %self.account.uuid, generation = self.generation, "Session loop finished");
    }

    async fn handle_command(&mut self, command: SessionCommand) -> Flow {
        match command {
            SessionCommand::Request {
                message,
                responder,
                accepted,
            } => {
                let result = self.send_request(message, responder).await;
                let _ = accepted.send(result);
                Flow::Continue
            }
            SessionCommand::CheckConnect { alive } => {
                if let Err(e) = self.channel.ping().await {
                    self.fail(e.to_string()).await;
                    return Flow::Stop;
                }
                self.arm_deadline();
                self.check_waiters.push(alive);
                if self.current() == SessionState::Degraded {
                    self.transition(SessionState::KeepAliveWait);
                }
                Flow::Continue
            }
            SessionCommand::Shutdown { done } => {
                info!(uuid = %self.account.uuid, generation = self.generation, "Session shutdown requested");
                self.teardown(SessionState::Closed).await;
                let _ = done.send(());
                Flow::Stop
            }
        }
    }

    async fn send_request(&mut self, message: CommandMessage, responder: Responder) -> Result<(), SessionError> {
        let json = message.to_json().map_err(SessionError::Encode)?;
        let armored = encrypt_for(json.as_bytes(), &self.peer_key, &self.identity)?;

        let serial = message.request_serial.clone();
        self.correlator
            .register(serial.clone(), responder)
            .map_err(|_| SessionError::DuplicateSerial(serial.clone()))?;

        if let Err(e) = self.channel.send(armored.into_bytes()).await {
            self.correlator.cancel(&serial);
            warn!(serial = %serial, "Request not sent: {}", e);
            return Err(e.into());
        }
        debug!(serial = %serial, command = %message.command, "Request sent");
        Ok(())
    }

    async fn handle_channel_event(&mut self, event: ChannelEvent) -> Flow {
        match event {
            ChannelEvent::Ready => {
                self.deadline = None;
                if self.current() != SessionState::Ready {
                    self.transition(SessionState::Ready);
                    self.notify(SessionEvent::Ready);
                }
                for waiter in self.check_waiters.drain(..) {
                    let _ = waiter.send(true);
                }
                Flow::Continue
            }
            ChannelEvent::Message(bytes) => {
                self.handle_inbound(bytes);
                Flow::Continue
            }
            ChannelEvent::Disconnected => {
                info!(uuid = %self.account.uuid, generation = self.generation, "Peer disconnected");
                self.teardown(SessionState::Reconnecting).await;
                self.notify(SessionEvent::Disconnected);
                Flow::Stop
            }
            ChannelEvent::Error(e) => {
                self.fail(e).await;
                Flow::Stop
            }
        }
    }

    /// Decrypt and route one inbound envelope. Anything that does not
    /// decode is dropped.
    fn handle_inbound(&mut self, bytes: Vec<u8>) {
        let text = match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(_) => {
                warn!(uuid = %self.account.uuid, "Dropping non UTF-8 inbound message");
                return;
            }
        };
        match decode_command(&text, &self.peer_key, &self.identity) {
            Ok(response) => {
                self.correlator.resolve(response);
            }
            Err(e) => warn!(uuid = %self.account.uuid, len = text.len(), "Dropping inbound message: {}", e),
        }
    }

    fn on_deadline(&mut self) {
        self.deadline = None;
        warn!(uuid = %self.account.uuid, generation = self.generation, "Keep-alive deadline passed");
        if matches!(self.current(), SessionState::KeepAliveWait | SessionState::Ready) {
            self.transition(SessionState::Degraded);
            self.notify(SessionEvent::Degraded);
        }
        for waiter in self.check_waiters.drain(..) {
            let _ = waiter.send(false);
        }

        // Fire and forget. A late pong does not cancel it.
        if let Some(fallback) = self.fallback.clone() {
            let account = self.account.clone();
            let identity = self.identity.clone();
            let peer_key = self.peer_key.clone();
            tokio::spawn(async move {
                if let Err(e) = fallback.dispatch(&account, &peer_key, &identity).await {
                    warn!(uuid = %account.uuid, "Fallback introduction failed: {}", e);
                }
            });
        }
    }

    async fn fail(&mut self, error: String) {
        let code = classify_error(&error);
        error!(uuid = %self.account.uuid, generation = self.generation, code = %code, "Channel failed: {}", error);
        self.teardown(SessionState::Reconnecting).await;
        self.notify(SessionEvent::Closed(code));
    }

    /// Cancel the deadline, drop pending requests and close the channel
    async fn teardown(&mut self, next: SessionState) {
        self.deadline = None;
        self.check_waiters.clear();
        self.correlator.expire_all();
        self.channel.close().await;
        self.transition(next);
    }

    fn arm_deadline(&mut self) {
        self.deadline = Some(Instant::now() + self.keep_alive);
    }

    fn current(&self) -> SessionState {
        *self.state.borrow()
    }

    fn transition(&mut self, next: SessionState) {
        let previous = self.current();
        if previous != next {
            debug!(uuid = %self.account.uuid, generation = self.generation, from = ?previous, to = ?next, "Session state");
            self.state.send_replace(next);
        }
    }

    fn notify(&self, event: SessionEvent) {
        let _ = self.owner.send(TaggedEvent {
            generation: self.generation,
            account_uuid: self.account.uuid.clone(),
            event,
        });
    }
}
