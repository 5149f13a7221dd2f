//! Contract of the mail channel collaborator
//!
//! The collaborator turns a mailbox account into a byte stream: it watches
//! the client folder, appends to the server folder and reports what happens
//! as [`ChannelEvent`]s.

use async_trait::async_trait;
use flume::Receiver;

use crate::types::{classify_error, AccountRecord, ErrorCode};

/// Events surfaced by an open channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The peer answered a ping
    Ready,
    /// One inbound armored envelope
    Message(Vec<u8>),
    /// The peer signalled it is going away
    Disconnected,
    /// Terminal transport failure
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to open channel: {0}")]
    Open(String),

    #[error("Failed to send: {0}")]
    Send(String),

    #[error("Channel closed")]
    Closed,
}

impl ChannelError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ChannelError::Open(e) | ChannelError::Send(e) => classify_error(e),
            ChannelError::Closed => ErrorCode::Unknown,
        }
    }
}

#[async_trait]
pub trait MailChannel: Send {
    async fn send(&mut self, bytes: Vec<u8>) -> Result<(), ChannelError>;

    /// Ask the peer for a keep-alive acknowledgement
    async fn ping(&mut self) -> Result<(), ChannelError>;

    async fn close(&mut self);
}

pub struct ChannelHandle {
    pub channel: Box<dyn MailChannel>,
    pub events: Receiver<ChannelEvent>,
}

#[async_trait]
pub trait ChannelConnector: Send + Sync {
    /// Open a channel bound to the account's client/server folder pair
    async fn open(&self, account: &AccountRecord) -> Result<ChannelHandle, ChannelError>;
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use flume::Sender;
    use std::sync::{Arc, Mutex};

    /// Test-side view of one opened channel
    #[derive(Clone)]
    pub struct MockLink {
        pub account_uuid: String,
        pub client_folder: Option<String>,
        pub server_folder: Option<String>,
        pub events: Sender<ChannelEvent>,
        pub sent: Arc<Mutex<Vec<Vec<u8>>>>,
        pub pings: Arc<Mutex<usize>>,
        pub closed: Arc<Mutex<bool>>,
    }

    impl MockLink {
        pub fn sent(&self) -> Vec<Vec<u8>> {
            self.sent.lock().unwrap().clone()
        }

        pub fn pings(&self) -> usize {
            *self.pings.lock().unwrap()
        }

        pub fn is_closed(&self) -> bool {
            *self.closed.lock().unwrap()
        }

        pub fn emit(&self, event: ChannelEvent) {
            let _ = self.events.send(event);
        }
    }

    struct MockChannel {
        link: MockLink,
    }

    #[async_trait]
    impl MailChannel for MockChannel {
        async fn send(&mut self, bytes: Vec<u8>) -> Result<(), ChannelError> {
            if self.link.is_closed() {
                return Err(ChannelError::Closed);
            }
            self.link.sent.lock().unwrap().push(bytes);
            Ok(())
        }

        async fn ping(&mut self) -> Result<(), ChannelError> {
            *self.link.pings.lock().unwrap() += 1;
            Ok(())
        }

        async fn close(&mut self) {
            *self.link.closed.lock().unwrap() = true;
        }
    }

    /// Connector that records every channel it opens
    #[derive(Clone, Default)]
    pub struct MockConnector {
        pub links: Arc<Mutex<Vec<MockLink>>>,
        pub fail_with: Arc<Mutex<Option<String>>>,
    }

    impl MockConnector {
        pub fn links(&self) -> Vec<MockLink> {
            self.links.lock().unwrap().clone()
        }

        pub fn last(&self) -> Option<MockLink> {
            self.links.lock().unwrap().last().cloned()
        }
    }

    #[async_trait]
    impl ChannelConnector for MockConnector {
        async fn open(&self, account: &AccountRecord) -> Result<ChannelHandle, ChannelError> {
            if let Some(e) = self.fail_with.lock().unwrap().clone() {
                return Err(ChannelError::Open(e));
            }
            let (tx, rx) = flume::unbounded();
            let link = MockLink {
                account_uuid: account.uuid.clone(),
                client_folder: account.client_folder.clone(),
                server_folder: account.server_folder.clone(),
                events: tx,
                sent: Arc::default(),
                pings: Arc::default(),
                closed: Arc::default(),
            };
            self.links.lock().unwrap().push(link.clone());
            Ok(ChannelHandle {
                channel: Box::new(MockChannel { link }),
                events: rx,
            })
        }
    }
}
