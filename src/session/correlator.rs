use std::collections::HashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::types::CommandMessage;

/// Reply slot of one in-flight request
pub type Responder = oneshot::Sender<CommandMessage>;

/// Pending requests keyed by request serial. Only touched from the
/// orchestrator's event loop.
#[derive(Debug, Default)]
pub struct Correlator {
    pending: HashMap<String, Responder>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the responder for `serial`. A serial already in flight is
    /// refused and the new responder is handed back.
    pub fn register(&mut self, serial: String, responder: Responder) -> Result<(), Responder> {
        if self.pending.contains_key(&serial) {
            warn!(serial = %serial, "Request serial already in flight");
            return Err(responder);
        }
        self.pending.insert(serial, responder);
        Ok(())
    }

    /// Deliver `response` to the request with the same serial. Returns false
    /// when nothing was waiting: stale, duplicate or forged serials are
    /// logged and dropped.
    pub fn resolve(&mut self, response: CommandMessage) -> bool {
        match self.pending.remove(&response.request_serial) {
            Some(responder) => {
                let serial = response.request_serial.clone();
                if responder.send(response).is_err() {
                    debug!(serial = %serial, "Requester gave up before the response arrived");
                }
                true
            }
            None => {
                warn!(serial = %response.request_serial, command = %response.command, "Dropping response with unknown serial");
                false
            }
        }
    }

    /// Forget a request whose send failed
    pub fn cancel(&mut self, serial: &str) -> Option<Responder> {
        self.pending.remove(serial)
    }

    /// Drop every pending request without answering it. Returns how many
    /// were dropped.
    pub fn expire_all(&mut self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        if count > 0 {
            debug!(count, "Expired pending requests");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
