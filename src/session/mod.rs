//! Peer session over a mail channel
//!
//! - `channel`: what we need from the mail channel collaborator
//! - `correlator`: request serial → pending reply
//! - `fallback`: out-of-band introduction mail
//! - `orchestrator`: the session state machine and its event loop

pub mod channel;
pub mod correlator;
pub mod fallback;
pub mod orchestrator;

use serde::Serialize;

pub use channel::{ChannelConnector, ChannelError, ChannelEvent, ChannelHandle, MailChannel};
pub use correlator::Correlator;
pub use fallback::{Fallback, FallbackError, Introduction, IntroductionMailer, SmtpIntroductionMailer};
pub use orchestrator::{Orchestrator, SessionHandle, SessionParams};

use crate::encryption::CodecError;
use crate::types::ErrorCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Idle,
    Connecting,
    KeepAliveWait,
    Ready,
    Degraded,
    Reconnecting,
    Closed,
}

impl SessionState {
    /// Whether the session still processes events
    pub fn is_live(self) -> bool {
        !matches!(self, SessionState::Reconnecting | SessionState::Closed)
    }
}

/// Lifecycle notifications sent to the owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Ready,
    /// Keep-alive deadline passed without an answer
    Degraded,
    Disconnected,
    Closed(ErrorCode),
}

/// A [`SessionEvent`] stamped with the session that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedEvent {
    pub generation: u64,
    pub account_uuid: String,
    pub event: SessionEvent,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session ended before answering
    #[error("Session closed")]
    Closed,

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Failed to encode command: {0}")]
    Encode(serde_json::Error),

    #[error("Request serial already in flight: {0}")]
    DuplicateSerial(String),
}
