use serde::Serialize;

use crate::config::ConfigError;
use crate::encryption::{CodecError, UnlockError};
use crate::probe::ProbeError;
use crate::session::{ChannelError, FallbackError, SessionError};
use crate::store::StoreError;
use crate::types::error::ErrorCode;
use crate::types::PoolError;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Unlock error: {0}")]
    Unlock(#[from] UnlockError),

    #[error("Crypto error: {0}")]
    Codec(#[from] CodecError),

    #[error("Probe failed: {0}")]
    Probe(#[from] ProbeError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Introduction failed: {0}")]
    Introduction(#[from] FallbackError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Account error: {0}")]
    Pool(#[from] PoolError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Identity is locked")]
    IdentityLocked,

    #[error("No key pair configured")]
    NoKeyPair,

    #[error("No active session")]
    NoActiveSession,
}

impl GatewayError {
    /// Taxonomy code for the notification surface
    pub fn error_code(&self) -> ErrorCode {
        match self {
            GatewayError::Probe(e) => e.code(),
            GatewayError::Channel(e) => e.code(),
            GatewayError::Session(SessionError::Channel(e)) => e.code(),
            other => crate::types::classify_error(&other.to_string()),
        }
    }
}

// The notification surface only carries strings for errors.
impl Serialize for GatewayError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
