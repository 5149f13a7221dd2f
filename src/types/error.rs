//! Failure taxonomy shared by the prober and the session layer
//!
//! Transport errors never cross into the owner/UI layer as raw text.
//! They are reduced to an [`ErrorCode`] by matching the error message
//! against an ordered rule table:
//! - the first matching rule wins
//! - matching is case-insensitive substring matching
//! - anything unmatched is [`ErrorCode::Unknown`]

use serde::{Deserialize, Serialize};

/// Small integer error codes surfaced to the notification layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The remote peer has not acknowledged the session yet
    PeerNotReady,
    /// Login rejected by the IMAP or SMTP server
    AuthFailure,
    /// TCP connection refused
    ConnectionRefused,
    /// Server certificate not trusted and no override configured
    CertificateDistrust,
    /// Host name could not be resolved
    HostResolutionFailure,
    /// Connection or handshake timed out
    Timeout,
    /// Anything else
    Unknown,
}

impl ErrorCode {
    /// Numeric code used on the notification surface
    pub fn code(self) -> u8 {
        match self {
            ErrorCode::PeerNotReady => 0,
            ErrorCode::AuthFailure => 3,
            ErrorCode::ConnectionRefused => 4,
            ErrorCode::CertificateDistrust => 5,
            ErrorCode::HostResolutionFailure => 6,
            ErrorCode::Timeout => 7,
            ErrorCode::Unknown => 10,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0 => ErrorCode::PeerNotReady,
            3 => ErrorCode::AuthFailure,
            4 => ErrorCode::ConnectionRefused,
            5 => ErrorCode::CertificateDistrust,
            6 => ErrorCode::HostResolutionFailure,
            7 => ErrorCode::Timeout,
            _ => ErrorCode::Unknown,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCode::PeerNotReady => "peer not ready",
            ErrorCode::AuthFailure => "authentication failure",
            ErrorCode::ConnectionRefused => "connection refused",
            ErrorCode::CertificateDistrust => "certificate not trusted",
            ErrorCode::HostResolutionFailure => "host resolution failure",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Unknown => "unknown error",
        };
        write!(f, "{} ({})", name, self.code())
    }
}

// The UI surface only understands the integer form.
impl Serialize for ErrorCode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let code = u8::deserialize(deserializer)?;
        Ok(ErrorCode::from_code(code))
    }
}

/// Ordered classification rules. Order is significant: an error text can
/// contain keywords of several classes and the earliest rule decides.
pub const CLASSIFICATION_RULES: &[(ErrorCode, &[&str])] = &[
    (
        ErrorCode::AuthFailure,
        &[
            "authenticat",
            "auth failed",
            "lookup failed",
            "invalid login",
            "invalid credentials",
            "login",
            "username",
        ],
    ),
    (
        ErrorCode::ConnectionRefused,
        &["econnrefused", "connection refused"],
    ),
    (ErrorCode::CertificateDistrust, &["certificate"]),
    (ErrorCode::Timeout, &["timeout", "timed out", "deadline has elapsed"]),
    (
        ErrorCode::HostResolutionFailure,
        &[
            "enotfound",
            "host not found",
            "failed to lookup address",
            "name or service not known",
            "nodename nor servname",
            "no such host",
        ],
    ),
    (ErrorCode::PeerNotReady, &["peer not ready"]),
];

/// Reduce an error message to its taxonomy code
pub fn classify_error(message: &str) -> ErrorCode {
    let lowered = message.to_lowercase();
    CLASSIFICATION_RULES
        .iter()
        .find(|(_, patterns)| patterns.iter().any(|p| lowered.contains(p)))
        .map(|(code, _)| *code)
        .unwrap_or(ErrorCode::Unknown)
}
