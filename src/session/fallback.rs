//! Out-of-band introduction mail
//!
//! The introduction is the plain connect request sent to the peer's public
//! mailbox over the account's SMTP leg. It is used for the first contact
//! and as a nudge when the peer stops answering pings.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart};
use lettre::{AsyncTransport, Message};
use pgp::composed::SignedPublicKey;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::encryption::{encrypt_for, CodecError, UnlockedIdentity};
use crate::probe::smtp;
use crate::types::AccountRecord;

pub const INTRODUCTION_SUBJECT: &str = "QTGate";

#[derive(Debug, thiserror::Error)]
pub enum FallbackError {
    #[error("Failed to seal introduction: {0}")]
    Codec(#[from] CodecError),

    #[error("Failed to encode introduction: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Failed to send introduction: {0}")]
    Send(String),
}

/// Connect request carried by the introduction mail
#[derive(Debug, Clone, Serialize)]
pub struct Introduction {
    pub account: String,
    #[serde(rename = "QTGateVersion")]
    pub version: String,
    #[serde(rename = "imapData")]
    pub imap_data: AccountRecord,
    pub command: &'static str,
    pub error: Option<i64>,
    pub callback: Option<String>,
    pub language: String,
    #[serde(rename = "publicKey")]
    pub public_key: String,
}

impl Introduction {
    pub fn new(account: &str, version: &str, imap_data: AccountRecord, public_key: String) -> Self {
        let language = imap_data.language.clone().unwrap_or_else(|| "en".to_string());
        Self {
            account: account.to_string(),
            version: version.to_string(),
            imap_data,
            command: "connect",
            error: None,
            callback: None,
            language,
            public_key,
        }
    }

    /// Sign and encrypt the JSON form to the peer
    pub fn seal(&self, peer_key: &SignedPublicKey, identity: &UnlockedIdentity) -> Result<String, FallbackError> {
        let json = serde_json::to_vec(self)?;
        Ok(encrypt_for(&json, peer_key, identity)?)
    }
}

#[async_trait]
pub trait IntroductionMailer: Send + Sync {
    /// Deliver the armored introduction from `account` to the peer
    async fn send(&self, account: &AccountRecord, armored: String) -> Result<(), String>;
}

/// Sends the introduction as a text attachment through the account's SMTP leg
pub struct SmtpIntroductionMailer {
    peer_email: String,
    timeout: Duration,
}

impl SmtpIntroductionMailer {
    pub fn new(peer_email: impl Into<String>, timeout: Duration) -> Self {
        Self {
            peer_email: peer_email.into(),
            timeout,
        }
    }
}

#[async_trait]
impl IntroductionMailer for SmtpIntroductionMailer {
    async fn send(&self, account: &AccountRecord, armored: String) -> Result<(), String> {
        let from: Mailbox = account
            .email
            .parse()
            .map_err(|e: lettre::address::AddressError| format!("Invalid from address: {}", e))?;
        let to: Mailbox = self
            .peer_email
            .parse()
            .map_err(|e: lettre::address::AddressError| format!("Invalid to address: {}", e))?;

        let attachment = Attachment::new("QTGate.pem".to_string()).body(armored, ContentType::TEXT_PLAIN);
        let message = Message::builder()
            .from(from)
            .to(to)
            .subject(INTRODUCTION_SUBJECT)
            .multipart(MultiPart::mixed().singlepart(attachment))
            .map_err(|e| format!("Failed to build email: {}", e))?;

        let transport = smtp::transport(&account.smtp, self.timeout)?;
        transport
            .send(message)
            .await
            .map_err(|e| format!("Failed to send introduction: {}", e))?;
        Ok(())
    }
}

/// Everything needed to (re)send the introduction
#[derive(Clone)]
pub struct Fallback {
    pub mailer: Arc<dyn IntroductionMailer>,
    pub introduction: Introduction,
}

impl Fallback {
    pub async fn dispatch(
        &self,
        account: &AccountRecord,
        peer_key: &SignedPublicKey,
        identity: &UnlockedIdentity,
    ) -> Result<(), FallbackError> {
        let armored = self.introduction.seal(peer_key, identity)?;
        match self.mailer.send(account, armored).await {
            Ok(()) => {
                info!(uuid = %account.uuid, "Introduction sent");
                Ok(())
            }
            Err(e) => {
                warn!(uuid = %account.uuid, error = %e, "Introduction not sent");
                Err(FallbackError::Send(e))
            }
        }
    }
}
