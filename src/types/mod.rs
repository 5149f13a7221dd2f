pub mod command;
pub mod error;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use command::{Command, CommandMessage};
pub use error::{classify_error, ErrorCode};

/// Connection parameters and credentials for one leg (IMAP or SMTP)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Implicit TLS (993/465) when true, otherwise plain/STARTTLS
    pub tls: bool,
    pub username: String,
    pub password: String,
    /// Accept untrusted certificates for this leg
    #[serde(default)]
    pub ignore_certificate: bool,
}

/// Mail credentials as submitted by the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSubmission {
    pub uuid: String,
    pub email: String,
    pub imap: ServerSettings,
    pub smtp: ServerSettings,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub time_zone_offset: Option<i32>,
}

/// One mail-relay account the user wants to use as a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRecord {
    pub uuid: String,
    pub email: String,
    pub imap: ServerSettings,
    pub smtp: ServerSettings,
    /// Average IMAP latency in milliseconds from the last probe
    pub imap_test_result: Option<u64>,
    pub imap_check: bool,
    pub smtp_check: bool,
    /// Whether the introduction (connect request) has been dispatched
    #[serde(rename = "sendToQTGate")]
    pub send_to_peer: bool,
    pub server_folder: Option<String>,
    pub client_folder: Option<String>,
    pub random_password: Option<String>,
    pub validated: Option<bool>,
    pub can_do_delete: bool,
    pub language: Option<String>,
    pub time_zone_offset: Option<i32>,
}

impl AccountRecord {
    pub fn from_submission(submission: AccountSubmission) -> Self {
        Self {
            uuid: submission.uuid,
            email: submission.email,
            imap: submission.imap,
            smtp: submission.smtp,
            imap_test_result: None,
            imap_check: false,
            smtp_check: false,
            send_to_peer: false,
            server_folder: None,
            client_folder: None,
            random_password: None,
            validated: None,
            can_do_delete: true,
            language: submission.language,
            time_zone_offset: submission.time_zone_offset,
        }
    }

    /// Both legs verified and a latency recorded
    pub fn is_channel_ready(&self) -> bool {
        self.imap_check && self.smtp_check && self.imap_test_result.is_some()
    }

    /// Assign the folder pair and channel password the first time the record
    /// is used for a connection. Returns true when new identifiers were drawn.
    ///
    /// Identifiers are never redrawn while `can_do_delete` is false: both ends
    /// of the channel address each other through them.
    pub fn prepare_for_connection(&mut self) -> bool {
        let regenerate = self.server_folder.is_none() || self.can_do_delete;
        if regenerate {
            self.server_folder = Some(Uuid::new_v4().to_string());
            self.client_folder = Some(Uuid::new_v4().to_string());
            self.random_password = Some(Uuid::new_v4().to_string());
            self.send_to_peer = false;
        }
        self.can_do_delete = false;
        regenerate
    }

    fn apply_submission(&mut self, submission: AccountSubmission) {
        self.email = submission.email;
        self.imap = submission.imap;
        self.smtp = submission.smtp;
    }
}

/// Why a pool operation was refused
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("Email {0} is already registered under another account")]
    DuplicateEmail(String),

    #[error("Account not found: {0}")]
    NotFound(String),

    #[error("Account {0} is in use by a session and cannot be deleted")]
    InUse(String),
}

impl PoolError {
    /// Numeric code used on the notification surface
    pub fn code(&self) -> u8 {
        match self {
            PoolError::DuplicateEmail(_) => 10,
            PoolError::NotFound(_) => 1,
            PoolError::InUse(_) => 11,
        }
    }
}

/// Ordered list of account records, newest first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountPool {
    records: Vec<AccountRecord>,
}

impl AccountPool {
    pub fn new(records: Vec<AccountRecord>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[AccountRecord] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn get(&self, uuid: &str) -> Option<&AccountRecord> {
        self.records.iter().find(|r| r.uuid == uuid)
    }

    pub fn get_mut(&mut self, uuid: &str) -> Option<&mut AccountRecord> {
        self.records.iter_mut().find(|r| r.uuid == uuid)
    }

    pub fn first(&self) -> Option<&AccountRecord> {
        self.records.first()
    }

    /// Insert a new record or update the server settings of an existing one.
    /// Identifiers, flags and probe results of an existing record are kept.
    pub fn upsert(&mut self, submission: AccountSubmission) -> Result<usize, PoolError> {
        if self
            .records
            .iter()
            .any(|r| r.email == submission.email && r.uuid != submission.uuid)
        {
            return Err(PoolError::DuplicateEmail(submission.email));
        }

        match self.records.iter().position(|r| r.uuid == submission.uuid) {
            Some(index) => {
                self.records[index].apply_submission(submission);
                Ok(index)
            }
            None => {
                self.records.insert(0, AccountRecord::from_submission(submission));
                Ok(0)
            }
        }
    }

    /// Remove a record; refused while the record is bound to a session
    pub fn remove(&mut self, uuid: &str) -> Result<AccountRecord, PoolError> {
        let index = self
            .records
            .iter()
            .position(|r| r.uuid == uuid)
            .ok_or_else(|| PoolError::NotFound(uuid.to_string()))?;
        if !self.records[index].can_do_delete {
            return Err(PoolError::InUse(uuid.to_string()));
        }
        Ok(self.records.remove(index))
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

/// Connection phase reported to the UI (`qtGateConnecting`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPhase {
    /// Waiting for the user to confirm the connection
    AwaitingConfirmation,
    Connecting,
    Connected,
    Failed,
    /// Introduction sent, waiting for the peer to answer
    AwaitingPeer,
}

impl ConnectPhase {
    pub fn code(self) -> u8 {
        match self {
            ConnectPhase::AwaitingConfirmation => 0,
            ConnectPhase::Connecting => 1,
            ConnectPhase::Connected => 2,
            ConnectPhase::Failed => 3,
            ConnectPhase::AwaitingPeer => 4,
        }
    }
}

impl Serialize for ConnectPhase {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u8(self.code())
    }
}

/// Connection status pushed to the UI surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectStatus {
    #[serde(rename = "qtgateConnectImapAccount")]
    pub account_uuid: Option<String>,
    #[serde(rename = "qtGateConnecting")]
    pub phase: ConnectPhase,
    #[serde(rename = "isKeypairQtgateConform")]
    pub verified_keypair: bool,
    pub error: Option<ErrorCode>,
}

/// Outcome of probing one account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub uuid: String,
    pub imap: Result<u64, ErrorCode>,
    /// Not attempted when the IMAP probe failed
    pub smtp: Option<Result<(), ErrorCode>>,
}

impl ProbeReport {
    pub fn passed(&self) -> bool {
        self.imap.is_ok() && matches!(self.smtp, Some(Ok(())))
    }
}
