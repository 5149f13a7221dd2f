use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::encryption::{KeyPair, UnlockParams};

pub const DEFAULT_PEER_EMAIL: &str = "QTGate@QTGate.com";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("No config directory available")]
    NoConfigDir,

    #[error("Peer public key path not configured")]
    NoPeerKey,
}

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_true")]
    pub first_run: bool,

    #[serde(default)]
    pub already_init: bool,

    #[serde(default)]
    pub version: String,

    /// Email the identity was created for
    pub account: Option<String>,

    /// Account record currently used as the channel
    pub connect_account_uuid: Option<String>,

    /// Passphrase derivation parameters, generated on first run
    pub unlock: UnlockParams,

    /// Local identity
    pub keypair: Option<KeyPair>,

    #[serde(default)]
    pub peer: PeerConfig,

    #[serde(default)]
    pub session: SessionConfig,
}

/// The remote gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    #[serde(default = "default_peer_email")]
    pub email: String,

    /// Armored public key of the peer
    pub public_key_path: Option<PathBuf>,
}

/// Session timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,

    #[serde(default = "default_probe_attempts")]
    pub probe_attempts: usize,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_peer_email() -> String {
    DEFAULT_PEER_EMAIL.to_string()
}

fn default_keep_alive() -> u64 {
    30
}

fn default_reconnect_delay() -> u64 {
    5
}

fn default_probe_attempts() -> usize {
    4
}

fn default_probe_timeout() -> u64 {
    15
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            email: default_peer_email(),
            public_key_path: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keep_alive_secs: default_keep_alive(),
            reconnect_delay_secs: default_reconnect_delay(),
            probe_attempts: default_probe_attempts(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

impl PeerConfig {
    /// Read the peer's armored public key from `public_key_path`
    pub fn read_public_key(&self) -> Result<String, ConfigError> {
        let path = self.public_key_path.as_ref().ok_or(ConfigError::NoPeerKey)?;
        Ok(fs::read_to_string(path)?)
    }
}

impl SessionConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

impl AppConfig {
    pub fn new(version: &str) -> Self {
        Self {
            first_run: true,
            already_init: false,
            version: version.to_string(),
            account: None,
            connect_account_uuid: None,
            unlock: UnlockParams::generate(),
            keypair: None,
            peer: PeerConfig::default(),
            session: SessionConfig::default(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading configuration from: {:?}", path);
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load the config, or start over with fresh unlock parameters when the
    /// file is missing or unreadable
    pub fn load_or_init(path: &Path, version: &str) -> Self {
        if path.exists() {
            match Self::load(path) {
                Ok(mut config) => {
                    config.version = version.to_string();
                    return config;
                }
                Err(e) => warn!("Could not load config, starting fresh: {}", e),
            }
        } else {
            info!("No config file found, using a new config");
        }
        Self::new(version)
    }

    /// Write through a sibling temp file so a crash never leaves a torn file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        write_atomic(path, content.as_bytes())?;
        info!("Saved configuration to: {:?}", path);
        Ok(())
    }

    /// Forget the identity. This is the only place unlock parameters are
    /// redrawn.
    pub fn reset_identity(&mut self) {
        self.unlock = UnlockParams::generate();
        self.keypair = None;
        self.account = None;
        self.connect_account_uuid = None;
        self.first_run = true;
        self.already_init = false;
    }
}

/// `<config_dir>/mailtunnel/config.toml`
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join("mailtunnel").join("config.toml"))
        .ok_or(ConfigError::NoConfigDir)
}

/// Replace `path` with `bytes` via temp file + rename
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}
