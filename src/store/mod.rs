//! Account pool persistence
//!
//! On disk the pool is an opaque armored blob: the JSON list is signed and
//! encrypted to our own key and replaced atomically.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::config::write_atomic;
use crate::encryption::{decrypt_from, encrypt_for, CodecError, UnlockedIdentity};
use crate::types::AccountPool;

pub const ACCOUNT_POOL_FILE: &str = "imapData.pem";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Codec(#[from] CodecError),

    #[error("Invalid account data: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Store lock poisoned")]
    Poisoned,
}

pub trait AccountPoolStore: Send + Sync {
    fn load(&self) -> Result<AccountPool, StoreError>;

    /// Atomic overwrite
    fn save(&self, pool: &AccountPool) -> Result<(), StoreError>;
}

pub struct FileAccountStore {
    path: PathBuf,
    identity: Arc<UnlockedIdentity>,
}

impl FileAccountStore {
    pub fn new(data_dir: &Path, identity: Arc<UnlockedIdentity>) -> Self {
        Self {
            path: data_dir.join(ACCOUNT_POOL_FILE),
            identity,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AccountPoolStore for FileAccountStore {
    fn load(&self) -> Result<AccountPool, StoreError> {
        if !self.path.exists() {
            debug!("No account pool at {:?}", self.path);
            return Ok(AccountPool::default());
        }
        let armored = fs::read_to_string(&self.path)?;
        let plain = decrypt_from(&armored, self.identity.public_key(), &self.identity)?;
        let pool: AccountPool = serde_json::from_slice(&plain)?;
        info!(count = pool.len(), "Loaded account pool");
        Ok(pool)
    }

    fn save(&self, pool: &AccountPool) -> Result<(), StoreError> {
        if pool.is_empty() {
            if self.path.exists() {
                fs::remove_file(&self.path)?;
                info!("Account pool empty, removed {:?}", self.path);
            }
            return Ok(());
        }
        let json = serde_json::to_vec(pool)?;
        let armored = encrypt_for(&json, self.identity.public_key(), &self.identity)?;
        write_atomic(&self.path, armored.as_bytes())?;
        debug!(count = pool.len(), "Saved account pool");
        Ok(())
    }
}

/// In-process store
#[derive(Default)]
pub struct MemoryAccountStore {
    pool: Mutex<AccountPool>,
    saves: Mutex<usize>,
}

impl MemoryAccountStore {
    pub fn new(pool: AccountPool) -> Self {
        Self {
            pool: Mutex::new(pool),
            saves: Mutex::new(0),
        }
    }

    pub fn save_count(&self) -> usize {
        self.saves.lock().map(|n| *n).unwrap_or(0)
    }
}

impl AccountPoolStore for MemoryAccountStore {
    fn load(&self) -> Result<AccountPool, StoreError> {
        self.pool
            .lock()
            .map(|pool| pool.clone())
            .map_err(|_| StoreError::Poisoned)
    }

    fn save(&self, pool: &AccountPool) -> Result<(), StoreError> {
        *self.pool.lock().map_err(|_| StoreError::Poisoned)? = pool.clone();
        *self.saves.lock().map_err(|_| StoreError::Poisoned)? += 1;
        Ok(())
    }
}
