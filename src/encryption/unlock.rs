//! Passphrase-derived unlock key
//!
//! The unlock key is what locks the secret half of the identity key pair.
//! Deriving it is deliberately slow, so callers derive once per unlocked
//! session and keep the [`UnlockKey`] around.

use pbkdf2::pbkdf2_hmac;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Sha256, Sha512};

const SALT_LEN: usize = 64;
const MIN_ITERATIONS: u32 = 2000;
const MAX_ITERATIONS: u32 = 4000;
const MIN_KEY_LEN: usize = 16;
const MAX_KEY_LEN: usize = 46;

#[derive(Debug, thiserror::Error)]
pub enum UnlockError {
    #[error("Invalid salt encoding: {0}")]
    InvalidSalt(#[from] hex::FromHexError),

    #[error("Unlock parameters out of range: {0}")]
    InvalidParams(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Digest {
    Sha512,
    Sha256,
}

/// Per-install derivation parameters, generated once and persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockParams {
    /// Hex-encoded random salt
    pub salt: String,
    pub iterations: u32,
    pub key_len: usize,
    pub digest: Digest,
}

impl UnlockParams {
    /// Draw fresh parameters. Only first run and identity reset call this.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut salt = [0u8; SALT_LEN];
        rng.fill_bytes(&mut salt);
        Self {
            salt: hex::encode(salt),
            iterations: rng.gen_range(MIN_ITERATIONS..=MAX_ITERATIONS),
            key_len: rng.gen_range(MIN_KEY_LEN..=MAX_KEY_LEN),
            digest: Digest::Sha512,
        }
    }

    fn validate(&self) -> Result<Vec<u8>, UnlockError> {
        if self.iterations == 0 {
            return Err(UnlockError::InvalidParams("zero iterations".into()));
        }
        if self.key_len == 0 || self.key_len > 1024 {
            return Err(UnlockError::InvalidParams(format!(
                "key length {}",
                self.key_len
            )));
        }
        Ok(hex::decode(&self.salt)?)
    }
}

/// Symmetric key derived from the user's passphrase
#[derive(Clone, PartialEq, Eq)]
pub struct UnlockKey(Vec<u8>);

impl UnlockKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Hex form, used as the OpenPGP secret key passphrase
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl std::fmt::Debug for UnlockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UnlockKey({} bytes)", self.0.len())
    }
}

/// Derive the unlock key. Same passphrase and parameters always give the
/// same bytes; a wrong passphrase is only noticed when the key fails to
/// unlock the identity.
pub fn derive_unlock_key(passphrase: &str, params: &UnlockParams) -> Result<UnlockKey, UnlockError> {
    let salt = params.validate()?;
    let mut out = vec![0u8; params.key_len];
    match params.digest {
        Digest::Sha512 => pbkdf2_hmac::<Sha512>(passphrase.as_bytes(), &salt, params.iterations, &mut out),
        Digest::Sha256 => pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), &salt, params.iterations, &mut out),
    }
    Ok(UnlockKey(out))
}
