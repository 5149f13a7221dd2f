//! Identity encryption
//!
//! - `unlock`: passphrase → unlock key (PBKDF2)
//! - `keys`: the OpenPGP identity key pair and its metadata
//! - `envelope`: signed-and-encrypted armored envelopes

pub mod envelope;
pub mod keys;
pub mod unlock;

use thiserror::Error;

pub use envelope::{
    decode_command, decrypt_from, encrypt_for, is_armored_message, parse_public_key,
    unlock_identity, UnlockedIdentity,
};
pub use keys::{KeyPair, KeyPairSummary, TRUSTED_SIGNER_KEY_ID};
pub use unlock::{derive_unlock_key, UnlockError, UnlockKey, UnlockParams};

/// Key pair and envelope errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Wrong passphrase")]
    WrongPassphrase,

    #[error("Not an armored OpenPGP message")]
    MalformedArmor,

    #[error("Invalid key: {0}")]
    Key(String),

    #[error("Key has no encryption subkey")]
    NoEncryptionKey,

    #[error("Encryption failed: {0}")]
    Encrypt(String),

    #[error("Decryption failed: {0}")]
    Decrypt(String),

    #[error("Message is not signed")]
    Unsigned,

    #[error("Signature does not match the expected sender")]
    SignerMismatch,

    /// Decryption worked but the plaintext is not a valid command
    #[error("Invalid payload: {0}")]
    Payload(#[from] serde_json::Error),
}
