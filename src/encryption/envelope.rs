//! Signed-and-encrypted armored envelopes
//!
//! Every payload is signed with the sender identity, compressed and then
//! encrypted to the recipient's encryption subkey. Opening an envelope
//! checks the signature against the key of the party we expect to hear from.

use pgp::composed::{Deserializable, Message, SignedPublicKey, SignedSecretKey};
use pgp::crypto::hash::HashAlgorithm;
use pgp::crypto::sym::SymmetricKeyAlgorithm;
use pgp::types::{CompressionAlgorithm, KeyTrait, SecretKeyTrait};
use rand::thread_rng;
use tracing::{debug, warn};

use super::unlock::UnlockKey;
use super::CodecError;
use crate::types::CommandMessage;

const MESSAGE_BEGIN: &str = "-----BEGIN PGP MESSAGE-----";
const MESSAGE_END: &str = "-----END PGP MESSAGE-----";

/// An identity whose secret key has been proven to unlock. Keeps the hex
/// unlock key so it is not re-derived per message.
#[derive(Clone)]
pub struct UnlockedIdentity {
    secret: SignedSecretKey,
    public: SignedPublicKey,
    passphrase: String,
}

impl UnlockedIdentity {
    pub fn public_key(&self) -> &SignedPublicKey {
        &self.public
    }

    pub fn armored_public_key(&self) -> Result<String, CodecError> {
        self.public
            .to_armored_string(None)
            .map_err(|e| CodecError::Key(e.to_string()))
    }
}

impl std::fmt::Debug for UnlockedIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UnlockedIdentity({})", hex::encode_upper(self.public.fingerprint()))
    }
}

/// Parse the armored private key and prove `unlock_key` opens it
pub fn unlock_identity(private_key: &str, unlock_key: &UnlockKey) -> Result<UnlockedIdentity, CodecError> {
    let (secret, _) =
        SignedSecretKey::from_string(private_key).map_err(|e| CodecError::Key(e.to_string()))?;
    let passphrase = unlock_key.to_hex();

    secret
        .unlock(|| passphrase.clone(), |_| Ok(()))
        .map_err(|_| CodecError::WrongPassphrase)?;

    let public = secret
        .public_key()
        .sign(&secret, || passphrase.clone())
        .map_err(|e| CodecError::Key(e.to_string()))?;

    debug!("Identity unlocked");
    Ok(UnlockedIdentity {
        secret,
        public,
        passphrase,
    })
}

pub fn parse_public_key(armored: &str) -> Result<SignedPublicKey, CodecError> {
    SignedPublicKey::from_string(armored)
        .map(|(key, _)| key)
        .map_err(|e| CodecError::Key(e.to_string()))
}

/// Cheap shape check done before any cryptographic call
pub fn is_armored_message(text: &str) -> bool {
    let text = text.trim();
    !text.is_empty() && text.starts_with(MESSAGE_BEGIN) && text.ends_with(MESSAGE_END)
}

/// Sign `plaintext` as `sender` and encrypt it to `recipient`
pub fn encrypt_for(
    plaintext: &[u8],
    recipient: &SignedPublicKey,
    sender: &UnlockedIdentity,
) -> Result<String, CodecError> {
    let encryption_key = recipient
        .public_subkeys
        .iter()
        .find(|k| k.is_encryption_key())
        .ok_or(CodecError::NoEncryptionKey)?;

    let encrypt = |e: pgp::errors::Error| CodecError::Encrypt(e.to_string());
    let passphrase = sender.passphrase.clone();

    let armored = Message::new_literal_bytes("", plaintext)
        .sign(&sender.secret, || passphrase, HashAlgorithm::SHA2_256)
        .map_err(encrypt)?
        .compress(CompressionAlgorithm::ZLIB)
        .map_err(encrypt)?
        .encrypt_to_keys(&mut thread_rng(), SymmetricKeyAlgorithm::AES128, &[encryption_key])
        .map_err(encrypt)?
        .to_armored_string(None)
        .map_err(encrypt)?;

    debug!(plain_len = plaintext.len(), armored_len = armored.len(), "Envelope sealed");
    Ok(armored)
}

/// Decrypt an envelope addressed to `recipient` and verify it was signed
/// by `sender`
pub fn decrypt_from(
    ciphertext: &str,
    sender: &SignedPublicKey,
    recipient: &UnlockedIdentity,
) -> Result<Vec<u8>, CodecError> {
    if !is_armored_message(ciphertext) {
        return Err(CodecError::MalformedArmor);
    }

    let decrypt = |e: pgp::errors::Error| CodecError::Decrypt(e.to_string());

    let (message, _) = Message::from_string(ciphertext.trim()).map_err(decrypt)?;
    let passphrase = recipient.passphrase.clone();
    let (mut decrypter, _) = message
        .decrypt(|| passphrase, &[&recipient.secret])
        .map_err(decrypt)?;
    let message = decrypter
        .next()
        .ok_or_else(|| CodecError::Decrypt("no decryptable packet".to_string()))?
        .map_err(decrypt)?;

    let message = if matches!(message, Message::Compressed(_)) {
        message.decompress().map_err(decrypt)?
    } else {
        message
    };

    if !matches!(message, Message::Signed { .. }) {
        return Err(CodecError::Unsigned);
    }
    if let Err(e) = message.verify(sender) {
        warn!("Envelope signature rejected: {}", e);
        return Err(CodecError::SignerMismatch);
    }

    let content = message
        .get_content()
        .map_err(decrypt)?
        .unwrap_or_default();
    debug!(plain_len = content.len(), "Envelope opened");
    Ok(content)
}

/// Open an envelope and parse it as a [`CommandMessage`]. A JSON failure is
/// reported as [`CodecError::Payload`], separate from crypto failures.
pub fn decode_command(
    ciphertext: &str,
    sender: &SignedPublicKey,
    recipient: &UnlockedIdentity,
) -> Result<CommandMessage, CodecError> {
    let plaintext = decrypt_from(ciphertext, sender, recipient)?;
    Ok(CommandMessage::from_json(&plaintext)?)
}
