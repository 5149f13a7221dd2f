use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use pgp::composed::{
    Deserializable, KeyType, SecretKeyParamsBuilder, SignedPublicKey, SignedSecretKey,
    SubkeyParamsBuilder,
};
use pgp::crypto::hash::HashAlgorithm;
use pgp::crypto::sym::SymmetricKeyAlgorithm;
use pgp::types::{CompressionAlgorithm, KeyTrait, PublicParams, SecretKeyTrait};
use serde::{Deserialize, Serialize};
use smallvec::smallvec;
use tracing::{debug, info};

use super::unlock::UnlockKey;
use super::CodecError;

/// Issuer key id whose certification marks a key pair as verified by the peer
pub const TRUSTED_SIGNER_KEY_ID: &str = "3acbe3cbd3c1caa9";

/// Long-term identity. The private key stays armored and locked with the
/// hex unlock key; it is only parsed when needed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPair {
    pub public_key: String,
    pub private_key: String,
    pub key_length: u32,
    pub created_at: DateTime<Utc>,
    pub display_name: String,
    pub email: String,
    pub verified: bool,
    #[serde(rename = "publicKeyID")]
    pub public_key_id: String,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key_id", &self.public_key_id)
            .field("email", &self.email)
            .field("verified", &self.verified)
            .finish()
    }
}

/// Key pair details without armored material
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPairSummary {
    pub key_length: u32,
    pub created_at: DateTime<Utc>,
    pub display_name: String,
    pub email: String,
    pub verified: bool,
    #[serde(rename = "publicKeyID")]
    pub public_key_id: String,
}

fn pgp_err(e: pgp::errors::Error) -> CodecError {
    CodecError::Key(e.to_string())
}

impl KeyPair {
    /// Create a fresh EdDSA/ECDH key pair locked with `unlock_key`
    pub fn generate(display_name: &str, email: &str, unlock_key: &UnlockKey) -> Result<Self, CodecError> {
        let passphrase = unlock_key.to_hex();
        let user_id = format!("{} <{}>", display_name, email);

        let subkey = SubkeyParamsBuilder::default()
            .key_type(KeyType::ECDH)
            .can_encrypt(true)
            .passphrase(Some(passphrase.clone()))
            .build()
            .map_err(|e| CodecError::Key(e.to_string()))?;

        let params = SecretKeyParamsBuilder::default()
            .key_type(KeyType::EdDSA)
            .can_create_certificates(true)
            .can_sign(true)
            .primary_user_id(user_id)
            .passphrase(Some(passphrase.clone()))
            .preferred_symmetric_algorithms(smallvec![SymmetricKeyAlgorithm::AES128])
            .preferred_hash_algorithms(smallvec![HashAlgorithm::SHA2_256])
            .preferred_compression_algorithms(smallvec![CompressionAlgorithm::ZLIB])
            .subkey(subkey)
            .build()
            .map_err(|e| CodecError::Key(e.to_string()))?;

        let secret = params.generate().map_err(pgp_err)?;
        let signed_secret = secret.sign(|| passphrase.clone()).map_err(pgp_err)?;
        let signed_public = signed_secret
            .public_key()
            .sign(&signed_secret, || passphrase.clone())
            .map_err(pgp_err)?;

        let public_key = signed_public.to_armored_string(None).map_err(pgp_err)?;
        let private_key = signed_secret.to_armored_string(None).map_err(pgp_err)?;

        let pair = Self::from_armored(&public_key, &private_key)?;
        info!(key_id = %pair.public_key_id, "Generated identity key pair");
        Ok(pair)
    }

    /// Build a key pair from armored material, reading all metadata from the
    /// public key
    pub fn from_armored(public_key: &str, private_key: &str) -> Result<Self, CodecError> {
        let (public, _) = SignedPublicKey::from_string(public_key).map_err(pgp_err)?;
        // The secret key must at least parse; it stays locked.
        SignedSecretKey::from_string(private_key).map_err(pgp_err)?;

        let (display_name, email) = public
            .details
            .users
            .first()
            .map(|u| parse_user_id(&u.id.id().to_string()))
            .unwrap_or_default();

        Ok(Self {
            public_key: public_key.to_string(),
            private_key: private_key.to_string(),
            key_length: key_length(&public),
            created_at: *public.primary_key.created_at(),
            display_name,
            email,
            verified: is_verified(&public),
            public_key_id: public_key_id(&public),
        })
    }

    /// Whether `unlock_key` unlocks the private key ("passwordOK")
    pub fn check_passphrase(&self, unlock_key: &UnlockKey) -> bool {
        let secret = match SignedSecretKey::from_string(&self.private_key) {
            Ok((secret, _)) => secret,
            Err(e) => {
                debug!("Stored private key does not parse: {}", e);
                return false;
            }
        };
        secret.unlock(|| unlock_key.to_hex(), |_| Ok(())).is_ok()
    }

    /// Replace the public key with the re-certified copy sent back by the
    /// peer (base64 of the armored key) and recompute `verified`
    pub fn replace_public_key(&mut self, encoded: &str) -> Result<(), CodecError> {
        let armored = match BASE64.decode(encoded.trim()) {
            Ok(bytes) => String::from_utf8(bytes).map_err(|e| CodecError::Key(e.to_string()))?,
            // Accept the armored text as is
            Err(_) => encoded.to_string(),
        };
        let (public, _) = SignedPublicKey::from_string(&armored).map_err(pgp_err)?;
        if public_key_id(&public) != self.public_key_id {
            return Err(CodecError::Key(
                "replacement key belongs to another identity".to_string(),
            ));
        }
        self.verified = is_verified(&public);
        self.public_key = armored;
        info!(key_id = %self.public_key_id, verified = self.verified, "Public key replaced");
        Ok(())
    }

    pub fn summary(&self) -> KeyPairSummary {
        KeyPairSummary {
            key_length: self.key_length,
            created_at: self.created_at,
            display_name: self.display_name.clone(),
            email: self.email.clone(),
            verified: self.verified,
            public_key_id: self.public_key_id.clone(),
        }
    }
}

fn key_length(public: &SignedPublicKey) -> u32 {
    match public.primary_key.public_params() {
        PublicParams::RSA { n, .. } => (n.as_bytes().len() * 8) as u32,
        _ => 256,
    }
}

fn public_key_id(public: &SignedPublicKey) -> String {
    let fingerprint = hex::encode_upper(public.fingerprint());
    fingerprint[fingerprint.len().saturating_sub(8)..].to_string()
}

fn is_verified(public: &SignedPublicKey) -> bool {
    public.details.users.first().is_some_and(|user| {
        user.signatures.iter().any(|sig| {
            sig.issuer()
                .is_some_and(|id| hex::encode(id) == TRUSTED_SIGNER_KEY_ID)
        })
    })
}

/// Split `Name (comment) <email>` into display name and email
fn parse_user_id(user_id: &str) -> (String, String) {
    let (name, email) = match (user_id.find('<'), user_id.rfind('>')) {
        (Some(start), Some(end)) if start < end => {
            (&user_id[..start], user_id[start + 1..end].to_string())
        }
        _ => (user_id, String::new()),
    };
    let name = match name.find(" (") {
        Some(idx) => &name[..idx],
        None => name,
    };
    (name.trim().to_string(), email)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::unlock::{derive_unlock_key, UnlockParams};

    fn unlock_key(passphrase: &str) -> (UnlockParams, UnlockKey) {
        let params = UnlockParams::generate();
        let key = derive_unlock_key(passphrase, &params).unwrap();
        (params, key)
    }

    #[test]
    fn test_parse_user_id() {
        assert_eq!(
            parse_user_id("Alice <alice@example.com>"),
            ("Alice".to_string(), "alice@example.com".to_string())
        );
        assert_eq!(
            parse_user_id("Bob (work) <bob@example.com>"),
            ("Bob".to_string(), "bob@example.com".to_string())
        );
        assert_eq!(parse_user_id("nobody"), ("nobody".to_string(), String::new()));
    }

    #[test]
    fn test_generate_key_pair_metadata() {
        let (_, key) = unlock_key("hunter2");
        let pair = KeyPair::generate("Alice", "alice@example.com", &key).unwrap();
        assert_eq!(pair.display_name, "Alice");
        assert_eq!(pair.email, "alice@example.com");
        assert_eq!(pair.key_length, 256);
        assert_eq!(pair.public_key_id.len(), 8);
        assert!(pair.public_key_id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
        assert!(!pair.verified);
        assert!(pair.public_key.contains("BEGIN PGP PUBLIC KEY BLOCK"));
        assert!(pair.private_key.contains("BEGIN PGP PRIVATE KEY BLOCK"));
    }

    #[test]
    fn test_check_passphrase() {
        let (params, key) = unlock_key("hunter2");
        let pair = KeyPair::generate("Alice", "alice@example.com", &key).unwrap();
        assert!(pair.check_passphrase(&key));

        let wrong = derive_unlock_key("hunter3", &params).unwrap();
        assert!(!pair.check_passphrase(&wrong));
    }

    #[test]
    fn test_from_armored_roundtrip_keeps_metadata() {
        let (_, key) = unlock_key("pw");
        let pair = KeyPair::generate("Carol", "carol@example.com", &key).unwrap();
        let again = KeyPair::from_armored(&pair.public_key, &pair.private_key).unwrap();
        assert_eq!(again.public_key_id, pair.public_key_id);
        assert_eq!(again.created_at, pair.created_at);
        assert_eq!(again.display_name, "Carol");
        assert_eq!(again.email, "carol@example.com");
        assert!(KeyPair::from_armored("garbage", &pair.private_key).is_err());
    }

    #[test]
    fn test_replace_public_key() {
        let (_, key) = unlock_key("pw");
        let mut pair = KeyPair::generate("Dave", "dave@example.com", &key).unwrap();
        let encoded = BASE64.encode(pair.public_key.as_bytes());
        pair.replace_public_key(&encoded).unwrap();
        assert!(!pair.verified);

        let other = KeyPair::generate("Eve", "eve@example.com", &key).unwrap();
        let encoded = BASE64.encode(other.public_key.as_bytes());
        assert!(pair.replace_public_key(&encoded).is_err());
    }

    #[test]
    fn test_summary_and_debug_hide_material() {
        let (_, key) = unlock_key("pw");
        let pair = KeyPair::generate("Frank", "frank@example.com", &key).unwrap();
        let json = serde_json::to_string(&pair.summary()).unwrap();
        assert!(!json.contains("PGP"));
        assert!(json.contains("publicKeyID"));
        assert!(!format!("{:?}", pair).contains("PGP"));
    }
}
