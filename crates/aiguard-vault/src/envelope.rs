//! AES-256-GCM credential envelopes.
//!
//! Envelope wire format, base64-encoded: `IV(12) || TAG(16) || CIPHERTEXT`.
//! The AEAD library emits `CIPHERTEXT || TAG`; the tag is split out and moved
//! ahead of the ciphertext to keep the stored layout stable.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::Aes256Gcm;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::master_key::MasterKey;

const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Errors produced by envelope operations.
#[derive(Debug)]
pub enum VaultError {
    /// AEAD tag mismatch or malformed envelope bytes.
    DecryptionFailed,
    /// Envelope is not valid base64 or too short to hold IV and tag.
    InvalidEnvelope(String),
    /// The decrypted payload is not the expected JSON document.
    InvalidPayload(serde_json::Error),
    /// Encryption failed (never expected with a well-formed key).
    EncryptionFailed,
}

impl std::fmt::Display for VaultError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DecryptionFailed => write!(f, "credential decryption failed"),
            Self::InvalidEnvelope(reason) => write!(f, "invalid envelope: {reason}"),
            Self::InvalidPayload(e) => write!(f, "invalid envelope payload: {e}"),
            Self::EncryptionFailed => write!(f, "credential encryption failed"),
        }
    }
}

impl std::error::Error for VaultError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidPayload(e) => Some(e),
            _ => None,
        }
    }
}

/// Plaintext document sealed inside an envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EnvelopePayload {
    key: String,
    #[serde(rename = "keyId")]
    key_id: String,
    #[serde(default)]
    metadata: serde_json::Value,
    #[serde(rename = "encryptedAt")]
    encrypted_at: DateTime<Utc>,
}

/// Result of sealing a credential.
#[derive(Debug, Clone)]
pub struct SealedCredential {
    /// Base64 envelope, safe to persist.
    pub envelope: String,
    /// Stable handle chosen at encryption time (16 random bytes, hex).
    pub key_id: String,
}

/// Result of opening an envelope.
#[derive(Debug, Clone)]
pub struct DecryptedCredential {
    pub api_key: String,
    pub key_id: String,
    pub metadata: serde_json::Value,
    pub encrypted_at: DateTime<Utc>,
}

/// Stateless envelope operations over a master key.
#[derive(Clone)]
pub struct Vault {
    master: MasterKey,
}

impl Vault {
    pub fn new(master: MasterKey) -> Self {
        Self { master }
    }

    /// Seal `api_key` with `metadata` into a fresh envelope.
    pub fn encrypt(
        &self,
        api_key: &str,
        metadata: serde_json::Value,
    ) -> Result<SealedCredential, VaultError> {
        let mut key_id_bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut key_id_bytes);
        let key_id = hex::encode(key_id_bytes);

        let payload = EnvelopePayload {
            key: api_key.to_string(),
            key_id: key_id.clone(),
            metadata,
            encrypted_at: Utc::now(),
        };
        let plaintext = serde_json::to_vec(&payload).map_err(VaultError::InvalidPayload)?;

        let envelope = seal(&self.master, &plaintext)?;
        Ok(SealedCredential { envelope, key_id })
    }

    /// Open an envelope produced by [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, envelope: &str) -> Result<DecryptedCredential, VaultError> {
        decrypt_with(&self.master, envelope)
    }

    /// Re-encrypt an envelope from `old` to `new` without touching any shared
    /// state: both keys live only on this call's stack.
    pub fn rotate(
        envelope: &str,
        old: &MasterKey,
        new: &MasterKey,
    ) -> Result<String, VaultError> {
        let opened = open(old, envelope)?;
        seal(new, &opened)
    }
}

fn seal(master: &MasterKey, plaintext: &[u8]) -> Result<String, VaultError> {
    let cipher = Aes256Gcm::new(GenericArray::from_slice(master.as_bytes()));

    let mut iv = [0u8; IV_LEN];
    rand::rng().fill_bytes(&mut iv);

    // `encrypt` returns CIPHERTEXT || TAG.
    let sealed = cipher
        .encrypt(GenericArray::from_slice(&iv), plaintext)
        .map_err(|_| VaultError::EncryptionFailed)?;
    let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

    let mut wire = Vec::with_capacity(IV_LEN + TAG_LEN + ciphertext.len());
    wire.extend_from_slice(&iv);
    wire.extend_from_slice(tag);
    wire.extend_from_slice(ciphertext);
    Ok(BASE64.encode(wire))
}

fn open(master: &MasterKey, envelope: &str) -> Result<Vec<u8>, VaultError> {
    let wire = BASE64
        .decode(envelope)
        .map_err(|e| VaultError::InvalidEnvelope(e.to_string()))?;

    if wire.len() < IV_LEN + TAG_LEN {
        return Err(VaultError::InvalidEnvelope(format!(
            "{} bytes is too short for IV and tag",
            wire.len()
        )));
    }

    let (iv, rest) = wire.split_at(IV_LEN);
    let (tag, ciphertext) = rest.split_at(TAG_LEN);

    // Reassemble the CIPHERTEXT || TAG order the AEAD library expects.
    let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_LEN);
    sealed.extend_from_slice(ciphertext);
    sealed.extend_from_slice(tag);

    let cipher = Aes256Gcm::new(GenericArray::from_slice(master.as_bytes()));
    cipher
        .decrypt(GenericArray::from_slice(iv), sealed.as_slice())
        .map_err(|_| VaultError::DecryptionFailed)
}

fn decrypt_with(master: &MasterKey, envelope: &str) -> Result<DecryptedCredential, VaultError> {
    let plaintext = open(master, envelope)?;
    let payload: EnvelopePayload =
        serde_json::from_slice(&plaintext).map_err(VaultError::InvalidPayload)?;
    Ok(DecryptedCredential {
        api_key: payload.key,
        key_id: payload.key_id,
        metadata: payload.metadata,
        encrypted_at: payload.encrypted_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> Vault {
        Vault::new(MasterKey::from_material(&[0x42; 32]))
    }

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let vault = vault();
        let meta = serde_json::json!({"env": "prod", "team": "ml"});
        let sealed = vault.encrypt("sk-ant-realkey", meta.clone()).unwrap();

        let opened = vault.decrypt(&sealed.envelope).unwrap();
        assert_eq!(opened.api_key, "sk-ant-realkey");
        assert_eq!(opened.metadata, meta);
        assert_eq!(opened.key_id, sealed.key_id);
    }

    #[test]
    fn key_id_is_sixteen_random_bytes_hex() {
        let vault = vault();
        let a = vault.encrypt("k", serde_json::Value::Null).unwrap();
        let b = vault.encrypt("k", serde_json::Value::Null).unwrap();
        assert_eq!(a.key_id.len(), 32);
        assert!(a.key_id.bytes().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a.key_id, b.key_id);
    }

    #[test]
    fn envelopes_are_unique_per_encryption() {
        let vault = vault();
        let a = vault.encrypt("same-key", serde_json::Value::Null).unwrap();
        let b = vault.encrypt("same-key", serde_json::Value::Null).unwrap();
        assert_ne!(a.envelope, b.envelope, "IV must be random per envelope");
    }

    #[test]
    fn wrong_key_fails_decryption() {
        let sealed = vault().encrypt("secret", serde_json::Value::Null).unwrap();
        let other = Vault::new(MasterKey::from_material(&[0x43; 32]));
        assert!(matches!(
            other.decrypt(&sealed.envelope),
            Err(VaultError::DecryptionFailed)
        ));
    }

    #[test]
    fn tampered_ciphertext_fails_tag_check() {
        let vault = vault();
        let sealed = vault.encrypt("secret", serde_json::Value::Null).unwrap();

        let mut wire = BASE64.decode(&sealed.envelope).unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0x01;
        let tampered = BASE64.encode(wire);

        assert!(matches!(
            vault.decrypt(&tampered),
            Err(VaultError::DecryptionFailed)
        ));
    }

    #[test]
    fn garbage_envelope_is_rejected() {
        let vault = vault();
        assert!(matches!(
            vault.decrypt("not-base64!!!"),
            Err(VaultError::InvalidEnvelope(_))
        ));
        assert!(matches!(
            vault.decrypt(&BASE64.encode([0u8; 8])),
            Err(VaultError::InvalidEnvelope(_))
        ));
    }

    #[test]
    fn wire_layout_is_iv_tag_ciphertext() {
        let vault = vault();
        let sealed = vault.encrypt("k", serde_json::Value::Null).unwrap();
        let wire = BASE64.decode(&sealed.envelope).unwrap();
        // Payload JSON is never shorter than a few dozen bytes, so the wire
        // must be strictly longer than the fixed header.
        assert!(wire.len() > IV_LEN + TAG_LEN);
    }

    #[test]
    fn rotation_preserves_plaintext() {
        let old = MasterKey::from_material(b"old-master-passphrase");
        let new = MasterKey::from_material(b"new-master-passphrase");
        let old_vault = Vault::new(old.clone());

        let meta = serde_json::json!({"rotated": true});
        let sealed = old_vault.encrypt("sk-rotate-me", meta.clone()).unwrap();

        let rotated = Vault::rotate(&sealed.envelope, &old, &new).unwrap();
        let opened = Vault::new(new).decrypt(&rotated).unwrap();

        assert_eq!(opened.api_key, "sk-rotate-me");
        assert_eq!(opened.key_id, sealed.key_id);
        assert_eq!(opened.metadata, meta);

        // The old key can no longer open the rotated envelope.
        assert!(matches!(
            old_vault.decrypt(&rotated),
            Err(VaultError::DecryptionFailed)
        ));
    }

    #[test]
    fn rotation_under_wrong_old_key_fails_closed() {
        let old = MasterKey::from_material(b"old");
        let wrong = MasterKey::from_material(b"wrong");
        let new = MasterKey::from_material(b"new");
        let sealed = Vault::new(old).encrypt("k", serde_json::Value::Null).unwrap();

        assert!(matches!(
            Vault::rotate(&sealed.envelope, &wrong, &new),
            Err(VaultError::DecryptionFailed)
        ));
    }
}
