//! Master key material handling.

use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;

/// PBKDF2 parameters are frozen: changing either one is a breaking migration
/// that silently orphans every stored envelope.
const DERIVE_ITERATIONS: u32 = 100_000;
const DERIVE_SALT: &[u8] = b"ai-guard-master-key-salt";

/// A 32-byte AES-256 master key, read-only after construction.
#[derive(Clone)]
pub struct MasterKey([u8; 32]);

impl MasterKey {
    /// Build a key from configured material.
    ///
    /// Material of 32 bytes or more is used raw (first 32 bytes); shorter
    /// material is stretched with PBKDF2-SHA256.
    pub fn from_material(material: &[u8]) -> Self {
        let mut key = [0u8; 32];
        if material.len() >= 32 {
            key.copy_from_slice(&material[..32]);
        } else {
            pbkdf2_hmac::<Sha256>(material, DERIVE_SALT, DERIVE_ITERATIONS, &mut key);
        }
        Self(key)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

// Key bytes must never end up in logs.
impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}
