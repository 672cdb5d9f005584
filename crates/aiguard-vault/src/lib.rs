//! Credential vault: AEAD envelopes around provider API keys.
//!
//! A [`MasterKey`] (32 bytes, derived from shorter material when needed)
//! seals each provider credential into a base64 envelope laid out as
//! `IV(12) || TAG(16) || CIPHERTEXT` under AES-256-GCM. The plaintext is a
//! small JSON document carrying the key itself, a random `key_id` handle,
//! caller metadata, and the encryption timestamp.
//!
//! Rotation is a pure function over (envelope, old key, new key) — no
//! process-global key is ever swapped.

mod envelope;
mod master_key;

pub use envelope::{DecryptedCredential, SealedCredential, Vault, VaultError};
pub use master_key::MasterKey;
