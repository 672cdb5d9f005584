//! Slow hashing of personal access tokens.
//!
//! The full wire string (`pat_<id>_<secret>`) goes through bcrypt at cost 10.
//! Verification is bcrypt's constant-time check against the stored hash; the
//! identifier segment only narrows the candidate set via an indexed lookup
//! and is never itself a security boundary.

use aiguard_types::MintedPat;

const BCRYPT_COST: u32 = 10;

/// Errors from hashing or verification.
#[derive(Debug)]
pub struct HashError(bcrypt::BcryptError);

impl std::fmt::Display for HashError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bcrypt error: {}", self.0)
    }
}

impl std::error::Error for HashError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

/// Hash a full token string for storage.
pub fn hash_token(token: &str) -> Result<String, HashError> {
    bcrypt::hash(token, BCRYPT_COST).map_err(HashError)
}

/// Constant-time verification of a presented token against a stored hash.
pub fn verify_token(token: &str, stored_hash: &str) -> bool {
    bcrypt::verify(token, stored_hash).unwrap_or(false)
}

/// Mint a fresh token and its storage hash in one step.
///
/// Returns the minted token (the only place the raw secret ever exists) and
/// the hash to persist.
pub fn mint() -> Result<(MintedPat, String), HashError> {
    let minted = MintedPat::generate();
    let hash = hash_token(minted.token.as_str())?;
    Ok((minted, hash))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_token_verifies_against_its_hash() {
        let (minted, hash) = mint().unwrap();
        assert!(verify_token(minted.token.as_str(), &hash));
    }

    #[test]
    fn different_token_fails_verification() {
        let (_, hash) = mint().unwrap();
        let (other, _) = mint().unwrap();
        assert!(!verify_token(other.token.as_str(), &hash));
    }

    /// The hash covers the full wire string, identifier included: the same
    /// secret under a different identifier must not verify.
    #[test]
    fn hash_covers_the_identifier_segment() {
        let (minted, hash) = mint().unwrap();
        let swapped = format!(
            "pat_{}_{}",
            "0000000000000000",
            minted.token.secret()
        );
        assert!(!verify_token(&swapped, &hash));
    }

    #[test]
    fn malformed_stored_hash_fails_closed() {
        assert!(!verify_token("pat_a1b2c3d4e5f60718_x", "not-a-bcrypt-hash"));
    }
}
