//! Personal access token wire format.
//!
//! Token format: `pat_{identifier}_{secret}`
//! Example:      `pat_a1b2c3d4e5f60718_Zm9vYmFyYmF6cXV4MTIzNDU2Nzg5MGFi`
//!
//! `identifier` is 16 lowercase hex characters (8 random bytes) and is stored
//! with the `pat_` prefix for indexed lookup. `secret` is 32 URL-safe base64
//! characters (24 random bytes). The full string is what gets slow-hashed;
//! the raw secret is shown exactly once at mint time and never persisted.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;

const PREFIX: &str = "pat_";
const ID_HEX_LEN: usize = 16;
const SECRET_B64_LEN: usize = 32;

/// Errors produced when parsing a PAT wire string.
#[derive(Debug, Clone, PartialEq)]
pub enum PatParseError {
    /// Token must start with `pat_`.
    MissingPrefix,
    /// Token has fewer than three `_`-separated segments.
    TooFewSegments,
    /// Identifier segment is not 16 lowercase hex characters.
    InvalidIdentifier,
    /// Secret segment is not 32 URL-safe base64 characters.
    InvalidSecret,
}

impl fmt::Display for PatParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingPrefix => write!(f, "token must start with 'pat_'"),
            Self::TooFewSegments => {
                write!(f, "token must have format pat_{{identifier}}_{{secret}}")
            }
            Self::InvalidIdentifier => {
                write!(f, "identifier segment must be {ID_HEX_LEN} lowercase hex characters")
            }
            Self::InvalidSecret => {
                write!(f, "secret segment must be {SECRET_B64_LEN} URL-safe base64 characters")
            }
        }
    }
}

impl std::error::Error for PatParseError {}

/// A validated PAT wire string, split into its segments.
///
/// Holds the full string; accessors return the indexed identifier
/// (`pat_<16 hex>`, as stored) and the secret segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PatParts(String);

impl PatParts {
    /// Parse and validate a raw token string.
    pub fn parse(s: impl Into<String>) -> Result<Self, PatParseError> {
        let s: String = s.into();

        let Some(rest) = s.strip_prefix(PREFIX) else {
            return Err(PatParseError::MissingPrefix);
        };

        let Some((id, secret)) = rest.split_once('_') else {
            return Err(PatParseError::TooFewSegments);
        };

        if id.len() != ID_HEX_LEN
            || !id.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(PatParseError::InvalidIdentifier);
        }

        if secret.len() != SECRET_B64_LEN || !secret.bytes().all(is_url_safe_b64) {
            return Err(PatParseError::InvalidSecret);
        }

        Ok(Self(s))
    }

    /// The full wire string, `pat_<id>_<secret>`.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The indexed identifier including the `pat_` prefix.
    pub fn identifier(&self) -> &str {
        &self.0[..PREFIX.len() + ID_HEX_LEN]
    }

    /// The secret segment.
    pub fn secret(&self) -> &str {
        &self.0[PREFIX.len() + ID_HEX_LEN + 1..]
    }
}

impl fmt::Display for PatParts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for PatParts {
    type Error = PatParseError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PatParts {
    type Error = PatParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

fn is_url_safe_b64(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-' || b == b'_'
}

/// A freshly minted token: the wire string plus its indexed identifier.
///
/// The wire string leaves the process exactly once, in the creation response.
#[derive(Debug, Clone)]
pub struct MintedPat {
    pub token: PatParts,
}

impl MintedPat {
    /// Generate a new token from OS randomness.
    pub fn generate() -> Self {
        let mut id_bytes = [0u8; 8];
        let mut secret_bytes = [0u8; 24];
        rand::rng().fill_bytes(&mut id_bytes);
        rand::rng().fill_bytes(&mut secret_bytes);

        let wire = format!(
            "{PREFIX}{}_{}",
            hex::encode(id_bytes),
            URL_SAFE_NO_PAD.encode(secret_bytes)
        );

        // Both segments are constructed to the exact shape `parse` accepts.
        let token = PatParts::parse(wire).expect("generated token is well-formed");
        Self { token }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = "pat_a1b2c3d4e5f60718_Zm9vYmFyYmF6cXV4MTIzNDU2Nzg5MGFi";

    #[test]
    fn valid_token_parses() {
        let t = PatParts::parse(VALID).unwrap();
        assert_eq!(t.as_str(), VALID);
        assert_eq!(t.identifier(), "pat_a1b2c3d4e5f60718");
        assert_eq!(t.secret(), "Zm9vYmFyYmF6cXV4MTIzNDU2Nzg5MGFi");
    }

    #[test]
    fn identifier_keeps_wire_prefix() {
        let t = PatParts::parse(VALID).unwrap();
        assert!(t.identifier().starts_with("pat_"));
        assert_eq!(t.identifier().len(), 20);
    }

    #[test]
    fn missing_prefix_errors() {
        assert_eq!(
            PatParts::parse("tok_a1b2c3d4e5f60718_Zm9vYmFyYmF6cXV4MTIzNDU2Nzg5MGFi").unwrap_err(),
            PatParseError::MissingPrefix
        );
    }

    #[test]
    fn too_few_segments() {
        assert_eq!(
            PatParts::parse("pat_a1b2c3d4e5f60718").unwrap_err(),
            PatParseError::TooFewSegments
        );
    }

    #[test]
    fn uppercase_hex_identifier_is_rejected() {
        assert_eq!(
            PatParts::parse("pat_A1B2C3D4E5F60718_Zm9vYmFyYmF6cXV4MTIzNDU2Nzg5MGFi").unwrap_err(),
            PatParseError::InvalidIdentifier
        );
    }

    #[test]
    fn short_identifier_is_rejected() {
        assert_eq!(
            PatParts::parse("pat_a1b2c3_Zm9vYmFyYmF6cXV4MTIzNDU2Nzg5MGFi").unwrap_err(),
            PatParseError::InvalidIdentifier
        );
    }

    #[test]
    fn wrong_length_secret_is_rejected() {
        assert_eq!(
            PatParts::parse("pat_a1b2c3d4e5f60718_shortsecret").unwrap_err(),
            PatParseError::InvalidSecret
        );
    }

    #[test]
    fn secret_with_invalid_characters_is_rejected() {
        assert_eq!(
            PatParts::parse("pat_a1b2c3d4e5f60718_Zm9vYmFyYmF6cXV4MTIzNDU2Nzg5MG+/").unwrap_err(),
            PatParseError::InvalidSecret
        );
    }

    /// An underscore is a legal URL-safe base64 character, so a secret
    /// containing one still round-trips: the split is on the *first*
    /// underscore after the identifier.
    #[test]
    fn underscore_in_secret_round_trips() {
        let wire = "pat_a1b2c3d4e5f60718_Zm9vYmFy_mF6cXV4MTIzNDU2Nzg5MGFi";
        let t = PatParts::parse(wire).unwrap();
        assert_eq!(t.secret(), "Zm9vYmFy_mF6cXV4MTIzNDU2Nzg5MGFi");
    }

    #[test]
    fn generated_tokens_parse_and_differ() {
        let a = MintedPat::generate();
        let b = MintedPat::generate();
        assert_ne!(a.token.as_str(), b.token.as_str());
        assert_eq!(a.token.identifier().len(), 20);
        assert_eq!(a.token.secret().len(), 32);
        // format(parse(x)) == x
        assert_eq!(
            PatParts::parse(a.token.as_str()).unwrap().as_str(),
            a.token.as_str()
        );
    }

    #[test]
    fn try_from_str() {
        let t = PatParts::try_from(VALID).unwrap();
        assert_eq!(t.to_string(), VALID);
    }
}
