//! Upstream AI provider registry.
//!
//! A closed enum keyed by the lowercased tag carried in
//! `X-AI-Guard-Provider`, plus a static per-provider spec: upstream origin,
//! authentication header, and any constant headers or query parameters the
//! provider requires on every call.

use std::fmt;

/// The upstream AI provider a request is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Anthropic,
    Gemini,
}

/// Static routing and authentication facts for one provider.
pub struct ProviderSpec {
    /// Upstream origin, scheme + host, no trailing slash.
    pub origin: &'static str,
    /// Header carrying the upstream credential.
    pub auth_header: &'static str,
    /// Prefix prepended (with a space) to the credential value, e.g. `Bearer`.
    pub auth_prefix: Option<&'static str>,
    /// Headers added to the outbound request when the caller did not set them.
    pub constant_headers: &'static [(&'static str, &'static str)],
    /// Query parameters always present on the outbound URL.
    pub constant_query: &'static [(&'static str, &'static str)],
}

const OPENAI: ProviderSpec = ProviderSpec {
    origin: "https://api.openai.com",
    auth_header: "authorization",
    auth_prefix: Some("Bearer"),
    constant_headers: &[],
    constant_query: &[],
};

const ANTHROPIC: ProviderSpec = ProviderSpec {
    origin: "https://api.anthropic.com",
    auth_header: "x-api-key",
    auth_prefix: None,
    constant_headers: &[("anthropic-version", "2023-06-01")],
    constant_query: &[],
};

const GEMINI: ProviderSpec = ProviderSpec {
    origin: "https://generativelanguage.googleapis.com",
    auth_header: "x-goog-api-key",
    auth_prefix: None,
    constant_headers: &[],
    constant_query: &[],
};

impl Provider {
    /// All registered providers, in registry order.
    pub const ALL: [Provider; 3] = [Provider::OpenAi, Provider::Anthropic, Provider::Gemini];

    /// Parse a provider tag. Matching is on the lowercased tag.
    pub fn from_tag(tag: &str) -> Result<Self, UnknownProvider> {
        match tag.to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "gemini" => Ok(Self::Gemini),
            _ => Err(UnknownProvider(tag.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
        }
    }

    /// The static registry entry for this provider.
    pub fn spec(&self) -> &'static ProviderSpec {
        match self {
            Self::OpenAi => &OPENAI,
            Self::Anthropic => &ANTHROPIC,
            Self::Gemini => &GEMINI,
        }
    }

    /// Host portion of the upstream origin.
    pub fn host(&self) -> &'static str {
        self.spec()
            .origin
            .trim_start_matches("https://")
            .trim_start_matches("http://")
    }

    /// Environment variable holding the process-default credential.
    pub fn default_key_env(&self) -> &'static str {
        match self {
            Self::OpenAi => "OPENAI_API_KEY",
            Self::Anthropic => "ANTHROPIC_API_KEY",
            Self::Gemini => "GEMINI_API_KEY",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tag did not match any registered provider.
#[derive(Debug, Clone, PartialEq)]
pub struct UnknownProvider(pub String);

impl fmt::Display for UnknownProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown AI provider: {}", self.0)
    }
}

impl std::error::Error for UnknownProvider {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_tags_parse() {
        assert_eq!(Provider::from_tag("openai").unwrap(), Provider::OpenAi);
        assert_eq!(Provider::from_tag("anthropic").unwrap(), Provider::Anthropic);
        assert_eq!(Provider::from_tag("gemini").unwrap(), Provider::Gemini);
    }

    #[test]
    fn tags_are_lowercased_before_matching() {
        assert_eq!(Provider::from_tag("OpenAI").unwrap(), Provider::OpenAi);
        assert_eq!(Provider::from_tag("ANTHROPIC").unwrap(), Provider::Anthropic);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let err = Provider::from_tag("cohere").unwrap_err();
        assert!(err.to_string().contains("cohere"));
        assert!(Provider::from_tag("").is_err());
    }

    #[test]
    fn registry_origins() {
        assert_eq!(Provider::OpenAi.spec().origin, "https://api.openai.com");
        assert_eq!(Provider::Anthropic.spec().origin, "https://api.anthropic.com");
        assert_eq!(
            Provider::Gemini.spec().origin,
            "https://generativelanguage.googleapis.com"
        );
    }

    #[test]
    fn auth_header_shapes() {
        assert_eq!(Provider::OpenAi.spec().auth_header, "authorization");
        assert_eq!(Provider::OpenAi.spec().auth_prefix, Some("Bearer"));
        assert_eq!(Provider::Anthropic.spec().auth_header, "x-api-key");
        assert_eq!(Provider::Anthropic.spec().auth_prefix, None);
        assert_eq!(Provider::Gemini.spec().auth_header, "x-goog-api-key");
    }

    #[test]
    fn anthropic_carries_version_header() {
        let spec = Provider::Anthropic.spec();
        assert_eq!(spec.constant_headers, &[("anthropic-version", "2023-06-01")]);
    }

    #[test]
    fn host_strips_scheme() {
        assert_eq!(Provider::OpenAi.host(), "api.openai.com");
        assert_eq!(Provider::Gemini.host(), "generativelanguage.googleapis.com");
    }
}
