//! Provider credential resolution.
//!
//! Three tiers, first hit wins: the explicit project context, the caller's
//! default project, then the process-default key from the environment.
//! Decryption failures fail closed — a project with a corrupt envelope does
//! not silently fall through to a broader credential.

use std::collections::HashMap;
use std::sync::Arc;

use aiguard_types::{Project, Provider};
use aiguard_vault::{Vault, VaultError};

use crate::error::{ApiError, ErrorKind};

/// Which tier supplied the credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    Project,
    User,
    System,
}

impl KeySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::User => "user",
            Self::System => "system",
        }
    }
}

/// A decrypted, ready-to-forward credential.
#[derive(Clone)]
pub struct ResolvedCredential {
    pub key: String,
    pub source: KeySource,
    pub key_id: Option<String>,
}

impl std::fmt::Debug for ResolvedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedCredential")
            .field("key", &"<redacted>")
            .field("source", &self.source)
            .field("key_id", &self.key_id)
            .finish()
    }
}

pub struct CredentialResolver {
    vault: Arc<Vault>,
    system_keys: Arc<HashMap<Provider, String>>,
}

impl CredentialResolver {
    pub fn new(vault: Arc<Vault>, system_keys: Arc<HashMap<Provider, String>>) -> Self {
        Self { vault, system_keys }
    }

    /// Resolve a credential for `provider`.
    ///
    /// `explicit` is the project named by the request; `fallback` is the
    /// caller's default project when that differs.
    pub fn resolve(
        &self,
        provider: Provider,
        explicit: Option<&Project>,
        fallback: Option<&Project>,
    ) -> Result<ResolvedCredential, ApiError> {
        if let Some(project) = explicit {
            if let Some(resolved) = self.from_project(project, provider, KeySource::Project)? {
                return Ok(resolved);
            }
        }

        if let Some(project) = fallback {
            if let Some(resolved) = self.from_project(project, provider, KeySource::User)? {
                return Ok(resolved);
            }
        }

        if let Some(key) = self.system_keys.get(&provider) {
            return Ok(ResolvedCredential {
                key: key.clone(),
                source: KeySource::System,
                key_id: None,
            });
        }

        Err(ApiError::new(
            ErrorKind::ConfigurationError,
            format!("no credential available for provider {provider}"),
        )
        .with_suggestion(format!(
            "add an API key for {provider} to the project, or configure {}",
            provider.default_key_env()
        )))
    }

    fn from_project(
        &self,
        project: &Project,
        provider: Provider,
        source: KeySource,
    ) -> Result<Option<ResolvedCredential>, ApiError> {
        let Some(credential) = project.active_credential(provider) else {
            return Ok(None);
        };

        let opened = self.vault.decrypt(&credential.envelope).map_err(|e| {
            tracing::error!(
                project_id = %project.id,
                key_id = %credential.key_id,
                error = %e,
                "Credential decryption failed"
            );
            match e {
                VaultError::DecryptionFailed => ApiError::new(
                    ErrorKind::ConfigurationError,
                    "stored credential could not be decrypted",
                ),
                other => ApiError::new(ErrorKind::ConfigurationError, other.to_string()),
            }
        })?;

        Ok(Some(ResolvedCredential {
            key: opened.api_key,
            source,
            key_id: Some(opened.key_id),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aiguard_types::{MemberRole, ProjectCredential, ProjectMember, ProjectSettings, UsageCounters};
    use aiguard_vault::MasterKey;
    use chrono::Utc;

    fn vault() -> Arc<Vault> {
        Arc::new(Vault::new(MasterKey::from_material(&[7u8; 32])))
    }

    fn project_with_credential(vault: &Vault, provider: Provider, key: &str) -> Project {
        let sealed = vault.encrypt(key, serde_json::Value::Null).unwrap();
        Project {
            id: "p1".to_string(),
            name: "p".to_string(),
            owner_id: "u1".to_string(),
            members: vec![ProjectMember {
                user_id: "u1".to_string(),
                role: MemberRole::Owner,
                added_at: Utc::now(),
            }],
            credentials: vec![ProjectCredential {
                provider,
                envelope: sealed.envelope,
                key_id: sealed.key_id,
                active: true,
                added_by: "u1".to_string(),
                added_at: Utc::now(),
            }],
            settings: ProjectSettings::default(),
            usage: UsageCounters::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn explicit_project_wins() {
        let vault = vault();
        let explicit = project_with_credential(&vault, Provider::Anthropic, "sk-project");
        let fallback = project_with_credential(&vault, Provider::Anthropic, "sk-default");
        let mut system = HashMap::new();
        system.insert(Provider::Anthropic, "sk-system".to_string());

        let resolver = CredentialResolver::new(vault, Arc::new(system));
        let resolved = resolver
            .resolve(Provider::Anthropic, Some(&explicit), Some(&fallback))
            .unwrap();
        assert_eq!(resolved.key, "sk-project");
        assert_eq!(resolved.source, KeySource::Project);
        assert!(resolved.key_id.is_some());
    }

    #[test]
    fn default_project_is_second() {
        let vault = vault();
        let fallback = project_with_credential(&vault, Provider::Anthropic, "sk-default");
        let resolver = CredentialResolver::new(vault, Arc::new(HashMap::new()));

        let resolved = resolver
            .resolve(Provider::Anthropic, None, Some(&fallback))
            .unwrap();
        assert_eq!(resolved.key, "sk-default");
        assert_eq!(resolved.source, KeySource::User);
    }

    #[test]
    fn system_key_is_last() {
        let vault = vault();
        let mut system = HashMap::new();
        system.insert(Provider::Gemini, "sk-system".to_string());
        let resolver = CredentialResolver::new(vault, Arc::new(system));

        let resolved = resolver.resolve(Provider::Gemini, None, None).unwrap();
        assert_eq!(resolved.key, "sk-system");
        assert_eq!(resolved.source, KeySource::System);
        assert!(resolved.key_id.is_none());
    }

    #[test]
    fn exhaustion_is_a_configuration_error() {
        let resolver = CredentialResolver::new(vault(), Arc::new(HashMap::new()));
        let err = resolver.resolve(Provider::OpenAi, None, None).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConfigurationError);
    }

    #[test]
    fn project_without_matching_provider_falls_through() {
        let vault = vault();
        let explicit = project_with_credential(&vault, Provider::OpenAi, "sk-openai");
        let mut system = HashMap::new();
        system.insert(Provider::Anthropic, "sk-system".to_string());
        let resolver = CredentialResolver::new(vault, Arc::new(system));

        let resolved = resolver
            .resolve(Provider::Anthropic, Some(&explicit), None)
            .unwrap();
        assert_eq!(resolved.source, KeySource::System);
    }

    #[test]
    fn corrupt_envelope_fails_closed() {
        let vault = vault();
        let mut project = project_with_credential(&vault, Provider::Anthropic, "sk-x");
        project.credentials[0].envelope = "AAAA".to_string();
        let mut system = HashMap::new();
        system.insert(Provider::Anthropic, "sk-system".to_string());
        let resolver = CredentialResolver::new(vault, Arc::new(system));

        // The system key exists, but a corrupt project envelope must not
        // fall through to it.
        let err = resolver
            .resolve(Provider::Anthropic, Some(&project), None)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConfigurationError);
    }

    #[test]
    fn debug_never_prints_the_key() {
        let resolved = ResolvedCredential {
            key: "sk-secret".to_string(),
            source: KeySource::System,
            key_id: None,
        };
        assert!(!format!("{resolved:?}").contains("sk-secret"));
    }
}
