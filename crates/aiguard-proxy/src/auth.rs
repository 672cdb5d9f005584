//! Caller authentication: PAT and external-identity token schemes.

use std::sync::Arc;

use chrono::Utc;

use aiguard_store::{StoreError, TokenRepo, UserRepo};
use aiguard_types::{PatParts, PersonalAccessToken, Scope, User, UserStatus};

use crate::error::{ApiError, ErrorKind};
use crate::hasher;
use crate::identity::IdentityVerifier;

/// Which scheme authenticated the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    Pat,
    External,
}

impl AuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pat => "pat",
            Self::External => "external",
        }
    }
}

/// The authenticated caller: a user plus the PAT used, when one was.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user: User,
    pub token: Option<PersonalAccessToken>,
    pub auth_type: AuthType,
}

impl Principal {
    /// Scope check for a proxied call. External-identity principals carry no
    /// token and are not scope-restricted.
    pub fn allows_scope(&self, scope: Scope) -> bool {
        match &self.token {
            Some(token) => token.has_scope(scope),
            None => true,
        }
    }
}

/// Dispatches an `Authorization` value to the PAT or identity path.
pub struct TokenValidator {
    tokens: Arc<dyn TokenRepo>,
    users: Arc<dyn UserRepo>,
    identity: Option<Arc<dyn IdentityVerifier>>,
}

impl TokenValidator {
    pub fn new(
        tokens: Arc<dyn TokenRepo>,
        users: Arc<dyn UserRepo>,
        identity: Option<Arc<dyn IdentityVerifier>>,
    ) -> Self {
        Self {
            tokens,
            users,
            identity,
        }
    }

    /// Authenticate an `Authorization` header value.
    ///
    /// The `Bearer ` prefix is optional on the wire; bare tokens are accepted.
    pub async fn authenticate(&self, authorization: Option<&str>) -> Result<Principal, ApiError> {
        let Some(raw) = authorization else {
            return Err(unauthenticated("missing Authorization header"));
        };

        let token = raw.strip_prefix("Bearer ").unwrap_or(raw).trim();
        if token.is_empty() {
            return Err(unauthenticated("empty bearer token"));
        }

        if token.starts_with("pat_") {
            self.authenticate_pat(token).await
        } else {
            self.authenticate_external(token).await
        }
    }

    async fn authenticate_pat(&self, raw: &str) -> Result<Principal, ApiError> {
        let parts = PatParts::parse(raw).map_err(|e| {
            tracing::debug!(error = %e, "Malformed PAT");
            unauthenticated("invalid personal access token")
        })?;

        let Some(token) = self
            .tokens
            .token_by_identifier(parts.identifier())
            .await
            .map_err(store_error)?
        else {
            return Err(unauthenticated("unknown personal access token"));
        };

        // bcrypt at cost 10 takes tens of milliseconds; keep it off the
        // async worker threads.
        let presented = raw.to_string();
        let stored_hash = token.token_hash.clone();
        let verified = tokio::task::spawn_blocking(move || {
            hasher::verify_token(&presented, &stored_hash)
        })
        .await
        .unwrap_or(false);

        if !verified {
            return Err(unauthenticated("invalid personal access token"));
        }

        let now = Utc::now();
        if !token.is_usable_at(now) {
            return Err(unauthenticated("personal access token revoked or expired"));
        }

        let Some(user) = self.users.user_by_id(&token.user_id).await.map_err(store_error)? else {
            return Err(unauthenticated("token owner not found"));
        };
        if !user.is_active() {
            return Err(unauthenticated("token owner is not active"));
        }

        // Best-effort bookkeeping; a failed touch never fails the request.
        if let Err(e) = self.tokens.touch_last_used(&token.id, now).await {
            tracing::warn!(error = %e, token_id = %token.id, "Failed to update last_used_at");
        }

        Ok(Principal {
            user,
            token: Some(token),
            auth_type: AuthType::Pat,
        })
    }

    async fn authenticate_external(&self, raw: &str) -> Result<Principal, ApiError> {
        let Some(verifier) = &self.identity else {
            return Err(unauthenticated("identity verification is not configured"));
        };

        let profile = verifier.verify(raw).await.map_err(|e| {
            tracing::debug!(error = %e, "Identity verification failed");
            unauthenticated("identity token verification failed")
        })?;

        let now = Utc::now();
        let user = match self
            .users
            .user_by_external_id(&profile.uid)
            .await
            .map_err(store_error)?
        {
            Some(user) => user,
            None => self.provision_user(&profile.uid, profile.email, profile.display_name).await?,
        };

        if !user.is_active() {
            return Err(unauthenticated("user is not active"));
        }

        if let Err(e) = self.users.touch_last_login(&user.id, now).await {
            tracing::warn!(error = %e, user_id = %user.id, "Failed to update last_login_at");
        }

        Ok(Principal {
            user,
            token: None,
            auth_type: AuthType::External,
        })
    }

    /// First login through the identity provider: link to an existing account
    /// by email, or create a fresh one keyed by the external uid.
    async fn provision_user(
        &self,
        uid: &str,
        email: Option<String>,
        display_name: Option<String>,
    ) -> Result<User, ApiError> {
        let email = email
            .map(|e| e.to_lowercase())
            .unwrap_or_else(|| format!("{uid}@users.external"));

        if let Some(mut existing) = self.users.user_by_email(&email).await.map_err(store_error)? {
            existing.external_id = Some(uid.to_string());
            existing.updated_at = Utc::now();
            self.users.update_user(&existing).await.map_err(store_error)?;
            return Ok(existing);
        }

        let now = Utc::now();
        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            external_id: Some(uid.to_string()),
            email,
            display_name: display_name.unwrap_or_else(|| uid.to_string()),
            status: UserStatus::Active,
            default_project_id: None,
            created_at: now,
            updated_at: now,
            last_login_at: Some(now),
        };
        self.users.insert_user(user.clone()).await.map_err(store_error)?;
        tracing::info!(user_id = %user.id, "Provisioned user from identity verification");
        Ok(user)
    }
}

fn unauthenticated(message: &str) -> ApiError {
    ApiError::new(ErrorKind::AuthenticationError, message)
}

fn store_error(e: StoreError) -> ApiError {
    ApiError::new(ErrorKind::DatabaseError, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use aiguard_store::MemoryStore;
    use aiguard_types::MintedPat;

    use crate::identity::{IdentityProfile, StaticVerifier};

    fn active_user(id: &str) -> User {
        User {
            id: id.to_string(),
            external_id: None,
            email: format!("{id}@example.com"),
            display_name: id.to_string(),
            status: UserStatus::Active,
            default_project_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_login_at: None,
        }
    }

    fn pat_for(user_id: &str, minted: &MintedPat, hash: &str) -> PersonalAccessToken {
        PersonalAccessToken {
            id: uuid::Uuid::new_v4().to_string(),
            identifier: minted.token.identifier().to_string(),
            token_hash: hash.to_string(),
            user_id: user_id.to_string(),
            project_id: None,
            name: "test".to_string(),
            scopes: vec![Scope::ApiWrite],
            expires_at: None,
            revoked: false,
            last_used_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn validator(store: &MemoryStore) -> TokenValidator {
        TokenValidator::new(Arc::new(store.clone()), Arc::new(store.clone()), None)
    }

    #[tokio::test]
    async fn valid_pat_authenticates_and_touches_last_used() {
        let store = MemoryStore::new();
        store.seed_user(active_user("u1"));
        let (minted, hash) = hasher::mint().unwrap();
        let token = pat_for("u1", &minted, &hash);
        let token_id = token.id.clone();
        store.seed_token(token);

        let principal = validator(&store)
            .authenticate(Some(&format!("Bearer {}", minted.token)))
            .await
            .unwrap();

        assert_eq!(principal.user.id, "u1");
        assert_eq!(principal.auth_type, AuthType::Pat);
        let stored = store.token_by_id(&token_id).await.unwrap().unwrap();
        assert!(stored.last_used_at.is_some());
    }

    #[tokio::test]
    async fn bare_token_without_bearer_prefix_is_accepted() {
        let store = MemoryStore::new();
        store.seed_user(active_user("u1"));
        let (minted, hash) = hasher::mint().unwrap();
        store.seed_token(pat_for("u1", &minted, &hash));

        let principal = validator(&store)
            .authenticate(Some(minted.token.as_str()))
            .await
            .unwrap();
        assert_eq!(principal.auth_type, AuthType::Pat);
    }

    #[tokio::test]
    async fn missing_header_is_rejected() {
        let store = MemoryStore::new();
        let err = validator(&store).authenticate(None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthenticationError);
    }

    #[tokio::test]
    async fn revoked_token_is_rejected() {
        let store = MemoryStore::new();
        store.seed_user(active_user("u1"));
        let (minted, hash) = hasher::mint().unwrap();
        let mut token = pat_for("u1", &minted, &hash);
        token.revoked = true;
        store.seed_token(token);

        let err = validator(&store)
            .authenticate(Some(minted.token.as_str()))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthenticationError);
    }

    #[tokio::test]
    async fn suspended_owner_is_rejected() {
        let store = MemoryStore::new();
        let mut user = active_user("u1");
        user.status = UserStatus::Suspended;
        store.seed_user(user);
        let (minted, hash) = hasher::mint().unwrap();
        store.seed_token(pat_for("u1", &minted, &hash));

        let err = validator(&store)
            .authenticate(Some(minted.token.as_str()))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthenticationError);
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected() {
        let store = MemoryStore::new();
        store.seed_user(active_user("u1"));
        let (minted, hash) = hasher::mint().unwrap();
        store.seed_token(pat_for("u1", &minted, &hash));

        let (other, _) = hasher::mint().unwrap();
        let forged = format!(
            "{}_{}",
            minted.token.identifier(),
            other.token.secret()
        );
        let err = validator(&store).authenticate(Some(&forged)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthenticationError);
    }

    #[tokio::test]
    async fn identity_path_provisions_user_on_first_login() {
        let store = MemoryStore::new();
        let verifier = StaticVerifier::new();
        verifier.insert(
            "fb-token",
            IdentityProfile {
                uid: "ext-uid-1".to_string(),
                email: Some("New.User@Example.com".to_string()),
                display_name: Some("New User".to_string()),
            },
        );
        let validator = TokenValidator::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Some(Arc::new(verifier)),
        );

        let principal = validator.authenticate(Some("Bearer fb-token")).await.unwrap();
        assert_eq!(principal.auth_type, AuthType::External);
        assert_eq!(principal.user.email, "new.user@example.com");
        assert_eq!(principal.user.external_id.as_deref(), Some("ext-uid-1"));

        // Second login resolves to the same user.
        let again = validator.authenticate(Some("Bearer fb-token")).await.unwrap();
        assert_eq!(again.user.id, principal.user.id);
    }

    #[tokio::test]
    async fn identity_path_without_verifier_is_rejected() {
        let store = MemoryStore::new();
        let err = validator(&store)
            .authenticate(Some("Bearer some-oidc-token"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthenticationError);
    }

    #[tokio::test]
    async fn external_principal_is_not_scope_restricted() {
        let principal = Principal {
            user: active_user("u1"),
            token: None,
            auth_type: AuthType::External,
        };
        assert!(principal.allows_scope(Scope::ApiWrite));
        assert!(principal.allows_scope(Scope::Admin));
    }
}
