//! Repository contracts over the persistence store.
//!
//! Implementations must be `Send + Sync` so they can be shared across async
//! tasks behind `Arc<dyn …>`. Counter updates are required to be atomic on
//! the backing store: a read-modify-write cycle is not an acceptable
//! implementation of [`ProjectRepo::increment_usage`].

use chrono::{DateTime, Utc};

use aiguard_types::{
    AuditLog, PersonalAccessToken, Project, ProjectCredential, ProjectMember, Provider,
    QuotaLimits, UsageRecord, User, UserStatus,
};

/// Errors surfaced by any repository operation.
#[derive(Debug)]
pub enum StoreError {
    /// A uniqueness invariant was violated (duplicate email, token name, …).
    Duplicate(String),
    /// The backend failed (connection, query, serialization).
    Backend(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Duplicate(what) => write!(f, "duplicate {what}"),
            Self::Backend(e) => write!(f, "store backend error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

#[async_trait::async_trait]
pub trait UserRepo: Send + Sync {
    async fn insert_user(&self, user: User) -> Result<(), StoreError>;
    async fn user_by_id(&self, id: &str) -> Result<Option<User>, StoreError>;
    async fn user_by_external_id(&self, external_id: &str) -> Result<Option<User>, StoreError>;
    /// Lookup by lowercased email among non-deleted users.
    async fn user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;
    async fn update_user(&self, user: &User) -> Result<(), StoreError>;
    async fn touch_last_login(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;
    async fn set_user_status(&self, id: &str, status: UserStatus) -> Result<bool, StoreError>;
    async fn list_users(&self) -> Result<Vec<User>, StoreError>;
}

#[async_trait::async_trait]
pub trait TokenRepo: Send + Sync {
    async fn insert_token(&self, token: PersonalAccessToken) -> Result<(), StoreError>;
    /// Indexed lookup by `pat_<16 hex>` identifier.
    async fn token_by_identifier(
        &self,
        identifier: &str,
    ) -> Result<Option<PersonalAccessToken>, StoreError>;
    async fn token_by_id(&self, id: &str) -> Result<Option<PersonalAccessToken>, StoreError>;
    async fn tokens_for_user(&self, user_id: &str)
        -> Result<Vec<PersonalAccessToken>, StoreError>;
    async fn touch_last_used(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;
    async fn revoke_token(&self, id: &str) -> Result<bool, StoreError>;
    async fn revoke_all_for_user(&self, user_id: &str) -> Result<u64, StoreError>;
    /// Swap in a freshly minted identifier + hash (token rotation).
    async fn replace_token_secret(
        &self,
        id: &str,
        identifier: &str,
        token_hash: &str,
    ) -> Result<bool, StoreError>;
}

#[async_trait::async_trait]
pub trait ProjectRepo: Send + Sync {
    async fn insert_project(&self, project: Project) -> Result<(), StoreError>;
    async fn project_by_id(&self, id: &str) -> Result<Option<Project>, StoreError>;
    async fn projects_for_user(&self, user_id: &str) -> Result<Vec<Project>, StoreError>;
    async fn delete_project(&self, id: &str) -> Result<bool, StoreError>;

    /// Append a credential, deactivating any existing active credential for
    /// the same provider so at most one stays active per provider.
    async fn add_credential(
        &self,
        project_id: &str,
        credential: ProjectCredential,
    ) -> Result<bool, StoreError>;
    async fn remove_credential(
        &self,
        project_id: &str,
        provider: Provider,
    ) -> Result<bool, StoreError>;

    async fn add_member(&self, project_id: &str, member: ProjectMember)
        -> Result<bool, StoreError>;
    async fn remove_member(&self, project_id: &str, user_id: &str) -> Result<bool, StoreError>;

    async fn set_quota(&self, project_id: &str, quota: QuotaLimits) -> Result<bool, StoreError>;

    /// Atomically add one request, `tokens`, and `cost` to all three usage
    /// buckets in a single backend operation.
    async fn increment_usage(
        &self,
        project_id: &str,
        tokens: u64,
        cost: f64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Zero every project's `current_day` bucket. Returns projects touched.
    async fn reset_daily_counters(&self, at: DateTime<Utc>) -> Result<u64, StoreError>;
    /// Zero every project's `current_month` bucket. Returns projects touched.
    async fn reset_monthly_counters(&self, at: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[async_trait::async_trait]
pub trait UsageRepo: Send + Sync {
    async fn insert_usage(&self, record: UsageRecord) -> Result<(), StoreError>;
    async fn usage_for_project(
        &self,
        project_id: &str,
        limit: usize,
    ) -> Result<Vec<UsageRecord>, StoreError>;
}

#[async_trait::async_trait]
pub trait AuditRepo: Send + Sync {
    async fn append_audit(&self, log: AuditLog) -> Result<(), StoreError>;
}
