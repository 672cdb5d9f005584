//! Persisted data model: users, personal access tokens, projects with
//! embedded credentials and usage counters, usage records, and audit logs.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::provider::Provider;

// ── Users ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Active,
    Suspended,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    /// Identifier assigned by the external identity provider, when the user
    /// was provisioned through it. Unique when present.
    pub external_id: Option<String>,
    /// Stored lowercased; unique among non-deleted users.
    pub email: String,
    pub display_name: String,
    pub status: UserStatus,
    /// Weak reference: may dangle briefly while the project is being deleted.
    pub default_project_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn is_active(&self) -> bool {
        self.status == UserStatus::Active
    }
}

// ── Personal access tokens ────────────────────────────────────────────────────

/// Permission granted to a PAT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    #[serde(rename = "api:read")]
    ApiRead,
    #[serde(rename = "api:write")]
    ApiWrite,
    #[serde(rename = "projects:read")]
    ProjectsRead,
    #[serde(rename = "projects:write")]
    ProjectsWrite,
    #[serde(rename = "users:read")]
    UsersRead,
    #[serde(rename = "users:write")]
    UsersWrite,
    #[serde(rename = "admin")]
    Admin,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApiRead => "api:read",
            Self::ApiWrite => "api:write",
            Self::ProjectsRead => "projects:read",
            Self::ProjectsWrite => "projects:write",
            Self::UsersRead => "users:read",
            Self::UsersWrite => "users:write",
            Self::Admin => "admin",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "api:read" => Some(Self::ApiRead),
            "api:write" => Some(Self::ApiWrite),
            "projects:read" => Some(Self::ProjectsRead),
            "projects:write" => Some(Self::ProjectsWrite),
            "users:read" => Some(Self::UsersRead),
            "users:write" => Some(Self::UsersWrite),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonalAccessToken {
    pub id: String,
    /// Indexed lookup key, `pat_<16 hex>` — the wire prefix included.
    pub identifier: String,
    /// Slow hash of the full wire string. The raw secret is never stored.
    pub token_hash: String,
    pub user_id: String,
    pub project_id: Option<String>,
    /// Human name, unique per user.
    pub name: String,
    pub scopes: Vec<Scope>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PersonalAccessToken {
    /// Usability minus the owner-status check, which needs the user document.
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && self.expires_at.map_or(true, |exp| now < exp)
    }

    pub fn has_scope(&self, scope: Scope) -> bool {
        self.scopes.contains(&scope) || self.scopes.contains(&Scope::Admin)
    }
}

// ── Projects ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Owner,
    Admin,
    Member,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectMember {
    pub user_id: String,
    pub role: MemberRole,
    pub added_at: DateTime<Utc>,
}

/// A provider credential embedded in its owning project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectCredential {
    pub provider: Provider,
    /// AEAD envelope, base64. Decryptable only with the process master key.
    pub envelope: String,
    pub key_id: String,
    pub active: bool,
    pub added_by: String,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitOverride {
    /// Requests admitted per window.
    pub requests: u32,
    /// Window length in milliseconds.
    pub window_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuotaLimits {
    pub daily: u64,
    pub monthly: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectSettings {
    pub rate_limit: Option<RateLimitOverride>,
    pub quota: Option<QuotaLimits>,
    /// When set, only these providers may be used through this project.
    pub allowed_providers: Option<Vec<Provider>>,
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UsageBucket {
    pub requests: u64,
    pub tokens: u64,
    pub cost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageCounters {
    pub total: UsageBucket,
    pub current_month: UsageBucket,
    pub current_day: UsageBucket,
    pub last_updated: DateTime<Utc>,
}

impl Default for UsageCounters {
    fn default() -> Self {
        Self {
            total: UsageBucket::default(),
            current_month: UsageBucket::default(),
            current_day: UsageBucket::default(),
            last_updated: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    /// The owner is always present with role `owner`.
    pub members: Vec<ProjectMember>,
    pub credentials: Vec<ProjectCredential>,
    pub settings: ProjectSettings,
    pub usage: UsageCounters,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    /// Tier inferred from member count.
    pub fn tier(&self) -> Tier {
        match self.members.len() {
            0 | 1 => Tier::Free,
            2..=5 => Tier::Pro,
            _ => Tier::Enterprise,
        }
    }

    /// First active credential for `provider`, in insertion order.
    pub fn active_credential(&self, provider: Provider) -> Option<&ProjectCredential> {
        self.credentials
            .iter()
            .find(|c| c.active && c.provider == provider)
    }

    pub fn role_of(&self, user_id: &str) -> Option<MemberRole> {
        self.members
            .iter()
            .find(|m| m.user_id == user_id)
            .map(|m| m.role)
    }

    pub fn allows_provider(&self, provider: Provider) -> bool {
        match &self.settings.allowed_providers {
            Some(allowed) => allowed.contains(&provider),
            None => true,
        }
    }
}

// ── Tiers ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Pro,
    Enterprise,
}

impl Tier {
    /// Default rate-limit policy: requests per one-minute window.
    pub fn default_rate_limit(&self) -> RateLimitOverride {
        let requests = match self {
            Self::Free => 10,
            Self::Pro => 100,
            Self::Enterprise => 1_000,
        };
        RateLimitOverride {
            requests,
            window_ms: 60_000,
        }
    }

    /// Default daily/monthly request quota.
    pub fn default_quota(&self) -> QuotaLimits {
        match self {
            Self::Free => QuotaLimits { daily: 100, monthly: 1_000 },
            Self::Pro => QuotaLimits { daily: 5_000, monthly: 50_000 },
            Self::Enterprise => QuotaLimits { daily: 50_000, monthly: 1_000_000 },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
            Self::Enterprise => "enterprise",
        }
    }
}

// ── Usage records ─────────────────────────────────────────────────────────────

/// One record per proxied request. Retained for 90 days.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: String,
    pub user_id: String,
    pub project_id: Option<String>,
    pub provider: Provider,
    pub endpoint: String,
    pub method: String,
    pub model: Option<String>,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    pub cost: Option<f64>,
    pub response_time_ms: u64,
    pub status_code: u16,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

// ── Audit logs ────────────────────────────────────────────────────────────────

/// Closed taxonomy of auditable actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditAction {
    AuthLogin,
    AuthTokenCreated,
    AuthTokenRevoked,
    AuthTokenRotated,
    ApiKeyAdded,
    ApiKeyRemoved,
    ProjectCreated,
    ProjectUpdated,
    ProjectDeleted,
    ProjectMemberAdded,
    ProjectMemberRemoved,
    UserUpdated,
    UserStatusChanged,
    UserDeleted,
    /// One per proxied request; the payload is the HTTP method.
    Api(String),
}

impl AuditAction {
    pub fn name(&self) -> String {
        match self {
            Self::AuthLogin => "auth.login".to_string(),
            Self::AuthTokenCreated => "auth.token_created".to_string(),
            Self::AuthTokenRevoked => "auth.token_revoked".to_string(),
            Self::AuthTokenRotated => "auth.token_rotated".to_string(),
            Self::ApiKeyAdded => "api_key.added".to_string(),
            Self::ApiKeyRemoved => "api_key.removed".to_string(),
            Self::ProjectCreated => "project.created".to_string(),
            Self::ProjectUpdated => "project.updated".to_string(),
            Self::ProjectDeleted => "project.deleted".to_string(),
            Self::ProjectMemberAdded => "project.member.added".to_string(),
            Self::ProjectMemberRemoved => "project.member.removed".to_string(),
            Self::UserUpdated => "user.updated".to_string(),
            Self::UserStatusChanged => "user.status_changed".to_string(),
            Self::UserDeleted => "user.deleted".to_string(),
            Self::Api(method) => format!("api.{}", method.to_lowercase()),
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Success,
    Failure,
}

/// Append-only audit entry. Retained for 90 days.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: String,
    pub user_id: Option<String>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    #[serde(default)]
    pub details: serde_json::Value,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub status: AuditStatus,
    pub error: Option<String>,
}
