//! MongoDB store.
//!
//! Collections: `users`, `personalaccesstokens`, `projects`, `usagerecords`,
//! `auditlogs`. Counter updates are single `$inc` operations on the embedded
//! usage buckets; the two log collections carry 90-day TTL indexes.
//!
//! Documents are mapped through dedicated `*Doc` structs rather than the
//! shared model types: non-optional timestamps are stored as BSON dates (the
//! TTL index needs a real date), optional timestamps as epoch milliseconds.

use std::time::Duration;

use bson::serde_helpers::chrono_datetime_as_bson_datetime;
use bson::{doc, Bson};
use chrono::{DateTime, TimeZone, Utc};
use futures_util::TryStreamExt;
use mongodb::options::IndexOptions;
use mongodb::{Client, Collection, Database, IndexModel};
use serde::{Deserialize, Serialize};

use aiguard_types::{
    AuditLog, AuditStatus, MemberRole, PersonalAccessToken, Project, ProjectCredential,
    ProjectMember, ProjectSettings, Provider, QuotaLimits, RateLimitOverride, Scope, UsageBucket,
    UsageCounters, UsageRecord, User, UserStatus,
};

use crate::repo::{AuditRepo, ProjectRepo, StoreError, TokenRepo, UsageRepo, UserRepo};

const USERS: &str = "users";
const TOKENS: &str = "personalaccesstokens";
const PROJECTS: &str = "projects";
const USAGE: &str = "usagerecords";
const AUDIT: &str = "auditlogs";

const LOG_TTL: Duration = Duration::from_secs(90 * 24 * 60 * 60);

/// MongoDB-backed implementation of every repository contract.
#[derive(Clone)]
pub struct MongoStore {
    db: Database,
}

impl MongoStore {
    /// Connect and create the indexes the invariants depend on.
    pub async fn connect(uri: &str, db_name: &str) -> Result<Self, StoreError> {
        let client = Client::with_uri_str(uri)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let store = Self {
            db: client.database(db_name),
        };
        store.ensure_indexes().await?;
        Ok(store)
    }

    async fn ensure_indexes(&self) -> Result<(), StoreError> {
        // Email unique among non-deleted users.
        let email_unique = IndexModel::builder()
            .keys(doc! {"email": 1})
            .options(
                IndexOptions::builder()
                    .unique(true)
                    .partial_filter_expression(
                        doc! {"status": {"$in": ["active", "suspended"]}},
                    )
                    .build(),
            )
            .build();
        // External identity id unique when present.
        let external_unique = IndexModel::builder()
            .keys(doc! {"external_id": 1})
            .options(
                IndexOptions::builder()
                    .unique(true)
                    .partial_filter_expression(doc! {"external_id": {"$exists": true}})
                    .build(),
            )
            .build();
        self.users()
            .create_indexes(vec![email_unique, external_unique])
            .await
            .map_err(map_err)?;

        let identifier_unique = IndexModel::builder()
            .keys(doc! {"identifier": 1})
            .options(IndexOptions::builder().unique(true).build())
            .build();
        let name_per_user = IndexModel::builder()
            .keys(doc! {"user_id": 1, "name": 1})
            .options(IndexOptions::builder().unique(true).build())
            .build();
        self.tokens()
            .create_indexes(vec![identifier_unique, name_per_user])
            .await
            .map_err(map_err)?;

        let member_lookup = IndexModel::builder()
            .keys(doc! {"members.user_id": 1})
            .build();
        self.projects()
            .create_index(member_lookup)
            .await
            .map_err(map_err)?;

        let usage_ttl = IndexModel::builder()
            .keys(doc! {"timestamp": 1})
            .options(IndexOptions::builder().expire_after(LOG_TTL).build())
            .build();
        self.usage()
            .create_index(usage_ttl)
            .await
            .map_err(map_err)?;

        let audit_ttl = IndexModel::builder()
            .keys(doc! {"timestamp": 1})
            .options(IndexOptions::builder().expire_after(LOG_TTL).build())
            .build();
        self.audit()
            .create_index(audit_ttl)
            .await
            .map_err(map_err)?;

        Ok(())
    }

    fn users(&self) -> Collection<UserDoc> {
        self.db.collection(USERS)
    }

    fn tokens(&self) -> Collection<TokenDoc> {
        self.db.collection(TOKENS)
    }

    fn projects(&self) -> Collection<ProjectDoc> {
        self.db.collection(PROJECTS)
    }

    fn usage(&self) -> Collection<UsageRecordDoc> {
        self.db.collection(USAGE)
    }

    fn audit(&self) -> Collection<AuditLogDoc> {
        self.db.collection(AUDIT)
    }
}

/// Map driver errors, surfacing duplicate-key violations as [`StoreError::Duplicate`].
fn map_err(e: mongodb::error::Error) -> StoreError {
    let rendered = e.to_string();
    if rendered.contains("E11000") {
        StoreError::Duplicate(rendered)
    } else {
        StoreError::Backend(rendered)
    }
}

fn millis(at: Option<DateTime<Utc>>) -> Option<i64> {
    at.map(|t| t.timestamp_millis())
}

fn from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(|v| Utc.timestamp_millis_opt(v).single())
}

fn provider_tag(p: Provider) -> String {
    p.as_str().to_string()
}

fn parse_provider(tag: &str) -> Result<Provider, StoreError> {
    Provider::from_tag(tag).map_err(|e| StoreError::Backend(e.to_string()))
}

// ── Documents ─────────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct UserDoc {
    #[serde(rename = "_id")]
    id: String,
    external_id: Option<String>,
    email: String,
    display_name: String,
    status: UserStatus,
    default_project_id: Option<String>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    created_at: DateTime<Utc>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    updated_at: DateTime<Utc>,
    last_login_at_ms: Option<i64>,
}

impl From<User> for UserDoc {
    fn from(u: User) -> Self {
        Self {
            id: u.id,
            external_id: u.external_id,
            email: u.email,
            display_name: u.display_name,
            status: u.status,
            default_project_id: u.default_project_id,
            created_at: u.created_at,
            updated_at: u.updated_at,
            last_login_at_ms: millis(u.last_login_at),
        }
    }
}

impl From<UserDoc> for User {
    fn from(d: UserDoc) -> Self {
        Self {
            id: d.id,
            external_id: d.external_id,
            email: d.email,
            display_name: d.display_name,
            status: d.status,
            default_project_id: d.default_project_id,
            created_at: d.created_at,
            updated_at: d.updated_at,
            last_login_at: from_millis(d.last_login_at_ms),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct TokenDoc {
    #[serde(rename = "_id")]
    id: String,
    identifier: String,
    token_hash: String,
    user_id: String,
    project_id: Option<String>,
    name: String,
    scopes: Vec<String>,
    expires_at_ms: Option<i64>,
    revoked: bool,
    last_used_at_ms: Option<i64>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    created_at: DateTime<Utc>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    updated_at: DateTime<Utc>,
}

impl From<PersonalAccessToken> for TokenDoc {
    fn from(t: PersonalAccessToken) -> Self {
        Self {
            id: t.id,
            identifier: t.identifier,
            token_hash: t.token_hash,
            user_id: t.user_id,
            project_id: t.project_id,
            name: t.name,
            scopes: t.scopes.iter().map(|s| s.as_str().to_string()).collect(),
            expires_at_ms: millis(t.expires_at),
            revoked: t.revoked,
            last_used_at_ms: millis(t.last_used_at),
            created_at: t.created_at,
            updated_at: t.updated_at,
        }
    }
}

impl From<TokenDoc> for PersonalAccessToken {
    fn from(d: TokenDoc) -> Self {
        Self {
            id: d.id,
            identifier: d.identifier,
            token_hash: d.token_hash,
            user_id: d.user_id,
            project_id: d.project_id,
            name: d.name,
            scopes: d.scopes.iter().filter_map(|s| Scope::from_str(s)).collect(),
            expires_at: from_millis(d.expires_at_ms),
            revoked: d.revoked,
            last_used_at: from_millis(d.last_used_at_ms),
            created_at: d.created_at,
            updated_at: d.updated_at,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct MemberDoc {
    user_id: String,
    role: MemberRole,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    added_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct CredentialDoc {
    provider: String,
    envelope: String,
    key_id: String,
    active: bool,
    added_by: String,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    added_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Default)]
struct SettingsDoc {
    rate_limit: Option<RateLimitOverride>,
    quota: Option<QuotaLimits>,
    allowed_providers: Option<Vec<String>>,
    webhook_url: Option<String>,
}

#[derive(Serialize, Deserialize, Default)]
struct UsageBucketDoc {
    requests: i64,
    tokens: i64,
    cost: f64,
}

impl From<UsageBucket> for UsageBucketDoc {
    fn from(b: UsageBucket) -> Self {
        Self {
            requests: b.requests as i64,
            tokens: b.tokens as i64,
            cost: b.cost,
        }
    }
}

impl From<UsageBucketDoc> for UsageBucket {
    fn from(d: UsageBucketDoc) -> Self {
        Self {
            requests: d.requests.max(0) as u64,
            tokens: d.tokens.max(0) as u64,
            cost: d.cost,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct UsageCountersDoc {
    total: UsageBucketDoc,
    current_month: UsageBucketDoc,
    current_day: UsageBucketDoc,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    last_updated: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct ProjectDoc {
    #[serde(rename = "_id")]
    id: String,
    name: String,
    owner_id: String,
    members: Vec<MemberDoc>,
    credentials: Vec<CredentialDoc>,
    settings: SettingsDoc,
    usage: UsageCountersDoc,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    created_at: DateTime<Utc>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    updated_at: DateTime<Utc>,
}

impl From<Project> for ProjectDoc {
    fn from(p: Project) -> Self {
        Self {
            id: p.id,
            name: p.name,
            owner_id: p.owner_id,
            members: p
                .members
                .into_iter()
                .map(|m| MemberDoc {
                    user_id: m.user_id,
                    role: m.role,
                    added_at: m.added_at,
                })
                .collect(),
            credentials: p
                .credentials
                .into_iter()
                .map(|c| CredentialDoc {
                    provider: provider_tag(c.provider),
                    envelope: c.envelope,
                    key_id: c.key_id,
                    active: c.active,
                    added_by: c.added_by,
                    added_at: c.added_at,
                })
                .collect(),
            settings: SettingsDoc {
                rate_limit: p.settings.rate_limit,
                quota: p.settings.quota,
                allowed_providers: p
                    .settings
                    .allowed_providers
                    .map(|v| v.into_iter().map(provider_tag).collect()),
                webhook_url: p.settings.webhook_url,
            },
            usage: UsageCountersDoc {
                total: p.usage.total.into(),
                current_month: p.usage.current_month.into(),
                current_day: p.usage.current_day.into(),
                last_updated: p.usage.last_updated,
            },
            created_at: p.created_at,
            updated_at: p.updated_at,
        }
    }
}

impl TryFrom<ProjectDoc> for Project {
    type Error = StoreError;

    fn try_from(d: ProjectDoc) -> Result<Self, StoreError> {
        let credentials = d
            .credentials
            .into_iter()
            .map(|c| {
                Ok(ProjectCredential {
                    provider: parse_provider(&c.provider)?,
                    envelope: c.envelope,
                    key_id: c.key_id,
                    active: c.active,
                    added_by: c.added_by,
                    added_at: c.added_at,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        let allowed_providers = match d.settings.allowed_providers {
            Some(tags) => Some(
                tags.iter()
                    .map(|t| parse_provider(t))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            None => None,
        };

        Ok(Self {
            id: d.id,
            name: d.name,
            owner_id: d.owner_id,
            members: d
                .members
                .into_iter()
                .map(|m| ProjectMember {
                    user_id: m.user_id,
                    role: m.role,
                    added_at: m.added_at,
                })
                .collect(),
            credentials,
            settings: ProjectSettings {
                rate_limit: d.settings.rate_limit,
                quota: d.settings.quota,
                allowed_providers,
                webhook_url: d.settings.webhook_url,
            },
            usage: UsageCounters {
                total: d.usage.total.into(),
                current_month: d.usage.current_month.into(),
                current_day: d.usage.current_day.into(),
                last_updated: d.usage.last_updated,
            },
            created_at: d.created_at,
            updated_at: d.updated_at,
        })
    }
}

#[derive(Serialize, Deserialize)]
struct UsageRecordDoc {
    #[serde(rename = "_id")]
    id: String,
    user_id: String,
    project_id: Option<String>,
    provider: String,
    endpoint: String,
    method: String,
    model: Option<String>,
    prompt_tokens: Option<i64>,
    completion_tokens: Option<i64>,
    total_tokens: Option<i64>,
    cost: Option<f64>,
    response_time_ms: i64,
    status_code: i32,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    timestamp: DateTime<Utc>,
    metadata: Bson,
}

impl From<UsageRecord> for UsageRecordDoc {
    fn from(r: UsageRecord) -> Self {
        Self {
            id: r.id,
            user_id: r.user_id,
            project_id: r.project_id,
            provider: provider_tag(r.provider),
            endpoint: r.endpoint,
            method: r.method,
            model: r.model,
            prompt_tokens: r.prompt_tokens.map(|v| v as i64),
            completion_tokens: r.completion_tokens.map(|v| v as i64),
            total_tokens: r.total_tokens.map(|v| v as i64),
            cost: r.cost,
            response_time_ms: r.response_time_ms as i64,
            status_code: i32::from(r.status_code),
            timestamp: r.timestamp,
            metadata: bson::to_bson(&r.metadata).unwrap_or(Bson::Null),
        }
    }
}

impl TryFrom<UsageRecordDoc> for UsageRecord {
    type Error = StoreError;

    fn try_from(d: UsageRecordDoc) -> Result<Self, StoreError> {
        Ok(Self {
            id: d.id,
            user_id: d.user_id,
            project_id: d.project_id,
            provider: parse_provider(&d.provider)?,
            endpoint: d.endpoint,
            method: d.method,
            model: d.model,
            prompt_tokens: d.prompt_tokens.map(|v| v.max(0) as u64),
            completion_tokens: d.completion_tokens.map(|v| v.max(0) as u64),
            total_tokens: d.total_tokens.map(|v| v.max(0) as u64),
            cost: d.cost,
            response_time_ms: d.response_time_ms.max(0) as u64,
            status_code: d.status_code.clamp(0, u16::MAX as i32) as u16,
            timestamp: d.timestamp,
            metadata: d.metadata.into_relaxed_extjson(),
        })
    }
}

#[derive(Serialize, Deserialize)]
struct AuditLogDoc {
    #[serde(rename = "_id")]
    id: String,
    user_id: Option<String>,
    action: String,
    resource_type: String,
    resource_id: Option<String>,
    details: Bson,
    client_ip: Option<String>,
    user_agent: Option<String>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    timestamp: DateTime<Utc>,
    status: AuditStatus,
    error: Option<String>,
}

impl From<AuditLog> for AuditLogDoc {
    fn from(l: AuditLog) -> Self {
        Self {
            id: l.id,
            user_id: l.user_id,
            action: l.action,
            resource_type: l.resource_type,
            resource_id: l.resource_id,
            details: bson::to_bson(&l.details).unwrap_or(Bson::Null),
            client_ip: l.client_ip,
            user_agent: l.user_agent,
            timestamp: l.timestamp,
            status: l.status,
            error: l.error,
        }
    }
}

// ── Repository impls ──────────────────────────────────────────────────────────

#[async_trait::async_trait]
impl UserRepo for MongoStore {
    async fn insert_user(&self, user: User) -> Result<(), StoreError> {
        self.users()
            .insert_one(UserDoc::from(user))
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn user_by_id(&self, id: &str) -> Result<Option<User>, StoreError> {
        let doc = self
            .users()
            .find_one(doc! {"_id": id})
            .await
            .map_err(map_err)?;
        Ok(doc.map(User::from))
    }

    async fn user_by_external_id(&self, external_id: &str) -> Result<Option<User>, StoreError> {
        let doc = self
            .users()
            .find_one(doc! {"external_id": external_id})
            .await
            .map_err(map_err)?;
        Ok(doc.map(User::from))
    }

    async fn user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let doc = self
            .users()
            .find_one(doc! {"email": email.to_lowercase(), "status": {"$ne": "deleted"}})
            .await
            .map_err(map_err)?;
        Ok(doc.map(User::from))
    }

    async fn update_user(&self, user: &User) -> Result<(), StoreError> {
        self.users()
            .replace_one(doc! {"_id": user.id.as_str()}, UserDoc::from(user.clone()))
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn touch_last_login(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.users()
            .update_one(
                doc! {"_id": id},
                doc! {"$set": {
                    "last_login_at_ms": at.timestamp_millis(),
                    "updated_at": bson::DateTime::from_chrono(at),
                }},
            )
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn set_user_status(&self, id: &str, status: UserStatus) -> Result<bool, StoreError> {
        let status_bson = bson::to_bson(&status).map_err(|e| StoreError::Backend(e.to_string()))?;
        let result = self
            .users()
            .update_one(
                doc! {"_id": id},
                doc! {"$set": {
                    "status": status_bson,
                    "updated_at": bson::DateTime::from_chrono(Utc::now()),
                }},
            )
            .await
            .map_err(map_err)?;
        Ok(result.matched_count > 0)
    }

    async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        let docs: Vec<UserDoc> = self
            .users()
            .find(doc! {})
            .sort(doc! {"created_at": 1})
            .await
            .map_err(map_err)?
            .try_collect()
            .await
            .map_err(map_err)?;
        Ok(docs.into_iter().map(User::from).collect())
    }
}

#[async_trait::async_trait]
impl TokenRepo for MongoStore {
    async fn insert_token(&self, token: PersonalAccessToken) -> Result<(), StoreError> {
        self.tokens()
            .insert_one(TokenDoc::from(token))
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn token_by_identifier(
        &self,
        identifier: &str,
    ) -> Result<Option<PersonalAccessToken>, StoreError> {
        let doc = self
            .tokens()
            .find_one(doc! {"identifier": identifier})
            .await
            .map_err(map_err)?;
        Ok(doc.map(PersonalAccessToken::from))
    }

    async fn token_by_id(&self, id: &str) -> Result<Option<PersonalAccessToken>, StoreError> {
        let doc = self
            .tokens()
            .find_one(doc! {"_id": id})
            .await
            .map_err(map_err)?;
        Ok(doc.map(PersonalAccessToken::from))
    }

    async fn tokens_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<PersonalAccessToken>, StoreError> {
        let docs: Vec<TokenDoc> = self
            .tokens()
            .find(doc! {"user_id": user_id})
            .sort(doc! {"created_at": 1})
            .await
            .map_err(map_err)?
            .try_collect()
            .await
            .map_err(map_err)?;
        Ok(docs.into_iter().map(PersonalAccessToken::from).collect())
    }

    async fn touch_last_used(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.tokens()
            .update_one(
                doc! {"_id": id},
                doc! {"$set": {"last_used_at_ms": at.timestamp_millis()}},
            )
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn revoke_token(&self, id: &str) -> Result<bool, StoreError> {
        let result = self
            .tokens()
            .update_one(
                doc! {"_id": id},
                doc! {"$set": {
                    "revoked": true,
                    "updated_at": bson::DateTime::from_chrono(Utc::now()),
                }},
            )
            .await
            .map_err(map_err)?;
        Ok(result.matched_count > 0)
    }

    async fn revoke_all_for_user(&self, user_id: &str) -> Result<u64, StoreError> {
        let result = self
            .tokens()
            .update_many(
                doc! {"user_id": user_id, "revoked": false},
                doc! {"$set": {"revoked": true}},
            )
            .await
            .map_err(map_err)?;
        Ok(result.modified_count)
    }

    async fn replace_token_secret(
        &self,
        id: &str,
        identifier: &str,
        token_hash: &str,
    ) -> Result<bool, StoreError> {
        let result = self
            .tokens()
            .update_one(
                doc! {"_id": id},
                doc! {"$set": {
                    "identifier": identifier,
                    "token_hash": token_hash,
                    "updated_at": bson::DateTime::from_chrono(Utc::now()),
                }},
            )
            .await
            .map_err(map_err)?;
        Ok(result.matched_count > 0)
    }
}

#[async_trait::async_trait]
impl ProjectRepo for MongoStore {
    async fn insert_project(&self, project: Project) -> Result<(), StoreError> {
        self.projects()
            .insert_one(ProjectDoc::from(project))
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn project_by_id(&self, id: &str) -> Result<Option<Project>, StoreError> {
        let doc = self
            .projects()
            .find_one(doc! {"_id": id})
            .await
            .map_err(map_err)?;
        doc.map(Project::try_from).transpose()
    }

    async fn projects_for_user(&self, user_id: &str) -> Result<Vec<Project>, StoreError> {
        let docs: Vec<ProjectDoc> = self
            .projects()
            .find(doc! {"members.user_id": user_id})
            .sort(doc! {"created_at": 1})
            .await
            .map_err(map_err)?
            .try_collect()
            .await
            .map_err(map_err)?;
        docs.into_iter().map(Project::try_from).collect()
    }

    async fn delete_project(&self, id: &str) -> Result<bool, StoreError> {
        let result = self
            .projects()
            .delete_one(doc! {"_id": id})
            .await
            .map_err(map_err)?;
        Ok(result.deleted_count > 0)
    }

    async fn add_credential(
        &self,
        project_id: &str,
        credential: ProjectCredential,
    ) -> Result<bool, StoreError> {
        let cred_doc = CredentialDoc {
            provider: provider_tag(credential.provider),
            envelope: credential.envelope,
            key_id: credential.key_id,
            active: credential.active,
            added_by: credential.added_by,
            added_at: credential.added_at,
        };
        let cred_bson = bson::to_bson(&cred_doc).map_err(|e| StoreError::Backend(e.to_string()))?;

        // A $set on credentials.$[..] cannot ride in the same update as a
        // $push onto credentials, so deactivation is its own operation.
        self.projects()
            .update_one(
                doc! {"_id": project_id},
                doc! {"$set": {"credentials.$[stale].active": false}},
            )
            .array_filters(vec![doc! {
                "stale.provider": cred_doc.provider.as_str(),
                "stale.active": true,
            }])
            .await
            .map_err(map_err)?;

        let result = self
            .projects()
            .update_one(
                doc! {"_id": project_id},
                doc! {
                    "$push": {"credentials": cred_bson},
                    "$set": {"updated_at": bson::DateTime::from_chrono(Utc::now())},
                },
            )
            .await
            .map_err(map_err)?;
        Ok(result.matched_count > 0)
    }

    async fn remove_credential(
        &self,
        project_id: &str,
        provider: Provider,
    ) -> Result<bool, StoreError> {
        let result = self
            .projects()
            .update_one(
                doc! {"_id": project_id},
                doc! {"$pull": {"credentials": {"provider": provider.as_str()}}},
            )
            .await
            .map_err(map_err)?;
        Ok(result.modified_count > 0)
    }

    async fn add_member(
        &self,
        project_id: &str,
        member: ProjectMember,
    ) -> Result<bool, StoreError> {
        let member_doc = MemberDoc {
            user_id: member.user_id.clone(),
            role: member.role,
            added_at: member.added_at,
        };
        let member_bson =
            bson::to_bson(&member_doc).map_err(|e| StoreError::Backend(e.to_string()))?;
        // Guard against duplicate membership in the filter itself so the
        // check-and-push is one atomic operation.
        let result = self
            .projects()
            .update_one(
                doc! {"_id": project_id, "members.user_id": {"$ne": member.user_id.as_str()}},
                doc! {
                    "$push": {"members": member_bson},
                    "$set": {"updated_at": bson::DateTime::from_chrono(Utc::now())},
                },
            )
            .await
            .map_err(map_err)?;

        if result.matched_count > 0 {
            return Ok(true);
        }
        match self.project_by_id(project_id).await? {
            Some(_) => Err(StoreError::Duplicate(format!("member {}", member.user_id))),
            None => Ok(false),
        }
    }

    async fn remove_member(&self, project_id: &str, user_id: &str) -> Result<bool, StoreError> {
        let result = self
            .projects()
            .update_one(
                doc! {"_id": project_id},
                doc! {"$pull": {"members": {"user_id": user_id}}},
            )
            .await
            .map_err(map_err)?;
        Ok(result.modified_count > 0)
    }

    async fn set_quota(&self, project_id: &str, quota: QuotaLimits) -> Result<bool, StoreError> {
        let quota_bson = bson::to_bson(&quota).map_err(|e| StoreError::Backend(e.to_string()))?;
        let result = self
            .projects()
            .update_one(
                doc! {"_id": project_id},
                doc! {"$set": {
                    "settings.quota": quota_bson,
                    "updated_at": bson::DateTime::from_chrono(Utc::now()),
                }},
            )
            .await
            .map_err(map_err)?;
        Ok(result.matched_count > 0)
    }

    async fn increment_usage(
        &self,
        project_id: &str,
        tokens: u64,
        cost: f64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let tokens = tokens as i64;
        // One server-side $inc across all three buckets; racing requests are
        // both reflected without a read-modify-write cycle.
        self.projects()
            .update_one(
                doc! {"_id": project_id},
                doc! {
                    "$inc": {
                        "usage.total.requests": 1_i64,
                        "usage.total.tokens": tokens,
                        "usage.total.cost": cost,
                        "usage.current_month.requests": 1_i64,
                        "usage.current_month.tokens": tokens,
                        "usage.current_month.cost": cost,
                        "usage.current_day.requests": 1_i64,
                        "usage.current_day.tokens": tokens,
                        "usage.current_day.cost": cost,
                    },
                    "$set": {"usage.last_updated": bson::DateTime::from_chrono(at)},
                },
            )
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn reset_daily_counters(&self, at: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = self
            .projects()
            .update_many(
                doc! {},
                doc! {"$set": {
                    "usage.current_day": {"requests": 0_i64, "tokens": 0_i64, "cost": 0.0},
                    "usage.last_updated": bson::DateTime::from_chrono(at),
                }},
            )
            .await
            .map_err(map_err)?;
        Ok(result.modified_count)
    }

    async fn reset_monthly_counters(&self, at: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = self
            .projects()
            .update_many(
                doc! {},
                doc! {"$set": {
                    "usage.current_month": {"requests": 0_i64, "tokens": 0_i64, "cost": 0.0},
                    "usage.last_updated": bson::DateTime::from_chrono(at),
                }},
            )
            .await
            .map_err(map_err)?;
        Ok(result.modified_count)
    }
}

#[async_trait::async_trait]
impl UsageRepo for MongoStore {
    async fn insert_usage(&self, record: UsageRecord) -> Result<(), StoreError> {
        self.usage()
            .insert_one(UsageRecordDoc::from(record))
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn usage_for_project(
        &self,
        project_id: &str,
        limit: usize,
    ) -> Result<Vec<UsageRecord>, StoreError> {
        let docs: Vec<UsageRecordDoc> = self
            .usage()
            .find(doc! {"project_id": project_id})
            .sort(doc! {"timestamp": -1})
            .limit(limit as i64)
            .await
            .map_err(map_err)?
            .try_collect()
            .await
            .map_err(map_err)?;
        docs.into_iter().map(UsageRecord::try_from).collect()
    }
}

#[async_trait::async_trait]
impl AuditRepo for MongoStore {
    async fn append_audit(&self, log: AuditLog) -> Result<(), StoreError> {
        self.audit()
            .insert_one(AuditLogDoc::from(log))
            .await
            .map_err(map_err)?;
        Ok(())
    }
}
