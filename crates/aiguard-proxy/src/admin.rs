//! Management surface under `/_api`: user profile, token lifecycle, project
//! lifecycle, membership, credentials, usage, and the admin override.

use axum::extract::{FromRequestParts, Path, State};
use axum::http::{header, request::Parts, HeaderMap, StatusCode};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use aiguard_store::{ProjectRepo, StoreError, TokenRepo, UsageRepo, UserRepo};
use aiguard_types::{
    AuditAction, MemberRole, PersonalAccessToken, Project, ProjectCredential, ProjectMember,
    ProjectSettings, Provider, QuotaLimits, Scope, UsageCounters, User, UserStatus,
};

use crate::audit::ClientInfo;
use crate::auth::Principal;
use crate::error::{ApiError, ErrorKind};
use crate::hasher;
use crate::pipeline::{client_ip, new_request_id};
use crate::server::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/users/profile", get(get_profile).patch(update_profile))
        .route("/users/account", delete(delete_account))
        .route("/users/tokens", post(create_token).get(list_tokens))
        .route("/users/tokens/{id}", delete(revoke_token))
        .route("/users/tokens/{id}/rotate", post(rotate_token))
        .route("/projects", post(create_project).get(list_projects))
        .route("/projects/{id}", get(get_project).delete(delete_project))
        .route("/projects/{id}/keys", post(add_project_key))
        .route("/projects/{id}/keys/{provider}", delete(remove_project_key))
        .route("/projects/{id}/members", post(add_member))
        .route("/projects/{id}/members/{user_id}", delete(remove_member))
        .route("/projects/{id}/usage", get(project_usage))
        .route("/projects/{id}/quota", put(set_quota))
        .route("/admin/users", get(admin_list_users))
        .route("/admin/users/{id}/status", put(admin_set_status))
}

// ── Extractors ────────────────────────────────────────────────────────────────

/// Request context for envelopes and audit attribution.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub client: ClientInfo,
}

impl RequestMeta {
    pub fn error(&self, kind: ErrorKind, message: impl Into<String>) -> ApiError {
        ApiError::new(kind, message).with_context(&self.method, &self.path, &self.request_id)
    }

    pub fn store_error(&self, e: StoreError) -> ApiError {
        match e {
            StoreError::Duplicate(what) => self.error(ErrorKind::Conflict, format!("duplicate {what}")),
            StoreError::Backend(e) => self.error(ErrorKind::DatabaseError, e),
        }
    }
}

impl<S> FromRequestParts<S> for RequestMeta
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let client = ClientInfo {
            ip: Some(client_ip(&parts.headers, parts.extensions.get())),
            user_agent: parts
                .headers
                .get(header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .map(String::from),
        };
        Ok(Self {
            request_id: new_request_id(),
            method: parts.method.to_string(),
            path: parts.uri.path().to_string(),
            client,
        })
    }
}

impl FromRequestParts<AppState> for Principal {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        let authorization = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        state
            .validator
            .authenticate(authorization)
            .await
            .map_err(|e| {
                e.with_context(parts.method.as_str(), parts.uri.path(), &new_request_id())
            })
    }
}

/// Scope gate for management routes. External principals pass.
fn require_scope(meta: &RequestMeta, principal: &Principal, scope: Scope) -> Result<(), ApiError> {
    if principal.allows_scope(scope) {
        Ok(())
    } else {
        Err(meta.error(
            ErrorKind::Forbidden,
            format!("token lacks the {scope} scope"),
        ))
    }
}

/// Admin gate: `admin` PAT scope, or `X-Admin-Key` matching the configured
/// secret (compared in constant time). Returns the acting user when one
/// authenticated.
async fn authorize_admin(
    state: &AppState,
    meta: &RequestMeta,
    headers: &HeaderMap,
) -> Result<Option<Principal>, ApiError> {
    if let Some(presented) = headers.get("x-admin-key").and_then(|v| v.to_str().ok()) {
        if let Some(secret) = &state.config.admin_secret_key {
            if presented.as_bytes().ct_eq(secret.as_bytes()).into() {
                return Ok(None);
            }
        }
        return Err(meta.error(ErrorKind::Forbidden, "invalid admin key"));
    }

    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let principal = state
        .validator
        .authenticate(authorization)
        .await
        .map_err(|e| e.with_context(&meta.method, &meta.path, &meta.request_id))?;

    match &principal.token {
        Some(token) if token.has_scope(Scope::Admin) => Ok(Some(principal)),
        Some(_) => Err(meta.error(ErrorKind::Forbidden, "admin scope required")),
        // External principals are not admins unless provisioned as such.
        None => Err(meta.error(ErrorKind::Forbidden, "admin scope required")),
    }
}

// ── Views ─────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UserView {
    id: String,
    email: String,
    display_name: String,
    status: UserStatus,
    default_project_id: Option<String>,
    created_at: DateTime<Utc>,
    last_login_at: Option<DateTime<Utc>>,
}

impl From<&User> for UserView {
    fn from(u: &User) -> Self {
        Self {
            id: u.id.clone(),
            email: u.email.clone(),
            display_name: u.display_name.clone(),
            status: u.status,
            default_project_id: u.default_project_id.clone(),
            created_at: u.created_at,
            last_login_at: u.last_login_at,
        }
    }
}

/// Token without its hash; the raw string appears only in [`MintedTokenView`].
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenView {
    id: String,
    identifier: String,
    name: String,
    scopes: Vec<String>,
    project_id: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    revoked: bool,
    last_used_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<&PersonalAccessToken> for TokenView {
    fn from(t: &PersonalAccessToken) -> Self {
        Self {
            id: t.id.clone(),
            identifier: t.identifier.clone(),
            name: t.name.clone(),
            scopes: t.scopes.iter().map(|s| s.as_str().to_string()).collect(),
            project_id: t.project_id.clone(),
            expires_at: t.expires_at,
            revoked: t.revoked,
            last_used_at: t.last_used_at,
            created_at: t.created_at,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MintedTokenView {
    /// Shown exactly once; never retrievable again.
    token: String,
    #[serde(flatten)]
    details: TokenView,
}

/// Credential without its envelope.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CredentialView {
    provider: Provider,
    key_id: String,
    active: bool,
    added_by: String,
    added_at: DateTime<Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProjectView {
    id: String,
    name: String,
    owner_id: String,
    members: Vec<ProjectMember>,
    credentials: Vec<CredentialView>,
    settings: ProjectSettings,
    usage: UsageCounters,
    tier: String,
    created_at: DateTime<Utc>,
}

impl From<&Project> for ProjectView {
    fn from(p: &Project) -> Self {
        Self {
            id: p.id.clone(),
            name: p.name.clone(),
            owner_id: p.owner_id.clone(),
            members: p.members.clone(),
            credentials: p
                .credentials
                .iter()
                .map(|c| CredentialView {
                    provider: c.provider,
                    key_id: c.key_id.clone(),
                    active: c.active,
                    added_by: c.added_by.clone(),
                    added_at: c.added_at,
                })
                .collect(),
            settings: p.settings.clone(),
            usage: p.usage.clone(),
            tier: p.tier().as_str().to_string(),
            created_at: p.created_at,
        }
    }
}

// ── User routes ───────────────────────────────────────────────────────────────

async fn get_profile(
    meta: RequestMeta,
    principal: Principal,
) -> Result<Json<UserView>, ApiError> {
    require_scope(&meta, &principal, Scope::UsersRead)?;
    Ok(Json(UserView::from(&principal.user)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateProfileRequest {
    display_name: Option<String>,
    default_project_id: Option<String>,
}

async fn update_profile(
    State(state): State<AppState>,
    meta: RequestMeta,
    principal: Principal,
    Json(body): Json<UpdateProfileRequest>,
) -> Result<Json<UserView>, ApiError> {
    require_scope(&meta, &principal, Scope::UsersWrite)?;

    let mut user = principal.user.clone();
    if let Some(display_name) = body.display_name {
        user.display_name = display_name;
    }
    if let Some(project_id) = body.default_project_id {
        let project = state
            .projects
            .project_by_id(&project_id)
            .await
            .map_err(|e| meta.store_error(e))?
            .ok_or_else(|| meta.error(ErrorKind::NotFound, "project not found"))?;
        if project.role_of(&user.id).is_none() {
            return Err(meta.error(ErrorKind::Forbidden, "not a member of that project"));
        }
        user.default_project_id = Some(project_id);
    }
    user.updated_at = Utc::now();
    state
        .users
        .update_user(&user)
        .await
        .map_err(|e| meta.store_error(e))?;

    state
        .audit
        .success(
            &user.id,
            AuditAction::UserUpdated,
            "user",
            Some(&user.id),
            serde_json::json!({}),
            &meta.client,
        )
        .await;

    Ok(Json(UserView::from(&user)))
}

async fn delete_account(
    State(state): State<AppState>,
    meta: RequestMeta,
    principal: Principal,
) -> Result<StatusCode, ApiError> {
    require_scope(&meta, &principal, Scope::UsersWrite)?;

    let user_id = principal.user.id.clone();
    state
        .users
        .set_user_status(&user_id, UserStatus::Deleted)
        .await
        .map_err(|e| meta.store_error(e))?;
    let revoked = state
        .tokens
        .revoke_all_for_user(&user_id)
        .await
        .map_err(|e| meta.store_error(e))?;

    state
        .audit
        .success(
            &user_id,
            AuditAction::UserDeleted,
            "user",
            Some(&user_id),
            serde_json::json!({ "tokensRevoked": revoked }),
            &meta.client,
        )
        .await;

    Ok(StatusCode::NO_CONTENT)
}

// ── Token routes ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTokenRequest {
    name: String,
    #[serde(default)]
    scopes: Vec<String>,
    project_id: Option<String>,
    expires_in_days: Option<i64>,
}

async fn create_token(
    State(state): State<AppState>,
    meta: RequestMeta,
    principal: Principal,
    Json(body): Json<CreateTokenRequest>,
) -> Result<(StatusCode, Json<MintedTokenView>), ApiError> {
    require_scope(&meta, &principal, Scope::UsersWrite)?;

    if body.name.trim().is_empty() {
        return Err(meta.error(ErrorKind::ValidationError, "token name must not be empty"));
    }
    let mut scopes = Vec::new();
    for raw in &body.scopes {
        let scope = Scope::from_str(raw)
            .ok_or_else(|| meta.error(ErrorKind::ValidationError, format!("unknown scope {raw}")))?;
        // Minting an admin token requires already being one.
        if scope == Scope::Admin && !principal.allows_scope(Scope::Admin) {
            return Err(meta.error(ErrorKind::Forbidden, "cannot grant the admin scope"));
        }
        scopes.push(scope);
    }
    if scopes.is_empty() {
        scopes = vec![Scope::ApiRead, Scope::ApiWrite];
    }

    let (minted, hash) = hasher::mint()
        .map_err(|e| meta.error(ErrorKind::Unknown, e.to_string()))?;
    let now = Utc::now();
    let token = PersonalAccessToken {
        id: uuid::Uuid::new_v4().to_string(),
        identifier: minted.token.identifier().to_string(),
        token_hash: hash,
        user_id: principal.user.id.clone(),
        project_id: body.project_id,
        name: body.name.trim().to_string(),
        scopes,
        expires_at: body
            .expires_in_days
            .map(|days| now + ChronoDuration::days(days)),
        revoked: false,
        last_used_at: None,
        created_at: now,
        updated_at: now,
    };

    state
        .tokens
        .insert_token(token.clone())
        .await
        .map_err(|e| meta.store_error(e))?;

    state
        .audit
        .success(
            &principal.user.id,
            AuditAction::AuthTokenCreated,
            "token",
            Some(&token.id),
            serde_json::json!({ "name": token.name }),
            &meta.client,
        )
        .await;

    Ok((
        StatusCode::CREATED,
        Json(MintedTokenView {
            token: minted.token.as_str().to_string(),
            details: TokenView::from(&token),
        }),
    ))
}

async fn list_tokens(
    State(state): State<AppState>,
    meta: RequestMeta,
    principal: Principal,
) -> Result<Json<Vec<TokenView>>, ApiError> {
    require_scope(&meta, &principal, Scope::UsersRead)?;
    let tokens = state
        .tokens
        .tokens_for_user(&principal.user.id)
        .await
        .map_err(|e| meta.store_error(e))?;
    Ok(Json(tokens.iter().map(TokenView::from).collect()))
}

async fn revoke_token(
    State(state): State<AppState>,
    meta: RequestMeta,
    principal: Principal,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    require_scope(&meta, &principal, Scope::UsersWrite)?;

    let token = state
        .tokens
        .token_by_id(&id)
        .await
        .map_err(|e| meta.store_error(e))?
        .ok_or_else(|| meta.error(ErrorKind::NotFound, "token not found"))?;
    if token.user_id != principal.user.id {
        return Err(meta.error(ErrorKind::Forbidden, "token belongs to another user"));
    }

    state
        .tokens
        .revoke_token(&id)
        .await
        .map_err(|e| meta.store_error(e))?;

    state
        .audit
        .success(
            &principal.user.id,
            AuditAction::AuthTokenRevoked,
            "token",
            Some(&id),
            serde_json::json!({ "name": token.name }),
            &meta.client,
        )
        .await;

    Ok(StatusCode::NO_CONTENT)
}

async fn rotate_token(
    State(state): State<AppState>,
    meta: RequestMeta,
    principal: Principal,
    Path(id): Path<String>,
) -> Result<Json<MintedTokenView>, ApiError> {
    require_scope(&meta, &principal, Scope::UsersWrite)?;

    let token = state
        .tokens
        .token_by_id(&id)
        .await
        .map_err(|e| meta.store_error(e))?
        .ok_or_else(|| meta.error(ErrorKind::NotFound, "token not found"))?;
    if token.user_id != principal.user.id {
        return Err(meta.error(ErrorKind::Forbidden, "token belongs to another user"));
    }
    if token.revoked {
        return Err(meta.error(ErrorKind::Conflict, "cannot rotate a revoked token"));
    }

    let (minted, hash) = hasher::mint()
        .map_err(|e| meta.error(ErrorKind::Unknown, e.to_string()))?;
    state
        .tokens
        .replace_token_secret(&id, minted.token.identifier(), &hash)
        .await
        .map_err(|e| meta.store_error(e))?;

    state
        .audit
        .success(
            &principal.user.id,
            AuditAction::AuthTokenRotated,
            "token",
            Some(&id),
            serde_json::json!({ "name": token.name }),
            &meta.client,
        )
        .await;

    let mut rotated = token;
    rotated.identifier = minted.token.identifier().to_string();
    Ok(Json(MintedTokenView {
        token: minted.token.as_str().to_string(),
        details: TokenView::from(&rotated),
    }))
}

// ── Project routes ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateProjectRequest {
    name: String,
}

async fn create_project(
    State(state): State<AppState>,
    meta: RequestMeta,
    principal: Principal,
    Json(body): Json<CreateProjectRequest>,
) -> Result<(StatusCode, Json<ProjectView>), ApiError> {
    require_scope(&meta, &principal, Scope::ProjectsWrite)?;

    if body.name.trim().is_empty() {
        return Err(meta.error(ErrorKind::ValidationError, "project name must not be empty"));
    }

    let now = Utc::now();
    let project = Project {
        id: uuid::Uuid::new_v4().to_string(),
        name: body.name.trim().to_string(),
        owner_id: principal.user.id.clone(),
        members: vec![ProjectMember {
            user_id: principal.user.id.clone(),
            role: MemberRole::Owner,
            added_at: now,
        }],
        credentials: vec![],
        settings: ProjectSettings::default(),
        usage: UsageCounters::default(),
        created_at: now,
        updated_at: now,
    };
    state
        .projects
        .insert_project(project.clone())
        .await
        .map_err(|e| meta.store_error(e))?;

    // First project becomes the caller's default.
    if principal.user.default_project_id.is_none() {
        let mut user = principal.user.clone();
        user.default_project_id = Some(project.id.clone());
        user.updated_at = now;
        if let Err(e) = state.users.update_user(&user).await {
            tracing::warn!(error = %e, "Failed to set default project");
        }
    }

    state
        .audit
        .success(
            &principal.user.id,
            AuditAction::ProjectCreated,
            "project",
            Some(&project.id),
            serde_json::json!({ "name": project.name }),
            &meta.client,
        )
        .await;

    Ok((StatusCode::CREATED, Json(ProjectView::from(&project))))
}

async fn list_projects(
    State(state): State<AppState>,
    meta: RequestMeta,
    principal: Principal,
) -> Result<Json<Vec<ProjectView>>, ApiError> {
    require_scope(&meta, &principal, Scope::ProjectsRead)?;
    let projects = state
        .projects
        .projects_for_user(&principal.user.id)
        .await
        .map_err(|e| meta.store_error(e))?;
    Ok(Json(projects.iter().map(ProjectView::from).collect()))
}

/// Fetch a project and require at least the given member standing.
async fn member_project(
    state: &AppState,
    meta: &RequestMeta,
    principal: &Principal,
    project_id: &str,
    manage: bool,
) -> Result<Project, ApiError> {
    let project = state
        .projects
        .project_by_id(project_id)
        .await
        .map_err(|e| meta.store_error(e))?
        .ok_or_else(|| meta.error(ErrorKind::NotFound, "project not found"))?;

    match project.role_of(&principal.user.id) {
        Some(MemberRole::Owner) | Some(MemberRole::Admin) => Ok(project),
        Some(MemberRole::Member) if !manage => Ok(project),
        Some(MemberRole::Member) => Err(meta.error(
            ErrorKind::Forbidden,
            "project owner or admin role required",
        )),
        None => Err(meta.error(ErrorKind::Forbidden, "not a member of this project")),
    }
}

async fn get_project(
    State(state): State<AppState>,
    meta: RequestMeta,
    principal: Principal,
    Path(id): Path<String>,
) -> Result<Json<ProjectView>, ApiError> {
    require_scope(&meta, &principal, Scope::ProjectsRead)?;
    let project = member_project(&state, &meta, &principal, &id, false).await?;
    Ok(Json(ProjectView::from(&project)))
}

async fn delete_project(
    State(state): State<AppState>,
    meta: RequestMeta,
    principal: Principal,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    require_scope(&meta, &principal, Scope::ProjectsWrite)?;
    let project = member_project(&state, &meta, &principal, &id, true).await?;
    if project.owner_id != principal.user.id {
        return Err(meta.error(ErrorKind::Forbidden, "only the owner may delete a project"));
    }

    state
        .projects
        .delete_project(&id)
        .await
        .map_err(|e| meta.store_error(e))?;

    state
        .audit
        .success(
            &principal.user.id,
            AuditAction::ProjectDeleted,
            "project",
            Some(&id),
            serde_json::json!({ "name": project.name }),
            &meta.client,
        )
        .await;

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddKeyRequest {
    provider: String,
    api_key: String,
    #[serde(default)]
    metadata: serde_json::Value,
}

async fn add_project_key(
    State(state): State<AppState>,
    meta: RequestMeta,
    principal: Principal,
    Path(id): Path<String>,
    Json(body): Json<AddKeyRequest>,
) -> Result<(StatusCode, Json<CredentialView>), ApiError> {
    require_scope(&meta, &principal, Scope::ProjectsWrite)?;
    member_project(&state, &meta, &principal, &id, true).await?;

    let provider = Provider::from_tag(&body.provider)
        .map_err(|e| meta.error(ErrorKind::InvalidProvider, e.to_string()))?;
    if body.api_key.is_empty() {
        return Err(meta.error(ErrorKind::ValidationError, "apiKey must not be empty"));
    }

    let sealed = state
        .vault
        .encrypt(&body.api_key, body.metadata)
        .map_err(|e| meta.error(ErrorKind::ConfigurationError, e.to_string()))?;

    let credential = ProjectCredential {
        provider,
        envelope: sealed.envelope,
        key_id: sealed.key_id.clone(),
        active: true,
        added_by: principal.user.id.clone(),
        added_at: Utc::now(),
    };
    state
        .projects
        .add_credential(&id, credential.clone())
        .await
        .map_err(|e| meta.store_error(e))?;

    state
        .audit
        .success(
            &principal.user.id,
            AuditAction::ApiKeyAdded,
            "project",
            Some(&id),
            serde_json::json!({ "provider": provider.as_str(), "keyId": sealed.key_id }),
            &meta.client,
        )
        .await;

    Ok((
        StatusCode::CREATED,
        Json(CredentialView {
            provider,
            key_id: credential.key_id,
            active: true,
            added_by: credential.added_by,
            added_at: credential.added_at,
        }),
    ))
}

async fn remove_project_key(
    State(state): State<AppState>,
    meta: RequestMeta,
    principal: Principal,
    Path((id, provider_tag)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    require_scope(&meta, &principal, Scope::ProjectsWrite)?;
    member_project(&state, &meta, &principal, &id, true).await?;

    let provider = Provider::from_tag(&provider_tag)
        .map_err(|e| meta.error(ErrorKind::InvalidProvider, e.to_string()))?;
    let removed = state
        .projects
        .remove_credential(&id, provider)
        .await
        .map_err(|e| meta.store_error(e))?;
    if !removed {
        return Err(meta.error(ErrorKind::NotFound, "no credential for that provider"));
    }

    state
        .audit
        .success(
            &principal.user.id,
            AuditAction::ApiKeyRemoved,
            "project",
            Some(&id),
            serde_json::json!({ "provider": provider.as_str() }),
            &meta.client,
        )
        .await;

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddMemberRequest {
    user_id: String,
    role: Option<String>,
}

async fn add_member(
    State(state): State<AppState>,
    meta: RequestMeta,
    principal: Principal,
    Path(id): Path<String>,
    Json(body): Json<AddMemberRequest>,
) -> Result<StatusCode, ApiError> {
    require_scope(&meta, &principal, Scope::ProjectsWrite)?;
    member_project(&state, &meta, &principal, &id, true).await?;

    let role = match body.role.as_deref() {
        None | Some("member") => MemberRole::Member,
        Some("admin") => MemberRole::Admin,
        Some(other) => {
            return Err(meta.error(ErrorKind::ValidationError, format!("unknown role {other}")))
        }
    };

    let user = state
        .users
        .user_by_id(&body.user_id)
        .await
        .map_err(|e| meta.store_error(e))?
        .ok_or_else(|| meta.error(ErrorKind::NotFound, "user not found"))?;
    if !user.is_active() {
        return Err(meta.error(ErrorKind::Conflict, "user is not active"));
    }

    state
        .projects
        .add_member(
            &id,
            ProjectMember {
                user_id: body.user_id.clone(),
                role,
                added_at: Utc::now(),
            },
        )
        .await
        .map_err(|e| meta.store_error(e))?;

    state
        .audit
        .success(
            &principal.user.id,
            AuditAction::ProjectMemberAdded,
            "project",
            Some(&id),
            serde_json::json!({ "userId": body.user_id }),
            &meta.client,
        )
        .await;

    Ok(StatusCode::CREATED)
}

async fn remove_member(
    State(state): State<AppState>,
    meta: RequestMeta,
    principal: Principal,
    Path((id, user_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    require_scope(&meta, &principal, Scope::ProjectsWrite)?;
    let project = member_project(&state, &meta, &principal, &id, true).await?;
    if project.owner_id == user_id {
        return Err(meta.error(ErrorKind::Conflict, "the owner cannot be removed"));
    }

    let removed = state
        .projects
        .remove_member(&id, &user_id)
        .await
        .map_err(|e| meta.store_error(e))?;
    if !removed {
        return Err(meta.error(ErrorKind::NotFound, "member not found"));
    }

    state
        .audit
        .success(
            &principal.user.id,
            AuditAction::ProjectMemberRemoved,
            "project",
            Some(&id),
            serde_json::json!({ "userId": user_id }),
            &meta.client,
        )
        .await;

    Ok(StatusCode::NO_CONTENT)
}

async fn project_usage(
    State(state): State<AppState>,
    meta: RequestMeta,
    principal: Principal,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_scope(&meta, &principal, Scope::ProjectsRead)?;
    let project = member_project(&state, &meta, &principal, &id, false).await?;

    let recent = state
        .usage
        .usage_for_project(&id, 50)
        .await
        .map_err(|e| meta.store_error(e))?;

    Ok(Json(serde_json::json!({
        "counters": project.usage,
        "recent": recent,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetQuotaRequest {
    daily: u64,
    monthly: u64,
}

async fn set_quota(
    State(state): State<AppState>,
    meta: RequestMeta,
    principal: Principal,
    Path(id): Path<String>,
    Json(body): Json<SetQuotaRequest>,
) -> Result<StatusCode, ApiError> {
    require_scope(&meta, &principal, Scope::ProjectsWrite)?;
    member_project(&state, &meta, &principal, &id, true).await?;

    if body.daily == 0 || body.monthly == 0 {
        return Err(meta.error(ErrorKind::ValidationError, "quota limits must be positive"));
    }

    state
        .projects
        .set_quota(
            &id,
            QuotaLimits {
                daily: body.daily,
                monthly: body.monthly,
            },
        )
        .await
        .map_err(|e| meta.store_error(e))?;

    state
        .audit
        .success(
            &principal.user.id,
            AuditAction::ProjectUpdated,
            "project",
            Some(&id),
            serde_json::json!({ "quota": { "daily": body.daily, "monthly": body.monthly } }),
            &meta.client,
        )
        .await;

    Ok(StatusCode::NO_CONTENT)
}

// ── Admin routes ──────────────────────────────────────────────────────────────

async fn admin_list_users(
    State(state): State<AppState>,
    meta: RequestMeta,
    headers: HeaderMap,
) -> Result<Json<Vec<UserView>>, ApiError> {
    authorize_admin(&state, &meta, &headers).await?;
    let users = state
        .users
        .list_users()
        .await
        .map_err(|e| meta.store_error(e))?;
    Ok(Json(users.iter().map(UserView::from).collect()))
}

#[derive(Deserialize)]
struct SetStatusRequest {
    status: String,
}

async fn admin_set_status(
    State(state): State<AppState>,
    meta: RequestMeta,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<SetStatusRequest>,
) -> Result<StatusCode, ApiError> {
    let acting = authorize_admin(&state, &meta, &headers).await?;

    let status = match body.status.as_str() {
        "active" => UserStatus::Active,
        "suspended" => UserStatus::Suspended,
        "deleted" => UserStatus::Deleted,
        other => {
            return Err(meta.error(ErrorKind::ValidationError, format!("unknown status {other}")))
        }
    };

    let found = state
        .users
        .set_user_status(&id, status)
        .await
        .map_err(|e| meta.store_error(e))?;
    if !found {
        return Err(meta.error(ErrorKind::NotFound, "user not found"));
    }

    let mut details = serde_json::json!({ "status": body.status });
    if status == UserStatus::Deleted {
        let revoked = state
            .tokens
            .revoke_all_for_user(&id)
            .await
            .map_err(|e| meta.store_error(e))?;
        details["tokensRevoked"] = serde_json::json!(revoked);
    }

    state
        .audit
        .write(
            acting.as_ref().map(|p| p.user.id.as_str()),
            AuditAction::UserStatusChanged,
            "user",
            Some(&id),
            details,
            &meta.client,
            aiguard_types::AuditStatus::Success,
            None,
        )
        .await;

    Ok(StatusCode::NO_CONTENT)
}

