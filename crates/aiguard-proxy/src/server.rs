//! Router assembly and dependency injection.
//!
//! Everything the pipeline needs is constructed once (in the binary or a
//! test) and carried in [`AppState`] — no process-wide singletons.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};

use aiguard_store::{AuditRepo, ProjectRepo, TokenRepo, UsageRepo, UserRepo};
use aiguard_types::Provider;
use aiguard_vault::{MasterKey, Vault};

use crate::admin;
use crate::audit::AuditWriter;
use crate::auth::TokenValidator;
use crate::config::Config;
use crate::credentials::CredentialResolver;
use crate::forward::Forwarder;
use crate::identity::IdentityVerifier;
use crate::pipeline;
use crate::ratelimit::{RateLimitBackend, RateLimiter};
use crate::usage::UsageTracker;

/// Shared, cloneable handle to every pipeline collaborator.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub vault: Arc<Vault>,
    pub users: Arc<dyn UserRepo>,
    pub tokens: Arc<dyn TokenRepo>,
    pub projects: Arc<dyn ProjectRepo>,
    pub usage: Arc<dyn UsageRepo>,
    pub validator: Arc<TokenValidator>,
    pub resolver: Arc<CredentialResolver>,
    pub limiter: Arc<RateLimiter>,
    pub forwarder: Arc<Forwarder>,
    pub tracker: Arc<UsageTracker>,
    pub audit: Arc<AuditWriter>,
}

impl AppState {
    /// Wire the pipeline from a store implementing every repository contract.
    pub fn build<S>(
        config: Config,
        store: S,
        identity: Option<Arc<dyn IdentityVerifier>>,
        rate_backend: Box<dyn RateLimitBackend>,
    ) -> Self
    where
        S: UserRepo + TokenRepo + ProjectRepo + UsageRepo + AuditRepo + Clone + 'static,
    {
        let users: Arc<dyn UserRepo> = Arc::new(store.clone());
        let tokens: Arc<dyn TokenRepo> = Arc::new(store.clone());
        let projects: Arc<dyn ProjectRepo> = Arc::new(store.clone());
        let usage: Arc<dyn UsageRepo> = Arc::new(store.clone());
        let audit_repo: Arc<dyn AuditRepo> = Arc::new(store);

        let master_material = config
            .encryption_key
            .clone()
            .unwrap_or_else(|| "aiguard-development-only-master".to_string());
        let vault = Arc::new(Vault::new(MasterKey::from_material(
            master_material.as_bytes(),
        )));

        let system_keys: Arc<HashMap<Provider, String>> = Arc::new(config.system_keys.clone());
        let http = reqwest::Client::new();

        Self {
            vault: vault.clone(),
            users: users.clone(),
            tokens: tokens.clone(),
            projects: projects.clone(),
            usage: usage.clone(),
            validator: Arc::new(TokenValidator::new(tokens, users, identity)),
            resolver: Arc::new(CredentialResolver::new(vault, system_keys)),
            limiter: Arc::new(RateLimiter::new(rate_backend)),
            forwarder: Arc::new(Forwarder::new(http, &config)),
            tracker: Arc::new(UsageTracker::new(usage, projects)),
            audit: Arc::new(AuditWriter::new(audit_repo)),
            config: Arc::new(config),
        }
    }
}

/// Build the full router: health endpoints, the `/_api` management surface,
/// and the catch-all proxy pipeline.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .nest("/_api", admin::router())
        .fallback(pipeline::handle)
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn ready(State(_state): State<AppState>) -> impl IntoResponse {
    let providers: Vec<&str> = Provider::ALL.iter().map(Provider::as_str).collect();
    Json(serde_json::json!({
        "status": "ready",
        "providers": providers,
    }))
}
