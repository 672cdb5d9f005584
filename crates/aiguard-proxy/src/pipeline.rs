//! The request pipeline: one explicit, ordered sequence of stages per
//! inbound proxy request.
//!
//! Stage order: request id → provider header → authenticate → scope check →
//! body screen + schema → rate limit → quota → project context + allowlist →
//! credential resolution → forward → usage + audit. Errors are converted to
//! the envelope at this boundary, with the request id attached.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use rand::Rng;
use serde_json::Value;

use aiguard_store::ProjectRepo;
use aiguard_types::{AuditAction, AuditStatus, Project, Provider, Scope};

use crate::audit::ClientInfo;
use crate::auth::Principal;
use crate::error::{ApiError, ErrorKind};
use crate::forward::{ForwardBody, StreamSummary};
use crate::quota;
use crate::ratelimit::{RateDecision, RateLimiter};
use crate::server::AppState;
use crate::usage::{self, UsageContext};
use crate::validate;

pub const PROVIDER_HEADER: &str = "x-ai-guard-provider";
pub const PROJECT_HEADER: &str = "x-ai-guard-project";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Random 16-character alphanumeric request id.
pub fn new_request_id() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..16)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Client address: first `x-forwarded-for` hop, else the socket peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<&ConnectInfo<std::net::SocketAddr>>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| {
            peer.map(|ConnectInfo(addr)| addr.ip().to_string())
                .unwrap_or_else(|| "unknown".to_string())
        })
}

/// Fallback handler for everything outside `/_api`, `/health`, `/ready`.
pub async fn handle(State(state): State<AppState>, request: Request) -> Response {
    let request_id = new_request_id();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    match run(&state, request, &request_id).await {
        Ok(mut response) => {
            if let Ok(value) = HeaderValue::from_str(&request_id) {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
            }
            response
        }
        Err(err) => {
            tracing::warn!(
                request_id = %request_id,
                method = %method,
                path = %path,
                error = %err,
                "Pipeline rejected request"
            );
            err.with_context(&method, &path, &request_id).into_response()
        }
    }
}

async fn run(state: &AppState, request: Request, request_id: &str) -> Result<Response, ApiError> {
    let started = Instant::now();
    let (parts, body) = request.into_parts();
    let method = parts.method.clone();
    let path = parts.uri.path().to_string();
    let query = parts.uri.query().map(String::from);
    let headers = parts.headers.clone();

    // ── Provider ──────────────────────────────────────────────────────────
    let provider_tag = headers
        .get(PROVIDER_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            ApiError::new(
                ErrorKind::InvalidRequest,
                format!("missing required header {PROVIDER_HEADER}"),
            )
            .with_suggestion("set X-AI-Guard-Provider to openai, anthropic, or gemini")
        })?;
    let provider = Provider::from_tag(provider_tag)
        .map_err(|e| ApiError::new(ErrorKind::InvalidProvider, e.to_string()))?;

    let client = ClientInfo {
        ip: Some(client_ip(
            &headers,
            parts.extensions.get::<ConnectInfo<std::net::SocketAddr>>(),
        )),
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(String::from),
    };

    // ── Authenticate ──────────────────────────────────────────────────────
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let principal = state.validator.authenticate(authorization).await?;

    let required_scope = if method == Method::GET || method == Method::HEAD {
        Scope::ApiRead
    } else {
        Scope::ApiWrite
    };
    if !principal.allows_scope(required_scope) {
        return Err(ApiError::new(
            ErrorKind::Forbidden,
            format!("token lacks the {required_scope} scope"),
        ));
    }

    // ── Body: read, screen, validate ──────────────────────────────────────
    let body_bytes = axum::body::to_bytes(body, state.config.max_request_size)
        .await
        .map_err(|_| {
            ApiError::new(
                ErrorKind::PayloadTooLarge,
                format!(
                    "request body exceeds the {} byte limit",
                    state.config.max_request_size
                ),
            )
        })?;

    let parsed_body: Option<Value> = if body_bytes.is_empty() {
        None
    } else {
        serde_json::from_slice(&body_bytes).ok()
    };

    if let Some(body) = &parsed_body {
        validate::screen(body)?;
        validate::validate(provider, method.as_str(), &path, body)?;
    }

    // ── Project context ───────────────────────────────────────────────────
    let (explicit_project, fallback_project) =
        resolve_project_context(state, &principal, &headers, query.as_deref()).await?;
    let governing = explicit_project.as_ref().or(fallback_project.as_ref());

    if let Some(project) = governing {
        if !project.allows_provider(provider) {
            return Err(ApiError::new(
                ErrorKind::Forbidden,
                format!("provider {provider} is not allowed for project {}", project.name),
            ));
        }
    }

    // ── Rate limit ────────────────────────────────────────────────────────
    let rate_key = RateLimiter::key_for(
        Some(principal.user.id.as_str()),
        client.ip.as_deref().unwrap_or("unknown"),
    );
    let rate_policy = RateLimiter::policy_for(governing.map(|p| &**p));
    let rate = state.limiter.check(&rate_key, rate_policy).await;
    if !rate.allowed {
        let mut err = ApiError::new(ErrorKind::RateLimitExceeded, "rate limit exceeded")
            .with_header(
                HeaderName::from_static("retry-after"),
                rate.retry_after_secs().to_string(),
            );
        for (name, value) in rate.headers() {
            err = err.with_header(name, value);
        }
        return Err(err);
    }

    // ── Quota ─────────────────────────────────────────────────────────────
    let quota_decision = governing.map(|project| quota::admit(project));
    if let Some(decision) = &quota_decision {
        if !decision.allowed {
            let bucket = decision.denied_bucket.unwrap_or("daily");
            let mut err = ApiError::new(
                ErrorKind::QuotaExceeded,
                format!("{bucket} request quota exhausted"),
            )
            .with_details(serde_json::json!({ "quotaType": bucket }));
            for (name, value) in decision.headers() {
                err = err.with_header(name, value);
            }
            return Err(err);
        }
    }

    // ── Credential ────────────────────────────────────────────────────────
    let credential = state.resolver.resolve(
        provider,
        explicit_project.as_deref(),
        fallback_project.as_deref(),
    )?;

    // ── Forward ───────────────────────────────────────────────────────────
    let project_id = governing.map(|p| p.id.clone());
    let stream_ctx = StreamAccounting {
        state: state.clone(),
        user_id: principal.user.id.clone(),
        project_id: project_id.clone(),
        provider,
        path: path.clone(),
        method: method.to_string(),
        key_source: credential.source.as_str(),
        request_id: request_id.to_string(),
        request_model: parsed_body
            .as_ref()
            .and_then(|b| b.get("model"))
            .and_then(Value::as_str)
            .map(String::from),
        client: client.clone(),
        started,
    };
    let on_stream_end: crate::forward::StreamEndHook =
        Box::new(move |summary| stream_ctx.finish(summary));

    let outcome = state
        .forwarder
        .forward(
            provider,
            method.clone(),
            &path,
            query.as_deref(),
            &headers,
            body_bytes.clone(),
            parsed_body.as_ref(),
            &credential,
            on_stream_end,
        )
        .await?;

    // ── Respond + account ─────────────────────────────────────────────────
    let mut builder = Response::builder().status(outcome.status);
    if let Some(headers_mut) = builder.headers_mut() {
        *headers_mut = outcome.headers.clone();
        apply_policy_headers(headers_mut, &rate, quota_decision.as_ref());
    }

    match outcome.body {
        ForwardBody::Buffered(bytes) => {
            account_buffered(
                state,
                &principal,
                project_id,
                provider,
                &path,
                &method,
                outcome.status,
                &bytes,
                parsed_body.as_ref(),
                credential.source.as_str(),
                request_id,
                &client,
                started,
            )
            .await;

            builder
                .body(Body::from(bytes))
                .map_err(|e| ApiError::new(ErrorKind::Unknown, e.to_string()))
        }
        ForwardBody::Streaming(stream) => builder
            .body(stream)
            .map_err(|e| ApiError::new(ErrorKind::Unknown, e.to_string())),
    }
}

fn apply_policy_headers(
    headers: &mut HeaderMap,
    rate: &RateDecision,
    quota: Option<&quota::QuotaDecision>,
) {
    for (name, value) in rate.headers() {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }
    if let Some(decision) = quota {
        for (name, value) in decision.headers() {
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(name, value);
            }
        }
    }
}

/// Explicit project hint (header or `project` query parameter) and the
/// caller's default project.
async fn resolve_project_context(
    state: &AppState,
    principal: &Principal,
    headers: &HeaderMap,
    query: Option<&str>,
) -> Result<(Option<Arc<Project>>, Option<Arc<Project>>), ApiError> {
    let hint = headers
        .get(PROJECT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .or_else(|| {
            query.and_then(|q| {
                q.split('&')
                    .find_map(|pair| pair.strip_prefix("project="))
                    .map(String::from)
            })
        });

    let explicit = match hint {
        Some(project_id) => {
            let project = state
                .projects
                .project_by_id(&project_id)
                .await
                .map_err(|e| ApiError::new(ErrorKind::DatabaseError, e.to_string()))?
                .ok_or_else(|| {
                    ApiError::new(ErrorKind::NotFound, format!("project {project_id} not found"))
                })?;
            if project.role_of(&principal.user.id).is_none() {
                return Err(ApiError::new(
                    ErrorKind::Forbidden,
                    "caller is not a member of the requested project",
                ));
            }
            Some(Arc::new(project))
        }
        None => None,
    };

    let fallback = match &principal.user.default_project_id {
        Some(default_id)
            if explicit
                .as_ref()
                .map_or(true, |p| p.id != *default_id) =>
        {
            // The default-project reference may dangle briefly during
            // deletion; tolerate it.
            state
                .projects
                .project_by_id(default_id)
                .await
                .map_err(|e| ApiError::new(ErrorKind::DatabaseError, e.to_string()))?
                .map(Arc::new)
        }
        _ => None,
    };

    Ok((explicit, fallback))
}

#[allow(clippy::too_many_arguments)]
async fn account_buffered(
    state: &AppState,
    principal: &Principal,
    project_id: Option<String>,
    provider: Provider,
    path: &str,
    method: &Method,
    status: StatusCode,
    response_bytes: &Bytes,
    request_body: Option<&Value>,
    key_source: &'static str,
    request_id: &str,
    client: &ClientInfo,
    started: Instant,
) {
    let response_body: Value = serde_json::from_slice(response_bytes).unwrap_or(Value::Null);
    let extracted = usage::extract(provider, &response_body, request_body, path);

    state
        .tracker
        .record(UsageContext {
            user_id: principal.user.id.clone(),
            project_id,
            provider,
            endpoint: path.to_string(),
            method: method.to_string(),
            status_code: status.as_u16(),
            response_time_ms: started.elapsed().as_millis() as u64,
            usage: extracted,
            key_source,
            request_id: request_id.to_string(),
        })
        .await;

    let audit_status = if status.is_success() {
        AuditStatus::Success
    } else {
        AuditStatus::Failure
    };
    state
        .audit
        .write(
            Some(&principal.user.id),
            AuditAction::Api(method.to_string()),
            "proxy",
            None,
            serde_json::json!({
                "provider": provider.as_str(),
                "path": path,
                "status": status.as_u16(),
                "requestId": request_id,
            }),
            client,
            audit_status,
            None,
        )
        .await;
}

/// Accounting context carried into a streaming response's end-of-stream hook.
struct StreamAccounting {
    state: AppState,
    user_id: String,
    project_id: Option<String>,
    provider: Provider,
    path: String,
    method: String,
    key_source: &'static str,
    request_id: String,
    request_model: Option<String>,
    client: ClientInfo,
    started: Instant,
}

impl StreamAccounting {
    fn finish(self, summary: StreamSummary) {
        tokio::spawn(async move {
            let usage_event = summary.usage_event.unwrap_or(Value::Null);
            let request_body = self.request_model.map(|m| serde_json::json!({ "model": m }));
            let extracted = usage::extract(
                self.provider,
                &usage_event,
                request_body.as_ref(),
                &self.path,
            );

            self.state
                .tracker
                .record(UsageContext {
                    user_id: self.user_id.clone(),
                    project_id: self.project_id,
                    provider: self.provider,
                    endpoint: self.path.clone(),
                    method: self.method.clone(),
                    status_code: summary.status,
                    response_time_ms: self.started.elapsed().as_millis() as u64,
                    usage: extracted,
                    key_source: self.key_source,
                    request_id: self.request_id.clone(),
                })
                .await;

            let status = if summary.aborted {
                AuditStatus::Failure
            } else {
                AuditStatus::Success
            };
            self.state
                .audit
                .write(
                    Some(&self.user_id),
                    AuditAction::Api(self.method.clone()),
                    "proxy",
                    None,
                    serde_json::json!({
                        "provider": self.provider.as_str(),
                        "path": self.path,
                        "streamed": true,
                        "aborted": summary.aborted,
                        "requestId": self.request_id,
                    }),
                    &self.client,
                    status,
                    None,
                )
                .await;
        });
    }
}
