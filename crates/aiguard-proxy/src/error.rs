//! Error envelope returned to clients.
//!
//! Every pipeline stage raises an [`ApiError`]; the orchestrator boundary
//! converts it to the JSON envelope
//! `{ error: { type, message, details?, statusCode, timestamp, path, method,
//! requestId?, suggestions? } }` with the stage-appropriate HTTP status.

use axum::body::Body;
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;

/// Closed set of error kinds carried in the envelope's `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidProvider,
    UpstreamError,
    NetworkError,
    Timeout,
    InvalidRequest,
    ConfigurationError,
    AuthenticationError,
    RateLimitExceeded,
    QuotaExceeded,
    Forbidden,
    NotFound,
    Conflict,
    DatabaseError,
    ValidationError,
    PayloadTooLarge,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidProvider => "INVALID_PROVIDER",
            Self::UpstreamError => "UPSTREAM_ERROR",
            Self::NetworkError => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::ConfigurationError => "CONFIGURATION_ERROR",
            Self::AuthenticationError => "AUTHENTICATION_ERROR",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::QuotaExceeded => "QUOTA_EXCEEDED",
            Self::Forbidden => "FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::DatabaseError => "DATABASE_ERROR",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::PayloadTooLarge => "INVALID_REQUEST",
            Self::Unknown => "UNKNOWN_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidProvider | Self::InvalidRequest | Self::ValidationError => {
                StatusCode::BAD_REQUEST
            }
            Self::AuthenticationError => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict => StatusCode::CONFLICT,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::RateLimitExceeded | Self::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
            Self::UpstreamError | Self::NetworkError => StatusCode::BAD_GATEWAY,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::ConfigurationError | Self::DatabaseError | Self::Unknown => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// A pipeline error, enriched with request context at the boundary.
#[derive(Debug)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub suggestions: Option<Vec<String>>,
    path: Option<String>,
    method: Option<String>,
    request_id: Option<String>,
    extra_headers: Vec<(HeaderName, String)>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
            suggestions: None,
            path: None,
            method: None,
            request_id: None,
            extra_headers: Vec::new(),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions
            .get_or_insert_with(Vec::new)
            .push(suggestion.into());
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: impl Into<String>) -> Self {
        self.extra_headers.push((name, value.into()));
        self
    }

    /// Attach the request context that goes into the envelope.
    pub fn with_context(mut self, method: &str, path: &str, request_id: &str) -> Self {
        self.method = Some(method.to_string());
        self.path = Some(path.to_string());
        self.request_id = Some(request_id.to_string());
        self
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.kind.status();

        let mut error = serde_json::json!({
            "type": self.kind.as_str(),
            "message": self.message,
            "statusCode": status.as_u16(),
            "timestamp": Utc::now().to_rfc3339(),
        });
        if let Some(details) = &self.details {
            error["details"] = details.clone();
        }
        if let Some(path) = &self.path {
            error["path"] = serde_json::json!(path);
        }
        if let Some(method) = &self.method {
            error["method"] = serde_json::json!(method);
        }
        if let Some(request_id) = &self.request_id {
            error["requestId"] = serde_json::json!(request_id);
        }
        if let Some(suggestions) = &self.suggestions {
            error["suggestions"] = serde_json::json!(suggestions);
        }
        let body = serde_json::json!({ "error": error });

        let mut response = Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json");
        for (name, value) in &self.extra_headers {
            if let Ok(value) = HeaderValue::from_str(value) {
                response = response.header(name, value);
            }
        }

        response
            .body(Body::from(body.to_string()))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}
