//! Usage accounting after a forwarded request.
//!
//! Extracts token counts from the provider response, prices the call from a
//! static per-family cost table, emits a [`UsageRecord`], and advances the
//! owning project's counters with one atomic increment. Nothing in here may
//! fail the response: errors are logged and swallowed.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use aiguard_store::{ProjectRepo, UsageRepo};
use aiguard_types::{Provider, UsageRecord};

/// Token counts and model extracted from one response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderUsage {
    pub model: Option<String>,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

/// USD per 1K tokens, (model family substring, input, output). Checked in
/// order, so more specific families sit above their prefixes.
const COST_TABLE: [(&str, f64, f64); 12] = [
    ("gpt-4o-mini", 0.000_15, 0.000_6),
    ("gpt-4o", 0.002_5, 0.01),
    ("gpt-4-turbo", 0.01, 0.03),
    ("gpt-4", 0.03, 0.06),
    ("gpt-3.5", 0.000_5, 0.001_5),
    ("claude-3-5-sonnet", 0.003, 0.015),
    ("claude-3-opus", 0.015, 0.075),
    ("claude-3-sonnet", 0.003, 0.015),
    ("claude-3-haiku", 0.000_25, 0.001_25),
    ("gemini-1.5-pro", 0.001_25, 0.005),
    ("gemini-1.5-flash", 0.000_075, 0.000_3),
    ("gemini-pro", 0.000_5, 0.001_5),
];

/// Extract token counts by provider. Absent fields stay `None`.
pub fn extract(
    provider: Provider,
    response_body: &Value,
    request_body: Option<&Value>,
    path: &str,
) -> ProviderUsage {
    match provider {
        Provider::OpenAi => ProviderUsage {
            model: request_model(request_body),
            prompt_tokens: count_at(response_body, "/usage/prompt_tokens"),
            completion_tokens: count_at(response_body, "/usage/completion_tokens"),
            total_tokens: count_at(response_body, "/usage/total_tokens"),
        },
        Provider::Anthropic => {
            let input = count_at(response_body, "/usage/input_tokens");
            let output = count_at(response_body, "/usage/output_tokens");
            let total = match (input, output) {
                (None, None) => None,
                (i, o) => Some(i.unwrap_or(0) + o.unwrap_or(0)),
            };
            ProviderUsage {
                model: request_model(request_body),
                prompt_tokens: input,
                completion_tokens: output,
                total_tokens: total,
            }
        }
        Provider::Gemini => ProviderUsage {
            model: model_from_path(path),
            prompt_tokens: count_at(response_body, "/usageMetadata/promptTokenCount"),
            completion_tokens: count_at(response_body, "/usageMetadata/candidatesTokenCount"),
            total_tokens: count_at(response_body, "/usageMetadata/totalTokenCount"),
        },
    }
}

/// Price a call from the cost table. Unknown model families yield `None`.
pub fn cost_for(usage: &ProviderUsage) -> Option<f64> {
    let model = usage.model.as_deref()?.to_lowercase();
    let (_, input_rate, output_rate) = COST_TABLE
        .iter()
        .find(|(family, _, _)| model.contains(family))?;

    match (usage.prompt_tokens, usage.completion_tokens) {
        (Some(prompt), Some(completion)) => {
            Some(prompt as f64 / 1000.0 * input_rate + completion as f64 / 1000.0 * output_rate)
        }
        _ => usage
            .total_tokens
            .map(|total| total as f64 / 1000.0 * input_rate),
    }
}

fn count_at(body: &Value, pointer: &str) -> Option<u64> {
    body.pointer(pointer).and_then(Value::as_u64)
}

fn request_model(request_body: Option<&Value>) -> Option<String> {
    request_body?
        .get("model")
        .and_then(Value::as_str)
        .map(String::from)
}

/// Model name from the path segment after `models/`, trimmed at the next
/// `/` or `:`.
fn model_from_path(path: &str) -> Option<String> {
    let start = path.find("models/")? + "models/".len();
    let rest = &path[start..];
    let end = rest.find(['/', ':']).unwrap_or(rest.len());
    let model = &rest[..end];
    (!model.is_empty()).then(|| model.to_string())
}

/// Everything the tracker needs to account one request.
pub struct UsageContext {
    pub user_id: String,
    pub project_id: Option<String>,
    pub provider: Provider,
    pub endpoint: String,
    pub method: String,
    pub status_code: u16,
    pub response_time_ms: u64,
    pub usage: ProviderUsage,
    pub key_source: &'static str,
    pub request_id: String,
}

/// Records usage and advances project counters, at most once per request.
pub struct UsageTracker {
    usage: Arc<dyn UsageRepo>,
    projects: Arc<dyn ProjectRepo>,
}

impl UsageTracker {
    pub fn new(usage: Arc<dyn UsageRepo>, projects: Arc<dyn ProjectRepo>) -> Self {
        Self { usage, projects }
    }

    /// Write the usage record and bump counters. Never fails the caller.
    pub async fn record(&self, ctx: UsageContext) {
        let cost = cost_for(&ctx.usage);
        let record = UsageRecord {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: ctx.user_id,
            project_id: ctx.project_id.clone(),
            provider: ctx.provider,
            endpoint: ctx.endpoint,
            method: ctx.method,
            model: ctx.usage.model.clone(),
            prompt_tokens: ctx.usage.prompt_tokens,
            completion_tokens: ctx.usage.completion_tokens,
            total_tokens: ctx.usage.total_tokens,
            cost,
            response_time_ms: ctx.response_time_ms,
            status_code: ctx.status_code,
            timestamp: Utc::now(),
            metadata: serde_json::json!({
                "requestId": ctx.request_id,
                "keySource": ctx.key_source,
            }),
        };

        if let Err(e) = self.usage.insert_usage(record).await {
            tracing::warn!(error = %e, "Failed to write usage record");
        }

        if let Some(project_id) = &ctx.project_id {
            let tokens = ctx.usage.total_tokens.unwrap_or(1);
            if let Err(e) = self
                .projects
                .increment_usage(project_id, tokens, cost.unwrap_or(0.0), Utc::now())
                .await
            {
                tracing::warn!(error = %e, project_id, "Failed to increment project usage");
            }
        }
    }
}
