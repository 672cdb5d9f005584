//! Request body validation: a cheap safety screen followed by per-provider
//! schema rules.
//!
//! The screen is deliberately conservative — it rejects anything that looks
//! like SQL or script injection even at the cost of false positives. Schema
//! rules are keyed by (provider, method, path pattern); unknown fields and
//! unmatched endpoints pass through for forward compatibility.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use aiguard_types::Provider;

use crate::error::{ApiError, ErrorKind};

/// Bodies above this serialized size are rejected outright.
const MAX_BODY_BYTES: usize = 1024 * 1024;

static SQL_INJECTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(union|select|insert|update|delete|drop|create|alter)\b.{0,40}?('|--|/\*|;)"#)
        .expect("valid sql screen regex")
});

static SCRIPT_INJECTION: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)<\s*script\b",
        r"(?i)javascript\s*:",
        r"(?i)\bon[a-z]+\s*=",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid script screen regex"))
    .collect()
});

/// Safety screen over the serialized body.
pub fn screen(body: &Value) -> Result<(), ApiError> {
    let serialized = body.to_string();

    if serialized.len() > MAX_BODY_BYTES {
        return Err(ApiError::new(
            ErrorKind::PayloadTooLarge,
            format!(
                "request body of {} bytes exceeds the {} byte limit",
                serialized.len(),
                MAX_BODY_BYTES
            ),
        ));
    }

    if SQL_INJECTION.is_match(&serialized) {
        return Err(ApiError::new(
            ErrorKind::InvalidRequest,
            "request body matches a blocked SQL pattern",
        ));
    }

    if SCRIPT_INJECTION.iter().any(|re| re.is_match(&serialized)) {
        return Err(ApiError::new(
            ErrorKind::InvalidRequest,
            "request body matches a blocked script pattern",
        ));
    }

    Ok(())
}

/// Schema pass for one (provider, method, path). Unmatched endpoints pass.
pub fn validate(
    provider: Provider,
    method: &str,
    path: &str,
    body: &Value,
) -> Result<(), ApiError> {
    let rule = match provider {
        Provider::OpenAi if method == "POST" && path_matches("/v1/chat/completions", path) => {
            openai_chat_completions
        }
        Provider::Anthropic if method == "POST" && path_matches("/v1/messages", path) => {
            anthropic_messages
        }
        Provider::Gemini
            if method == "POST"
                && path_matches("/v1beta/models/:model/generateContent", path) =>
        {
            gemini_generate_content
        }
        _ => return Ok(()),
    };

    let errors = rule(body);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ApiError::new(
            ErrorKind::ValidationError,
            "request body failed schema validation",
        )
        .with_details(serde_json::json!({ "fields": errors })))
    }
}

/// Exact-segment matching with `:name` segments matching any value.
fn path_matches(pattern: &str, path: &str) -> bool {
    let path = path.split('?').next().unwrap_or(path);
    let pattern_segments: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let path_segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    pattern_segments.len() == path_segments.len()
        && pattern_segments
            .iter()
            .zip(&path_segments)
            .all(|(pat, seg)| pat.starts_with(':') || pat == seg)
}

// ── Field helpers ─────────────────────────────────────────────────────────────

fn field_error(field: &str, message: &str) -> Value {
    serde_json::json!({ "field": field, "message": message })
}

fn check_number_range(
    body: &Value,
    field: &str,
    min: f64,
    max: f64,
    errors: &mut Vec<Value>,
) {
    if let Some(value) = body.get(field) {
        match value.as_f64() {
            Some(n) if (min..=max).contains(&n) => {}
            _ => errors.push(field_error(
                field,
                &format!("must be a number in [{min}, {max}]"),
            )),
        }
    }
}

fn check_bool(body: &Value, field: &str, errors: &mut Vec<Value>) {
    if let Some(value) = body.get(field) {
        if !value.is_boolean() {
            errors.push(field_error(field, "must be a boolean"));
        }
    }
}

fn check_array(body: &Value, field: &str, errors: &mut Vec<Value>) {
    if let Some(value) = body.get(field) {
        if !value.is_array() {
            errors.push(field_error(field, "must be an array"));
        }
    }
}

fn check_string_or_blocks(value: Option<&Value>) -> bool {
    matches!(value, Some(v) if v.is_string() || v.is_array())
}

// ── Per-endpoint rules ────────────────────────────────────────────────────────

fn openai_chat_completions(body: &Value) -> Vec<Value> {
    let mut errors = Vec::new();

    if !body.get("model").map_or(false, Value::is_string) {
        errors.push(field_error("model", "required string"));
    }

    match body.get("messages").and_then(Value::as_array) {
        None => errors.push(field_error("messages", "required array")),
        Some(messages) => {
            const ROLES: [&str; 5] = ["system", "user", "assistant", "function", "tool"];
            for (i, message) in messages.iter().enumerate() {
                let role = message.get("role").and_then(Value::as_str);
                if !role.map_or(false, |r| ROLES.contains(&r)) {
                    errors.push(field_error(
                        &format!("messages[{i}].role"),
                        "must be one of system, user, assistant, function, tool",
                    ));
                }
                if !check_string_or_blocks(message.get("content")) {
                    errors.push(field_error(
                        &format!("messages[{i}].content"),
                        "must be a string or content array",
                    ));
                }
            }
        }
    }

    check_number_range(body, "max_tokens", 1.0, 4096.0, &mut errors);
    check_number_range(body, "temperature", 0.0, 2.0, &mut errors);
    check_number_range(body, "top_p", 0.0, 1.0, &mut errors);
    check_bool(body, "stream", &mut errors);
    check_array(body, "functions", &mut errors);
    check_array(body, "tools", &mut errors);

    errors
}

fn anthropic_messages(body: &Value) -> Vec<Value> {
    let mut errors = Vec::new();

    if !body.get("model").map_or(false, Value::is_string) {
        errors.push(field_error("model", "required string"));
    }

    match body.get("messages").and_then(Value::as_array) {
        None => errors.push(field_error("messages", "required array")),
        Some(messages) => {
            for (i, message) in messages.iter().enumerate() {
                let role = message.get("role").and_then(Value::as_str);
                if !matches!(role, Some("user") | Some("assistant")) {
                    errors.push(field_error(
                        &format!("messages[{i}].role"),
                        "must be user or assistant",
                    ));
                }
                if !check_string_or_blocks(message.get("content")) {
                    errors.push(field_error(
                        &format!("messages[{i}].content"),
                        "must be a string or content array",
                    ));
                }
            }
        }
    }

    match body.get("max_tokens").and_then(Value::as_f64) {
        Some(n) if (1.0..=4096.0).contains(&n) => {}
        _ => errors.push(field_error("max_tokens", "required number in [1, 4096]")),
    }

    check_number_range(body, "temperature", 0.0, 1.0, &mut errors);
    check_number_range(body, "top_p", 0.0, 1.0, &mut errors);
    if let Some(top_k) = body.get("top_k") {
        match top_k.as_f64() {
            Some(n) if n >= 0.0 => {}
            _ => errors.push(field_error("top_k", "must be a number >= 0")),
        }
    }
    check_bool(body, "stream", &mut errors);
    if let Some(system) = body.get("system") {
        if !system.is_string() {
            errors.push(field_error("system", "must be a string"));
        }
    }

    errors
}

fn gemini_generate_content(body: &Value) -> Vec<Value> {
    const PART_KEYS: [&str; 5] = [
        "text",
        "inlineData",
        "fileData",
        "functionCall",
        "functionResponse",
    ];

    let mut errors = Vec::new();

    match body.get("contents").and_then(Value::as_array) {
        None => errors.push(field_error("contents", "required array")),
        Some(contents) => {
            for (i, content) in contents.iter().enumerate() {
                match content.get("parts").and_then(Value::as_array) {
                    None => errors.push(field_error(
                        &format!("contents[{i}].parts"),
                        "required array",
                    )),
                    Some(parts) => {
                        for (j, part) in parts.iter().enumerate() {
                            let recognised = part
                                .as_object()
                                .map_or(false, |o| o.keys().any(|k| PART_KEYS.contains(&k.as_str())));
                            if !recognised {
                                errors.push(field_error(
                                    &format!("contents[{i}].parts[{j}]"),
                                    "must carry text, inlineData, fileData, functionCall, or functionResponse",
                                ));
                            }
                        }
                    }
                }
                if let Some(role) = content.get("role") {
                    if !matches!(role.as_str(), Some("user") | Some("model")) {
                        errors.push(field_error(
                            &format!("contents[{i}].role"),
                            "must be user or model",
                        ));
                    }
                }
            }
        }
    }

    check_array(body, "tools", &mut errors);
    check_array(body, "safetySettings", &mut errors);

    if let Some(config) = body.get("generationConfig") {
        check_number_range(config, "temperature", 0.0, 1.0, &mut errors);
        check_number_range(config, "topP", 0.0, 1.0, &mut errors);
        if let Some(top_k) = config.get("topK") {
            match top_k.as_f64() {
                Some(n) if n >= 1.0 => {}
                _ => errors.push(field_error("generationConfig.topK", "must be a number >= 1")),
            }
        }
        check_number_range(config, "candidateCount", 1.0, 8.0, &mut errors);
        check_number_range(config, "maxOutputTokens", 1.0, 8192.0, &mut errors);
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn screen_allows_plain_chat_bodies() {
        let body = json!({
            "model": "claude-3-sonnet-20240229",
            "messages": [{"role": "user", "content": "How do I SELECT a good wine?"}],
        });
        assert!(screen(&body).is_ok());
    }

    #[test]
    fn screen_blocks_sql_injection_shapes() {
        let body = json!({"q": "1 UNION SELECT password FROM users --"});
        let err = screen(&body).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);

        let body = json!({"q": "DROP TABLE users;"});
        assert!(screen(&body).is_err());
    }

    #[test]
    fn screen_blocks_script_injection_shapes() {
        assert!(screen(&json!({"content": "<script>alert(1)</script>"})).is_err());
        assert!(screen(&json!({"href": "javascript:alert(1)"})).is_err());
        assert!(screen(&json!({"html": "<img onerror=steal()>"})).is_err());
    }

    #[test]
    fn screen_enforces_the_one_mib_cap() {
        let big = "x".repeat(MAX_BODY_BYTES + 1);
        let err = screen(&json!({"payload": big})).unwrap_err();
        assert_eq!(err.kind.status(), axum::http::StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn path_matching_with_params() {
        assert!(path_matches("/v1/messages", "/v1/messages"));
        assert!(path_matches(
            "/v1beta/models/:model/generateContent",
            "/v1beta/models/gemini-1.5-pro/generateContent"
        ));
        assert!(!path_matches("/v1/messages", "/v1/messages/extra"));
        assert!(!path_matches("/v1/messages", "/v2/messages"));
    }

    fn valid_anthropic_body() -> Value {
        json!({
            "model": "claude-3-sonnet-20240229",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 16,
        })
    }

    #[test]
    fn anthropic_happy_path_validates() {
        assert!(validate(
            Provider::Anthropic,
            "POST",
            "/v1/messages",
            &valid_anthropic_body()
        )
        .is_ok());
    }

    #[test]
    fn anthropic_requires_max_tokens() {
        let mut body = valid_anthropic_body();
        body.as_object_mut().unwrap().remove("max_tokens");
        let err = validate(Provider::Anthropic, "POST", "/v1/messages", &body).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValidationError);
        let details = err.details.unwrap();
        assert!(details["fields"]
            .as_array()
            .unwrap()
            .iter()
            .any(|f| f["field"] == "max_tokens"));
    }

    #[test]
    fn anthropic_rejects_system_role_in_messages() {
        let body = json!({
            "model": "claude-3-sonnet-20240229",
            "messages": [{"role": "system", "content": "be nice"}],
            "max_tokens": 16,
        });
        assert!(validate(Provider::Anthropic, "POST", "/v1/messages", &body).is_err());
    }

    #[test]
    fn anthropic_temperature_is_bounded_at_one() {
        let mut body = valid_anthropic_body();
        body["temperature"] = json!(1.5);
        assert!(validate(Provider::Anthropic, "POST", "/v1/messages", &body).is_err());
    }

    #[test]
    fn openai_validates_roles_and_ranges() {
        let body = json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 1.5,
            "stream": true,
        });
        assert!(validate(Provider::OpenAi, "POST", "/v1/chat/completions", &body).is_ok());

        let bad_role = json!({
            "model": "gpt-4o",
            "messages": [{"role": "robot", "content": "hi"}],
        });
        assert!(validate(Provider::OpenAi, "POST", "/v1/chat/completions", &bad_role).is_err());

        let bad_max = json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 5000,
        });
        assert!(validate(Provider::OpenAi, "POST", "/v1/chat/completions", &bad_max).is_err());
    }

    #[test]
    fn openai_missing_model_is_reported() {
        let body = json!({"messages": [{"role": "user", "content": "hi"}]});
        let err = validate(Provider::OpenAi, "POST", "/v1/chat/completions", &body).unwrap_err();
        assert!(err.details.is_some());
    }

    #[test]
    fn gemini_validates_contents_and_config() {
        let body = json!({
            "contents": [{"role": "user", "parts": [{"text": "hi"}]}],
            "generationConfig": {"temperature": 0.5, "maxOutputTokens": 256},
        });
        assert!(validate(
            Provider::Gemini,
            "POST",
            "/v1beta/models/gemini-1.5-pro/generateContent",
            &body
        )
        .is_ok());

        let bad = json!({
            "contents": [{"parts": [{"unknownPart": 1}]}],
        });
        assert!(validate(
            Provider::Gemini,
            "POST",
            "/v1beta/models/gemini-1.5-pro/generateContent",
            &bad
        )
        .is_err());

        let bad_config = json!({
            "contents": [{"parts": [{"text": "hi"}]}],
            "generationConfig": {"candidateCount": 9},
        });
        assert!(validate(
            Provider::Gemini,
            "POST",
            "/v1beta/models/gemini-1.5-pro/generateContent",
            &bad_config
        )
        .is_err());
    }

    #[test]
    fn unknown_fields_are_permitted() {
        let mut body = valid_anthropic_body();
        body["some_future_field"] = json!({"nested": true});
        assert!(validate(Provider::Anthropic, "POST", "/v1/messages", &body).is_ok());
    }

    #[test]
    fn unmatched_endpoints_pass_through() {
        let body = json!({"anything": "goes"});
        assert!(validate(Provider::OpenAi, "POST", "/v1/embeddings", &body).is_ok());
        assert!(validate(Provider::Anthropic, "GET", "/v1/models", &body).is_ok());
    }
}
