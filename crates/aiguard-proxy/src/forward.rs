//! Transparent forwarding to the upstream provider.
//!
//! Composes the upstream URL and header set, then either buffers the whole
//! response or pipes it byte-for-byte for server-sent-event streams. The
//! streaming path never buffers frames; a bounded line scanner watches the
//! stream for usage events so accounting can run after the terminal event.

use std::io;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::Value;

use aiguard_types::Provider;

use crate::config::Config;
use crate::credentials::ResolvedCredential;
use crate::error::{ApiError, ErrorKind};

/// Headers stripped from the inbound request before forwarding.
const DROP_REQUEST_HEADERS: [&str; 11] = [
    "host",
    "x-ai-guard-provider",
    "x-ai-guard-project",
    "authorization",
    "connection",
    "content-length",
    "user-agent",
    "accept-encoding",
    "postman-token",
    "cache-control",
    "pragma",
];

/// Hop-by-hop headers stripped from the upstream response before relaying.
const DROP_RESPONSE_HEADERS: [&str; 3] = ["content-encoding", "transfer-encoding", "connection"];

/// How much of a single SSE line the usage scanner will hold before giving up
/// on that line.
const MAX_SCAN_LINE: usize = 256 * 1024;

/// A request is streaming iff the client asked for an event stream or the
/// body carries `stream: true`.
pub fn is_streaming(headers: &HeaderMap, body: Option<&Value>) -> bool {
    let accept_stream = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |accept| {
            accept.contains("text/event-stream") || accept.contains("application/x-ndjson")
        });

    accept_stream
        || body
            .and_then(|b| b.get("stream"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
}

/// What the forwarder produced.
pub enum ForwardBody {
    /// The full upstream body; available for usage parsing.
    Buffered(Bytes),
    /// A live byte pipe to the upstream; usage arrives via the stream-end hook.
    Streaming(Body),
}

pub struct ForwardOutcome {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ForwardBody,
}

/// Summary handed to the stream-end hook.
pub struct StreamSummary {
    /// Synthesized object carrying any `usage` / `usageMetadata` fields seen
    /// in the event stream.
    pub usage_event: Option<Value>,
    /// True when the pipe ended early (client or upstream dropped).
    pub aborted: bool,
    /// Upstream response status.
    pub status: u16,
}

/// Hook invoked once a streamed response reaches its terminal event.
pub type StreamEndHook = Box<dyn FnOnce(StreamSummary) + Send + 'static>;

pub struct Forwarder {
    http: reqwest::Client,
    timeout: Duration,
    max_retries: u32,
    retry_delay: Duration,
    base_url_override: Option<String>,
}

impl Forwarder {
    pub fn new(http: reqwest::Client, config: &Config) -> Self {
        Self {
            http,
            timeout: config.request_timeout,
            max_retries: config.max_retries.max(1),
            retry_delay: config.retry_delay,
            base_url_override: config.base_url_override.clone(),
        }
    }

    /// Upstream URL: provider origin + request path, query params merged with
    /// the registry constants (constants win ties).
    pub fn upstream_url(&self, provider: Provider, path: &str, query: Option<&str>) -> String {
        let base = match &self.base_url_override {
            Some(origin) => origin.trim_end_matches('/'),
            None => provider.spec().origin,
        };

        let constants = provider.spec().constant_query;
        let mut pairs: Vec<(String, String)> = query
            .unwrap_or("")
            .split('&')
            .filter(|p| !p.is_empty())
            .map(|p| match p.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (p.to_string(), String::new()),
            })
            .filter(|(k, _)| !constants.iter().any(|(ck, _)| ck == k))
            .collect();
        for (k, v) in constants {
            pairs.push((k.to_string(), v.to_string()));
        }

        if pairs.is_empty() {
            format!("{base}{path}")
        } else {
            let query: Vec<String> = pairs
                .into_iter()
                .map(|(k, v)| if v.is_empty() { k } else { format!("{k}={v}") })
                .collect();
            format!("{base}{path}?{}", query.join("&"))
        }
    }

    /// Outbound header set: inbound minus the drop block, plus registry
    /// constants where absent, plus the provider auth header.
    pub fn outbound_headers(
        &self,
        provider: Provider,
        inbound: &HeaderMap,
        credential: &ResolvedCredential,
    ) -> Result<HeaderMap, ApiError> {
        let mut headers = HeaderMap::new();
        for (name, value) in inbound {
            if DROP_REQUEST_HEADERS.contains(&name.as_str()) {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        let spec = provider.spec();
        for (name, value) in spec.constant_headers {
            let name = HeaderName::from_static(name);
            if !headers.contains_key(&name) {
                headers.insert(name, HeaderValue::from_static(value));
            }
        }

        let auth_value = match spec.auth_prefix {
            Some(prefix) => format!("{prefix} {}", credential.key),
            None => credential.key.clone(),
        };
        headers.insert(
            HeaderName::from_static(spec.auth_header),
            HeaderValue::from_str(&auth_value).map_err(|_| {
                ApiError::new(
                    ErrorKind::ConfigurationError,
                    "credential contains characters not valid in a header",
                )
            })?,
        );

        Ok(headers)
    }

    /// Forward a request. `on_stream_end` fires only for streaming responses.
    #[allow(clippy::too_many_arguments)]
    pub async fn forward(
        &self,
        provider: Provider,
        method: Method,
        path: &str,
        query: Option<&str>,
        inbound_headers: &HeaderMap,
        body: Bytes,
        parsed_body: Option<&Value>,
        credential: &ResolvedCredential,
        on_stream_end: StreamEndHook,
    ) -> Result<ForwardOutcome, ApiError> {
        let url = self.upstream_url(provider, path, query);
        let headers = self.outbound_headers(provider, inbound_headers, credential)?;
        let streaming = is_streaming(inbound_headers, parsed_body);

        // Retries only cover the connection attempt: once a response arrives
        // the body leaves the retry loop, so a streaming request is never
        // retried after its first byte.
        let attempts = if is_idempotent(&method) {
            self.max_retries
        } else {
            1
        };

        let response = self
            .send_with_retries(&url, &method, &headers, &body, attempts)
            .await?;

        let status = StatusCode::from_u16(response.status().as_u16())
            .unwrap_or(StatusCode::BAD_GATEWAY);
        let mut response_headers = HeaderMap::new();
        for (name, value) in response.headers() {
            if DROP_RESPONSE_HEADERS.contains(&name.as_str()) {
                continue;
            }
            response_headers.append(name.clone(), value.clone());
        }

        if streaming {
            let pipe = stream_pipe(response, on_stream_end);
            Ok(ForwardOutcome {
                status,
                headers: response_headers,
                body: ForwardBody::Streaming(pipe),
            })
        } else {
            let bytes = response.bytes().await.map_err(|e| {
                ApiError::new(ErrorKind::NetworkError, format!("failed to read upstream body: {e}"))
            })?;
            Ok(ForwardOutcome {
                status,
                headers: response_headers,
                body: ForwardBody::Buffered(bytes),
            })
        }
    }

    /// Bounded retry with linear backoff; transport errors and 5xx retry,
    /// 4xx never does.
    async fn send_with_retries(
        &self,
        url: &str,
        method: &Method,
        headers: &HeaderMap,
        body: &Bytes,
        attempts: u32,
    ) -> Result<reqwest::Response, ApiError> {
        let mut last_error = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(self.retry_delay * (attempt - 1)).await;
            }

            let request = self
                .http
                .request(method.clone(), url)
                .headers(headers.clone())
                .body(body.clone())
                .timeout(self.timeout);

            match request.send().await {
                Ok(response) if response.status().is_server_error() && attempt < attempts => {
                    tracing::warn!(
                        attempt,
                        status = response.status().as_u16(),
                        url,
                        "Upstream 5xx, retrying"
                    );
                    last_error = Some(ApiError::new(
                        ErrorKind::UpstreamError,
                        format!("upstream returned {}", response.status()),
                    ));
                }
                Ok(response) => return Ok(response),
                Err(e) if e.is_timeout() => {
                    tracing::warn!(attempt, url, "Upstream attempt timed out");
                    last_error = Some(ApiError::new(
                        ErrorKind::Timeout,
                        format!("upstream timed out after {:?}", self.timeout),
                    ));
                    if attempt == attempts {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(attempt, url, error = %e, "Upstream transport error");
                    last_error = Some(ApiError::new(
                        ErrorKind::NetworkError,
                        format!("upstream request failed: {e}"),
                    ));
                    if attempt == attempts {
                        break;
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| ApiError::new(ErrorKind::Unknown, "no upstream attempt was made")))
    }
}

fn is_idempotent(method: &Method) -> bool {
    *method == Method::GET
        || *method == Method::HEAD
        || *method == Method::PUT
        || *method == Method::DELETE
        || *method == Method::OPTIONS
}

/// Pipe the upstream body to the client without buffering, scanning SSE lines
/// for usage events along the way. Dropping the returned [`Body`] (client
/// disconnect) tears down the upstream connection on the next chunk.
fn stream_pipe(response: reqwest::Response, on_stream_end: StreamEndHook) -> Body {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<Result<Bytes, io::Error>>(16);

    tokio::spawn(async move {
        let status = response.status().as_u16();
        let mut upstream = response.bytes_stream();
        let mut scanner = UsageScanner::new();
        let mut aborted = false;

        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(bytes) => {
                    scanner.feed(&bytes);
                    if tx.send(Ok(bytes)).await.is_err() {
                        tracing::debug!("Client disconnected, aborting upstream stream");
                        aborted = true;
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Upstream stream error");
                    let _ = tx.send(Err(io::Error::other(e))).await;
                    aborted = true;
                    break;
                }
            }
        }
        drop(tx);

        on_stream_end(StreamSummary {
            usage_event: scanner.into_event(),
            aborted,
            status,
        });
    });

    Body::from_stream(futures_util::stream::poll_fn(move |cx| rx.poll_recv(cx)))
}

/// Incremental SSE scanner: merges every `usage` / `usageMetadata` object
/// seen in `data:` lines into one synthetic event.
struct UsageScanner {
    line_buf: String,
    usage: serde_json::Map<String, Value>,
    usage_metadata: serde_json::Map<String, Value>,
}

impl UsageScanner {
    fn new() -> Self {
        Self {
            line_buf: String::new(),
            usage: serde_json::Map::new(),
            usage_metadata: serde_json::Map::new(),
        }
    }

    fn feed(&mut self, bytes: &[u8]) {
        self.line_buf.push_str(&String::from_utf8_lossy(bytes));

        while let Some(pos) = self.line_buf.find('\n') {
            let line = self.line_buf[..pos].trim_end_matches('\r').to_string();
            self.line_buf.drain(..=pos);
            self.scan_line(&line);
        }

        // A pathological stream with no newlines must not grow without bound.
        if self.line_buf.len() > MAX_SCAN_LINE {
            self.line_buf.clear();
        }
    }

    fn scan_line(&mut self, line: &str) {
        let Some(data) = line.strip_prefix("data: ") else {
            return;
        };
        if data == "[DONE]" {
            return;
        }
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            return;
        };

        for source in [&event, &event["message"]] {
            if let Some(usage) = source.get("usage").and_then(Value::as_object) {
                for (k, v) in usage {
                    if !v.is_null() {
                        self.usage.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        if let Some(metadata) = event.get("usageMetadata").and_then(Value::as_object) {
            for (k, v) in metadata {
                if !v.is_null() {
                    self.usage_metadata.insert(k.clone(), v.clone());
                }
            }
        }
    }

    fn into_event(self) -> Option<Value> {
        if self.usage.is_empty() && self.usage_metadata.is_empty() {
            return None;
        }
        let mut event = serde_json::Map::new();
        if !self.usage.is_empty() {
            event.insert("usage".to_string(), Value::Object(self.usage));
        }
        if !self.usage_metadata.is_empty() {
            event.insert("usageMetadata".to_string(), Value::Object(self.usage_metadata));
        }
        Some(Value::Object(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::KeySource;

    fn forwarder() -> Forwarder {
        Forwarder::new(reqwest::Client::new(), &Config::for_test())
    }

    fn credential(key: &str) -> ResolvedCredential {
        ResolvedCredential {
            key: key.to_string(),
            source: KeySource::System,
            key_id: None,
        }
    }

    #[test]
    fn url_composition_uses_registry_origin() {
        let f = forwarder();
        assert_eq!(
            f.upstream_url(Provider::Anthropic, "/v1/messages", None),
            "https://api.anthropic.com/v1/messages"
        );
        assert_eq!(
            f.upstream_url(Provider::OpenAi, "/v1/chat/completions", Some("foo=1&bar=2")),
            "https://api.openai.com/v1/chat/completions?foo=1&bar=2"
        );
    }

    #[test]
    fn url_override_replaces_origin() {
        let config = Config::for_test().with_base_url_override("http://127.0.0.1:9999/");
        let f = Forwarder::new(reqwest::Client::new(), &config);
        assert_eq!(
            f.upstream_url(Provider::Gemini, "/v1beta/models/gemini-1.5-pro/generateContent", None),
            "http://127.0.0.1:9999/v1beta/models/gemini-1.5-pro/generateContent"
        );
    }

    #[test]
    fn request_headers_drop_the_fixed_block() {
        let f = forwarder();
        let mut inbound = HeaderMap::new();
        inbound.insert("authorization", HeaderValue::from_static("Bearer pat_x"));
        inbound.insert("x-ai-guard-provider", HeaderValue::from_static("anthropic"));
        inbound.insert("host", HeaderValue::from_static("proxy.internal"));
        inbound.insert("user-agent", HeaderValue::from_static("curl/8"));
        inbound.insert("content-type", HeaderValue::from_static("application/json"));
        inbound.insert("x-custom", HeaderValue::from_static("kept"));

        let headers = f
            .outbound_headers(Provider::Anthropic, &inbound, &credential("sk-ant-key"))
            .unwrap();

        assert!(headers.get("authorization").is_none());
        assert!(headers.get("x-ai-guard-provider").is_none());
        assert!(headers.get("host").is_none());
        assert!(headers.get("user-agent").is_none());
        assert_eq!(headers.get("content-type").unwrap(), "application/json");
        assert_eq!(headers.get("x-custom").unwrap(), "kept");
        assert_eq!(headers.get("x-api-key").unwrap(), "sk-ant-key");
        assert_eq!(headers.get("anthropic-version").unwrap(), "2023-06-01");
    }

    #[test]
    fn openai_auth_gets_bearer_prefix() {
        let f = forwarder();
        let headers = f
            .outbound_headers(Provider::OpenAi, &HeaderMap::new(), &credential("sk-oai"))
            .unwrap();
        assert_eq!(headers.get("authorization").unwrap(), "Bearer sk-oai");
    }

    #[test]
    fn caller_supplied_constant_header_is_kept() {
        let f = forwarder();
        let mut inbound = HeaderMap::new();
        inbound.insert("anthropic-version", HeaderValue::from_static("2024-01-01"));
        let headers = f
            .outbound_headers(Provider::Anthropic, &inbound, &credential("k"))
            .unwrap();
        assert_eq!(headers.get("anthropic-version").unwrap(), "2024-01-01");
    }

    #[test]
    fn streaming_detection() {
        let mut headers = HeaderMap::new();
        assert!(!is_streaming(&headers, None));

        headers.insert(header::ACCEPT, HeaderValue::from_static("text/event-stream"));
        assert!(is_streaming(&headers, None));

        let headers = HeaderMap::new();
        let body = serde_json::json!({"stream": true});
        assert!(is_streaming(&headers, Some(&body)));

        let body = serde_json::json!({"stream": false});
        assert!(!is_streaming(&headers, Some(&body)));

        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/x-ndjson"));
        assert!(is_streaming(&headers, None));
    }

    #[test]
    fn idempotency_classification() {
        assert!(is_idempotent(&Method::GET));
        assert!(is_idempotent(&Method::DELETE));
        assert!(!is_idempotent(&Method::POST));
        assert!(!is_idempotent(&Method::PATCH));
    }

    #[test]
    fn scanner_merges_anthropic_usage_events() {
        let mut scanner = UsageScanner::new();
        scanner.feed(
            b"event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":9}}}\n\n",
        );
        scanner.feed(
            b"event: message_delta\ndata: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":17}}\n\n",
        );
        let event = scanner.into_event().unwrap();
        assert_eq!(event["usage"]["input_tokens"], 9);
        assert_eq!(event["usage"]["output_tokens"], 17);
    }

    #[test]
    fn scanner_handles_chunks_split_mid_line() {
        let mut scanner = UsageScanner::new();
        scanner.feed(b"data: {\"usage\":{\"prompt_t");
        scanner.feed(b"okens\":4,\"completion_tokens\":2}}\n");
        let event = scanner.into_event().unwrap();
        assert_eq!(event["usage"]["prompt_tokens"], 4);
    }

    #[test]
    fn scanner_picks_up_gemini_metadata() {
        let mut scanner = UsageScanner::new();
        scanner.feed(b"data: {\"usageMetadata\":{\"promptTokenCount\":3,\"candidatesTokenCount\":5,\"totalTokenCount\":8}}\n");
        let event = scanner.into_event().unwrap();
        assert_eq!(event["usageMetadata"]["totalTokenCount"], 8);
    }

    #[test]
    fn scanner_without_usage_yields_none() {
        let mut scanner = UsageScanner::new();
        scanner.feed(b"data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n");
        scanner.feed(b"data: [DONE]\n");
        assert!(scanner.into_event().is_none());
    }
}
