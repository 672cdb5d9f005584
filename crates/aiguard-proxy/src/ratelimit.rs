//! Rate limiting with a pluggable backend.
//!
//! Policy precedence: project override → tier default. The key is
//! `ratelimit:user:<id>` for authenticated callers, `ratelimit:ip:<addr>`
//! otherwise. Two backends implement the same contract: a Redis sorted-set
//! sliding window (shared across replicas, executed as one atomic
//! transaction) and an in-process fixed window. Backend transport errors
//! fail open.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use axum::http::HeaderName;
use chrono::{DateTime, Utc};

use aiguard_types::{Project, RateLimitOverride};

/// Outcome of one rate-limit hit.
#[derive(Debug, Clone)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

impl RateDecision {
    /// `X-RateLimit-*` headers carried on every response.
    pub fn headers(&self) -> Vec<(HeaderName, String)> {
        vec![
            (
                HeaderName::from_static("x-ratelimit-limit"),
                self.limit.to_string(),
            ),
            (
                HeaderName::from_static("x-ratelimit-remaining"),
                self.remaining.to_string(),
            ),
            (
                HeaderName::from_static("x-ratelimit-reset"),
                self.reset_at.timestamp().to_string(),
            ),
        ]
    }

    /// Seconds until the window resets, for `Retry-After`.
    pub fn retry_after_secs(&self) -> i64 {
        (self.reset_at - Utc::now()).num_seconds().max(1)
    }
}

/// Transport-level backend failure. The limiter treats it as "allow".
#[derive(Debug)]
pub struct RateLimitBackendError(pub String);

impl std::fmt::Display for RateLimitBackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rate-limit backend error: {}", self.0)
    }
}

impl std::error::Error for RateLimitBackendError {}

/// A counting backend: record one hit against `key` and report the decision.
#[async_trait::async_trait]
pub trait RateLimitBackend: Send + Sync {
    async fn hit(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<RateDecision, RateLimitBackendError>;
}

// ── Local backend ─────────────────────────────────────────────────────────────

struct Window {
    count: u32,
    reset_at: DateTime<Utc>,
}

/// In-process fixed-window counter, one bucket per key.
#[derive(Default)]
pub struct LocalBackend {
    buckets: Mutex<HashMap<String, Window>>,
}

/// Above this many live buckets the hit path also evicts stale ones.
const EVICT_THRESHOLD: usize = 4_096;

impl LocalBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl RateLimitBackend for LocalBackend {
    async fn hit(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<RateDecision, RateLimitBackendError> {
        let now = Utc::now();
        let window_chrono = chrono::Duration::from_std(window)
            .map_err(|e| RateLimitBackendError(e.to_string()))?;

        let mut buckets = self.buckets.lock().unwrap();

        if buckets.len() > EVICT_THRESHOLD {
            buckets.retain(|_, w| w.reset_at > now);
        }

        let bucket = buckets.entry(key.to_string()).or_insert(Window {
            count: 0,
            reset_at: now + window_chrono,
        });
        if bucket.reset_at <= now {
            bucket.count = 0;
            bucket.reset_at = now + window_chrono;
        }
        bucket.count += 1;

        Ok(RateDecision {
            allowed: bucket.count <= limit,
            limit,
            remaining: limit.saturating_sub(bucket.count),
            reset_at: bucket.reset_at,
        })
    }
}

// ── Shared backend ────────────────────────────────────────────────────────────

/// Redis sorted-set sliding window.
///
/// Each hit trims entries older than the window, appends the current
/// timestamp, counts what remains, and refreshes the key TTL — all in one
/// `MULTI`/`EXEC` transaction so concurrent replicas cannot interleave.
pub struct RedisBackend {
    conn: redis::aio::ConnectionManager,
}

impl RedisBackend {
    pub async fn connect(url: &str) -> Result<Self, RateLimitBackendError> {
        let client = redis::Client::open(url).map_err(|e| RateLimitBackendError(e.to_string()))?;
        let conn = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(|e| RateLimitBackendError(e.to_string()))?;
        Ok(Self { conn })
    }
}

#[async_trait::async_trait]
impl RateLimitBackend for RedisBackend {
    async fn hit(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<RateDecision, RateLimitBackendError> {
        let now = Utc::now();
        let now_ms = now.timestamp_millis();
        let window_ms = window.as_millis() as i64;
        let member = format!("{now_ms}-{}", uuid::Uuid::new_v4());

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg(0)
            .arg(now_ms - window_ms)
            .ignore()
            .cmd("ZADD")
            .arg(key)
            .arg(now_ms)
            .arg(&member)
            .ignore()
            .cmd("ZCARD")
            .arg(key)
            .cmd("PEXPIRE")
            .arg(key)
            .arg(window_ms)
            .ignore();

        let (count,): (u32,) = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| RateLimitBackendError(e.to_string()))?;

        Ok(RateDecision {
            allowed: count <= limit,
            limit,
            remaining: limit.saturating_sub(count),
            reset_at: now + chrono::Duration::milliseconds(window_ms),
        })
    }
}

// ── Limiter facade ────────────────────────────────────────────────────────────

/// Policy selection and fail-open behavior over a backend.
pub struct RateLimiter {
    backend: Box<dyn RateLimitBackend>,
}

impl RateLimiter {
    pub fn new(backend: Box<dyn RateLimitBackend>) -> Self {
        Self { backend }
    }

    /// Policy for a request: project override, else tier default. Requests
    /// with no project context get the free-tier default.
    pub fn policy_for(project: Option<&Project>) -> RateLimitOverride {
        match project {
            Some(p) => p
                .settings
                .rate_limit
                .unwrap_or_else(|| p.tier().default_rate_limit()),
            None => aiguard_types::Tier::Free.default_rate_limit(),
        }
    }

    /// Bucket key: principal when present, caller address otherwise.
    pub fn key_for(user_id: Option<&str>, client_ip: &str) -> String {
        match user_id {
            Some(id) => format!("ratelimit:user:{id}"),
            None => format!("ratelimit:ip:{client_ip}"),
        }
    }

    /// Record a hit. Backend errors log and allow.
    pub async fn check(&self, key: &str, policy: RateLimitOverride) -> RateDecision {
        let window = Duration::from_millis(policy.window_ms);
        match self.backend.hit(key, policy.requests, window).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!(key, error = %e, "Rate-limit backend failed, allowing request");
                RateDecision {
                    allowed: true,
                    limit: policy.requests,
                    remaining: policy.requests,
                    reset_at: Utc::now() + chrono::Duration::milliseconds(policy.window_ms as i64),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aiguard_types::{MemberRole, ProjectMember, ProjectSettings, Tier, UsageCounters};

    fn limiter() -> RateLimiter {
        RateLimiter::new(Box::new(LocalBackend::new()))
    }

    fn policy(requests: u32, window_ms: u64) -> RateLimitOverride {
        RateLimitOverride { requests, window_ms }
    }

    #[tokio::test]
    async fn allows_up_to_limit_then_denies() {
        let limiter = limiter();
        let policy = policy(3, 60_000);

        for i in 0..3 {
            let decision = limiter.check("ratelimit:user:u1", policy).await;
            assert!(decision.allowed, "hit {i} should be allowed");
            assert_eq!(decision.remaining, 2 - i);
        }
        let denied = limiter.check("ratelimit:user:u1", policy).await;
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let limiter = limiter();
        let policy = policy(1, 60_000);

        assert!(limiter.check("ratelimit:user:u1", policy).await.allowed);
        assert!(!limiter.check("ratelimit:user:u1", policy).await.allowed);
        assert!(limiter.check("ratelimit:user:u2", policy).await.allowed);
        assert!(limiter.check("ratelimit:ip:10.0.0.1", policy).await.allowed);
    }

    #[tokio::test]
    async fn window_expiry_admits_again() {
        let limiter = limiter();
        let policy = policy(1, 50);

        assert!(limiter.check("k", policy).await.allowed);
        assert!(!limiter.check("k", policy).await.allowed);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(limiter.check("k", policy).await.allowed);
    }

    struct FailingBackend;

    #[async_trait::async_trait]
    impl RateLimitBackend for FailingBackend {
        async fn hit(
            &self,
            _key: &str,
            _limit: u32,
            _window: Duration,
        ) -> Result<RateDecision, RateLimitBackendError> {
            Err(RateLimitBackendError("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn backend_failure_fails_open() {
        let limiter = RateLimiter::new(Box::new(FailingBackend));
        let decision = limiter.check("k", policy(5, 60_000)).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 5);
    }

    #[test]
    fn policy_precedence() {
        let mut project = Project {
            id: "p1".to_string(),
            name: "p".to_string(),
            owner_id: "u1".to_string(),
            members: vec![ProjectMember {
                user_id: "u1".to_string(),
                role: MemberRole::Owner,
                added_at: Utc::now(),
            }],
            credentials: vec![],
            settings: ProjectSettings::default(),
            usage: UsageCounters::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        // Tier default for a one-member project.
        assert_eq!(RateLimiter::policy_for(Some(&project)).requests, 10);

        // Override wins.
        project.settings.rate_limit = Some(policy(42, 30_000));
        assert_eq!(RateLimiter::policy_for(Some(&project)).requests, 42);

        // No project context: free tier.
        assert_eq!(
            RateLimiter::policy_for(None).requests,
            Tier::Free.default_rate_limit().requests
        );
    }

    #[test]
    fn key_shapes() {
        assert_eq!(RateLimiter::key_for(Some("u1"), "1.2.3.4"), "ratelimit:user:u1");
        assert_eq!(RateLimiter::key_for(None, "1.2.3.4"), "ratelimit:ip:1.2.3.4");
    }

    #[test]
    fn decision_headers() {
        let decision = RateDecision {
            allowed: true,
            limit: 10,
            remaining: 7,
            reset_at: Utc::now() + chrono::Duration::seconds(30),
        };
        let headers = decision.headers();
        assert_eq!(headers[0].1, "10");
        assert_eq!(headers[1].1, "7");
        assert!(decision.retry_after_secs() >= 1);
    }
}
