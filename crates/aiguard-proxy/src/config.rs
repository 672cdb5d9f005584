//! Proxy configuration, read from the environment at startup.

use std::collections::HashMap;
use std::time::Duration;

use aiguard_types::Provider;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1_000);
const DEFAULT_MAX_REQUEST_SIZE: usize = 10 * 1024 * 1024;
const DEFAULT_DB_NAME: &str = "aiguard";

/// Identity-verifier credentials, present only when all three variables are set.
#[derive(Debug, Clone)]
pub struct FirebaseConfig {
    pub project_id: String,
    pub client_email: String,
    pub private_key: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// TCP port to listen on. Default: `3000`.
    pub port: u16,
    /// Per-attempt upstream timeout. Default: `30s`.
    pub request_timeout: Duration,
    /// Upstream attempts per request. Default: `3`.
    pub max_retries: u32,
    /// Linear backoff unit between attempts. Default: `1s`.
    pub retry_delay: Duration,
    /// Inbound body cap in bytes. Default: `10 MiB`.
    pub max_request_size: usize,
    pub mongodb_uri: Option<String>,
    pub mongodb_db_name: String,
    /// Shared rate-limit backend; absence selects the in-process backend.
    pub redis_url: Option<String>,
    /// Master key material for the credential vault.
    pub encryption_key: Option<String>,
    pub firebase: Option<FirebaseConfig>,
    pub admin_secret_key: Option<String>,
    /// Process-default provider credentials (credential resolution tier 3).
    pub system_keys: HashMap<Provider, String>,
    /// Overrides every provider origin. `None` in production; set to a mock
    /// server URL in integration tests.
    pub base_url_override: Option<String>,
}

impl Config {
    /// Read configuration from the process environment.
    pub fn from_env() -> Self {
        let firebase = match (
            std::env::var("FIREBASE_PROJECT_ID").ok().filter(|v| !v.is_empty()),
            std::env::var("FIREBASE_CLIENT_EMAIL").ok().filter(|v| !v.is_empty()),
            std::env::var("FIREBASE_PRIVATE_KEY").ok().filter(|v| !v.is_empty()),
        ) {
            (Some(project_id), Some(client_email), Some(private_key)) => Some(FirebaseConfig {
                project_id,
                client_email,
                private_key,
            }),
            _ => None,
        };

        let mut system_keys = HashMap::new();
        for provider in Provider::ALL {
            if let Some(key) = std::env::var(provider.default_key_env())
                .ok()
                .filter(|v| !v.is_empty())
            {
                system_keys.insert(provider, key);
            }
        }

        Self {
            port: env_parsed("PORT").unwrap_or(DEFAULT_PORT),
            request_timeout: env_parsed("REQUEST_TIMEOUT")
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            max_retries: env_parsed("MAX_RETRIES").unwrap_or(DEFAULT_MAX_RETRIES),
            retry_delay: env_parsed("RETRY_DELAY")
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_RETRY_DELAY),
            max_request_size: env_parsed("MAX_REQUEST_SIZE").unwrap_or(DEFAULT_MAX_REQUEST_SIZE),
            mongodb_uri: std::env::var("MONGODB_URI").ok().filter(|v| !v.is_empty()),
            mongodb_db_name: std::env::var("MONGODB_DB_NAME")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_DB_NAME.to_string()),
            redis_url: std::env::var("REDIS_URL").ok().filter(|v| !v.is_empty()),
            encryption_key: std::env::var("ENCRYPTION_KEY").ok().filter(|v| !v.is_empty()),
            firebase,
            admin_secret_key: std::env::var("ADMIN_SECRET_KEY").ok().filter(|v| !v.is_empty()),
            system_keys,
            base_url_override: std::env::var("PROXY_BASE_URL_OVERRIDE")
                .ok()
                .filter(|v| !v.is_empty()),
        }
    }

    /// Defaults with nothing external configured, for tests.
    pub fn for_test() -> Self {
        Self {
            port: 0,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_retries: 1,
            retry_delay: Duration::from_millis(10),
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            mongodb_uri: None,
            mongodb_db_name: DEFAULT_DB_NAME.to_string(),
            redis_url: None,
            encryption_key: Some("test-master-key-material-32bytes".to_string()),
            firebase: None,
            admin_secret_key: None,
            system_keys: HashMap::new(),
            base_url_override: None,
        }
    }

    pub fn with_base_url_override(mut self, url: impl Into<String>) -> Self {
        self.base_url_override = Some(url.into());
        self
    }

    pub fn with_system_key(mut self, provider: Provider, key: impl Into<String>) -> Self {
        self.system_keys.insert(provider, key.into());
        self
    }

    pub fn with_admin_secret(mut self, secret: impl Into<String>) -> Self {
        self.admin_secret_key = Some(secret.into());
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
