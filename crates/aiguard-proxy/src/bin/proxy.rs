//! AI Guard proxy binary.
//!
//! Listens on `PORT` (default 3000), authenticates callers, and forwards
//! requests to the configured AI providers with per-tenant credentials.
//!
//! # Environment variables
//!
//! | Variable                  | Default       | Description                             |
//! |---------------------------|---------------|-----------------------------------------|
//! | `PORT`                    | `3000`        | TCP port to listen on                   |
//! | `LOG_LEVEL`               | `info`        | Log filter when `RUST_LOG` is unset     |
//! | `REQUEST_TIMEOUT`         | `30000`       | Per-attempt upstream timeout (ms)       |
//! | `MAX_RETRIES`             | `3`           | Upstream attempts per request           |
//! | `RETRY_DELAY`             | `1000`        | Linear backoff unit (ms)                |
//! | `MAX_REQUEST_SIZE`        | `10485760`    | Inbound body cap (bytes)                |
//! | `MONGODB_URI`             | —             | Document store; in-memory when unset    |
//! | `MONGODB_DB_NAME`         | `aiguard`     | Database name                           |
//! | `REDIS_URL`               | —             | Shared rate-limit backend               |
//! | `ENCRYPTION_KEY`          | —             | Master key material (≥32 bytes raw)     |
//! | `FIREBASE_PROJECT_ID`     | —             | Identity verifier (with the two below)  |
//! | `FIREBASE_CLIENT_EMAIL`   | —             |                                         |
//! | `FIREBASE_PRIVATE_KEY`    | —             |                                         |
//! | `ADMIN_SECRET_KEY`        | —             | `X-Admin-Key` override for `/admin/*`   |
//! | `OPENAI_API_KEY`          | —             | Process-default provider credentials    |
//! | `ANTHROPIC_API_KEY`       | —             |                                         |
//! | `GEMINI_API_KEY`          | —             |                                         |

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;

use aiguard_proxy::config::Config;
use aiguard_proxy::identity::{GoogleIdentityVerifier, IdentityVerifier};
use aiguard_proxy::ratelimit::{LocalBackend, RateLimitBackend, RedisBackend};
use aiguard_proxy::reset;
use aiguard_proxy::server::{router, AppState};
use aiguard_store::{MemoryStore, MongoStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    let config = Config::from_env();

    if config.encryption_key.is_none() {
        tracing::warn!("ENCRYPTION_KEY is not set; using a development-only master key");
    }

    let identity: Option<Arc<dyn IdentityVerifier>> = match &config.firebase {
        Some(firebase) => match GoogleIdentityVerifier::new(firebase) {
            Ok(verifier) => {
                tracing::info!(project_id = %firebase.project_id, "Identity verifier ready");
                Some(Arc::new(verifier))
            }
            Err(e) => {
                // PAT-only traffic keeps working without the verifier.
                tracing::error!(error = %e, "Identity verifier init failed; serving PAT-only");
                None
            }
        },
        None => {
            tracing::info!("No identity verifier configured; serving PAT-only");
            None
        }
    };

    let rate_backend: Box<dyn RateLimitBackend> = match &config.redis_url {
        Some(url) => {
            let backend = RedisBackend::connect(url)
                .await
                .context("failed to connect to the Redis rate-limit backend")?;
            tracing::info!("Rate limiting via shared Redis backend");
            Box::new(backend)
        }
        None => {
            tracing::info!("Rate limiting via in-process backend");
            Box::new(LocalBackend::new())
        }
    };

    let port = config.port;
    let state = match &config.mongodb_uri {
        Some(uri) => {
            let store = MongoStore::connect(uri, &config.mongodb_db_name)
                .await
                .context("failed to connect to MongoDB")?;
            tracing::info!(db = %config.mongodb_db_name, "Persistence via MongoDB");
            AppState::build(config, store, identity, rate_backend)
        }
        None => {
            tracing::warn!("MONGODB_URI is not set; state lives in process memory only");
            AppState::build(config, MemoryStore::new(), identity, rate_backend)
        }
    };

    let reset_task = reset::spawn(state.projects.clone());

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .context("failed to bind TCP listener")?;

    tracing::info!(port, "AI Guard proxy listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    reset_task.abort();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Ctrl-C received, shutting down"),
        _ = terminate => tracing::info!("SIGTERM received, shutting down"),
    }
}
