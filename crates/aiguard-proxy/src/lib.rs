//! Multi-tenant reverse proxy in front of AI providers.
//!
//! # Architecture
//!
//! ```text
//! Client → POST /v1/messages
//!          X-AI-Guard-Provider: anthropic
//!          Authorization: Bearer pat_…
//!              ↓
//!         [pipeline] request id → authenticate → validate body
//!              ↓      → rate limit → quota → project context
//!              ↓      → resolve credential (project → user → system)
//!              ↓      → decrypt envelope (aiguard-vault)
//!         [forwarder] rewrite auth + host, buffered or SSE streaming
//!              ↓
//!         https://api.anthropic.com/v1/messages
//!              ↓
//!         [usage tracker + audit writer] token counts, cost, counters
//! ```
//!
//! Management surface lives under `/_api`; `/health` and `/ready` report
//! liveness and the registered providers. Every collaborator (store, rate
//! limiter backend, identity verifier) is injected through [`server::AppState`]
//! — construction happens once in the binary.

pub mod audit;
pub mod auth;
pub mod config;
pub mod credentials;
pub mod error;
pub mod forward;
pub mod hasher;
pub mod identity;
pub mod pipeline;
pub mod quota;
pub mod ratelimit;
pub mod reset;
pub mod server;
pub mod usage;
pub mod validate;

mod admin;
