#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]

//! jobgw library — core modules of the job-status streaming gateway.
//!
//! - `ratelimit` — per-address fixed-window limiter with temporary bans
//! - `auth` — token issuance/verification delegated to the execution backend
//! - `relay` — per-job rooms multiplexing one upstream subscription each
//! - `ws` — browser-facing WebSocket upgrade and per-connection handling
//! - `backend` — REST + event-source client for the execution backend
//! - `routes` — REST proxies (health, token issuance, submit, result)
//! - `config` — TOML + env-var configuration

pub mod auth;
pub mod backend;
pub mod config;
pub mod ratelimit;
pub mod relay;
pub mod routes;
pub mod state;
pub mod util;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use auth::TokenAuthenticator;
pub use backend::BackendClient;
pub use config::Config;
pub use ratelimit::RateLimiter;
pub use relay::JobRelay;
pub use state::AppState;
