//! Palaver Gateway - HTTP surface
//!
//! This crate exposes the orchestration core over HTTP:
//! - Chat submissions streamed back as server-sent events
//! - Session deletion
//! - Admin surface: circuit-breaker stats/reset, session count, idle sweep

pub mod config;
pub mod routes;
pub mod state;

pub use config::GatewayConfig;
pub use routes::build_routes;
pub use state::AppState;

/// Gateway version
pub const GATEWAY_VERSION: &str = env!("CARGO_PKG_VERSION");
