//! Gateway configuration from environment variables.

use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_TOKEN_BUDGET: usize = 4096;
const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful, concise assistant. Answer plainly and admit what you do not know.";
const DEFAULT_SESSION_MAX_AGE_MINUTES: u64 = 60;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub model: Option<String>,
    pub token_budget: usize,
    pub system_prompt: String,
    pub session_max_age: Duration,
    pub sweep_interval: Duration,
}

impl GatewayConfig {
    /// Read configuration from the environment, falling back to defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let bind_addr: SocketAddr = std::env::var("PALAVER_BIND_ADDR")
            .unwrap_or_else(|_| DEFAULT_BIND_ADDR.into())
            .parse()?;

        let token_budget = match std::env::var("PALAVER_TOKEN_BUDGET") {
            Ok(value) => value.parse()?,
            Err(_) => DEFAULT_TOKEN_BUDGET,
        };

        let max_age_minutes = match std::env::var("PALAVER_SESSION_MAX_AGE_MINUTES") {
            Ok(value) => value.parse()?,
            Err(_) => DEFAULT_SESSION_MAX_AGE_MINUTES,
        };
        let session_max_age = Duration::from_secs(max_age_minutes * 60);

        Ok(Self {
            bind_addr,
            model: std::env::var("PALAVER_MODEL").ok(),
            token_budget,
            system_prompt: std::env::var("PALAVER_SYSTEM_PROMPT")
                .unwrap_or_else(|_| DEFAULT_SYSTEM_PROMPT.to_string()),
            session_max_age,
            // Sweep at a fraction of the max age so sessions linger at most
            // ~1.25x past their deadline.
            sweep_interval: session_max_age.div_f64(4.0).max(Duration::from_secs(30)),
        })
    }
}
