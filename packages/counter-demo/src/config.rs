use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use sluice::EngineConfig;

/// Demo configuration loaded from environment variables.
///
/// Every variable is optional; unset ones fall back to [`EngineConfig`]
/// defaults or the demo's own defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub engine: EngineConfig,
    pub initial_count: i64,
    pub reset_threshold: i64,
    pub reset_delay: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let mut engine = EngineConfig::default();
        if let Some(capacity) = parse_var("SLUICE_BUS_CAPACITY")? {
            engine.bus_capacity = capacity;
        }
        if let Some(attempts) = parse_var("SLUICE_RETRY_MAX_ATTEMPTS")? {
            engine.resilience.retry.max_attempts = attempts;
        }
        if let Some(ms) = parse_var("SLUICE_RETRY_BASE_BACKOFF_MS")? {
            engine.resilience.retry.base_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var("SLUICE_RETRY_ATTEMPT_TIMEOUT_MS")? {
            engine.resilience.retry.attempt_timeout = Duration::from_millis(ms);
        }
        if let Some(threshold) = parse_var("SLUICE_BREAKER_THRESHOLD")? {
            engine.resilience.breaker.failure_threshold = threshold;
        }
        if let Some(ms) = parse_var("SLUICE_BREAKER_OPEN_MS")? {
            engine.resilience.breaker.open_duration = Duration::from_millis(ms);
        }

        Ok(Self {
            engine,
            initial_count: parse_var("SLUICE_INITIAL_COUNT")?.unwrap_or(10),
            reset_threshold: parse_var("SLUICE_RESET_THRESHOLD")?.unwrap_or(15),
            reset_delay: Duration::from_millis(parse_var("SLUICE_RESET_DELAY_MS")?.unwrap_or(500)),
        })
    }
}

fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{} must be a valid number", name)),
        Err(_) => Ok(None),
    }
}
