//! Engine configuration.
//!
//! Every field has a default, so a partial document deserializes:
//!
//! ```ignore
//! let config: EngineConfig = serde_json::from_str(r#"{
//!     "bus_capacity": 1024,
//!     "resilience": { "retry": { "max_attempts": 5 } }
//! }"#)?;
//! ```
//!
//! Durations are expressed in milliseconds (`*_ms` fields).

use serde::{Deserialize, Serialize};

use crate::bus::DEFAULT_CAPACITY;
use crate::resilience::{CircuitBreakerConfig, RetryPolicy};

/// Top-level engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Action bus buffer before slow observers lag.
    pub bus_capacity: usize,
    /// Defaults for effects wrapped by the engine's retry middleware.
    pub resilience: ResilienceConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bus_capacity: DEFAULT_CAPACITY,
            resilience: ResilienceConfig::default(),
        }
    }
}

/// Retry and circuit-breaker settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub retry: RetryPolicy,
    pub breaker: CircuitBreakerConfig,
}

/// Serde adapter for `Duration` as integer milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
