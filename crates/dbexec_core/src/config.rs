use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::query::IsolationLevel;

fn default_connection_name() -> String {
    "defaultDatabase".to_string()
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionsValidationError(pub String);

impl std::fmt::Display for OptionsValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for OptionsValidationError {}

/// Case-insensitive connection-name map. Kept as its own wrapper (rather
/// than a bare `HashMap`) so lookups are case-insensitive without forcing
/// every caller to lowercase keys themselves.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStrings(HashMap<String, String>);

impl ConnectionStrings {
    pub fn insert(&mut self, name: impl Into<String>, connection_string: impl Into<String>) {
        self.0.insert(name.into().to_lowercase(), connection_string.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_lowercase()).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Hot-reloadable connection and timeout options (C1, §3 `DbOptions`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbOptions {
    #[serde(default = "default_connection_name")]
    pub default_connection_name: String,

    #[serde(default = "default_command_timeout", with = "duration_secs")]
    pub command_timeout: Duration,

    #[serde(default)]
    pub default_isolation: IsolationLevelConfig,

    #[serde(default)]
    pub prefer_read_only_connection: bool,

    #[serde(default)]
    pub connection_strings: ConnectionStrings,
}

/// Serde-friendly mirror of [`IsolationLevel`] (the domain type has no
/// `Serialize`/`Deserialize` derive since most call sites construct it
/// programmatically, not from JSON).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IsolationLevelConfig {
    Unspecified,
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
    Snapshot,
    Chaos,
}

impl From<IsolationLevelConfig> for IsolationLevel {
    fn from(value: IsolationLevelConfig) -> Self {
        match value {
            IsolationLevelConfig::Unspecified => IsolationLevel::Unspecified,
            IsolationLevelConfig::ReadUncommitted => IsolationLevel::ReadUncommitted,
            IsolationLevelConfig::ReadCommitted => IsolationLevel::ReadCommitted,
            IsolationLevelConfig::RepeatableRead => IsolationLevel::RepeatableRead,
            IsolationLevelConfig::Serializable => IsolationLevel::Serializable,
            IsolationLevelConfig::Snapshot => IsolationLevel::Snapshot,
            IsolationLevelConfig::Chaos => IsolationLevel::Chaos,
        }
    }
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            default_connection_name: default_connection_name(),
            command_timeout: default_command_timeout(),
            default_isolation: IsolationLevelConfig::default(),
            prefer_read_only_connection: false,
            connection_strings: ConnectionStrings::default(),
        }
    }
}

impl DbOptions {
    /// Validates the rules from §3: positive timeout, non-empty default
    /// connection name. Run once at startup and again after every hot
    /// reload before the new snapshot is published.
    pub fn validate(&self) -> Result<(), OptionsValidationError> {
        if self.command_timeout.is_zero() {
            return Err(OptionsValidationError(
                "command_timeout must be greater than zero".to_string(),
            ));
        }
        if self.default_connection_name.trim().is_empty() {
            return Err(OptionsValidationError(
                "default_connection_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryOptions {
    #[serde(default)]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay", with = "duration_millis")]
    pub base_delay: Duration,
    #[serde(default = "default_backoff_exponent")]
    pub backoff_exponent: f64,
    #[serde(default)]
    pub use_jitter: bool,
}

fn default_base_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_backoff_exponent() -> f64 {
    2.0
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            base_delay: default_base_delay(),
            backoff_exponent: default_backoff_exponent(),
            use_jitter: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutOptions {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_per_attempt", with = "duration_secs")]
    pub per_attempt: Duration,
}

fn default_per_attempt() -> Duration {
    Duration::from_secs(10)
}

impl Default for TimeoutOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            per_attempt: default_per_attempt(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerOptions {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_sampling_window")]
    pub sampling_window: u32,
    #[serde(default = "default_break_duration", with = "duration_secs")]
    pub break_duration: Duration,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_sampling_window() -> u32 {
    20
}

fn default_break_duration() -> Duration {
    Duration::from_secs(30)
}

impl Default for CircuitBreakerOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            failure_threshold: default_failure_threshold(),
            sampling_window: default_sampling_window(),
            break_duration: default_break_duration(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkheadOptions {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    #[serde(default)]
    pub max_queued: u32,
}

fn default_max_concurrent() -> u32 {
    10
}

impl Default for BulkheadOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            max_concurrent: default_max_concurrent(),
            max_queued: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterOptions {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_permit_limit")]
    pub permit_limit: u32,
    #[serde(default = "default_replenishment_period", with = "duration_secs")]
    pub replenishment_period: Duration,
}

fn default_permit_limit() -> u32 {
    100
}

fn default_replenishment_period() -> Duration {
    Duration::from_secs(1)
}

impl Default for RateLimiterOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            permit_limit: default_permit_limit(),
            replenishment_period: default_replenishment_period(),
        }
    }
}

/// Hot-reloadable resilience knobs (C1, §3 `DbResilienceOptions`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DbResilienceOptions {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub retry: RetryOptions,
    #[serde(default)]
    pub timeout: TimeoutOptions,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerOptions,
    #[serde(default)]
    pub bulkhead: BulkheadOptions,
    #[serde(default)]
    pub rate_limiter: RateLimiterOptions,
}

impl DbResilienceOptions {
    pub fn validate(&self) -> Result<(), OptionsValidationError> {
        if self.timeout.enabled && self.timeout.per_attempt.is_zero() {
            return Err(OptionsValidationError(
                "resilience.timeout.per_attempt must be greater than zero when enabled".to_string(),
            ));
        }
        Ok(())
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}
