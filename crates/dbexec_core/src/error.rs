use thiserror::Error;

/// Failure taxonomy for command execution.
///
/// Every public operation on [`crate::executor::DbClient`] returns this
/// type. Variants line up with the resilience pipeline stages that can reject
/// an attempt (timeout, circuit breaker, bulkhead, rate limiter) plus the
/// failures that originate outside the pipeline (configuration, coercion,
/// disposal).
#[derive(Debug, Error)]
pub enum ExecError {
    /// Unknown connection name, blank connection string, or an invalid option value.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A driver error classified as transient (network blip, deadlock, driver-level timeout).
    #[error("transient failure on '{connection_name}': {message}")]
    Transient {
        connection_name: String,
        message: String,
    },

    /// Per-attempt timeout expired.
    #[error("attempt timed out on '{connection_name}'")]
    Timeout { connection_name: String },

    /// Bulkhead or rate limiter rejected the attempt.
    #[error("rejected: {0}")]
    Overloaded(String),

    /// Circuit breaker is open; the attempt was not sent to the driver.
    #[error("circuit open for '{0}'")]
    CircuitOpen(String),

    /// Scalar coercion could not convert the driver value to the requested type.
    #[error("cannot convert value to requested type: {0}")]
    InvalidConversion(String),

    /// Top-level or per-attempt cancellation.
    #[error("operation cancelled")]
    Cancelled,

    /// Call made after the executor was disposed.
    #[error("executor has been disposed")]
    Disposed,

    /// Any non-transient driver failure, surfaced as-is with context.
    #[error("unexpected failure on '{connection_name}': {message}")]
    Unknown {
        connection_name: String,
        message: String,
    },
}

impl ExecError {
    /// Whether the resilience pipeline's retry policy should consider this
    /// failure for another attempt. `Timeout` is treated as transient per
    /// the retry predicate in the resilience pipeline provider.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout { .. })
    }

    /// Short label attached to structured log records; never includes
    /// parameter values or full connection strings.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Transient { .. } => "transient",
            Self::Timeout { .. } => "timeout",
            Self::Overloaded(_) => "overloaded",
            Self::CircuitOpen(_) => "circuit_open",
            Self::InvalidConversion(_) => "invalid_conversion",
            Self::Cancelled => "cancelled",
            Self::Disposed => "disposed",
            Self::Unknown { .. } => "unknown",
        }
    }
}

/// Classifies an arbitrary driver-side error into the execution taxonomy.
///
/// Supplied by the embedder at executor construction (see §9 Open
/// Questions — the exact transient predicate is pluggable rather than
/// hard-coded against one driver's error codes).
pub trait DriverErrorClassifier: Send + Sync {
    fn classify(&self, connection_name: &str, err: &(dyn std::error::Error + Send + Sync)) -> ExecError;
}

/// Default classifier: every driver error is `Unknown` unless the caller
/// supplies a driver-aware one. Mirrors the teacher's pattern of treating
/// unrecognized errors conservatively rather than guessing retriability.
pub struct DefaultClassifier;

impl DriverErrorClassifier for DefaultClassifier {
    fn classify(&self, connection_name: &str, err: &(dyn std::error::Error + Send + Sync)) -> ExecError {
        ExecError::Unknown {
            connection_name: connection_name.to_string(),
            message: err.to_string(),
        }
    }
}
