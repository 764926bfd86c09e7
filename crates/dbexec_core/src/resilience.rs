use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tower::util::BoxCloneService;
use tower::{Service, ServiceExt};
use tower_resilience::bulkhead::{BulkheadConfig, BulkheadError};
use tower_resilience::circuitbreaker::{CircuitBreakerConfig, CircuitBreakerError};
use tower_resilience::ratelimiter::{RateLimiterConfig, RateLimiterError};
use tower_resilience::retry::RetryConfig;
use tower_resilience::timelimiter::{TimeLimiterConfig, TimeLimiterError};

use crate::config::DbResilienceOptions;
use crate::error::ExecError;
use crate::task::CancelToken;

/// One retry attempt, type-erased so the same cached pipeline can carry
/// non-query, scalar, and reader executions (§4.4: "one resilience
/// pipeline object per connection name", §4.5: three different result
/// shapes). Cheaply `Clone` because the retry layer re-issues the request
/// on every attempt.
pub type AttemptFn =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<Box<dyn Any + Send>, ExecError>> + Send>> + Send + Sync>;

type PipelineService = BoxCloneService<AttemptFn, Box<dyn Any + Send>, ExecError>;

/// The composed retry/timeout/circuit-breaker/bulkhead/rate-limiter stack
/// for a single connection name, built once and reused across calls until
/// an options reload evicts it.
#[derive(Clone)]
pub struct ResiliencePipeline {
    service: PipelineService,
}

impl ResiliencePipeline {
    /// Builds the pipeline in the order §4.4 names: Retry wraps Timeout
    /// wraps CircuitBreaker wraps Bulkhead wraps RateLimiter wraps the
    /// attempt itself. Each stage is skipped when disabled, so a
    /// `DbResilienceOptions::default()` pipeline is just the bare attempt.
    ///
    /// Every stage is parameterized with `ExecError` as its error type
    /// (matching `CircuitBreakerConfig::<(), std::io::Error>` in
    /// tower-resilience's own usage docs), and its rejection variant is
    /// mapped onto the matching `ExecError` member instead of being left
    /// to a logging-only callback, so callers can pattern-match
    /// `CircuitOpen`/`Overloaded`/`Timeout` the way §7 documents.
    pub fn build(connection_name: &str, options: &DbResilienceOptions) -> Self {
        let base = tower::service_fn(|attempt: AttemptFn| async move { attempt().await });
        let service: PipelineService = BoxCloneService::new(base);

        let service = Self::with_rate_limiter(connection_name, service, options);
        let service = Self::with_bulkhead(connection_name, service, options);
        let service = Self::with_circuit_breaker(connection_name, service, options);
        let service = Self::with_timeout(connection_name, service, options);
        let service = Self::with_retry(service, options);

        Self { service }
    }

    fn with_rate_limiter(
        connection_name: &str,
        inner: PipelineService,
        options: &DbResilienceOptions,
    ) -> PipelineService {
        if !options.enabled || !options.rate_limiter.enabled {
            return inner;
        }

        let limiter = RateLimiterConfig::<Box<dyn Any + Send>, ExecError>::builder()
            .limit_for_period(options.rate_limiter.permit_limit)
            .refresh_period(options.rate_limiter.replenishment_period)
            .timeout_duration(Duration::from_millis(50))
            .build();

        let connection_name = connection_name.to_string();
        BoxCloneService::new(limiter.layer().layer(inner).map_err(move |err: RateLimiterError<ExecError>| {
            match err {
                RateLimiterError::Rejected => {
                    log::warn!("rate limit exceeded for '{connection_name}'");
                    ExecError::Overloaded(format!("rate limit exceeded for '{connection_name}'"))
                }
                RateLimiterError::Inner(inner_err) => inner_err,
            }
        }))
    }

    fn with_bulkhead(connection_name: &str, inner: PipelineService, options: &DbResilienceOptions) -> PipelineService {
        if !options.enabled || !options.bulkhead.enabled {
            return inner;
        }

        let bulkhead = BulkheadConfig::<Box<dyn Any + Send>, ExecError>::builder()
            .max_concurrent_calls(options.bulkhead.max_concurrent)
            .max_wait_duration(None)
            .build();

        let connection_name = connection_name.to_string();
        BoxCloneService::new(bulkhead.layer(inner).map_err(move |err: BulkheadError<ExecError>| match err {
            BulkheadError::Rejected => {
                log::warn!("bulkhead exhausted for '{connection_name}'");
                ExecError::Overloaded(format!("bulkhead exhausted for '{connection_name}'"))
            }
            BulkheadError::Inner(inner_err) => inner_err,
        }))
    }

    fn with_circuit_breaker(
        connection_name: &str,
        inner: PipelineService,
        options: &DbResilienceOptions,
    ) -> PipelineService {
        if !options.enabled || !options.circuit_breaker.enabled {
            return inner;
        }

        let cb = &options.circuit_breaker;
        let failure_rate = if cb.sampling_window == 0 {
            1.0
        } else {
            (cb.failure_threshold as f64 / cb.sampling_window as f64).min(1.0)
        };

        let circuit_breaker = CircuitBreakerConfig::<Box<dyn Any + Send>, ExecError>::builder()
            .failure_rate_threshold(failure_rate)
            .sliding_window_size(cb.sampling_window as usize)
            .minimum_number_of_calls(cb.failure_threshold)
            .wait_duration_in_open(cb.break_duration)
            .build();

        log::debug!("circuit breaker enabled for '{connection_name}' at failure rate {failure_rate}");

        let connection_name = connection_name.to_string();
        BoxCloneService::new(circuit_breaker.layer(inner).map_err(move |err: CircuitBreakerError<ExecError>| {
            match err {
                CircuitBreakerError::Open => {
                    log::warn!("circuit open for '{connection_name}', rejecting without calling the driver");
                    ExecError::CircuitOpen(connection_name.clone())
                }
                CircuitBreakerError::Inner(inner_err) => inner_err,
            }
        }))
    }

    fn with_timeout(
        connection_name: &str,
        inner: PipelineService,
        options: &DbResilienceOptions,
    ) -> PipelineService {
        if !options.enabled || !options.timeout.enabled {
            return inner;
        }

        let time_limiter = TimeLimiterConfig::<Box<dyn Any + Send>, ExecError>::builder()
            .timeout_duration(options.timeout.per_attempt)
            .cancel_running_future(true)
            .build();

        let connection_name = connection_name.to_string();
        BoxCloneService::new(time_limiter.layer().layer(inner).map_err(move |err: TimeLimiterError<ExecError>| {
            match err {
                TimeLimiterError::Elapsed => {
                    log::warn!("attempt on '{connection_name}' exceeded its per-attempt timeout");
                    ExecError::Timeout {
                        connection_name: connection_name.clone(),
                    }
                }
                TimeLimiterError::Inner(inner_err) => inner_err,
            }
        }))
    }

    fn with_retry(inner: PipelineService, options: &DbResilienceOptions) -> PipelineService {
        if !options.enabled || options.retry.max_attempts == 0 {
            return inner;
        }

        let retry = RetryConfig::<ExecError>::builder()
            .max_attempts(options.retry.max_attempts)
            .exponential_backoff(options.retry.base_delay)
            .retry_predicate(|err: &ExecError| err.is_transient())
            .build();

        BoxCloneService::new(retry.layer().layer(inner))
    }

    /// Runs one attempt through the pipeline and downcasts the result back
    /// to the caller's expected type. `attempt` is the closure that opens
    /// a connection and runs the command body; the pipeline decides how
    /// many times, how fast, and under what admission control to call it.
    pub async fn execute<T: Send + 'static>(&self, attempt: AttemptFn) -> Result<T, ExecError> {
        let boxed = self.service.clone().oneshot(attempt).await?;
        boxed.downcast::<T>().map(|value| *value).map_err(|_| {
            ExecError::Unknown {
                connection_name: String::new(),
                message: "resilience pipeline returned an unexpected result type".to_string(),
            }
        })
    }
}

/// Caches one [`ResiliencePipeline`] per connection name (C5, §4.4). Rebuilt
/// lazily after every options reload since pipelines embed a frozen copy
/// of the resilience knobs at construction time.
pub struct ResiliencePipelineProvider {
    pipelines: Mutex<HashMap<String, ResiliencePipeline>>,
}

impl ResiliencePipelineProvider {
    pub fn new() -> Self {
        Self {
            pipelines: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ResiliencePipeline>> {
        match self.pipelines.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("resilience pipeline cache mutex poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Returns the cached pipeline for `connection_name`, building one if
    /// this is the first request for it. `cancel` matches §6's documented
    /// `get_pipeline(name, cancel)` signature; pipeline construction and
    /// caching don't depend on any one caller's cancellation state, so
    /// today it's only surfaced in the cache-hit/miss log lines, not used
    /// to gate the lookup itself.
    pub fn get_pipeline(
        &self,
        connection_name: &str,
        options: &DbResilienceOptions,
        cancel: &CancelToken,
    ) -> ResiliencePipeline {
        let mut pipelines = self.lock();
        if let Some(existing) = pipelines.get(connection_name) {
            log::debug!(
                "resilience pipeline cache hit for '{connection_name}' (cancelled={})",
                cancel.is_cancelled()
            );
            return existing.clone();
        }

        log::debug!("resilience pipeline cache miss for '{connection_name}', building");
        let built = ResiliencePipeline::build(connection_name, options);
        pipelines.insert(connection_name.to_string(), built.clone());
        built
    }

    /// Drops every cached pipeline. Called when the options store
    /// publishes a new snapshot so the next call rebuilds against the
    /// fresh resilience knobs rather than the ones frozen at cache time.
    pub fn evict_all(&self) {
        self.lock().clear();
    }
}

impl Default for ResiliencePipelineProvider {
    fn default() -> Self {
        Self::new()
    }
}
