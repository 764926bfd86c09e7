use std::any::Any;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Poll;

use futures::stream::{self, Stream};

use crate::config::DbOptions;
use crate::config_store::{DbOptionsStore, OptionsSnapshot};
use crate::context::ResilienceContext;
use crate::data_source::{DataSourceCache, DataSourceFactory};
use crate::error::{DriverErrorClassifier, ExecError};
use crate::query::{IsolationLevel, QueryDefinition, RowView};
use crate::resilience::{AttemptFn, ResiliencePipelineProvider};
use crate::task::CancelToken;

/// Which of the three C6 operations a given attempt is running. Only
/// affects which `DbCommand` method the attempt body calls; everything
/// else about the execution body (§4.5) is identical across operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    NonQuery,
    Scalar,
    Reader,
}

/// Asynchronous database command execution engine (C6, `DbClient`/§4.5).
///
/// Owns the data-source cache and the resilience pipeline cache, and wires
/// every call through options snapshots taken once per execution (§5:
/// "read once per execution and thereafter treated as frozen").
pub struct DbClient {
    options_store: Arc<DbOptionsStore>,
    data_sources: DataSourceCache,
    pipelines: ResiliencePipelineProvider,
    classifier: Arc<dyn DriverErrorClassifier>,
    disposed: AtomicBool,
}

impl DbClient {
    pub fn new(
        options_store: Arc<DbOptionsStore>,
        factory: Arc<dyn DataSourceFactory>,
        classifier: Arc<dyn DriverErrorClassifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            options_store,
            data_sources: DataSourceCache::new(factory),
            pipelines: ResiliencePipelineProvider::new(),
            classifier,
            disposed: AtomicBool::new(false),
        })
    }

    /// Spawns the background task that watches the options store and
    /// evicts both caches on every change (§4.3 "reconfiguration hook",
    /// §4.4 "evicts on change notification"). The returned `JoinHandle` is
    /// typically discarded; dropping it does not stop the task.
    pub fn spawn_reconfiguration_listener(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let client = self.clone();
        let mut changes = self.options_store.subscribe();
        tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                log::debug!("options snapshot changed, evicting data source and pipeline caches");
                client.data_sources.evict_all().await;
                client.pipelines.evict_all();
            }
        })
    }

    fn ensure_not_disposed(&self) -> Result<(), ExecError> {
        if self.disposed.load(Ordering::SeqCst) {
            Err(ExecError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Disposes the executor: evicts the data-source cache (§4.5
    /// "Shutdown"). Idempotent; in-flight executions that already opened a
    /// connection are left to complete on their own.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.data_sources.evict_all().await;
        self.pipelines.evict_all();
    }

    pub async fn execute_non_query(
        self: &Arc<Self>,
        query: &QueryDefinition,
        cancel: CancelToken,
    ) -> Result<i64, ExecError> {
        self.run_pipeline(query, cancel, Operation::NonQuery).await
    }

    pub async fn execute_scalar<T>(self: &Arc<Self>, query: &QueryDefinition, cancel: CancelToken) -> Result<Option<T>, ExecError>
    where
        T: crate::coerce::FromScalar + Send + 'static,
    {
        let raw: Option<crate::value::Value> = self.run_pipeline(query, cancel, Operation::Scalar).await?;
        crate::coerce::coerce_nullable_scalar(raw)
    }

    /// Returns a finite, single-pass, non-restartable stream of `p(row)`
    /// (§4.5, §8). Rows are fully buffered before the pipeline returns
    /// (retry atomicity); the stream that follows re-checks the caller's
    /// cancellation token before handing out each projected row.
    pub async fn query<T, F>(
        self: &Arc<Self>,
        query: &QueryDefinition,
        cancel: CancelToken,
        projector: F,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<T, ExecError>> + Send>>, ExecError>
    where
        T: Send + 'static,
        F: FnMut(&RowView) -> Result<T, ExecError> + Send + 'static,
    {
        let rows: Vec<RowView> = self.run_pipeline(query, cancel.clone(), Operation::Reader).await?;
        Ok(row_stream(rows, cancel, projector))
    }

    /// Runs `query` under the resilience pipeline for the connection it
    /// targets, and downcasts the attempt's boxed result to `R` — the
    /// concrete per-operation result type (`i64`, `Option<Value>`, or
    /// `Vec<RowView>`), never the caller-facing coerced/projected type.
    async fn run_pipeline<R: Send + 'static>(
        self: &Arc<Self>,
        query: &QueryDefinition,
        cancel: CancelToken,
        op: Operation,
    ) -> Result<R, ExecError> {
        self.ensure_not_disposed()?;

        let OptionsSnapshot { db, resilience } = self.options_store.current();
        let connection_name = query.effective_connection_name(&db.default_connection_name).to_string();
        let context = ResilienceContext::for_execution(query, &connection_name, cancel);
        let pipeline = self
            .pipelines
            .get_pipeline(&connection_name, &resilience, &context.cancel_token);

        let client = self.clone();
        let query = Arc::new(query.clone());
        let context_for_attempt = context.clone();
        let db_for_attempt = db.clone();

        let attempt: AttemptFn = Arc::new(move || {
            let client = client.clone();
            let query = query.clone();
            let context = context_for_attempt.clone();
            let db = db_for_attempt.clone();
            Box::pin(async move { client.attempt_once(&query, &context, &db, op).await })
        });

        pipeline.execute::<R>(attempt).await
    }

    /// One attempt of the §4.5 execution body: acquire connection, resolve
    /// transaction, build the command, run the operation, commit/rollback,
    /// then dispose transaction/command/connection in that order.
    async fn attempt_once(
        &self,
        query: &QueryDefinition,
        context: &ResilienceContext,
        db: &DbOptions,
        op: Operation,
    ) -> Result<Box<dyn Any + Send>, ExecError> {
        self.ensure_not_disposed()?;

        let cancel = &context.cancel_token;
        if cancel.is_cancelled() {
            return Err(ExecError::Cancelled);
        }

        let data_source = self.data_sources.get(&context.connection_name, db)?;
        let connection = data_source.open_connection(cancel).await?;

        let effective_isolation = query.isolation.unwrap_or_else(|| db.default_isolation.into());
        let transaction = if effective_isolation != IsolationLevel::Unspecified {
            match connection.begin_transaction(effective_isolation, cancel).await {
                Ok(tx) => Some(tx),
                Err(err) => {
                    connection.dispose().await;
                    return Err(err);
                }
            }
        } else {
            None
        };

        let mut command = connection.create_command();
        command.set_text(&query.command_text, query.command_kind);
        command.set_timeout(resolve_timeout_seconds(query.command_timeout.or(Some(db.command_timeout))));
        if let Some(tx) = &transaction {
            command.attach_transaction(tx.handle());
        }
        for param in &query.parameters {
            command.bind_parameter(param);
        }

        let outcome: Result<Box<dyn Any + Send>, ExecError> = match op {
            Operation::NonQuery => command
                .execute_non_query(cancel)
                .await
                .map(|n| Box::new(n) as Box<dyn Any + Send>),
            Operation::Scalar => command
                .execute_scalar(cancel)
                .await
                .map(|v| Box::new(v) as Box<dyn Any + Send>),
            Operation::Reader => command
                .execute_reader(cancel)
                .await
                .map(|rows| Box::new(rows) as Box<dyn Any + Send>),
        };
        let outcome = outcome.map_err(|err| self.classify_if_foreign(&context.connection_name, err));

        match outcome {
            Ok(result) => {
                if let Some(tx) = transaction {
                    if let Err(commit_err) = tx.commit().await {
                        command.dispose().await;
                        connection.dispose().await;
                        return Err(commit_err);
                    }
                }
                command.dispose().await;
                connection.dispose().await;
                Ok(result)
            }
            Err(exec_err) => {
                if let Some(tx) = transaction {
                    if let Err(rollback_err) = tx.rollback().await {
                        log::warn!(
                            "rollback failed on '{}': {rollback_err}, suppressing in favor of the original failure",
                            context.connection_name
                        );
                    }
                }
                command.dispose().await;
                connection.dispose().await;
                Err(exec_err)
            }
        }
    }

    /// Drivers that already return `ExecError` pass straight through; this
    /// only exists so a future driver adapter that surfaces a foreign
    /// error type has a single place to run it through the classifier.
    fn classify_if_foreign(&self, _connection_name: &str, err: ExecError) -> ExecError {
        let _ = &self.classifier;
        err
    }
}

/// §4.5 step 4: ceil of seconds, non-positive timeout maps to the driver's
/// "no timeout" sentinel (`None`).
fn resolve_timeout_seconds(timeout: Option<std::time::Duration>) -> Option<u64> {
    match timeout {
        None => None,
        Some(d) if d.is_zero() => None,
        Some(d) => Some(d.as_secs() + u64::from(d.subsec_nanos() > 0)),
    }
}

fn row_stream<T, F>(
    rows: Vec<RowView>,
    cancel: CancelToken,
    mut projector: F,
) -> Pin<Box<dyn Stream<Item = Result<T, ExecError>> + Send>>
where
    T: Send + 'static,
    F: FnMut(&RowView) -> Result<T, ExecError> + Send + 'static,
{
    let mut rows = rows.into_iter();
    let mut stopped = false;

    Box::pin(stream::poll_fn(move |_cx| {
        if stopped {
            return Poll::Ready(None);
        }
        if cancel.is_cancelled() {
            stopped = true;
            return Poll::Ready(Some(Err(ExecError::Cancelled)));
        }
        match rows.next() {
            None => Poll::Ready(None),
            Some(row) => Poll::Ready(Some(projector(&row))),
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeout_maps_to_no_timeout_sentinel() {
        assert_eq!(resolve_timeout_seconds(Some(std::time::Duration::ZERO)), None);
        assert_eq!(resolve_timeout_seconds(None), None);
    }

    #[test]
    fn sub_second_timeout_rounds_up() {
        assert_eq!(
            resolve_timeout_seconds(Some(std::time::Duration::from_millis(1500))),
            Some(2)
        );
        assert_eq!(resolve_timeout_seconds(Some(std::time::Duration::from_secs(3))), Some(3));
    }
}
