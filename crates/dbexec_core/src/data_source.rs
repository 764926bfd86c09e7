use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::config::DbOptions;
use crate::error::ExecError;
use crate::query::{CommandKind, IsolationLevel, QueryParameter, RowView};
use crate::task::CancelToken;

/// Opaque reference to an open transaction, handed to [`DbCommand::attach_transaction`]
/// so a command can run inside a transaction without the command taking
/// ownership of it (the executor separately owns the transaction for
/// commit/rollback).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionHandle(pub u64);

/// Driver-provided factory for opened connections (§6 consumed interfaces).
/// One instance is cached per logical connection name by [`DataSourceCache`].
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn open_connection(
        &self,
        cancel: &CancelToken,
    ) -> Result<Box<dyn DbConnection>, ExecError>;

    /// Disposes the data source itself. Must not block in-flight
    /// executions that already hold a connection opened from it (§4.3).
    async fn dispose(&self);
}

/// Factory for [`DataSource`] instances, one per logical connection name.
/// Implemented by the embedder's concrete driver crate; the engine only
/// ever calls through this trait.
pub trait DataSourceFactory: Send + Sync {
    fn create(&self, connection_name: &str, connection_string: &str) -> Result<Arc<dyn DataSource>, ExecError>;
}

#[async_trait]
pub trait DbConnection: Send + Sync {
    fn create_command(&self) -> Box<dyn DbCommand>;

    async fn begin_transaction(
        &self,
        isolation: IsolationLevel,
        cancel: &CancelToken,
    ) -> Result<Box<dyn DbTransaction>, ExecError>;

    async fn dispose(self: Box<Self>);
}

#[async_trait]
pub trait DbTransaction: Send + Sync {
    fn handle(&self) -> TransactionHandle;

    async fn commit(self: Box<Self>) -> Result<(), ExecError>;

    async fn rollback(self: Box<Self>) -> Result<(), ExecError>;
}

/// A command built from a [`crate::query::QueryDefinition`], executed
/// under the resilience pipeline. Built fresh per attempt (§4.5 step 4) so
/// retries never reuse a partially-consumed command.
#[async_trait]
pub trait DbCommand: Send {
    fn set_text(&mut self, text: &str, kind: CommandKind);

    /// `timeout` is already resolved to the driver's second-granularity
    /// convention: `None` means "no timeout" (§4.5 step 4, non-positive
    /// maps to the sentinel).
    fn set_timeout(&mut self, timeout: Option<u64>);

    fn attach_transaction(&mut self, transaction: TransactionHandle);

    fn bind_parameter(&mut self, parameter: &QueryParameter);

    async fn execute_non_query(&mut self, cancel: &CancelToken) -> Result<i64, ExecError>;

    async fn execute_scalar(&mut self, cancel: &CancelToken) -> Result<Option<crate::value::Value>, ExecError>;

    async fn execute_reader(&mut self, cancel: &CancelToken) -> Result<Vec<RowView>, ExecError>;

    /// Disposes the command. Most drivers have nothing to release here
    /// beyond what dropping the box already does; the hook exists so the
    /// executor's cleanup ordering (transaction, then command, then
    /// connection) is uniform across drivers that do hold a handle.
    async fn dispose(self: Box<Self>) {}
}

/// Per-connection-name pool of opened data sources (C4, §4.3).
///
/// At most one live entry per name at any instant; reconfiguration evicts
/// every entry and tears it down without blocking callers that already
/// hold a connection opened before the eviction.
pub struct DataSourceCache {
    factory: Arc<dyn DataSourceFactory>,
    entries: Mutex<HashMap<String, Arc<dyn DataSource>>>,
}

impl DataSourceCache {
    pub fn new(factory: Arc<dyn DataSourceFactory>) -> Self {
        Self {
            factory,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<dyn DataSource>>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("data source cache mutex poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Returns the cached data source for `name`, creating it on miss.
    /// Concurrent first-time callers for the same name collapse into a
    /// single creation because the whole check-then-insert happens while
    /// holding the map lock.
    pub fn get(&self, name: &str, options: &DbOptions) -> Result<Arc<dyn DataSource>, ExecError> {
        let mut entries = self.lock();
        if let Some(existing) = entries.get(name) {
            log::debug!("data source cache hit for '{name}'");
            return Ok(existing.clone());
        }

        let connection_string = options.connection_strings.get(name).ok_or_else(|| {
            ExecError::Configuration(format!("no connection string registered for '{name}'"))
        })?;

        if connection_string.trim().is_empty() {
            return Err(ExecError::Configuration(format!(
                "connection string for '{name}' is blank"
            )));
        }

        log::debug!("data source cache miss for '{name}', creating");
        let created = self.factory.create(name, connection_string)?;
        entries.insert(name.to_string(), created.clone());
        Ok(created)
    }

    /// Evicts every entry, disposing each one. Called on reconfiguration
    /// and on executor shutdown. Disposal runs without holding the map
    /// lock so it never blocks a concurrent `get()`.
    pub async fn evict_all(&self) {
        let drained: Vec<_> = {
            let mut entries = self.lock();
            entries.drain().map(|(_, v)| v).collect()
        };

        for entry in drained {
            entry.dispose().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFactory {
        calls: AtomicUsize,
    }

    struct NoopDataSource;

    #[async_trait]
    impl DataSource for NoopDataSource {
        async fn open_connection(&self, _cancel: &CancelToken) -> Result<Box<dyn DbConnection>, ExecError> {
            unimplemented!("not exercised by cache tests")
        }

        async fn dispose(&self) {}
    }

    impl DataSourceFactory for CountingFactory {
        fn create(&self, _name: &str, _connection_string: &str) -> Result<Arc<dyn DataSource>, ExecError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(NoopDataSource))
        }
    }

    #[test]
    fn missing_connection_name_fails_before_creating() {
        let factory = Arc::new(CountingFactory {
            calls: AtomicUsize::new(0),
        });
        let cache = DataSourceCache::new(factory.clone());
        let options = DbOptions::default();

        let result = cache.get("nope", &options);
        assert!(matches!(result, Err(ExecError::Configuration(_))));
        assert_eq!(factory.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn second_get_for_same_name_reuses_cached_entry() {
        let factory = Arc::new(CountingFactory {
            calls: AtomicUsize::new(0),
        });
        let cache = DataSourceCache::new(factory.clone());
        let mut options = DbOptions::default();
        options.connection_strings.insert("reporting", "server=A");

        cache.get("reporting", &options).unwrap();
        cache.get("reporting", &options).unwrap();

        assert_eq!(factory.calls.load(Ordering::SeqCst), 1);
    }
}
