use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockWriteGuard};

use async_trait::async_trait;
use dbexec_core::{
    CancelToken, CommandKind, DataSource, DataSourceFactory, DbCommand, DbConnection, DbTransaction,
    ExecError, IsolationLevel, QueryParameter, RowView, TransactionHandle, Value,
};

/// A registered outcome for one driver-level call. Mirrors
/// `FakeQueryOutcome`, split per result shape since non-query, scalar, and
/// reader calls each return a different concrete type.
#[derive(Debug, Clone)]
pub enum FakeAttemptOutcome<T> {
    Success(T),
    TransientError(String),
    PermanentError(String),
    Timeout,
    Cancelled,
}

impl<T: Clone> FakeAttemptOutcome<T> {
    fn into_result(&self, connection_name: &str) -> Result<T, ExecError> {
        match self {
            Self::Success(value) => Ok(value.clone()),
            Self::TransientError(message) => Err(ExecError::Transient {
                connection_name: connection_name.to_string(),
                message: message.clone(),
            }),
            Self::PermanentError(message) => Err(ExecError::Unknown {
                connection_name: connection_name.to_string(),
                message: message.clone(),
            }),
            Self::Timeout => Err(ExecError::Timeout {
                connection_name: connection_name.to_string(),
            }),
            Self::Cancelled => Err(ExecError::Cancelled),
        }
    }
}

/// An ordered list of outcomes consumed one per call; the last entry
/// repeats once exhausted. A single-element sequence behaves like a fixed
/// outcome, which is what the `with_*_result`/`with_*_error` builders use;
/// `with_*_sequence` exposes the general form for retry-then-success tests.
struct Sequence<T> {
    outcomes: Vec<FakeAttemptOutcome<T>>,
    calls: AtomicUsize,
}

impl<T: Clone> Sequence<T> {
    fn new(outcomes: Vec<FakeAttemptOutcome<T>>) -> Self {
        assert!(!outcomes.is_empty(), "a sequence must have at least one outcome");
        Self {
            outcomes,
            calls: AtomicUsize::new(0),
        }
    }

    fn next(&self, connection_name: &str) -> Result<T, ExecError> {
        let call_index = self.calls.fetch_add(1, Ordering::Relaxed);
        let index = call_index.min(self.outcomes.len() - 1);
        self.outcomes[index].into_result(connection_name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeDataSourceStats {
    pub open_count: usize,
    pub executed_commands: usize,
    pub commits: usize,
    pub rollbacks: usize,
    pub disposed: usize,
    pub executed_command_texts: Vec<String>,
}

#[derive(Default)]
struct FakeState {
    non_query_outcomes: RwLock<HashMap<String, Sequence<i64>>>,
    default_non_query: RwLock<Option<FakeAttemptOutcome<i64>>>,
    scalar_outcomes: RwLock<HashMap<String, Sequence<Option<Value>>>>,
    default_scalar: RwLock<Option<FakeAttemptOutcome<Option<Value>>>>,
    reader_outcomes: RwLock<HashMap<String, Sequence<Vec<RowView>>>>,
    default_reader: RwLock<Option<FakeAttemptOutcome<Vec<RowView>>>>,
    open_error: RwLock<Option<String>>,
    begin_transaction_error: RwLock<Option<String>>,
    commit_error: RwLock<Option<String>>,
    rollback_error: RwLock<Option<String>>,
    executed_command_texts: RwLock<Vec<String>>,
    next_transaction_id: AtomicU64,
    open_count: AtomicUsize,
    executed_commands: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    disposed: AtomicUsize,
}

fn rwlock_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn rwlock_read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// In-memory stand-in for a driver's [`DataSource`] (C11, §4.10). Every
/// connection name created from one [`FakeDataSourceFactory`] shares the
/// same registered outcomes and counters, which is what lets a test assert
/// on total attempt counts across retries regardless of which logical
/// connection name the executor resolved to.
#[derive(Clone)]
pub struct FakeDataSourceFactory {
    state: Arc<FakeState>,
}

impl FakeDataSourceFactory {
    pub fn new() -> Self {
        Self {
            state: Arc::new(FakeState::default()),
        }
    }

    pub fn with_non_query_result(self, sql: impl Into<String>, affected_rows: i64) -> Self {
        self.with_non_query_sequence(sql, vec![FakeAttemptOutcome::Success(affected_rows)])
    }

    pub fn with_non_query_transient_error(self, sql: impl Into<String>, message: impl Into<String>) -> Self {
        self.with_non_query_sequence(sql, vec![FakeAttemptOutcome::TransientError(message.into())])
    }

    pub fn with_non_query_permanent_error(self, sql: impl Into<String>, message: impl Into<String>) -> Self {
        self.with_non_query_sequence(sql, vec![FakeAttemptOutcome::PermanentError(message.into())])
    }

    /// Registers an ordered sequence of outcomes for `sql`; the Nth call
    /// with this text gets the Nth outcome, and the last outcome repeats
    /// once the list is exhausted. Lets a test model "fails twice, then
    /// succeeds" for a retry scenario.
    pub fn with_non_query_sequence(self, sql: impl Into<String>, outcomes: Vec<FakeAttemptOutcome<i64>>) -> Self {
        rwlock_write(&self.state.non_query_outcomes).insert(sql.into(), Sequence::new(outcomes));
        self
    }

    pub fn with_default_non_query_result(self, affected_rows: i64) -> Self {
        *rwlock_write(&self.state.default_non_query) = Some(FakeAttemptOutcome::Success(affected_rows));
        self
    }

    pub fn with_scalar_result(self, sql: impl Into<String>, value: Option<Value>) -> Self {
        self.with_scalar_sequence(sql, vec![FakeAttemptOutcome::Success(value)])
    }

    pub fn with_scalar_transient_error(self, sql: impl Into<String>, message: impl Into<String>) -> Self {
        self.with_scalar_sequence(sql, vec![FakeAttemptOutcome::TransientError(message.into())])
    }

    pub fn with_scalar_sequence(self, sql: impl Into<String>, outcomes: Vec<FakeAttemptOutcome<Option<Value>>>) -> Self {
        rwlock_write(&self.state.scalar_outcomes).insert(sql.into(), Sequence::new(outcomes));
        self
    }

    pub fn with_rows_result(self, sql: impl Into<String>, rows: Vec<RowView>) -> Self {
        self.with_rows_sequence(sql, vec![FakeAttemptOutcome::Success(rows)])
    }

    pub fn with_rows_sequence(self, sql: impl Into<String>, outcomes: Vec<FakeAttemptOutcome<Vec<RowView>>>) -> Self {
        rwlock_write(&self.state.reader_outcomes).insert(sql.into(), Sequence::new(outcomes));
        self
    }

    pub fn with_open_error(self, message: impl Into<String>) -> Self {
        *rwlock_write(&self.state.open_error) = Some(message.into());
        self
    }

    pub fn with_commit_error(self, message: impl Into<String>) -> Self {
        *rwlock_write(&self.state.commit_error) = Some(message.into());
        self
    }

    pub fn with_rollback_error(self, message: impl Into<String>) -> Self {
        *rwlock_write(&self.state.rollback_error) = Some(message.into());
        self
    }

    pub fn stats(&self) -> FakeDataSourceStats {
        FakeDataSourceStats {
            open_count: self.state.open_count.load(Ordering::Relaxed),
            executed_commands: self.state.executed_commands.load(Ordering::Relaxed),
            commits: self.state.commits.load(Ordering::Relaxed),
            rollbacks: self.state.rollbacks.load(Ordering::Relaxed),
            disposed: self.state.disposed.load(Ordering::Relaxed),
            executed_command_texts: rwlock_read(&self.state.executed_command_texts).clone(),
        }
    }
}

impl Default for FakeDataSourceFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl DataSourceFactory for FakeDataSourceFactory {
    fn create(&self, connection_name: &str, _connection_string: &str) -> Result<Arc<dyn DataSource>, ExecError> {
        Ok(Arc::new(FakeDataSource {
            connection_name: connection_name.to_string(),
            state: self.state.clone(),
        }))
    }
}

struct FakeDataSource {
    connection_name: String,
    state: Arc<FakeState>,
}

#[async_trait]
impl DataSource for FakeDataSource {
    async fn open_connection(&self, _cancel: &CancelToken) -> Result<Box<dyn DbConnection>, ExecError> {
        if let Some(message) = rwlock_read(&self.state.open_error).clone() {
            return Err(ExecError::Transient {
                connection_name: self.connection_name.clone(),
                message,
            });
        }

        self.state.open_count.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(FakeConnection {
            connection_name: self.connection_name.clone(),
            state: self.state.clone(),
        }))
    }

    async fn dispose(&self) {
        self.state.disposed.fetch_add(1, Ordering::Relaxed);
    }
}

struct FakeConnection {
    connection_name: String,
    state: Arc<FakeState>,
}

#[async_trait]
impl DbConnection for FakeConnection {
    fn create_command(&self) -> Box<dyn DbCommand> {
        Box::new(FakeCommand {
            connection_name: self.connection_name.clone(),
            state: self.state.clone(),
            text: String::new(),
            kind: CommandKind::Text,
            timeout: None,
            transaction: None,
            parameters: Vec::new(),
        })
    }

    async fn begin_transaction(
        &self,
        _isolation: IsolationLevel,
        _cancel: &CancelToken,
    ) -> Result<Box<dyn DbTransaction>, ExecError> {
        if let Some(message) = rwlock_read(&self.state.begin_transaction_error).clone() {
            return Err(ExecError::Transient {
                connection_name: self.connection_name.clone(),
                message,
            });
        }

        let id = self.state.next_transaction_id.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(FakeTransaction {
            connection_name: self.connection_name.clone(),
            state: self.state.clone(),
            id,
        }))
    }

    async fn dispose(self: Box<Self>) {}
}

struct FakeTransaction {
    connection_name: String,
    state: Arc<FakeState>,
    id: u64,
}

#[async_trait]
impl DbTransaction for FakeTransaction {
    fn handle(&self) -> TransactionHandle {
        TransactionHandle(self.id)
    }

    async fn commit(self: Box<Self>) -> Result<(), ExecError> {
        if let Some(message) = rwlock_read(&self.state.commit_error).clone() {
            return Err(ExecError::Unknown {
                connection_name: self.connection_name.clone(),
                message,
            });
        }
        self.state.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), ExecError> {
        if let Some(message) = rwlock_read(&self.state.rollback_error).clone() {
            return Err(ExecError::Unknown {
                connection_name: self.connection_name.clone(),
                message,
            });
        }
        self.state.rollbacks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

struct FakeCommand {
    connection_name: String,
    state: Arc<FakeState>,
    text: String,
    kind: CommandKind,
    timeout: Option<u64>,
    transaction: Option<TransactionHandle>,
    parameters: Vec<QueryParameter>,
}

#[async_trait]
impl DbCommand for FakeCommand {
    fn set_text(&mut self, text: &str, kind: CommandKind) {
        self.text = text.to_string();
        self.kind = kind;
    }

    fn set_timeout(&mut self, timeout: Option<u64>) {
        self.timeout = timeout;
    }

    fn attach_transaction(&mut self, transaction: TransactionHandle) {
        self.transaction = Some(transaction);
    }

    fn bind_parameter(&mut self, parameter: &QueryParameter) {
        self.parameters.push(parameter.clone());
    }

    async fn execute_non_query(&mut self, _cancel: &CancelToken) -> Result<i64, ExecError> {
        self.record_execution();
        let outcomes = rwlock_read(&self.state.non_query_outcomes);
        if let Some(sequence) = outcomes.get(&self.text) {
            return sequence.next(&self.connection_name);
        }
        drop(outcomes);
        match rwlock_read(&self.state.default_non_query).as_ref() {
            Some(outcome) => outcome.into_result(&self.connection_name),
            None => Ok(0),
        }
    }

    async fn execute_scalar(&mut self, _cancel: &CancelToken) -> Result<Option<Value>, ExecError> {
        self.record_execution();
        let outcomes = rwlock_read(&self.state.scalar_outcomes);
        if let Some(sequence) = outcomes.get(&self.text) {
            return sequence.next(&self.connection_name);
        }
        drop(outcomes);
        match rwlock_read(&self.state.default_scalar).as_ref() {
            Some(outcome) => outcome.into_result(&self.connection_name),
            None => Ok(None),
        }
    }

    async fn execute_reader(&mut self, _cancel: &CancelToken) -> Result<Vec<RowView>, ExecError> {
        self.record_execution();
        let outcomes = rwlock_read(&self.state.reader_outcomes);
        if let Some(sequence) = outcomes.get(&self.text) {
            return sequence.next(&self.connection_name);
        }
        drop(outcomes);
        match rwlock_read(&self.state.default_reader).as_ref() {
            Some(outcome) => outcome.into_result(&self.connection_name),
            None => Ok(Vec::new()),
        }
    }
}

impl FakeCommand {
    fn record_execution(&self) {
        self.state.executed_commands.fetch_add(1, Ordering::Relaxed);
        rwlock_write(&self.state.executed_command_texts).push(self.text.clone());
    }
}
