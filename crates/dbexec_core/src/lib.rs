#![allow(clippy::result_large_err)]

mod coerce;
mod config;
mod config_loader;
mod config_store;
mod context;
mod data_source;
mod error;
mod executor;
mod query;
mod registration;
mod resilience;
mod task;
mod value;

pub use coerce::{coerce_enum, coerce_nullable_scalar, coerce_scalar, FromScalar};
pub use config::{
    BulkheadOptions, CircuitBreakerOptions, ConnectionStrings, DbOptions, DbResilienceOptions,
    IsolationLevelConfig, OptionsValidationError, RateLimiterOptions, RetryOptions, TimeoutOptions,
};
pub use config_loader::{apply_connection_strings, ConnectionStringSource, EnvConnectionStringSource};
pub use config_store::{DbOptionsStore, OptionsSnapshot};
pub use context::ResilienceContext;
pub use data_source::{
    DataSource, DataSourceCache, DataSourceFactory, DbCommand, DbConnection, DbTransaction,
    TransactionHandle,
};
pub use error::{DefaultClassifier, DriverErrorClassifier, ExecError};
pub use executor::DbClient;
pub use query::{
    CommandKind, IsolationLevel, ParameterDirection, QueryDefinition, QueryDefinitionError,
    QueryParameter, RowView,
};
pub use registration::{register, Registration};
pub use resilience::{AttemptFn, ResiliencePipeline, ResiliencePipelineProvider};
pub use task::CancelToken;
pub use value::Value;
