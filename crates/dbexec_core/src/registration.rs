use std::sync::Arc;

use crate::config_store::DbOptionsStore;
use crate::data_source::DataSourceFactory;
use crate::error::{DriverErrorClassifier, ExecError};
use crate::executor::DbClient;

/// Everything a host process needs to start serving queries: the options
/// store (for wiring a reload trigger, e.g. a SIGHUP handler or a file
/// watcher) and the executor singleton built on top of it.
pub struct Registration {
    pub options_store: Arc<DbOptionsStore>,
    pub client: Arc<DbClient>,
}

/// Registration helper (§6): builds the options store — which already runs
/// the C2 post-configure step and the C1 validators, failing startup on an
/// invalid snapshot rather than serving a half-configured engine — then
/// registers the data source factory, pipeline provider, and executor as a
/// single `Arc<DbClient>` singleton, with the background reconfiguration
/// listener already running.
pub fn register(
    app_dir_name: &str,
    factory: Arc<dyn DataSourceFactory>,
    classifier: Arc<dyn DriverErrorClassifier>,
) -> Result<Registration, ExecError> {
    let options_store = Arc::new(DbOptionsStore::new(app_dir_name)?);
    let client = DbClient::new(options_store.clone(), factory, classifier);
    client.spawn_reconfiguration_listener();

    Ok(Registration {
        options_store,
        client,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_source::DataSource;
    use crate::error::DefaultClassifier;

    struct UnreachableFactory;

    impl DataSourceFactory for UnreachableFactory {
        fn create(&self, _name: &str, _connection_string: &str) -> Result<Arc<dyn DataSource>, ExecError> {
            unimplemented!("not exercised by this test")
        }
    }

    #[test]
    fn register_builds_a_client_against_the_default_options_snapshot() {
        let app_dir_name = format!("dbexec_registration_test_{}", uuid::Uuid::new_v4());
        let registration = register(
            &app_dir_name,
            Arc::new(UnreachableFactory),
            Arc::new(DefaultClassifier),
        )
        .unwrap();

        assert!(registration.options_store.current().db.connection_strings.is_empty());
    }
}
