use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;

use crate::config::{DbOptions, DbResilienceOptions};
use crate::config_loader::{apply_connection_strings, ConnectionStringSource, EnvConnectionStringSource};
use crate::error::ExecError;

/// A frozen pair of option snapshots read once per execution (§5: "Options
/// snapshots: read once per execution and thereafter treated as frozen").
#[derive(Debug, Clone)]
pub struct OptionsSnapshot {
    pub db: Arc<DbOptions>,
    pub resilience: Arc<DbResilienceOptions>,
}

/// Loads `DbOptions`/`DbResilienceOptions` from a JSON file in the
/// platform config directory, falling back to defaults when the file is
/// absent. Grounded on `AppConfigStore`'s `dirs::config_dir()` +
/// `fs::create_dir_all` + serde_json pattern.
pub struct DbOptionsStore {
    path: PathBuf,
    env_source: EnvConnectionStringSource,
    watch_tx: watch::Sender<OptionsSnapshot>,
}

#[derive(serde::Deserialize, serde::Serialize, Default)]
struct OnDiskOptions {
    #[serde(default)]
    db: DbOptions,
    #[serde(default)]
    resilience: DbResilienceOptions,
}

impl DbOptionsStore {
    /// Resolves `<config_dir>/<app_dir_name>/db_options.json`, creating the
    /// directory if needed, and builds the initial snapshot.
    pub fn new(app_dir_name: &str) -> Result<Self, ExecError> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| ExecError::Configuration("could not find config directory".to_string()))?;

        let app_dir = config_dir.join(app_dir_name);
        fs::create_dir_all(&app_dir)
            .map_err(|e| ExecError::Configuration(format!("cannot create config directory: {e}")))?;

        let path = app_dir.join("db_options.json");
        let env_source = EnvConnectionStringSource::default();
        let initial = Self::load_from(&path, &env_source)?;
        let (watch_tx, _rx) = watch::channel(initial);

        Ok(Self {
            path,
            env_source,
            watch_tx,
        })
    }

    fn load_from(
        path: &PathBuf,
        source: &dyn ConnectionStringSource,
    ) -> Result<OptionsSnapshot, ExecError> {
        let on_disk = if path.exists() {
            let content = fs::read_to_string(path)
                .map_err(|e| ExecError::Configuration(format!("cannot read {}: {e}", path.display())))?;
            serde_json::from_str::<OnDiskOptions>(&content)
                .map_err(|e| ExecError::Configuration(format!("invalid config JSON: {e}")))?
        } else {
            OnDiskOptions::default()
        };

        let mut db = on_disk.db;
        apply_connection_strings(&mut db, source);
        db.validate()
            .map_err(|e| ExecError::Configuration(e.to_string()))?;
        on_disk
            .resilience
            .validate()
            .map_err(|e| ExecError::Configuration(e.to_string()))?;

        Ok(OptionsSnapshot {
            db: Arc::new(db),
            resilience: Arc::new(on_disk.resilience),
        })
    }

    /// Returns the current snapshot.
    pub fn current(&self) -> OptionsSnapshot {
        self.watch_tx.borrow().clone()
    }

    /// Subscribes to change notifications. C4/C5 use this instead of
    /// polling to know when their caches must be invalidated.
    pub fn subscribe(&self) -> watch::Receiver<OptionsSnapshot> {
        self.watch_tx.subscribe()
    }

    /// Re-reads the file and publishes a new snapshot only if it differs
    /// from the currently published one, notifying every subscriber. An
    /// unchanged reload is a no-op, so a file-watcher that fires on every
    /// write (even a touch with no content change) doesn't spuriously
    /// evict the data-source and pipeline caches. Never mutate a snapshot
    /// in place; a real change always publishes a whole new one.
    pub fn reload(&self) -> Result<(), ExecError> {
        let snapshot = Self::load_from(&self.path, &self.env_source)?;
        let unchanged = {
            let current = self.watch_tx.borrow();
            current.db == snapshot.db && current.resilience == snapshot.resilience
        };
        if !unchanged {
            self.watch_tx.send_replace(snapshot);
        }
        Ok(())
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}
