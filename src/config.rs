//! Configuration loading for chatq.
//!
//! Settings live in a JSON file (`~/.chatq/settings.json` unless a path is given). A file
//! named `local_<name>` next to it, when present, is merged over it so a deployment can
//! override a few keys without copying the whole file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Error;
use crate::store::sqlite::validate_collection;
pub type Result<T> = std::result::Result<T, Error>;

/// Get the chatq home directory (~/.chatq).
pub fn get_home_dir() -> Result<PathBuf> {
    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".chatq"))
}

/// Get the default settings file path.
pub fn get_settings_path() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("settings.json"))
}

/// Path of the local override file for `path`: same directory, `local_` prefixed name.
pub fn local_override_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("local_{}", name))
}

/// Load settings from `path`, or from the default location.
///
/// A missing default file yields default settings; a missing explicit file is an error.
pub fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let (path, explicit) = match path {
        Some(path) => (path.to_path_buf(), true),
        None => (get_settings_path()?, false),
    };

    if !path.exists() {
        if explicit {
            return Err(Error::Config(format!(
                "Settings file not found at {}",
                path.display()
            )));
        }
        tracing::debug!("No settings at {}, using defaults", path.display());
        return Ok(Settings::default());
    }

    let mut data = read_json(&path)?;
    let local = local_override_path(&path);
    if local.exists() {
        merge(&mut data, read_json(&local)?);
        tracing::debug!("Merged local overrides from {}", local.display());
    }

    let settings: Settings = serde_json::from_value(data)?;
    validate_settings(&settings)?;

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

fn read_json(path: &Path) -> Result<serde_json::Value> {
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map_err(|e| Error::Config(format!("cannot parse {}: {}", path.display(), e)))
}

/// Deep-merge `overlay` into `base`: objects merge key by key, anything else is replaced.
fn merge(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base), serde_json::Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.queue.workers_num == 0 {
        return Err(Error::Config("queue.workers_num must be at least 1".to_string()));
    }
    if settings.queue.max_processing_time == 0 {
        return Err(Error::Config(
            "queue.max_processing_time must be positive".to_string(),
        ));
    }
    validate_collection(&settings.store.collection)
}

/// Store configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct StoreSettings {
    /// Database file; defaults to ~/.chatq/queue.db
    pub path: Option<PathBuf>,

    /// Queue name, one table per collection
    #[serde(default = "default_collection")]
    pub collection: String,

    /// How long to wait on a locked database (ms)
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout: u64,
}

fn default_collection() -> String {
    "incoming".to_string()
}

fn default_busy_timeout() -> u64 {
    5000
}

impl StoreSettings {
    pub fn db_path(&self) -> Result<PathBuf> {
        match &self.path {
            Some(path) => Ok(path.clone()),
            None => Ok(get_home_dir()?.join("queue.db")),
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout)
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: None,
            collection: default_collection(),
            busy_timeout: default_busy_timeout(),
        }
    }
}

/// Queue and worker pool configuration. Times are in milliseconds.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct QueueSettings {
    /// Lease staleness window
    #[serde(default = "default_max_processing_time")]
    pub max_processing_time: u64,

    #[serde(default = "default_workers_num")]
    pub workers_num: usize,

    /// Idle wait between empty claims
    #[serde(default)]
    pub fetch_delay: u64,
}

fn default_max_processing_time() -> u64 {
    20_000
}

fn default_workers_num() -> usize {
    1
}

impl QueueSettings {
    pub fn processing_window(&self) -> Duration {
        Duration::from_millis(self.max_processing_time)
    }

    pub fn fetch_interval(&self) -> Duration {
        Duration::from_millis(self.fetch_delay)
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_processing_time: default_max_processing_time(),
            workers_num: default_workers_num(),
            fetch_delay: 0,
        }
    }
}

/// Logging configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LoggingSettings {
    /// Filter used when RUST_LOG is unset
    #[serde(default = "default_level")]
    pub default_level: String,

    /// Directory for daily log files; console only when unset
    pub directory: Option<PathBuf>,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            default_level: default_level(),
            directory: None,
        }
    }
}

/// chatq settings.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Settings {
    #[serde(default = "default_service_name")]
    pub service_name: String,

    #[serde(default)]
    pub store: StoreSettings,

    #[serde(default)]
    pub queue: QueueSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

fn default_service_name() -> String {
    "chatq".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            store: StoreSettings::default(),
            queue: QueueSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}
