use async_trait::async_trait;
use serde_json::Value;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("setting {0} is not registered")]
    Unknown(String),
    #[error("setting {key} expects a number, got {value}")]
    NotNumeric { key: String, value: Value },
    #[error("value {value} for {key} is outside [{min}, {max}]")]
    OutOfRange {
        key: String,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Definition of a persisted setting, registered before it is used
#[derive(Debug, Clone, PartialEq)]
pub struct Setting {
    pub path: String,
    pub default: Value,
    pub range: Option<(f64, f64)>,
    pub alias: Option<String>,
}

impl Setting {
    pub fn new(path: impl Into<String>, default: impl Into<Value>) -> Self {
        Self {
            path: path.into(),
            default: default.into(),
            range: None,
            alias: None,
        }
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.range = Some((min, max));
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }
}

/// Persistent key/value configuration used by the meter
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Registers a setting. An already stored value is left untouched.
    async fn add_setting(&self, setting: Setting) -> Result<(), SettingsError>;

    /// Resolves a short alias to the canonical settings path
    fn alias(&self, alias: &str) -> Option<String>;

    fn get_value(&self, key: &str) -> Option<Value>;

    /// Stores the value and waits until it has been persisted
    async fn set_value(&self, key: &str, value: Value) -> Result<(), SettingsError>;

    /// Stores the value without waiting for persistence. Failures are only logged.
    fn set_value_async(&self, key: &str, value: Value);
}

#[derive(Default)]
struct SettingsState {
    values: BTreeMap<String, Value>,
    aliases: HashMap<String, String>,
    ranges: HashMap<String, (f64, f64)>,
    registered: HashSet<String>,
}

/// Settings kept in memory and, when opened on a file, mirrored to JSON on disk
#[derive(Clone, Default)]
pub struct LocalSettings {
    state: Arc<Mutex<SettingsState>>,
    storage: Option<PathBuf>,
    // Serialises file writes so a stale snapshot never lands after a newer one
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

impl LocalSettings {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens a file-backed store, loading previously saved values if the file exists
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();
        let values = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<BTreeMap<String, Value>>(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        tracing::info!(
            "Loaded {} settings from {}",
            values.len(),
            path.display()
        );
        Ok(Self {
            state: Arc::new(Mutex::new(SettingsState {
                values,
                ..Default::default()
            })),
            storage: Some(path),
            write_lock: Arc::default(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SettingsState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn store(&self, key: &str, value: Value) -> Result<(), SettingsError> {
        let mut state = self.lock();
        if !state.registered.contains(key) {
            return Err(SettingsError::Unknown(key.to_string()));
        }
        if let Some(&(min, max)) = state.ranges.get(key) {
            let number = value.as_f64().ok_or_else(|| SettingsError::NotNumeric {
                key: key.to_string(),
                value: value.clone(),
            })?;
            if number < min || number > max {
                return Err(SettingsError::OutOfRange {
                    key: key.to_string(),
                    value: number,
                    min,
                    max,
                });
            }
        }
        state.values.insert(key.to_string(), value);
        Ok(())
    }

    async fn persist(&self) -> Result<(), SettingsError> {
        let Some(path) = &self.storage else {
            return Ok(());
        };
        let _guard = self.write_lock.lock().await;
        let encoded = {
            let state = self.lock();
            serde_json::to_vec_pretty(&state.values)?
        };
        tokio::fs::write(path, encoded).await?;
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for LocalSettings {
    async fn add_setting(&self, setting: Setting) -> Result<(), SettingsError> {
        let is_new = {
            let mut state = self.lock();
            state.registered.insert(setting.path.clone());
            if let Some(alias) = setting.alias {
                state.aliases.insert(alias, setting.path.clone());
            }
            if let Some(range) = setting.range {
                state.ranges.insert(setting.path.clone(), range);
            }
            if state.values.contains_key(&setting.path) {
                false
            } else {
                state.values.insert(setting.path, setting.default);
                true
            }
        };
        if is_new {
            self.persist().await?;
        }
        Ok(())
    }

    fn alias(&self, alias: &str) -> Option<String> {
        self.lock().aliases.get(alias).cloned()
    }

    fn get_value(&self, key: &str) -> Option<Value> {
        self.lock().values.get(key).cloned()
    }

    async fn set_value(&self, key: &str, value: Value) -> Result<(), SettingsError> {
        self.store(key, value)?;
        self.persist().await
    }

    fn set_value_async(&self, key: &str, value: Value) {
        if let Err(e) = self.store(key, value) {
            tracing::warn!("Failed to store setting {}: {}", key, e);
            return;
        }
        if self.storage.is_none() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let settings = self.clone();
                handle.spawn(async move {
                    if let Err(e) = settings.persist().await {
                        tracing::warn!("Failed to persist settings: {}", e);
                    }
                });
            }
            Err(_) => tracing::warn!("No runtime available to persist setting {}", key),
        }
    }
}
