//! Sync tuning, loaded from RON.
//!
//! Every field has a default, so a config file only needs the values it
//! changes:
//!
//! ```ron
//! (
//!     initial_backoff_ms: 2000,
//!     max_retries: 8,
//! )
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_retries: u32,
    pub sync_interval_ms: u64,
    pub history_capacity: usize,
    pub connectivity_debounce_ms: u64,
    pub storage_key: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_retries: DEFAULT_MAX_RETRIES,
            sync_interval_ms: DEFAULT_SYNC_INTERVAL_MS,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            connectivity_debounce_ms: DEFAULT_CONNECTIVITY_DEBOUNCE_MS,
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
        }
    }
}

impl SyncConfig {
    /// Parse and validate a RON document.
    pub fn from_ron(text: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = ron::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a RON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_ron(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid("max_retries must be at least 1".into()));
        }
        if self.history_capacity == 0 || self.history_capacity > MAX_HISTORY_CAPACITY {
            return Err(ConfigError::Invalid(format!(
                "history_capacity must be between 1 and {MAX_HISTORY_CAPACITY}, got {}",
                self.history_capacity
            )));
        }
        if self.sync_interval_ms == 0 {
            return Err(ConfigError::Invalid("sync_interval_ms must be non-zero".into()));
        }
        if self.storage_key.is_empty() {
            return Err(ConfigError::Invalid("storage_key must not be empty".into()));
        }
        Ok(())
    }

    /// Wait required after `attempts` failed sends before the next one:
    /// `initial * multiplier^(attempts - 1)`, capped at [`MAX_BACKOFF_MS`].
    pub fn backoff_ms(&self, attempts: u32) -> u64 {
        if attempts == 0 {
            return 0;
        }
        let exp = (attempts - 1).min(i32::MAX as u32) as i32;
        let wait = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exp);
        if wait.is_finite() {
            (wait.round() as u64).min(MAX_BACKOFF_MS)
        } else {
            MAX_BACKOFF_MS
        }
    }

    pub fn backoff(&self, attempts: u32) -> Duration {
        Duration::from_millis(self.backoff_ms(attempts))
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn connectivity_debounce(&self) -> Duration {
        Duration::from_millis(self.connectivity_debounce_ms)
    }
}
