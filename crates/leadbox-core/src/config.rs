//! Engine configuration

use crate::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable overriding the database location
pub const DATABASE_ENV: &str = "LEADBOX_DATABASE";

/// Runtime settings, loaded once at process start
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// SQLite database file
    pub database_path: PathBuf,
    /// Maximum commands processed concurrently by the engine
    pub max_in_flight: usize,
    /// Compare-and-swap attempts for a single thread upsert
    pub thread_cas_retries: u32,
    /// Characters kept in a thread's last-message preview
    pub preview_length: usize,
    /// Capacity of the engine's command and event channels
    pub command_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("leadbox.db"),
            max_in_flight: 8,
            thread_cas_retries: 5,
            preview_length: 150,
            command_buffer: 100,
        }
    }
}

impl EngineConfig {
    /// Load configuration from an optional JSON file, then apply environment overrides
    pub fn load(path: Option<&Path>) -> CoreResult<Self> {
        let mut config = match path {
            Some(path) => {
                info!("Loading configuration from {}", path.display());
                let raw = std::fs::read_to_string(path)?;
                Self::from_json(&raw)?
            }
            None => Self::default(),
        };

        if let Ok(db) = std::env::var(DATABASE_ENV) {
            debug!("{} overrides database path", DATABASE_ENV);
            config.database_path = PathBuf::from(db);
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from JSON; missing keys take their defaults
    pub fn from_json(raw: &str) -> CoreResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    fn validate(&self) -> CoreResult<()> {
        if self.max_in_flight == 0 {
            return Err(CoreError::ConfigError("max_in_flight must be at least 1".into()));
        }
        if self.thread_cas_retries == 0 {
            return Err(CoreError::ConfigError(
                "thread_cas_retries must be at least 1".into(),
            ));
        }
        if self.command_buffer == 0 {
            return Err(CoreError::ConfigError("command_buffer must be at least 1".into()));
        }
        Ok(())
    }
}
