use anyhow::{anyhow, Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::channel::Backoff;
use crate::location::LoopSettings;

pub const CONFIG_ENV: &str = "TRIPSYNC_CONFIG";

/// Tunables for the synchronizer. Every field has a default, so a partial file works.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub ack_timeout_ms: u64,
    pub rest_timeout_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_jitter_ms: u64,
    pub location_interval_ms: u64,
    pub location_sample_timeout_ms: u64,
    pub update_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            ack_timeout_ms: 10_000,
            rest_timeout_ms: 15_000,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 30_000,
            reconnect_jitter_ms: 250,
            location_interval_ms: 5_000,
            location_sample_timeout_ms: 10_000,
            update_buffer: 100,
        }
    }
}

impl SyncConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn rest_timeout(&self) -> Duration {
        Duration::from_millis(self.rest_timeout_ms)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.reconnect_base_ms),
            Duration::from_millis(self.reconnect_max_ms),
            Duration::from_millis(self.reconnect_jitter_ms),
        )
    }

    pub fn location_settings(&self) -> LoopSettings {
        LoopSettings {
            interval: Duration::from_millis(self.location_interval_ms),
            sample_timeout: Duration::from_millis(self.location_sample_timeout_ms),
        }
    }

    /// Load from `path`, else `$TRIPSYNC_CONFIG`, else the user config directory.
    /// A missing file means defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match std::env::var_os(CONFIG_ENV) {
                Some(path) => PathBuf::from(path),
                None => default_config_path()?,
            },
        };

        if !path.exists() {
            info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: SyncConfig = serde_json::from_str(&contents)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    let dir = dirs::config_dir().ok_or_else(|| anyhow!("Could not determine config directory"))?;
    Ok(dir.join("tripsync").join("config.json"))
}
