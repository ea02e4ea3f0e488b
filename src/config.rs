use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::device::{DeviceSpec, HeartbeatConfig};
use crate::orchestration::ReconnectPolicy;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identity sent in every REGISTER frame.
    pub client_id: String,
    pub heartbeat_interval_secs: u64,
    pub max_missed_heartbeats: u32,
    pub reconnect_delay_secs: u64,
    pub max_retries: u32,
    pub registration_timeout_secs: u64,
    pub task_timeout_secs: u64,
    pub max_concurrent: usize,
    pub max_history_size: usize,
    pub devices: Vec<DeviceSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_id: "constellation_orchestrator".to_string(),
            heartbeat_interval_secs: crate::device::DEFAULT_HEARTBEAT_INTERVAL_SECS,
            max_missed_heartbeats: crate::device::DEFAULT_MAX_MISSED_HEARTBEATS,
            reconnect_delay_secs: crate::orchestration::DEFAULT_RECONNECT_DELAY_SECS,
            max_retries: crate::device::DEFAULT_DEVICE_MAX_RETRIES,
            registration_timeout_secs: crate::device::DEFAULT_REGISTRATION_TIMEOUT_SECS,
            task_timeout_secs: crate::orchestration::DEFAULT_TASK_TIMEOUT_SECS,
            max_concurrent: crate::orchestration::DEFAULT_MAX_CONCURRENT,
            max_history_size: crate::command::DEFAULT_MAX_HISTORY_SIZE,
            devices: Vec::new(),
        }
    }
}

impl Config {
    pub fn constellation_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir()
            .ok_or(Error::NoHomeDir)?
            .join(".constellation"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::constellation_dir()?.join("constellation.toml"))
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load from `path`, falling back to defaults when it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Config::load");
        if !path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        debug!(
            client_id = %config.client_id,
            devices = config.devices.len(),
            "Config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                debug!(dir = %dir.display(), "Creating config directory");
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "Config saved");
        Ok(())
    }

    pub fn heartbeat_config(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_secs(self.heartbeat_interval_secs),
            max_missed: self.max_missed_heartbeats,
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            delay: Duration::from_secs(self.reconnect_delay_secs),
            max_retries: self.max_retries,
        }
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_secs(self.registration_timeout_secs)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}
