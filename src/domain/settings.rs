use crate::domain::models::{Command, MacAddress};
use crate::domain::scheduler::SchedulerConfig;
use crate::domain::session::{SessionOptions, SessionTimings};
use crate::infrastructure::bluetooth::protocol::DeviceType;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const APP_DIR: &str = "wed_fleet";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

impl LogSettings {
    /// Route log files to `dir`, turning the file layer on
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self.file_logging_enabled = true;
        self
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}
fn default_prefix() -> String {
    APP_DIR.to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("config lists no devices")]
    NoDevices,

    #[error("invalid config value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Fleet configuration for the `start` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    pub devices: Vec<MacAddress>,
    #[serde(default)]
    pub battery_warning: Option<u8>,
    /// Enables file logging into this directory
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub raw: bool,
    #[serde(default = "default_min_logs")]
    pub min_logs: u32,

    #[serde(default)]
    pub device_type: DeviceType,
    #[serde(default = "default_watchdog_secs")]
    pub watchdog_secs: u64,
    #[serde(default = "default_drain_secs")]
    pub drain_secs: u64,
    #[serde(default = "default_radio_timeout_secs")]
    pub radio_timeout_secs: u64,
    /// Seconds to hold back a device whose checkpoint did not move; 0 retries at once
    #[serde(default)]
    pub backoff_secs: u64,
    #[serde(default)]
    pub revisit_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default)]
    pub max_rounds: Option<usize>,
    #[serde(default)]
    pub checkpoint_file: Option<PathBuf>,

    #[serde(default)]
    pub log_settings: LogSettings,
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join(APP_DIR).join("data"))
        .unwrap_or_else(|| PathBuf::from("."))
}
fn default_max_concurrency() -> usize {
    1
}
fn default_min_logs() -> u32 {
    1
}
fn default_watchdog_secs() -> u64 {
    30
}
fn default_drain_secs() -> u64 {
    2
}
fn default_radio_timeout_secs() -> u64 {
    10
}
fn default_shutdown_grace_secs() -> u64 {
    5
}

impl FleetConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents)
    }

    /// Parse and validate a JSON document; bad MACs fail here
    pub fn parse(json: &str) -> Result<Self, ConfigError> {
        let config: FleetConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.devices.is_empty() {
            return Err(ConfigError::NoDevices);
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::Invalid {
                field: "max_concurrency",
                reason: "must be at least 1".into(),
            });
        }
        if let Some(level) = self.battery_warning {
            if level > 100 {
                return Err(ConfigError::Invalid {
                    field: "battery_warning",
                    reason: format!("{}% is not a battery level", level),
                });
            }
        }
        if self.watchdog_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "watchdog_secs",
                reason: "must be at least 1".into(),
            });
        }
        if self.radio_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "radio_timeout_secs",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            raw: self.raw,
            min_logs: self.min_logs,
            file_prefix: self.data_dir.join("WED_data"),
            battery_warning: self.battery_warning,
            timings: SessionTimings {
                watchdog: Duration::from_secs(self.watchdog_secs),
                drain_grace: Duration::from_secs(self.drain_secs),
            },
            ..SessionOptions::new(Command::Download)
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrency: self.max_concurrency,
            backoff_base: Duration::from_secs(self.backoff_secs),
            revisit: Duration::from_secs(self.revisit_secs),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            max_rounds: self.max_rounds,
        }
    }

    pub fn radio_timeout(&self) -> Duration {
        Duration::from_secs(self.radio_timeout_secs)
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.checkpoint_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("checkpoints.json"))
    }

    /// Logging settings with the top-level `log_dir` applied
    pub fn effective_log_settings(&self) -> LogSettings {
        match &self.log_dir {
            Some(dir) => self.log_settings.clone().with_log_dir(dir),
            None => self.log_settings.clone(),
        }
    }
}
