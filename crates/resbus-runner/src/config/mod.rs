pub mod paths;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use resbus_events::{DEFAULT_MAX_ENVELOPE_SIZE, PeerId, QueueLimit};
use resbus_host::HostOptions;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;

use paths::ProjectPaths;

pub const APP_NAME: &str = "resbus";

#[derive(Debug)]
pub enum ConfigLoadError {
    NotFound,
    ParseError(String),
    IoError(String),
}

impl std::fmt::Display for ConfigLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigLoadError::NotFound => write!(f, "Config file not found"),
            ConfigLoadError::ParseError(msg) => write!(f, "Failed to parse config: {}", msg),
            ConfigLoadError::IoError(msg) => write!(f, "IO error reading config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigLoadError {}

fn default_tick_interval_ms() -> u64 {
    16
}

fn default_pending_timeout_ms() -> u64 {
    30_000
}

fn default_max_envelope_size() -> usize {
    DEFAULT_MAX_ENVELOPE_SIZE
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of queued events; unbounded when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingConfig {
    #[serde(default = "default_pending_timeout_ms")]
    pub default_timeout_ms: u64,
}

impl Default for PendingConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_pending_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetConfig {
    /// Envelopes larger than this are dropped on ingress
    #[serde(default = "default_max_envelope_size")]
    pub max_envelope_size: usize,

    /// Per-peer ingress budget; no limit when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_events_per_second: Option<u32>,

    /// Source id stamped on outbound envelopes
    #[serde(default)]
    pub local_peer_id: u16,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            max_envelope_size: default_max_envelope_size(),
            peer_events_per_second: None,
            local_peer_id: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Also write logs to `<data_dir>/logs/<component>.log`
    #[serde(default)]
    pub file: bool,

    /// Write the log file here instead of under the data directory
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResbusConfig {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Resources started by the runner, in this order
    #[serde(default)]
    pub autostart: Vec<String>,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub pending: PendingConfig,

    #[serde(default)]
    pub net: NetConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for ResbusConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            autostart: Vec::new(),
            queue: QueueConfig::default(),
            pending: PendingConfig::default(),
            net: NetConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ResbusConfig {
    pub fn config_path() -> Option<PathBuf> {
        ProjectPaths::new(APP_NAME).map(|p| p.config_dir().join("config.toml"))
    }

    pub fn load() -> Result<Self, ConfigLoadError> {
        let path = Self::config_path().ok_or(ConfigLoadError::NotFound)?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigLoadError> {
        if !path.exists() {
            return Err(ConfigLoadError::NotFound);
        }

        let content =
            fs::read_to_string(path).map_err(|e| ConfigLoadError::IoError(e.to_string()))?;
        let config =
            toml::from_str(&content).map_err(|e| ConfigLoadError::ParseError(e.to_string()))?;
        info!(target: "runner", "Loaded config from {}", path.display());
        Ok(config)
    }

    /// Load the config file, or the defaults if there is none
    pub fn load_or_default() -> anyhow::Result<Self> {
        match Self::load() {
            Ok(config) => Ok(config),
            Err(ConfigLoadError::NotFound) => {
                info!(target: "runner", "No config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e).context("loading resbus config"),
        }
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let path = Self::config_path().context("could not determine config directory")?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let content = toml::to_string_pretty(&self)?;
        fs::write(path, content).with_context(|| format!("writing {}", path.display()))?;
        info!(target: "runner", "Saved config to {}", path.display());
        Ok(())
    }

    /// Install the global subscriber as the `[logging]` section asks
    ///
    /// Keep the returned guard alive while file logging is wanted.
    pub fn init_logging(&self, component_name: &str) -> io::Result<Option<WorkerGuard>> {
        match (self.logging.file, self.logging.directory.as_deref()) {
            (false, _) => crate::logging::init_logging_in(component_name, None),
            (true, Some(dir)) => crate::logging::init_logging_in(component_name, Some(dir)),
            (true, None) => crate::logging::init_logging(component_name, true),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn host_options(&self) -> HostOptions {
        HostOptions {
            queue_limit: QueueLimit::from(self.queue.max_depth),
            pending_timeout: Duration::from_millis(self.pending.default_timeout_ms),
            local_peer: PeerId(self.net.local_peer_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config: ResbusConfig = toml::from_str("").unwrap();
        assert_eq!(config, ResbusConfig::default());
        assert_eq!(config.tick_interval(), Duration::from_millis(16));

        let options = config.host_options();
        assert_eq!(options.queue_limit, QueueLimit::Unbounded);
        assert_eq!(options.pending_timeout, Duration::from_secs(30));
        assert_eq!(options.local_peer, PeerId::SERVER);
    }

    #[test]
    fn test_partial_sections() {
        let config: ResbusConfig = toml::from_str(
            r#"
            tick_interval_ms = 50
            autostart = ["chat", "map"]

            [queue]
            max_depth = 4096

            [net]
            peer_events_per_second = 20
            "#,
        )
        .unwrap();

        assert_eq!(config.tick_interval_ms, 50);
        assert_eq!(config.autostart, vec!["chat", "map"]);
        assert_eq!(config.host_options().queue_limit, QueueLimit::MaxDepth(4096));
        assert_eq!(config.net.peer_events_per_second, Some(20));
        assert_eq!(config.net.max_envelope_size, DEFAULT_MAX_ENVELOPE_SIZE);
        assert_eq!(config.pending.default_timeout_ms, 30_000);
        assert!(!config.logging.file);
    }
}
