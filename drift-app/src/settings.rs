//! User settings persistence via TOML.
//!
//! Settings are stored at `<config_dir>/drift/settings.toml`.
//! Missing or corrupted config files return sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use drift_files::receiver::DEFAULT_MAX_FILE_SIZE;
use drift_files::sender::{CONNECT_TIMEOUT, STREAM_OPEN_TIMEOUT};
use drift_files::spool::DEFAULT_MEMORY_LIMIT;
use drift_files::{ReceiveLimits, ServiceConfig, SpoolConfig, Timeouts};
use serde::{Deserialize, Serialize};

/// User-configurable settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory for spooled inbound payloads.
    pub storage_dir: PathBuf,
    /// Largest payload held in memory when the spool directory is unusable.
    pub memory_spool_limit: u64,
    /// Largest file accepted from a peer.
    pub max_file_size: u64,
    pub connect_timeout_secs: u64,
    pub stream_open_timeout_secs: u64,
    /// Lifetime of a short code.
    pub code_ttl_secs: u64,
    /// How often the idle watchdog checks for active transfers.
    pub watchdog_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        let storage_dir = directories::ProjectDirs::from("", "", "drift")
            .map(|d| d.data_dir().join("spool"))
            .unwrap_or_else(|| PathBuf::from("drift-spool"));

        Self {
            storage_dir,
            memory_spool_limit: DEFAULT_MEMORY_LIMIT,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            connect_timeout_secs: CONNECT_TIMEOUT.as_secs(),
            stream_open_timeout_secs: STREAM_OPEN_TIMEOUT.as_secs(),
            code_ttl_secs: drift_net::CODE_TTL.as_secs(),
            watchdog_interval_secs: 300,
        }
    }
}

impl Settings {
    /// Load settings from the default config path.
    ///
    /// Returns defaults if the file doesn't exist or is corrupted.
    pub fn load() -> Self {
        Self::load_from_dir(Self::config_dir())
    }

    /// Save settings to the default config path.
    pub fn save(&self) -> Result<PathBuf> {
        self.save_to_dir(Self::config_dir())
    }

    /// Load settings from a specific config directory.
    pub fn load_from_dir(config_dir: PathBuf) -> Self {
        let path = config_dir.join("settings.toml");
        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(settings) => {
                    tracing::info!(path = %path.display(), "settings loaded");
                    settings
                }
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "corrupted settings file, using defaults"
                    );
                    Self::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(
                    path = %path.display(),
                    "settings file not found, using defaults"
                );
                Self::default()
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to read settings file, using defaults"
                );
                Self::default()
            }
        }
    }

    /// Save settings to a specific config directory, returning the file path.
    pub fn save_to_dir(&self, config_dir: PathBuf) -> Result<PathBuf> {
        std::fs::create_dir_all(&config_dir).with_context(|| {
            format!(
                "failed to create config directory: {}",
                config_dir.display()
            )
        })?;

        let path = config_dir.join("settings.toml");
        let contents = toml::to_string_pretty(self).context("failed to serialize settings")?;
        std::fs::write(&path, &contents)
            .with_context(|| format!("failed to write settings file: {}", path.display()))?;

        tracing::info!(path = %path.display(), "settings saved");
        Ok(path)
    }

    /// Where settings are read from and written to.
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("settings.toml")
    }

    fn config_dir() -> PathBuf {
        directories::ProjectDirs::from("", "", "drift")
            .map(|d| d.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("drift-config"))
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: Duration::from_secs(self.connect_timeout_secs),
            stream_open: Duration::from_secs(self.stream_open_timeout_secs),
        }
    }

    pub fn code_ttl(&self) -> Duration {
        Duration::from_secs(self.code_ttl_secs)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs.max(1))
    }

    /// File service configuration. `memory_only` ignores `storage_dir`.
    pub fn service_config(&self, memory_only: bool) -> ServiceConfig {
        let spool = if memory_only {
            SpoolConfig::memory_only()
        } else {
            SpoolConfig::persistent(&self.storage_dir)
        };
        ServiceConfig {
            spool: spool.with_memory_limit(self.memory_spool_limit),
            limits: ReceiveLimits {
                max_file_size: self.max_file_size,
            },
            timeouts: self.timeouts(),
        }
    }
}
