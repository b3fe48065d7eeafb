use handycon_common::{tracing, PowerKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::DaemonError;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/handycon/config.yaml";

/// Configuration manager for the handycon daemon
pub struct ConfigManager {
    pub config_path: PathBuf,
    pub config: DaemonConfig,
}

/// Daemon configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub daemon: DaemonSettings,
    pub quirks: QuirkSettings,
    pub watcher: WatcherSettings,
    pub power: PowerSettings,
    pub feedback: FeedbackSettings,
}

/// Daemon-specific settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    pub socket_path: String,
    pub socket_group: String,
    pub log_level: String,
}

/// Where quirk profiles come from and how the hardware is identified
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct QuirkSettings {
    /// Directories of YAML profiles, searched before the built-in table
    pub profile_dirs: Vec<String>,
    /// Use this product name instead of the DMI value
    pub product_override: Option<String>,
}

/// Device watcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherSettings {
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub event_queue_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerBackendKind {
    Logind,
    Systemctl,
}

/// Power button and suspend handling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerSettings {
    /// Replaces the kind of every power request coming from the profile
    pub action: Option<PowerKind>,
    pub backend: PowerBackendKind,
    pub command_timeout_ms: u64,
}

/// Haptic and LED feedback settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackSettings {
    pub haptics: bool,
    /// Replay rumble that games send to the virtual controller on the gamepad
    pub forward_rumble: bool,
    pub rumble_ms: u64,
    /// sysfs `multi_intensity` file of the controller LED
    pub led_path: Option<String>,
    pub mode_colors: Vec<ModeColor>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModeColor {
    pub mode: String,
    pub color: [u8; 3],
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            socket_path: "/run/handycon/handycon.sock".to_string(),
            socket_group: "input".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            backoff_initial_ms: 250,
            backoff_max_ms: 5000,
            event_queue_size: 1024,
        }
    }
}

impl WatcherSettings {
    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms.max(1))
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms.max(self.backoff_initial_ms).max(1))
    }
}

impl Default for PowerSettings {
    fn default() -> Self {
        Self {
            action: None,
            backend: PowerBackendKind::Logind,
            command_timeout_ms: 10_000,
        }
    }
}

impl Default for FeedbackSettings {
    fn default() -> Self {
        Self {
            haptics: true,
            forward_rumble: true,
            rumble_ms: 150,
            led_path: None,
            mode_colors: Vec::new(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            daemon: DaemonSettings::default(),
            quirks: QuirkSettings::default(),
            watcher: WatcherSettings::default(),
            power: PowerSettings::default(),
            feedback: FeedbackSettings::default(),
        }
    }
}

impl ConfigManager {
    /// Create a configuration manager for the given file, holding defaults until loaded
    pub fn new<P: AsRef<Path>>(config_path: P) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
            config: DaemonConfig::default(),
        }
    }

    /// Load configuration from disk, writing the defaults if the file is missing
    pub async fn load_config(&mut self) -> Result<(), DaemonError> {
        info!("Loading configuration from {}", self.config_path.display());

        if self.config_path.exists() {
            let content = fs::read_to_string(&self.config_path)
                .await
                .map_err(|e| self.error(e.to_string()))?;
            self.config = serde_yaml::from_str(&content).map_err(|e| self.error(e.to_string()))?;
            debug!("Loaded configuration from disk");
        } else {
            warn!("Configuration file not found, using defaults");
            if let Err(e) = self.save_config().await {
                // A read-only /etc must not keep the daemon from starting
                warn!("Could not write default configuration: {}", e);
            }
        }

        Ok(())
    }

    /// Save configuration to disk
    pub async fn save_config(&self) -> Result<(), DaemonError> {
        info!("Saving configuration to {}", self.config_path.display());

        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let content = serde_yaml::to_string(&self.config).map_err(|e| self.error(e.to_string()))?;
        fs::write(&self.config_path, content).await?;

        debug!("Configuration saved");
        Ok(())
    }

    /// Get a reference to the configuration
    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    fn error(&self, reason: String) -> DaemonError {
        DaemonError::Config {
            path: self.config_path.clone(),
            reason,
        }
    }
}
