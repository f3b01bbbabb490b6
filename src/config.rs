//! Configuration file
//!
//! Everything lives in one TOML document, `config.toml` under the user's config
//! directory. Missing sections fall back to their defaults, so an absent file is a
//! valid (empty) configuration.

use crate::devices::channel::VirtualSlot;
use crate::devices::dispatch::DispatchSettings;
use crate::devices::encoding::AxisEncoding;
use crate::engine::routes::{Command, Trigger};
use crate::feedback::BindingMode;
use crate::platform::loopback::{LoopbackLayout, VIRTUAL_DEVICE_NAME};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const CONFIG_DIR: &str = "stickbridge";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Where the binding manifest is written after startup.
    pub manifest_path: Option<PathBuf>,
    pub engine: EngineSettings,
    pub platform: PlatformConfig,
    pub telemetry: TelemetryConfig,
    pub controls: Vec<ControlConfig>,
    pub routes: Vec<RouteConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct EngineSettings {
    pub pulse_duration_ms: u64,
    pub axis_encoding: AxisEncoding,
    /// Capacity of the dispatch and telemetry queues.
    pub queue_capacity: usize,
    pub poll_interval_ms: u64,
    pub stats_interval_secs: i64,
    /// Virtual slots the allocator never picks.
    pub ignored_slots: Vec<VirtualSlot>,
    /// Feedback switches are allocated below this button index.
    pub feedback_button_ceiling: u8,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            pulse_duration_ms: 100,
            axis_encoding: AxisEncoding::default(),
            queue_capacity: 1000,
            poll_interval_ms: 50,
            stats_interval_secs: 10,
            ignored_slots: Vec::new(),
            feedback_button_ceiling: 32,
        }
    }
}

impl EngineSettings {
    pub fn pulse_duration(&self) -> Duration {
        Duration::from_millis(self.pulse_duration_ms)
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            stats_interval: chrono::Duration::seconds(self.stats_interval_secs.max(1)),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Gilrs,
    Loopback,
}

impl Default for Backend {
    fn default() -> Self {
        if cfg!(feature = "gilrs") {
            Backend::Gilrs
        } else {
            Backend::Loopback
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct PlatformConfig {
    pub backend: Backend,
    /// Simulated devices. With gilrs, only the virtual part is used.
    pub loopback: LoopbackLayout,
    /// Name the OS reports for virtual joysticks, hidden from the gilrs device list.
    pub virtual_device_name: String,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            loopback: LoopbackLayout::default(),
            virtual_device_name: VIRTUAL_DEVICE_NAME.to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Flag name to bit index in the status word.
    pub flags: BTreeMap<String, u8>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogicalKind {
    Axis,
    Button,
    FeedbackSwitch,
}

/// One named logical output.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct ControlConfig {
    pub name: String,
    pub kind: LogicalKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flag: Option<String>,
    #[serde(default)]
    pub mode: BindingMode,
    /// Explicit placement, both `slot` and `index` or neither.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<VirtualSlot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u8>,
}

/// Physical channel to logical output.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct RouteConfig {
    /// Product name or GUID.
    pub device: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub button: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub axis: Option<u8>,
    pub trigger: Trigger,
    pub command: Command,
    pub target: String,
}

impl Config {
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn default_path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| {
            warn!("Could not determine config directory, using current directory");
            PathBuf::from(".")
        });
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    /// Load `path`, or the default location. A missing file yields the defaults.
    pub async fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map_or_else(Self::default_path, Path::to_path_buf);
        let exists = tokio::fs::try_exists(&path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
        if !exists {
            warn!("No configuration at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
        let config = Self::from_toml(&content)?;
        info!(
            "Loaded {} with {} control(s) and {} route(s)",
            path.display(),
            config.controls.len(),
            config.routes.len()
        );
        debug!("Configuration: {:?}", config);
        Ok(config)
    }
}
