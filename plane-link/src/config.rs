//! Configuration loading for shareplane devices.
//!
//! Configuration is loaded from a TOML file (default: `shareplane.toml`).
//! Every field has a default, so an empty file is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use plane_types::{DeviceId, Encoding, Orientation, ScreenInfo, ServiceId, DEFAULT_SERVICE_ID};
use serde::{Deserialize, Serialize};

use crate::broker::BrokerSettings;
use crate::node::{NodeConfig, PlaneSettings};
use crate::orchestrator::OrchestratorSettings;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Device identity.
    pub node: NodeSection,
    /// Local screen.
    pub screen: ScreenSection,
    /// Plane used when this device becomes Master.
    pub plane: PlaneSection,
    /// Broker and transport tuning.
    pub link: LinkSection,
    /// Discovery and rescan timing.
    pub discovery: DiscoverySection,
    /// Drag coalescing.
    pub drag: DragSection,
}

/// Device identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// Device id (random when unset).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Service id (default: `shareplane/1`).
    #[serde(default = "default_service_id")]
    pub service_id: String,
    /// Orientation of this device's own viewport (default: normal).
    #[serde(default = "default_orientation")]
    pub orientation: String,
}

/// Local screen description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenSection {
    /// Width in dp (default: 400).
    #[serde(default = "default_screen_width")]
    pub width_dp: f64,
    /// Height in dp (default: 480).
    #[serde(default = "default_screen_height")]
    pub height_dp: f64,
    /// Pixels per dp (default: 2.0).
    #[serde(default = "default_density")]
    pub density: f64,
}

/// Plane parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaneSection {
    /// Width in VU (default: 2000).
    #[serde(default = "default_plane_width")]
    pub width_vu: f64,
    /// Height in VU (default: 1200).
    #[serde(default = "default_plane_height")]
    pub height_vu: f64,
    /// dp per VU on every device (default: 0.4).
    #[serde(default = "default_global_scale")]
    pub global_scale_dp_per_vu: f64,
}

/// Broker and transport tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSection {
    /// TCP bind address for the Master listener (default: 0.0.0.0:7117).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Broker event channel capacity (default: 1024).
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Frames queued per peer before it is dropped (default: 256).
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,
    /// Candidate probe timeout in milliseconds (default: 2000).
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// `compact` or `msgpack` (default: compact).
    #[serde(default = "default_encoding")]
    pub encoding: String,
}

/// Discovery timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySection {
    /// Scan window in milliseconds (default: 3000).
    #[serde(default = "default_scan_window_ms")]
    pub scan_window_ms: u64,
    /// Rescan interval in seconds while Master with no peers (default: 8).
    #[serde(default = "default_rescan_interval_secs")]
    pub rescan_interval_secs: u64,
    /// Maximum rescan jitter in milliseconds (default: 2000).
    #[serde(default = "default_rescan_jitter_ms")]
    pub rescan_jitter_ms: u64,
    /// Addresses to probe, in order.
    #[serde(default)]
    pub candidates: Vec<String>,
}

/// Drag coalescing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DragSection {
    /// Flush interval in milliseconds; 0 sends every move (default: 16).
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

// Default value functions
fn default_service_id() -> String {
    DEFAULT_SERVICE_ID.to_string()
}

fn default_orientation() -> String {
    "normal".to_string()
}

fn default_screen_width() -> f64 {
    400.0
}

fn default_screen_height() -> f64 {
    480.0
}

fn default_density() -> f64 {
    2.0
}

fn default_plane_width() -> f64 {
    2000.0
}

fn default_plane_height() -> f64 {
    1200.0
}

fn default_global_scale() -> f64 {
    0.4
}

fn default_bind_address() -> String {
    "0.0.0.0:7117".to_string()
}

fn default_event_capacity() -> usize {
    1024
}

fn default_outbound_capacity() -> usize {
    256
}

fn default_probe_timeout_ms() -> u64 {
    2000
}

fn default_encoding() -> String {
    "compact".to_string()
}

fn default_scan_window_ms() -> u64 {
    3000
}

fn default_rescan_interval_secs() -> u64 {
    8
}

fn default_rescan_jitter_ms() -> u64 {
    2000
}

fn default_flush_interval_ms() -> u64 {
    16 // ~60 fps
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            device_id: None,
            service_id: default_service_id(),
            orientation: default_orientation(),
        }
    }
}

impl Default for ScreenSection {
    fn default() -> Self {
        Self {
            width_dp: default_screen_width(),
            height_dp: default_screen_height(),
            density: default_density(),
        }
    }
}

impl Default for PlaneSection {
    fn default() -> Self {
        Self {
            width_vu: default_plane_width(),
            height_vu: default_plane_height(),
            global_scale_dp_per_vu: default_global_scale(),
        }
    }
}

impl Default for LinkSection {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            event_capacity: default_event_capacity(),
            outbound_capacity: default_outbound_capacity(),
            probe_timeout_ms: default_probe_timeout_ms(),
            encoding: default_encoding(),
        }
    }
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            scan_window_ms: default_scan_window_ms(),
            rescan_interval_secs: default_rescan_interval_secs(),
            rescan_jitter_ms: default_rescan_jitter_ms(),
            candidates: Vec::new(),
        }
    }
}

impl Default for DragSection {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

impl Config {
    /// Load and validate configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values no device could run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("screen.width_dp", self.screen.width_dp),
            ("screen.height_dp", self.screen.height_dp),
            ("screen.density", self.screen.density),
            ("plane.width_vu", self.plane.width_vu),
            ("plane.height_vu", self.plane.height_vu),
            ("plane.global_scale_dp_per_vu", self.plane.global_scale_dp_per_vu),
        ];
        for (field, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "{field} must be positive, got {value}"
                )));
            }
        }
        if self.link.event_capacity == 0 || self.link.outbound_capacity == 0 {
            return Err(ConfigError::Invalid(
                "link capacities must be at least 1".to_string(),
            ));
        }
        if self.node.service_id.is_empty() {
            return Err(ConfigError::Invalid("node.service_id is empty".to_string()));
        }
        self.orientation()?;
        self.encoding()?;
        Ok(())
    }

    /// Parsed `node.orientation`.
    pub fn orientation(&self) -> Result<Orientation, ConfigError> {
        self.node
            .orientation
            .parse()
            .map_err(ConfigError::Invalid)
    }

    /// Parsed `link.encoding`.
    pub fn encoding(&self) -> Result<Encoding, ConfigError> {
        match self.link.encoding.to_ascii_lowercase().as_str() {
            "compact" => Ok(Encoding::Compact),
            "msgpack" | "messagepack" => Ok(Encoding::MessagePack),
            other => Err(ConfigError::Invalid(format!("unknown encoding: {other}"))),
        }
    }

    /// Screen as a wire record.
    pub fn screen_info(&self) -> ScreenInfo {
        ScreenInfo {
            width_dp: self.screen.width_dp,
            height_dp: self.screen.height_dp,
            density: self.screen.density,
        }
    }

    /// Build the node configuration. A missing device id gets a random one.
    pub fn to_node_config(&self) -> Result<NodeConfig, ConfigError> {
        let device_id = self
            .node
            .device_id
            .as_deref()
            .map(DeviceId::new)
            .unwrap_or_else(DeviceId::random);
        Ok(NodeConfig {
            device_id,
            service: ServiceId::new(&self.node.service_id),
            screen: self.screen_info(),
            orientation: self.orientation()?,
            plane: PlaneSettings {
                width_vu: self.plane.width_vu,
                height_vu: self.plane.height_vu,
                global_scale_dp_per_vu: self.plane.global_scale_dp_per_vu,
            },
            drag_flush_interval: Duration::from_millis(self.drag.flush_interval_ms),
            broker: BrokerSettings {
                event_capacity: self.link.event_capacity,
                outbound_capacity: self.link.outbound_capacity,
                encoding: self.encoding()?,
                ..BrokerSettings::default()
            },
            event_capacity: 256,
        })
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Orchestrator timing.
    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            scan_window: Duration::from_millis(self.discovery.scan_window_ms),
            probe_timeout: Duration::from_millis(self.link.probe_timeout_ms),
            rescan_interval: Duration::from_secs(self.discovery.rescan_interval_secs),
            rescan_jitter: Duration::from_millis(self.discovery.rescan_jitter_ms),
        }
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.node.service_id, "shareplane/1");
        assert_eq!(config.link.bind_address, "0.0.0.0:7117");
        assert_eq!(config.drag.flush_interval_ms, 16);
    }

    #[test]
    fn empty_toml_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.plane.width_vu, 2000.0);
        assert_eq!(config.discovery.rescan_interval_secs, 8);
        assert!(config.discovery.candidates.is_empty());
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
[node]
device_id = "tablet-a"
orientation = "rotated_90"

[screen]
width_dp = 800
height_dp = 1280
density = 2.5

[link]
encoding = "msgpack"

[discovery]
candidates = ["192.168.1.20:7117"]
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        let node = config.to_node_config().unwrap();
        assert_eq!(node.device_id, DeviceId::new("tablet-a"));
        assert_eq!(node.orientation, Orientation::Rotated90);
        assert_eq!(node.screen.width_dp, 800.0);
        assert_eq!(node.broker.encoding, Encoding::MessagePack);
        assert_eq!(config.discovery.candidates, vec!["192.168.1.20:7117"]);
    }

    #[test]
    fn missing_device_id_is_random() {
        let config = Config::default();
        let a = config.to_node_config().unwrap();
        let b = config.to_node_config().unwrap();
        assert_ne!(a.device_id, b.device_id);
    }

    #[test]
    fn non_positive_scale_rejected() {
        let toml = r#"
[plane]
global_scale_dp_per_vu = 0
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn unknown_encoding_rejected() {
        let mut config = Config::default();
        config.link.encoding = "json".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_file_reads_and_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[screen]\nwidth_dp = 360").unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.screen.width_dp, 360.0);

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        writeln!(bad, "[screen]\ndensity = -1").unwrap();
        assert!(matches!(
            Config::from_file(bad.path()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn missing_file_is_read_error() {
        let err = Config::from_file(Path::new("/nonexistent/shareplane.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
    }

    #[test]
    fn rendered_toml_parses_back() {
        let mut config = Config::default();
        config.node.device_id = Some("desk".into());
        let text = config.to_toml().unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.node.device_id.as_deref(), Some("desk"));
        assert_eq!(parsed.plane.global_scale_dp_per_vu, 0.4);
    }

    #[test]
    fn orchestrator_settings_convert_units() {
        let settings = Config::default().orchestrator_settings();
        assert_eq!(settings.scan_window, Duration::from_secs(3));
        assert_eq!(settings.rescan_interval, Duration::from_secs(8));
    }
}
