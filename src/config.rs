// src/config.rs
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::types::ThresholdType;

/// Smallest accepted sensitivity (samples per aggregation).
pub const MIN_SENSITIVITY: usize = 1;
/// Largest accepted sensitivity; also caps how many samples one fetch asks for.
pub const MAX_SENSITIVITY: usize = 1000;

#[cfg(windows)]
const DEFAULT_PORT_PREFIX: &str = "COM";
#[cfg(not(windows))]
const DEFAULT_PORT_PREFIX: &str = "/dev/ttyUSB";

/// Everything the reader needs to know up front. Loadable from JSON; missing
/// fields fall back to the defaults below.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    pub verbose: bool,
    pub link: LinkConfig,
    pub liveness: LivenessConfig,
    pub classifier: ClassifierConfig,
    pub calibration: CalibrationConfig,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            link: LinkConfig::default(),
            liveness: LivenessConfig::default(),
            classifier: ClassifierConfig::default(),
            calibration: CalibrationConfig::default(),
        }
    }
}

impl ReaderConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }
}

/// How candidate targets are chosen.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// When set, only this port is tried.
    pub default_address: Option<String>,
    /// Ask the OS for serial ports before falling back to `port_prefix` + index.
    pub enumerate_ports: bool,
    pub port_prefix: String,
    /// How many candidates to probe when scanning.
    pub scan_limit: usize,
    pub allow_wireless: bool,
    /// WiFi shield name, usually "OpenBCI-XXXX".
    pub wireless_device_name: Option<String>,
    pub wireless_port: u16,
    pub serial_board_id: i32,
    pub wireless_board_id: i32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            default_address: None,
            enumerate_ports: false,
            port_prefix: DEFAULT_PORT_PREFIX.to_owned(),
            scan_limit: 10,
            allow_wireless: false,
            wireless_device_name: None,
            wireless_port: 4000,
            serial_board_id: 0,
            wireless_board_id: 5,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Which channel's newest sample is watched for change.
    pub reference_channel: usize,
    /// Smallest change that counts as new data.
    pub epsilon: f64,
    pub stall_after_ms: u64,
    pub disconnect_after_ms: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            reference_channel: 0,
            epsilon: 0.01,
            stall_after_ms: 5_000,
            disconnect_after_ms: 10_000,
        }
    }
}

impl LivenessConfig {
    pub fn stall_after(&self) -> Duration {
        Duration::from_millis(self.stall_after_ms)
    }

    pub fn disconnect_after(&self) -> Duration {
        Duration::from_millis(self.disconnect_after_ms)
    }
}

/// Values new channels start with.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub threshold: f64,
    pub threshold_type: ThresholdType,
    pub sensitivity: usize,
    /// Auto resting threshold = current reading x margin.
    pub resting_margin: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            threshold: 0.0,
            threshold_type: ThresholdType::Average,
            sensitivity: 500,
            resting_margin: 1.2,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Length of each rest/flex phase; the first half is settle time.
    pub phase_duration_ms: u64,
    /// Bisection stops once the interval is narrower than this.
    pub search_epsilon: f64,
    /// Rest bound is this percentile of rest readings; flex bound is the mirror percentile.
    pub robust_percentile: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            phase_duration_ms: 6_000,
            search_epsilon: 1e-10,
            robust_percentile: 0.9,
        }
    }
}

impl CalibrationConfig {
    pub fn phase_duration(&self) -> Duration {
        Duration::from_millis(self.phase_duration_ms)
    }
}
