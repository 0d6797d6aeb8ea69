// src/types.rs
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of the device link as observed through data liveness.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No session is open.
    #[default]
    Disconnected,
    /// A session is open but no live data has been seen yet.
    Connecting,
    /// The board is streaming values that keep changing.
    Connected,
    /// Data went stale; the session is kept open while we wait for it to recover.
    Reconnecting,
}

impl ConnectionState {
    /// Whether channel data from this state may feed the classifier.
    pub fn is_streaming(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Reconnecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(label)
    }
}

/// How a window of raw samples is reduced to one reading.
///
/// - `Average`: mean of the window. Usually the best option; sensitivity 200-500.
/// - `Max`: largest absolute value in the window. Sensitivity 50-200, slightly more latency.
/// - `Last`: newest sample only. Latency diagnostics; sensitivity has no effect.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub enum ThresholdType {
    #[default]
    Average,
    Max,
    Last,
}

impl fmt::Display for ThresholdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ThresholdType::Average => "average",
            ThresholdType::Max => "max",
            ThresholdType::Last => "last",
        };
        f.write_str(label)
    }
}

/// Where a session is opened.
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum Target {
    Serial { port: String },
    Wireless { device_name: Option<String>, port: u16 },
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Serial { port } => write!(f, "{port}"),
            Target::Wireless {
                device_name: Some(name),
                port,
            } => write!(f, "wifi:{name}:{port}"),
            Target::Wireless {
                device_name: None,
                port,
            } => write!(f, "wifi:{port}"),
        }
    }
}
