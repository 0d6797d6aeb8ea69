// src/drivers/error.rs
use thiserror::Error;

use crate::types::ConnectionState;

/// Why a session could not be opened or started on one target.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConnectError {
    /// Port or address busy or missing; the next candidate may work.
    #[error("transport unavailable on {target}: {detail}")]
    TransportUnavailable { target: String, detail: String },
    /// The dongle answered but the board did not; power-cycling usually helps.
    #[error("board not ready on {target}: {detail}")]
    DeviceNotReady { target: String, detail: String },
    /// Another process already holds the board.
    #[error("board on {target} is held by another session: {detail}")]
    DeviceLocked { target: String, detail: String },
    #[error("unrecognized failure on {target}: {detail}")]
    Unrecognized { target: String, detail: String },
}

impl ConnectError {
    pub fn target(&self) -> &str {
        match self {
            ConnectError::TransportUnavailable { target, .. }
            | ConnectError::DeviceNotReady { target, .. }
            | ConnectError::DeviceLocked { target, .. }
            | ConnectError::Unrecognized { target, .. } => target,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ConnectError::Unrecognized { .. })
    }
}

/// Failure while talking to an already opened session.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FetchError {
    /// The session silently died underneath us.
    #[error("session is no longer valid: {0}")]
    SessionInvalidated(String),
    #[error("unrecognized session failure: {0}")]
    Unrecognized(String),
}

/// Rejected configuration change; the previous value is kept.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SettingError {
    #[error("channel {channel} out of range (device has {num_channels} channels)")]
    ChannelOutOfRange { channel: usize, num_channels: usize },
    #[error("sensitivity {value} out of range [{min}, {max}]")]
    SensitivityOutOfRange { value: usize, min: usize, max: usize },
    #[error("threshold must be a finite number, got {0}")]
    InvalidThreshold(f64),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("calibration is already running")]
    AlreadyRunning,
    #[error("no channels available to calibrate")]
    NoChannels,
    /// Readings are only live while the link is connected or recovering.
    #[error("cannot calibrate while the link is {0}")]
    NotStreaming(ConnectionState),
    #[error("channel {channel} collected no {class} samples")]
    InsufficientSamples { channel: usize, class: &'static str },
    #[error("channel {channel} rest and flex readings cannot be told apart (both near {value})")]
    Degenerate { channel: usize, value: f64 },
    #[error("channel count changed during calibration: expected {expected}, got {actual}")]
    Interrupted { expected: usize, actual: usize },
}

/// Errors that escape the reader. Everything else is folded into state.
#[derive(Debug, Error)]
pub enum ReaderError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Setting(#[from] SettingError),
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
}
