// src/lib.rs
//! EMG/EEG input for games and controllers.
//!
//! Turns raw OpenBCI sample batches into per-channel "is this muscle flexed"
//! booleans, supervises a flaky serial/WiFi link by watching whether data
//! keeps changing, and runs a guided rest/flex calibration to pick thresholds.
//!
//! ```no_run
//! use bci_input::{BciInput, BciReader, ReaderConfig, SimulatedSource};
//! use std::time::Instant;
//!
//! let mut reader = BciReader::new(SimulatedSource::new(7), ReaderConfig::default());
//! reader.connect(Instant::now())?;
//! loop {
//!     reader.tick(Instant::now())?;
//!     if reader.read_bool(0) {
//!         // steer left
//!     }
//! #   break;
//! }
//! # Ok::<(), bci_input::ReaderError>(())
//! ```

/// `info!` that only fires when the reader is verbose. Warnings and errors
/// go through `log` directly.
macro_rules! chatter {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            log::info!($($arg)+);
        }
    };
}

pub mod calibration;
pub mod classifier;
pub mod config;
pub mod connection;
pub mod drivers;
pub mod keybind;
pub mod reader;
pub mod recorder;
pub mod refresh;
pub mod types;

pub use calibration::{CalibrationPhase, CalibrationReport, CalibrationStatus, Calibrator, ChannelFit};
pub use classifier::ChannelClassifier;
pub use config::ReaderConfig;
pub use connection::{ConnectionManager, LivenessTracker};
pub use drivers::{
    BrainFlowSource, CalibrationError, ConnectError, FetchError, ManualSession, ManualSource,
    ReaderError, SampleBatch, SampleSource, Session, SettingError, SimulatedMuscles,
    SimulatedSource,
};
pub use keybind::KeybindMap;
pub use reader::{BciInput, BciReader};
pub use recorder::ReadingRecorder;
pub use refresh::{RefreshProbe, RefreshRating, RefreshReport};
pub use types::{ConnectionState, Target, ThresholdType};
