// src/drivers/mod.rs
pub mod brainflow;
pub mod error;
pub mod simulated;
pub mod source;

pub use brainflow::{BrainFlowSession, BrainFlowSource};
pub use error::{CalibrationError, ConnectError, FetchError, ReaderError, SettingError};
pub use simulated::{SimulatedMuscles, SimulatedSession, SimulatedSource};
pub use source::{
    release_logged, ManualSession, ManualSource, SampleBatch, SampleSource, Session, SessionFeed, SessionStats,
};
