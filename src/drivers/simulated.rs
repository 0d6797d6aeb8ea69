// src/drivers/simulated.rs
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::drivers::error::{ConnectError, FetchError};
use crate::drivers::source::{SampleBatch, SampleSource, Session};
use crate::types::Target;

/// Number of channels on the simulated board (Cyton).
pub const SIMULATED_CHANNELS: usize = 8;

/// Flex switches for the fake muscles, shared with whoever drives the simulation.
#[derive(Clone, Debug)]
pub struct SimulatedMuscles {
    flexed: Arc<[AtomicBool]>,
}

impl SimulatedMuscles {
    pub fn new(num_channels: usize) -> Self {
        Self {
            flexed: (0..num_channels).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    pub fn num_channels(&self) -> usize {
        self.flexed.len()
    }

    /// Flex or relax every simulated muscle.
    pub fn set_all(&self, flexed: bool) {
        for m in self.flexed.iter() {
            m.store(flexed, Ordering::Relaxed);
        }
    }

    /// Out-of-range channels are ignored.
    pub fn set(&self, channel: usize, flexed: bool) {
        if let Some(m) = self.flexed.get(channel) {
            m.store(flexed, Ordering::Relaxed);
        }
    }

    pub fn is_flexed(&self, channel: usize) -> bool {
        self.flexed
            .get(channel)
            .map(|m| m.load(Ordering::Relaxed))
            .unwrap_or(false)
    }
}

/// Deterministic stand-in for the board: uniform noise, doubled while flexed.
pub struct SimulatedSource {
    muscles: SimulatedMuscles,
    seed: u64,
    amplitude: f64,
    flex_gain: f64,
    open_sessions: usize,
}

impl SimulatedSource {
    pub fn new(seed: u64) -> Self {
        Self {
            muscles: SimulatedMuscles::new(SIMULATED_CHANNELS),
            seed,
            amplitude: 1.0,
            flex_gain: 2.0,
            open_sessions: 0,
        }
    }

    pub fn with_amplitude(mut self, amplitude: f64, flex_gain: f64) -> Self {
        self.amplitude = amplitude;
        self.flex_gain = flex_gain;
        self
    }

    pub fn muscles(&self) -> SimulatedMuscles {
        self.muscles.clone()
    }
}

impl SampleSource for SimulatedSource {
    type Session = SimulatedSession;

    fn open(&mut self, target: &Target) -> Result<SimulatedSession, ConnectError> {
        // Each session gets its own stream so reconnects don't replay the same noise.
        let seed = self.seed.wrapping_add(self.open_sessions as u64);
        self.open_sessions += 1;
        log::debug!("simulated board opened on {target} (seed {seed})");
        Ok(SimulatedSession {
            muscles: self.muscles.clone(),
            rng: StdRng::seed_from_u64(seed),
            amplitude: self.amplitude,
            flex_gain: self.flex_gain,
            streaming: false,
            released: false,
        })
    }
}

pub struct SimulatedSession {
    muscles: SimulatedMuscles,
    rng: StdRng,
    amplitude: f64,
    flex_gain: f64,
    streaming: bool,
    released: bool,
}

impl Session for SimulatedSession {
    fn num_channels(&self) -> usize {
        self.muscles.num_channels()
    }

    fn start(&mut self) -> Result<(), ConnectError> {
        self.streaming = true;
        Ok(())
    }

    fn fetch(&mut self, max_samples: usize) -> Result<Option<SampleBatch>, FetchError> {
        if self.released {
            return Err(FetchError::SessionInvalidated(
                "BOARD_NOT_CREATED_ERROR:15".into(),
            ));
        }
        if !self.streaming || max_samples == 0 {
            return Ok(None);
        }
        let channels = self.muscles.num_channels();
        let mut data = Array2::zeros((channels, max_samples));
        for (channel, mut row) in data.rows_mut().into_iter().enumerate() {
            let gain = if self.muscles.is_flexed(channel) {
                self.flex_gain
            } else {
                1.0
            };
            for v in row.iter_mut() {
                *v = self.rng.gen::<f64>() * self.amplitude * gain;
            }
        }
        Ok(Some(SampleBatch::new(data)))
    }

    fn stop(&mut self) -> Result<(), FetchError> {
        self.streaming = false;
        Ok(())
    }

    fn release(&mut self) -> Result<(), FetchError> {
        self.released = true;
        Ok(())
    }
}
