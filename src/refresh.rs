// src/refresh.rs
use std::fmt;
use std::time::{Duration, Instant};

use ndarray::s;

use crate::drivers::SampleBatch;

const REFERENCE_FPS: f64 = 30.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshRating {
    Unreal,
    VeryGood,
    Good,
    Acceptable,
    Uncomfortable,
    Noticeable,
    Terrible,
    Abysmal,
}

impl RefreshRating {
    pub fn from_frames_of_lag(frames: u32) -> Self {
        match frames {
            0 => RefreshRating::Unreal,
            1 => RefreshRating::VeryGood,
            2 => RefreshRating::Good,
            3..=5 => RefreshRating::Acceptable,
            6..=9 => RefreshRating::Uncomfortable,
            10..=14 => RefreshRating::Noticeable,
            15..=29 => RefreshRating::Terrible,
            _ => RefreshRating::Abysmal,
        }
    }
}

impl fmt::Display for RefreshRating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RefreshRating::Unreal => "UNREAL",
            RefreshRating::VeryGood => "VERY GOOD",
            RefreshRating::Good => "GOOD",
            RefreshRating::Acceptable => "ACCEPTABLE",
            RefreshRating::Uncomfortable => "UNCOMFORTABLE",
            RefreshRating::Noticeable => "NOTICEABLE",
            RefreshRating::Terrible => "TERRIBLE",
            RefreshRating::Abysmal => "ABYSMAL",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RefreshReport {
    /// Time until every compared sample had been replaced.
    pub elapsed: Duration,
    /// Whole frames of input lag at 30 fps.
    pub frames_of_lag: u32,
    pub rating: RefreshRating,
}

impl RefreshReport {
    pub fn from_elapsed(elapsed: Duration) -> Self {
        let frames_of_lag = (elapsed.as_secs_f64() * REFERENCE_FPS).floor() as u32;
        Self {
            elapsed,
            frames_of_lag,
            rating: RefreshRating::from_frames_of_lag(frames_of_lag),
        }
    }
}

impl fmt::Display for RefreshReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "refresh rate {} (less than {} frames of input lag at 30 fps)",
            self.rating, self.frames_of_lag
        )
    }
}

/// Measures how long the board takes to replace a whole window of samples.
///
/// The first batch becomes the baseline. Later batches compare the newest
/// `window` samples of the reference channel against it; once every one of
/// them differs by more than `epsilon`, the elapsed time is reported.
pub struct RefreshProbe {
    channel: usize,
    window: usize,
    epsilon: f64,
    baseline: Option<(Vec<f64>, Instant)>,
    progress: f64,
    report: Option<RefreshReport>,
}

impl RefreshProbe {
    pub fn new(channel: usize, window: usize, epsilon: f64) -> Self {
        Self {
            channel,
            window: window.max(1),
            epsilon,
            baseline: None,
            progress: 0.0,
            report: None,
        }
    }

    pub fn reset(&mut self) {
        self.baseline = None;
        self.progress = 0.0;
        self.report = None;
    }

    /// Fraction of the window that had changed at the last comparison.
    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn report(&self) -> Option<RefreshReport> {
        self.report
    }

    pub fn observe(&mut self, now: Instant, batch: &SampleBatch) -> Option<RefreshReport> {
        if self.report.is_some() {
            return self.report;
        }
        let row = batch.row(self.channel)?;
        let take = self.window.min(row.len());
        if take == 0 {
            return None;
        }
        let tail: Vec<f64> = row.slice(s![row.len() - take..]).to_vec();

        let Some((baseline, since)) = &self.baseline else {
            self.baseline = Some((tail, now));
            return None;
        };
        let compared = take.min(baseline.len());
        let base_tail = &baseline[baseline.len() - compared..];
        let new_tail = &tail[tail.len() - compared..];
        let differing = base_tail
            .iter()
            .zip(new_tail)
            .filter(|(a, b)| (*a - *b).abs() > self.epsilon)
            .count();
        self.progress = differing as f64 / self.window as f64;
        if differing == compared && compared == self.window {
            let report = RefreshReport::from_elapsed(now.saturating_duration_since(*since));
            self.progress = 1.0;
            self.report = Some(report);
            return Some(report);
        }
        None
    }
}
