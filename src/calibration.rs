// src/calibration.rs
use std::time::{Duration, Instant};

use log::warn;

use crate::classifier::ChannelClassifier;
use crate::config::CalibrationConfig;
use crate::drivers::CalibrationError;

/// Hard stop for the bisection in case the interval can't shrink further.
const MAX_BISECTIONS: usize = 256;

/// Steps of the guided rest/flex sequence, in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CalibrationPhase {
    Preface,
    Rest1,
    Flex1,
    Rest2,
    Flex2,
    Compute,
}

impl CalibrationPhase {
    fn next(self) -> Self {
        match self {
            CalibrationPhase::Preface => CalibrationPhase::Rest1,
            CalibrationPhase::Rest1 => CalibrationPhase::Flex1,
            CalibrationPhase::Flex1 => CalibrationPhase::Rest2,
            CalibrationPhase::Rest2 => CalibrationPhase::Flex2,
            CalibrationPhase::Flex2 | CalibrationPhase::Compute => CalibrationPhase::Compute,
        }
    }

    /// Position among the four timed collection phases.
    fn collection_index(self) -> Option<usize> {
        match self {
            CalibrationPhase::Rest1 => Some(0),
            CalibrationPhase::Flex1 => Some(1),
            CalibrationPhase::Rest2 => Some(2),
            CalibrationPhase::Flex2 => Some(3),
            CalibrationPhase::Preface | CalibrationPhase::Compute => None,
        }
    }

    pub fn is_flex(self) -> bool {
        matches!(self, CalibrationPhase::Flex1 | CalibrationPhase::Flex2)
    }

    /// What the user should be told while this phase runs.
    pub fn prompt(self) -> &'static str {
        match self {
            CalibrationPhase::Preface => {
                "We will now calibrate the signals to tell when you are flexing."
            }
            CalibrationPhase::Rest1 | CalibrationPhase::Rest2 => "Please relax your muscle.",
            CalibrationPhase::Flex1 | CalibrationPhase::Flex2 => {
                "Please flex your muscle until you are told otherwise. Do not overdo it, just a firm flex."
            }
            CalibrationPhase::Compute => "Calculating accuracy, please wait...",
        }
    }
}

/// Result of fitting one channel.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelFit {
    pub threshold: f64,
    /// Fraction of rest and flex samples on the correct side of the threshold.
    pub accuracy: f64,
    pub rest_bound: f64,
    pub flex_bound: f64,
    pub rest_samples: usize,
    pub flex_samples: usize,
}

/// Outcome of a whole calibration run, one entry per channel.
#[derive(Clone, Debug, PartialEq)]
pub struct CalibrationReport {
    pub channels: Vec<Result<ChannelFit, CalibrationError>>,
}

impl CalibrationReport {
    pub fn fit(&self, channel: usize) -> Option<&ChannelFit> {
        self.channels.get(channel).and_then(|r| r.as_ref().ok())
    }

    pub fn committed(&self) -> usize {
        self.channels.iter().filter(|r| r.is_ok()).count()
    }

    /// Mean accuracy over the channels that produced a fit.
    pub fn mean_accuracy(&self) -> Option<f64> {
        let fits: Vec<f64> = self
            .channels
            .iter()
            .filter_map(|r| r.as_ref().ok().map(|f| f.accuracy))
            .collect();
        (!fits.is_empty()).then(|| fits.iter().sum::<f64>() / fits.len() as f64)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum CalibrationStatus {
    Idle,
    Running { phase: CalibrationPhase, progress: f64 },
    /// Reported once, on the tick that commits the thresholds.
    Complete(CalibrationReport),
}

struct Run {
    phase: CalibrationPhase,
    phase_started: Instant,
    num_channels: usize,
    rest: Vec<Vec<f64>>,
    flex: Vec<Vec<f64>>,
}

/// Drives the rest/flex/rest/flex sequence from the main tick loop and
/// commits fitted thresholds into the classifier.
pub struct Calibrator {
    cfg: CalibrationConfig,
    run: Option<Run>,
    progress: f64,
    last_report: Option<CalibrationReport>,
    verbose: bool,
}

impl Calibrator {
    pub fn new(cfg: CalibrationConfig) -> Self {
        Self {
            cfg,
            run: None,
            progress: 0.0,
            last_report: None,
            verbose: false,
        }
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn is_running(&self) -> bool {
        self.run.is_some()
    }

    pub fn phase(&self) -> Option<CalibrationPhase> {
        self.run.as_ref().map(|r| r.phase)
    }

    /// Normalized progress in `[0, 1]` of the current or last run.
    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn last_report(&self) -> Option<&CalibrationReport> {
        self.last_report.as_ref()
    }

    pub fn start(&mut self, now: Instant, num_channels: usize) -> Result<(), CalibrationError> {
        if self.run.is_some() {
            return Err(CalibrationError::AlreadyRunning);
        }
        if num_channels == 0 {
            return Err(CalibrationError::NoChannels);
        }
        self.run = Some(Run {
            phase: CalibrationPhase::Preface,
            phase_started: now,
            num_channels,
            rest: vec![Vec::new(); num_channels],
            flex: vec![Vec::new(); num_channels],
        });
        self.progress = 0.0;
        Ok(())
    }

    pub fn cancel(&mut self) {
        if self.run.take().is_some() {
            chatter!(self.verbose, "calibration cancelled");
            self.progress = 0.0;
        }
    }

    /// Advances the sequence by one tick.
    pub fn tick(
        &mut self,
        now: Instant,
        classifier: &mut ChannelClassifier,
    ) -> Result<CalibrationStatus, CalibrationError> {
        let Some(run) = self.run.as_mut() else {
            return Ok(CalibrationStatus::Idle);
        };
        if classifier.num_channels() != run.num_channels {
            let err = CalibrationError::Interrupted {
                expected: run.num_channels,
                actual: classifier.num_channels(),
            };
            warn!("calibration aborted: {err}");
            self.run = None;
            self.progress = 0.0;
            return Err(err);
        }
        let duration = self.cfg.phase_duration();
        let settle = duration / 2;
        let elapsed = now.saturating_duration_since(run.phase_started);

        match run.phase {
            CalibrationPhase::Preface => {
                chatter!(self.verbose, "{}", CalibrationPhase::Preface.prompt());
                run.phase = CalibrationPhase::Rest1;
                run.phase_started = now;
                chatter!(self.verbose, "{}", run.phase.prompt());
                self.progress = 0.0;
            }
            CalibrationPhase::Compute => {
                chatter!(self.verbose, "{}", CalibrationPhase::Compute.prompt());
                let report = self.finish(classifier);
                return Ok(CalibrationStatus::Complete(report));
            }
            phase => {
                if elapsed >= duration {
                    run.phase = phase.next();
                    run.phase_started = now;
                    chatter!(self.verbose, "{}", run.phase.prompt());
                } else if elapsed >= settle {
                    let bucket = if phase.is_flex() { &mut run.flex } else { &mut run.rest };
                    for (channel, readings) in bucket.iter_mut().enumerate() {
                        readings.push(classifier.read_numeric(channel));
                    }
                }
                let index = phase.collection_index().unwrap_or(0) as f64;
                self.progress = 0.2 * index + 0.2 * phase_fraction(elapsed, duration);
            }
        }
        let run_phase = self.run.as_ref().map(|r| r.phase).unwrap_or(CalibrationPhase::Compute);
        Ok(CalibrationStatus::Running {
            phase: run_phase,
            progress: self.progress,
        })
    }

    fn finish(&mut self, classifier: &mut ChannelClassifier) -> CalibrationReport {
        let Some(run) = self.run.take() else {
            return CalibrationReport { channels: Vec::new() };
        };
        let channels: Vec<_> = (0..run.num_channels)
            .map(|channel| fit_channel(channel, &run.rest[channel], &run.flex[channel], &self.cfg))
            .collect();
        for (channel, outcome) in channels.iter().enumerate() {
            match outcome {
                Ok(fit) => {
                    if let Err(err) = classifier.set_threshold(channel, fit.threshold) {
                        warn!("could not commit calibrated threshold: {err}");
                        continue;
                    }
                    chatter!(
                        self.verbose,
                        "accuracy for channel {channel} is {:.1} % (threshold {})",
                        fit.accuracy * 100.0,
                        fit.threshold
                    );
                }
                Err(err) => warn!("channel {channel} keeps its previous threshold: {err}"),
            }
        }
        let report = CalibrationReport { channels };
        self.progress = 1.0;
        self.last_report = Some(report.clone());
        report
    }
}

fn phase_fraction(elapsed: Duration, duration: Duration) -> f64 {
    if duration.is_zero() {
        return 1.0;
    }
    (elapsed.as_secs_f64() / duration.as_secs_f64()).min(1.0)
}

/// Nearest-rank percentile of the finite values in `samples`.
pub fn robust_bound(samples: &[f64], percentile: f64) -> Option<f64> {
    let mut sorted: Vec<f64> = samples.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len();
    let rank = (percentile.clamp(0.0, 1.0) * n as f64).ceil() as usize;
    Some(sorted[rank.clamp(1, n) - 1])
}

/// Finds the threshold that best separates `rest` from `flex` for one channel.
///
/// The search interval runs from the rest bound (a high percentile of rest
/// readings) to the flex bound (the mirrored low percentile of flex readings).
/// Bisection moves toward whichever class has more misses; the first midpoint
/// with the fewest total misclassifications wins.
pub fn fit_channel(
    channel: usize,
    rest: &[f64],
    flex: &[f64],
    cfg: &CalibrationConfig,
) -> Result<ChannelFit, CalibrationError> {
    let rest: Vec<f64> = rest.iter().copied().filter(|v| v.is_finite()).collect();
    let flex: Vec<f64> = flex.iter().copied().filter(|v| v.is_finite()).collect();
    let percentile = cfg.robust_percentile.clamp(0.5, 1.0);
    let rest_bound = robust_bound(&rest, percentile).ok_or(CalibrationError::InsufficientSamples {
        channel,
        class: "rest",
    })?;
    let flex_bound = robust_bound(&flex, 1.0 - percentile).ok_or(
        CalibrationError::InsufficientSamples {
            channel,
            class: "flex",
        },
    )?;
    let (mut lowest, mut highest) = if flex_bound < rest_bound {
        (flex_bound, rest_bound)
    } else {
        (rest_bound, flex_bound)
    };
    if highest - lowest < cfg.search_epsilon {
        return Err(CalibrationError::Degenerate {
            channel,
            value: lowest,
        });
    }

    let misses = |t: f64| {
        let rest_misses = rest.iter().filter(|&&v| v > t).count();
        let flex_misses = flex.iter().filter(|&&v| v < t).count();
        (rest_misses, flex_misses)
    };
    let mut best: Option<(usize, f64)> = None;
    for _ in 0..MAX_BISECTIONS {
        let threshold = lowest + (highest - lowest) / 2.0;
        let (rest_misses, flex_misses) = misses(threshold);
        let total = rest_misses + flex_misses;
        if best.map_or(true, |(fewest, _)| total < fewest) {
            best = Some((total, threshold));
        }
        if highest - lowest < cfg.search_epsilon || threshold <= lowest || threshold >= highest {
            break;
        }
        if flex_misses > rest_misses {
            highest = threshold;
        } else {
            lowest = threshold;
        }
    }
    let threshold = best.map(|(_, t)| t).unwrap_or(lowest);

    let correct = flex.iter().filter(|&&v| v > threshold).count()
        + rest.iter().filter(|&&v| v < threshold).count();
    let accuracy = correct as f64 / (rest.len() + flex.len()) as f64;
    Ok(ChannelFit {
        threshold,
        accuracy,
        rest_bound,
        flex_bound,
        rest_samples: rest.len(),
        flex_samples: flex.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClassifierConfig;
    use crate::drivers::SampleBatch;

    fn cfg() -> CalibrationConfig {
        CalibrationConfig::default()
    }

    #[test]
    fn separable_samples_fit_perfectly() {
        let fit = fit_channel(0, &[10.0, 11.0, 9.0], &[90.0, 95.0, 88.0], &cfg()).unwrap();
        assert!(fit.threshold > 11.0 && fit.threshold < 88.0, "{}", fit.threshold);
        assert_eq!(fit.accuracy, 1.0);
        assert_eq!(fit.rest_bound, 11.0);
        assert_eq!(fit.flex_bound, 88.0);
    }

    #[test]
    fn fitting_is_deterministic() {
        let rest = [3.0, 4.5, 2.2, 6.1, 5.0, 4.4];
        let flex = [5.5, 9.0, 7.7, 6.0, 12.0, 8.1];
        let a = fit_channel(1, &rest, &flex, &cfg()).unwrap();
        let b = fit_channel(1, &rest, &flex, &cfg()).unwrap();
        assert_eq!(a, b);
        assert!(a.accuracy > 0.8);
    }

    #[test]
    fn single_outlier_does_not_move_the_rest_bound() {
        let mut rest = vec![10.0; 9];
        rest.push(200.0);
        let flex = vec![90.0; 10];
        let fit = fit_channel(0, &rest, &flex, &cfg()).unwrap();
        assert_eq!(fit.rest_bound, 10.0);
        assert!(fit.threshold > 10.0 && fit.threshold < 90.0);
        assert!((fit.accuracy - 0.95).abs() < 1e-12);
    }

    #[test]
    fn identical_classes_are_degenerate() {
        assert_eq!(
            fit_channel(2, &[5.0, 5.0], &[5.0, 5.0], &cfg()),
            Err(CalibrationError::Degenerate {
                channel: 2,
                value: 5.0
            })
        );
        assert_eq!(
            fit_channel(0, &[], &[1.0], &cfg()),
            Err(CalibrationError::InsufficientSamples {
                channel: 0,
                class: "rest"
            })
        );
    }

    #[test]
    fn huge_values_still_terminate() {
        let fit = fit_channel(0, &[1.0e9, 1.0e9 + 1.0], &[1.0e9 + 3.0, 1.0e9 + 4.0], &cfg()).unwrap();
        assert_eq!(fit.accuracy, 1.0);
    }

    #[test]
    fn robust_bound_uses_nearest_rank() {
        let samples = [4.0, 1.0, 3.0, 2.0, f64::NAN];
        assert_eq!(robust_bound(&samples, 0.5), Some(2.0));
        assert_eq!(robust_bound(&samples, 1.0), Some(4.0));
        assert_eq!(robust_bound(&samples, 0.0), Some(1.0));
        assert_eq!(robust_bound(&[], 0.9), None);
    }

    fn drive(rest_level: f64, flex_level: f64) -> (Vec<f64>, CalibrationReport, ChannelClassifier) {
        let mut classifier = ChannelClassifier::new(ClassifierConfig::default());
        classifier.open_session(2);
        let mut calibrator = Calibrator::new(cfg());
        let t0 = Instant::now();
        calibrator.start(t0, 2).unwrap();
        let mut progress = Vec::new();
        for i in 0..400u64 {
            let now = t0 + Duration::from_millis(100 * i);
            let level = match calibrator.phase() {
                Some(p) if p.is_flex() => flex_level,
                _ => rest_level,
            };
            classifier.update(&SampleBatch::constant(2, 10, level));
            match calibrator.tick(now, &mut classifier).unwrap() {
                CalibrationStatus::Running { progress: p, .. } => progress.push(p),
                CalibrationStatus::Complete(report) => {
                    progress.push(calibrator.progress());
                    return (progress, report, classifier);
                }
                CalibrationStatus::Idle => panic!("calibration stopped early"),
            }
        }
        panic!("calibration never completed");
    }

    #[test]
    fn full_sequence_commits_thresholds() {
        let (progress, report, classifier) = drive(10.0, 90.0);
        assert_eq!(report.committed(), 2);
        assert_eq!(report.mean_accuracy(), Some(1.0));
        for channel in 0..2 {
            let t = classifier.threshold(channel).unwrap();
            assert!(t > 10.0 && t < 90.0);
            let fit = report.fit(channel).unwrap();
            assert!(fit.rest_samples > 0 && fit.flex_samples > 0);
        }
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(progress.iter().filter(|&&p| p == 1.0).count(), 1);
        assert_eq!(progress.last(), Some(&1.0));
    }

    #[test]
    fn full_sequence_is_repeatable() {
        let (_, a, _) = drive(12.0, 40.0);
        let (_, b, _) = drive(12.0, 40.0);
        assert_eq!(a, b);
    }

    #[test]
    fn flat_signal_reports_degenerate_and_keeps_threshold() {
        let (_, report, classifier) = drive(7.0, 7.0);
        assert_eq!(report.committed(), 0);
        assert!(matches!(
            report.channels[0],
            Err(CalibrationError::Degenerate { channel: 0, .. })
        ));
        assert_eq!(classifier.threshold(0), Some(0.0));
    }

    #[test]
    fn losing_channels_interrupts() {
        let mut classifier = ChannelClassifier::new(ClassifierConfig::default());
        classifier.open_session(2);
        let mut calibrator = Calibrator::new(cfg());
        let t0 = Instant::now();
        calibrator.start(t0, 2).unwrap();
        assert_eq!(calibrator.start(t0, 2), Err(CalibrationError::AlreadyRunning));
        calibrator.tick(t0, &mut classifier).unwrap();
        classifier.close_session();
        assert_eq!(
            calibrator.tick(t0 + Duration::from_secs(1), &mut classifier),
            Err(CalibrationError::Interrupted {
                expected: 2,
                actual: 0
            })
        );
        assert!(!calibrator.is_running());
        assert_eq!(
            calibrator.tick(t0, &mut classifier),
            Ok(CalibrationStatus::Idle)
        );
    }
}
