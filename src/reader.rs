// src/reader.rs
use std::time::Instant;

use log::warn;

use crate::calibration::{CalibrationPhase, CalibrationReport, CalibrationStatus, Calibrator};
use crate::classifier::ChannelClassifier;
use crate::config::ReaderConfig;
use crate::connection::ConnectionManager;
use crate::drivers::{CalibrationError, ReaderError, SampleSource, SettingError};
use crate::refresh::{RefreshProbe, RefreshReport};
use crate::types::{ConnectionState, ThresholdType};

/// What menus and control mappers see of a reader.
///
/// Object safe, so a game can hold a `Box<dyn BciInput>` and not care whether
/// the board is real or simulated.
pub trait BciInput {
    fn connection_status(&self) -> ConnectionState;
    /// Channel count while the link is connected or recovering.
    fn num_channels(&self) -> Option<usize>;

    fn allow_wireless(&mut self, allow: bool);
    fn get_allow_wireless(&self) -> bool;
    fn wireless_device_name(&self) -> Option<String>;
    fn set_wireless_device_name(&mut self, name: Option<String>);
    fn default_address(&self) -> Option<String>;
    fn set_default_address(&mut self, address: Option<String>);
    fn verbose(&self) -> bool;
    fn set_verbose(&mut self, verbose: bool);

    fn threshold(&self, channel: usize) -> Option<f64>;
    fn set_threshold(&mut self, channel: usize, threshold: f64) -> Result<(), SettingError>;
    /// Threshold becomes the current reading plus a safety margin.
    fn auto_resting_threshold(&mut self, channel: usize) -> Result<(), SettingError>;
    fn auto_resting_threshold_all(&mut self);
    fn threshold_type(&self, channel: usize) -> Option<ThresholdType>;
    fn set_threshold_type(&mut self, channel: usize, threshold_type: ThresholdType) -> Result<(), SettingError>;
    fn set_threshold_type_all(&mut self, threshold_type: ThresholdType);
    fn threshold_sensitivity(&self, channel: usize) -> Option<usize>;
    /// Valid range is `1..=1000` samples.
    fn set_threshold_sensitivity(&mut self, channel: usize, sensitivity: usize) -> Result<(), SettingError>;
    fn set_threshold_sensitivity_all(&mut self, sensitivity: usize) -> Result<(), SettingError>;

    fn read_bool(&self, channel: usize) -> bool;
    fn read_numeric(&self, channel: usize) -> f64;

    fn disconnect(&mut self);
    fn reconnect(&mut self, now: Instant) -> Result<bool, ReaderError>;

    /// Only allowed while readings are live.
    fn start_calibration(&mut self, now: Instant) -> Result<(), CalibrationError>;
    fn cancel_calibration(&mut self);
    /// `Some(1.0)` on the tick that finishes a run, `None` when idle.
    fn calibration_progress(&self) -> Option<f64>;
}

/// Owns the link, the classifier and the calibrator, and drives them from
/// one [`tick`](Self::tick) per frame.
pub struct BciReader<S: SampleSource> {
    connection: ConnectionManager<S>,
    classifier: ChannelClassifier,
    calibrator: Calibrator,
    refresh: Option<RefreshProbe>,
    refresh_epsilon: f64,
    reference_channel: usize,
    /// Set on the tick that commits a calibration, cleared on the next one.
    calibration_completed: bool,
    verbose: bool,
}

impl<S: SampleSource> BciReader<S> {
    pub fn new(source: S, cfg: ReaderConfig) -> Self {
        let mut reader = Self {
            connection: ConnectionManager::new(source, cfg.link, cfg.liveness.clone()),
            classifier: ChannelClassifier::new(cfg.classifier),
            calibrator: Calibrator::new(cfg.calibration),
            refresh: None,
            refresh_epsilon: cfg.liveness.epsilon,
            reference_channel: cfg.liveness.reference_channel,
            calibration_completed: false,
            verbose: false,
        };
        reader.set_verbose(cfg.verbose);
        reader
    }

    pub fn classifier(&self) -> &ChannelClassifier {
        &self.classifier
    }

    pub fn connection(&self) -> &ConnectionManager<S> {
        &self.connection
    }

    pub fn calibration_phase(&self) -> Option<CalibrationPhase> {
        self.calibrator.phase()
    }

    pub fn last_calibration(&self) -> Option<&CalibrationReport> {
        self.calibrator.last_report()
    }

    pub fn connect(&mut self, now: Instant) -> Result<bool, ReaderError> {
        let opened = self.connection.connect(now)?;
        self.sync_channels();
        Ok(opened)
    }

    /// Starts measuring how quickly the board replaces a window of samples.
    /// The result shows up in [`refresh_report`](Self::refresh_report).
    pub fn probe_refresh_rate(&mut self, window: usize) {
        self.refresh = Some(RefreshProbe::new(
            self.reference_channel,
            window,
            self.refresh_epsilon,
        ));
    }

    pub fn refresh_report(&self) -> Option<RefreshReport> {
        self.refresh.as_ref().and_then(|p| p.report())
    }

    /// One frame: fetch, update liveness, classify, advance calibration.
    ///
    /// Only unrecognized session failures are returned as errors.
    pub fn tick(&mut self, now: Instant) -> Result<ConnectionState, ReaderError> {
        self.calibration_completed = false;
        let batch = if self.connection.status() == ConnectionState::Disconnected {
            None
        } else {
            match self.connection.fetch(self.classifier.max_sensitivity()) {
                Ok(batch) => batch,
                Err(err) => {
                    self.calibrator.cancel();
                    self.sync_channels();
                    return Err(err.into());
                }
            }
        };
        let state = self.connection.tick(now, batch.as_ref());
        self.sync_channels();

        if let Some(batch) = batch.as_ref() {
            if state.is_streaming() {
                self.classifier.update(batch);
            }
            if let Some(probe) = self.refresh.as_mut() {
                if probe.report().is_none() {
                    if let Some(report) = probe.observe(now, batch) {
                        chatter!(self.verbose, "{report}");
                    }
                }
            }
        }

        if self.calibrator.is_running() {
            match self.calibrator.tick(now, &mut self.classifier) {
                Ok(CalibrationStatus::Complete(report)) => {
                    self.calibration_completed = true;
                    chatter!(
                        self.verbose,
                        "calibration finished, {} of {} channels committed",
                        report.committed(),
                        report.channels.len()
                    );
                }
                Ok(_) => {}
                Err(err) => warn!("calibration stopped: {err}"),
            }
        }
        Ok(state)
    }

    /// Opens or drops classifier channels to match the session.
    fn sync_channels(&mut self) {
        match self.connection.session_channels() {
            Some(n) if n != self.classifier.num_channels() => self.classifier.open_session(n),
            None if self.classifier.num_channels() > 0 => self.classifier.close_session(),
            _ => {}
        }
    }
}

impl<S: SampleSource> BciInput for BciReader<S> {
    fn connection_status(&self) -> ConnectionState {
        self.connection.status()
    }

    fn num_channels(&self) -> Option<usize> {
        if self.connection.status().is_streaming() {
            self.connection.session_channels()
        } else {
            None
        }
    }

    fn allow_wireless(&mut self, allow: bool) {
        self.connection.link_mut().allow_wireless = allow;
    }

    fn get_allow_wireless(&self) -> bool {
        self.connection.link().allow_wireless
    }

    fn wireless_device_name(&self) -> Option<String> {
        self.connection.link().wireless_device_name.clone()
    }

    fn set_wireless_device_name(&mut self, name: Option<String>) {
        self.connection.link_mut().wireless_device_name = name;
    }

    fn default_address(&self) -> Option<String> {
        self.connection.link().default_address.clone()
    }

    fn set_default_address(&mut self, address: Option<String>) {
        self.connection.link_mut().default_address = address;
    }

    fn verbose(&self) -> bool {
        self.verbose
    }

    fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
        self.connection.set_verbose(verbose);
        self.classifier.set_verbose(verbose);
        self.calibrator.set_verbose(verbose);
    }

    fn threshold(&self, channel: usize) -> Option<f64> {
        self.classifier.threshold(channel)
    }

    fn set_threshold(&mut self, channel: usize, threshold: f64) -> Result<(), SettingError> {
        self.classifier.set_threshold(channel, threshold)
    }

    fn auto_resting_threshold(&mut self, channel: usize) -> Result<(), SettingError> {
        self.classifier.auto_resting_threshold(channel)
    }

    fn auto_resting_threshold_all(&mut self) {
        self.classifier.auto_resting_threshold_all();
    }

    fn threshold_type(&self, channel: usize) -> Option<ThresholdType> {
        self.classifier.threshold_type(channel)
    }

    fn set_threshold_type(&mut self, channel: usize, threshold_type: ThresholdType) -> Result<(), SettingError> {
        self.classifier.set_threshold_type(channel, threshold_type)
    }

    fn set_threshold_type_all(&mut self, threshold_type: ThresholdType) {
        self.classifier.set_threshold_type_all(threshold_type);
    }

    fn threshold_sensitivity(&self, channel: usize) -> Option<usize> {
        self.classifier.sensitivity(channel)
    }

    fn set_threshold_sensitivity(&mut self, channel: usize, sensitivity: usize) -> Result<(), SettingError> {
        self.classifier.set_sensitivity(channel, sensitivity)
    }

    fn set_threshold_sensitivity_all(&mut self, sensitivity: usize) -> Result<(), SettingError> {
        self.classifier.set_sensitivity_all(sensitivity)
    }

    fn read_bool(&self, channel: usize) -> bool {
        self.classifier.read_bool(channel)
    }

    fn read_numeric(&self, channel: usize) -> f64 {
        self.classifier.read_numeric(channel)
    }

    fn disconnect(&mut self) {
        self.calibrator.cancel();
        self.calibration_completed = false;
        self.connection.disconnect();
        self.sync_channels();
    }

    fn reconnect(&mut self, now: Instant) -> Result<bool, ReaderError> {
        self.calibrator.cancel();
        let opened = self.connection.reconnect(now);
        self.sync_channels();
        Ok(opened?)
    }

    fn start_calibration(&mut self, now: Instant) -> Result<(), CalibrationError> {
        let state = self.connection.status();
        if !state.is_streaming() {
            return Err(CalibrationError::NotStreaming(state));
        }
        self.calibrator.start(now, self.classifier.num_channels())
    }

    fn cancel_calibration(&mut self) {
        self.calibrator.cancel();
    }

    fn calibration_progress(&self) -> Option<f64> {
        if self.calibrator.is_running() {
            Some(self.calibrator.progress())
        } else if self.calibration_completed {
            Some(1.0)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{
        ConnectError, FetchError, ManualSession, ManualSource, SampleBatch, SimulatedSource,
    };
    use std::time::Duration;

    fn cfg() -> ReaderConfig {
        let mut cfg = ReaderConfig::default();
        cfg.link.port_prefix = "COM".into();
        cfg.link.scan_limit = 3;
        cfg
    }

    fn ramp(channels: usize, start: f64) -> SampleBatch {
        let rows = (0..channels)
            .map(|_| (0..4).map(|i| start + i as f64).collect())
            .collect();
        SampleBatch::from_rows(rows).unwrap()
    }

    #[test]
    fn ticks_feed_the_classifier_once_connected() {
        let session = ManualSession::new(2);
        let feed = session.feed();
        let mut reader = BciReader::new(ManualSource::new().accept(session), cfg());
        let t0 = Instant::now();
        assert_eq!(reader.connect(t0).unwrap(), true);
        assert_eq!(reader.connection_status(), ConnectionState::Connecting);
        assert_eq!(reader.num_channels(), None);
        assert_eq!(reader.default_address().as_deref(), Some("COM0"));

        feed.push(ramp(2, 0.0));
        feed.push(ramp(2, 10.0));
        reader.set_threshold(0, 5.0).unwrap();
        assert_eq!(reader.tick(t0).unwrap(), ConnectionState::Connecting);
        assert_eq!(reader.read_numeric(0), 0.0);
        assert_eq!(
            reader.tick(t0 + Duration::from_millis(30)).unwrap(),
            ConnectionState::Connected
        );
        assert_eq!(reader.num_channels(), Some(2));
        assert_eq!(reader.read_numeric(0), 11.5);
        assert!(reader.read_bool(0));
        assert!(!reader.read_bool(5));
    }

    #[test]
    fn stall_then_recovery_keeps_the_session() {
        let session = ManualSession::new(1);
        let feed = session.feed();
        let mut reader = BciReader::new(ManualSource::new().accept(session), cfg());
        let t0 = Instant::now();
        reader.connect(t0).unwrap();
        feed.push(ramp(1, 0.0));
        feed.push(ramp(1, 1.0));
        reader.tick(t0).unwrap();
        reader.tick(t0 + Duration::from_millis(100)).unwrap();
        assert_eq!(reader.connection_status(), ConnectionState::Connected);

        feed.push(ramp(1, 1.0));
        assert_eq!(
            reader.tick(t0 + Duration::from_secs(6)).unwrap(),
            ConnectionState::Reconnecting
        );
        feed.push(ramp(1, 2.0));
        assert_eq!(
            reader.tick(t0 + Duration::from_secs(7)).unwrap(),
            ConnectionState::Connected
        );
        assert_eq!(feed.stats().released(), 0);
        assert_eq!(reader.num_channels(), Some(1));
    }

    #[test]
    fn disconnect_while_connecting_is_clean() {
        let session = ManualSession::new(3).fail_teardown(FetchError::Unrecognized("gone".into()));
        let feed = session.feed();
        let mut reader = BciReader::new(ManualSource::new().accept(session), cfg());
        reader.connect(Instant::now()).unwrap();
        assert_eq!(reader.connection_status(), ConnectionState::Connecting);
        reader.disconnect();
        assert_eq!(reader.connection_status(), ConnectionState::Disconnected);
        assert_eq!(reader.num_channels(), None);
        assert_eq!(reader.classifier().num_channels(), 0);
        assert_eq!(feed.stats().released(), 1);
        reader.disconnect();
    }

    #[test]
    fn locked_board_never_connects() {
        let locked = ConnectError::DeviceLocked {
            target: String::new(),
            detail: "ANOTHER_BOARD_IS_CREATED_ERROR:16".into(),
        };
        let mut reader = BciReader::new(ManualSource::always(locked), cfg());
        assert_eq!(reader.connect(Instant::now()).unwrap(), false);
        assert_eq!(reader.connection_status(), ConnectionState::Disconnected);
        assert_eq!(reader.connection().source().attempts().len(), 3);
        assert_eq!(reader.tick(Instant::now()).unwrap(), ConnectionState::Disconnected);
    }

    #[test]
    fn unrecognized_fetch_failure_escapes_tick() {
        let session = ManualSession::new(1);
        let feed = session.feed();
        let mut reader = BciReader::new(ManualSource::new().accept(session), cfg());
        reader.connect(Instant::now()).unwrap();
        feed.push_error(FetchError::Unrecognized("GENERAL_ERROR:17".into()));
        assert!(matches!(
            reader.tick(Instant::now()),
            Err(ReaderError::Fetch(FetchError::Unrecognized(_)))
        ));
        assert_eq!(reader.connection_status(), ConnectionState::Disconnected);
    }

    #[test]
    fn zero_sensitivity_is_rejected() {
        let mut reader = BciReader::new(ManualSource::new().accept(ManualSession::new(2)), cfg());
        reader.connect(Instant::now()).unwrap();
        let before = reader.threshold_sensitivity(1);
        assert!(matches!(
            reader.set_threshold_sensitivity(1, 0),
            Err(SettingError::SensitivityOutOfRange { value: 0, .. })
        ));
        assert!(reader.set_threshold_sensitivity_all(0).is_err());
        assert_eq!(reader.threshold_sensitivity(1), before);
    }

    #[test]
    fn boxed_reader_exposes_link_settings() {
        let mut input: Box<dyn BciInput> = Box::new(BciReader::new(ManualSource::new(), cfg()));
        input.allow_wireless(true);
        input.set_wireless_device_name(Some("OpenBCI-1A2B".into()));
        input.set_verbose(true);
        assert!(input.get_allow_wireless());
        assert_eq!(input.wireless_device_name().as_deref(), Some("OpenBCI-1A2B"));
        assert!(input.verbose());
        assert_eq!(input.calibration_progress(), None);
        assert_eq!(
            input.start_calibration(Instant::now()),
            Err(CalibrationError::NotStreaming(ConnectionState::Disconnected))
        );
    }

    #[test]
    fn calibration_waits_for_live_data() {
        let session = ManualSession::new(2);
        let feed = session.feed();
        let mut reader = BciReader::new(ManualSource::new().accept(session), cfg());
        let t0 = Instant::now();
        reader.connect(t0).unwrap();
        assert_eq!(
            reader.start_calibration(t0),
            Err(CalibrationError::NotStreaming(ConnectionState::Connecting))
        );
        assert_eq!(reader.calibration_progress(), None);

        feed.push(ramp(2, 0.0));
        feed.push(ramp(2, 10.0));
        reader.tick(t0).unwrap();
        reader.tick(t0 + Duration::from_millis(30)).unwrap();
        assert_eq!(reader.connection_status(), ConnectionState::Connected);
        assert_eq!(reader.start_calibration(t0), Ok(()));
        assert_eq!(reader.calibration_progress(), Some(0.0));
    }

    #[test]
    fn simulated_calibration_separates_flex_from_rest() {
        let source = SimulatedSource::new(3);
        let muscles = source.muscles();
        let mut reader = BciReader::new(source, cfg());
        let t0 = Instant::now();
        reader.connect(t0).unwrap();
        reader.tick(t0).unwrap();
        reader.tick(t0 + Duration::from_millis(100)).unwrap();
        assert_eq!(reader.connection_status(), ConnectionState::Connected);

        reader.start_calibration(t0).unwrap();
        let mut now = t0;
        let mut polled = Vec::new();
        while let Some(progress) = reader.calibration_progress() {
            polled.push(progress);
            now += Duration::from_millis(100);
            muscles.set_all(reader.calibration_phase().map_or(false, |p| p.is_flex()));
            reader.tick(now).unwrap();
            assert!(now < t0 + Duration::from_secs(60), "calibration never finished");
        }
        assert_eq!(polled.iter().filter(|&&p| p == 1.0).count(), 1);
        assert_eq!(polled.last(), Some(&1.0));
        assert!(polled.windows(2).all(|w| w[0] <= w[1]));
        let report = reader.last_calibration().unwrap();
        assert_eq!(report.committed(), 8);
        assert_eq!(report.mean_accuracy(), Some(1.0));

        muscles.set(4, true);
        reader.tick(now + Duration::from_millis(100)).unwrap();
        assert!(reader.read_bool(4));
        assert!(!reader.read_bool(0));
    }
}
