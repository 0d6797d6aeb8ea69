// src/connection.rs
use std::time::{Duration, Instant};

use log::{debug, error, warn};

use crate::config::{LinkConfig, LivenessConfig};
use crate::drivers::{release_logged, ConnectError, FetchError, SampleBatch, SampleSource, Session};
use crate::types::{ConnectionState, Target};

/// Remembers the last distinguishing reference value and when it arrived.
#[derive(Clone, Debug)]
pub struct LivenessTracker {
    epsilon: f64,
    last_value: Option<f64>,
    last_change: Instant,
}

impl LivenessTracker {
    pub fn new(epsilon: f64, now: Instant) -> Self {
        Self {
            epsilon,
            last_value: None,
            last_change: now,
        }
    }

    pub fn reset(&mut self, now: Instant) {
        self.last_value = None;
        self.last_change = now;
    }

    /// Records `value` and reports whether it differs from the previous one
    /// by more than epsilon. The very first value only seeds the tracker.
    pub fn observe(&mut self, value: f64, now: Instant) -> bool {
        match self.last_value {
            None => {
                self.last_value = Some(value);
                self.last_change = now;
                false
            }
            Some(prev) if (value - prev).abs() > self.epsilon => {
                self.last_value = Some(value);
                self.last_change = now;
                true
            }
            Some(_) => false,
        }
    }

    pub fn last_value(&self) -> Option<f64> {
        self.last_value
    }

    pub fn stale_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_change)
    }
}

/// Owns the device session and the connection state machine.
///
/// Transitions:
/// - `Disconnected -> Connecting` on a successful open+start in [`connect`](Self::connect)
/// - `Connecting -> Connected` on the first meaningful change of the reference value
/// - `Connected -> Reconnecting` once the value has been stale for `stall_after`
/// - `Reconnecting -> Connected` when it changes again
/// - `Reconnecting -> Disconnected` once stale for `disconnect_after` (session torn down)
/// - any state `-> Disconnected` on [`disconnect`](Self::disconnect)
pub struct ConnectionManager<S: SampleSource> {
    source: S,
    session: Option<S::Session>,
    state: ConnectionState,
    link: LinkConfig,
    liveness_cfg: LivenessConfig,
    liveness: LivenessTracker,
    verbose: bool,
}

impl<S: SampleSource> ConnectionManager<S> {
    pub fn new(source: S, link: LinkConfig, liveness_cfg: LivenessConfig) -> Self {
        let liveness = LivenessTracker::new(liveness_cfg.epsilon, Instant::now());
        Self {
            source,
            session: None,
            state: ConnectionState::Disconnected,
            link,
            liveness_cfg,
            liveness,
            verbose: false,
        }
    }

    pub fn status(&self) -> ConnectionState {
        self.state
    }

    /// Channel count of the open session, if any.
    pub fn session_channels(&self) -> Option<usize> {
        self.session.as_ref().map(|s| s.num_channels())
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn link(&self) -> &LinkConfig {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut LinkConfig {
        &mut self.link
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    /// Ordered list of targets one `connect` call will try.
    pub fn candidates(&self) -> Vec<Target> {
        let mut out = Vec::new();
        if let Some(port) = &self.link.default_address {
            out.push(Target::Serial { port: port.clone() });
        } else {
            let listed = if self.link.enumerate_ports {
                enumerate_serial_ports()
            } else {
                Vec::new()
            };
            if listed.is_empty() {
                out.extend((0..self.link.scan_limit).map(|i| Target::Serial {
                    port: format!("{}{}", self.link.port_prefix, i),
                }));
            } else {
                out.extend(
                    listed
                        .into_iter()
                        .take(self.link.scan_limit)
                        .map(|port| Target::Serial { port }),
                );
            }
        }
        if self.link.allow_wireless {
            out.push(Target::Wireless {
                device_name: self.link.wireless_device_name.clone(),
                port: self.link.wireless_port,
            });
        } else {
            chatter!(self.verbose, "wifi not allowed, skipping wireless target");
        }
        out
    }

    /// Tries every candidate until one opens and starts streaming.
    ///
    /// Returns `Ok(false)` when every candidate failed with a recoverable
    /// error; only unrecognized failures are returned as `Err`.
    pub fn connect(&mut self, now: Instant) -> Result<bool, ConnectError> {
        if self.state != ConnectionState::Disconnected {
            chatter!(self.verbose, "connect ignored, link is already {}", self.state);
            return Ok(true);
        }
        for target in self.candidates() {
            self.state = ConnectionState::Connecting;
            chatter!(self.verbose, "attempting connection on {target}");
            match self.open_and_start(&target) {
                Ok(session) => {
                    self.session = Some(session);
                    self.liveness.reset(now);
                    if let Target::Serial { port } = &target {
                        self.link.default_address = Some(port.clone());
                    }
                    chatter!(self.verbose, "board session opened on {target}, waiting for live data");
                    return Ok(true);
                }
                Err(err) => {
                    self.state = ConnectionState::Disconnected;
                    if err.is_fatal() {
                        error!("{err}");
                        return Err(err);
                    }
                    match &err {
                        ConnectError::TransportUnavailable { .. } => {
                            if self.verbose {
                                warn!("board not available: {err}");
                            } else {
                                debug!("board not available: {err}");
                            }
                        }
                        ConnectError::DeviceNotReady { .. } => {
                            warn!("{err}. Make sure the board itself is switched on, then try again.");
                        }
                        ConnectError::DeviceLocked { .. } => {
                            error!("{err}. Close the other program using the board and reconnect.");
                        }
                        ConnectError::Unrecognized { .. } => {}
                    }
                }
            }
        }
        self.state = ConnectionState::Disconnected;
        warn!("no board connection could be made");
        Ok(false)
    }

    fn open_and_start(&mut self, target: &Target) -> Result<S::Session, ConnectError> {
        let mut session = self.source.open(target)?;
        if let Err(err) = session.start() {
            release_logged(&mut session, &format!("half-opened on {target}"));
            return Err(err);
        }
        Ok(session)
    }

    /// Ends the session from any state. Teardown failures are logged, never returned.
    pub fn disconnect(&mut self) {
        chatter!(self.verbose, "disconnecting (was {})", self.state);
        self.teardown();
        self.state = ConnectionState::Disconnected;
        self.liveness.reset(Instant::now());
    }

    /// `disconnect` followed by `connect`.
    pub fn reconnect(&mut self, now: Instant) -> Result<bool, ConnectError> {
        chatter!(self.verbose, "reconnecting");
        self.disconnect();
        self.connect(now)
    }

    fn teardown(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(err) = session.stop() {
                error!("stopping stream failed: {err}");
            }
            if let Err(err) = session.release() {
                error!("releasing session failed: {err}");
            }
        }
    }

    /// Pulls the newest batch from the session without blocking.
    pub fn fetch(&mut self, max_samples: usize) -> Result<Option<SampleBatch>, FetchError> {
        let Some(session) = self.session.as_mut() else {
            warn!("attempt to collect data when board is not connected");
            return Ok(None);
        };
        match session.fetch(max_samples) {
            Ok(Some(batch)) if !batch.is_empty() => Ok(Some(batch)),
            Ok(_) => Ok(None),
            Err(FetchError::SessionInvalidated(detail)) => {
                warn!("board was believed connected but the session is gone: {detail}");
                self.teardown();
                self.state = ConnectionState::Disconnected;
                Ok(None)
            }
            Err(err) => {
                error!("terminating session: {err}");
                self.teardown();
                self.state = ConnectionState::Disconnected;
                Err(err)
            }
        }
    }

    /// Feeds one liveness observation into the state machine.
    ///
    /// A tick without a batch counts as "nothing new" for stall timing.
    pub fn tick(&mut self, now: Instant, batch: Option<&SampleBatch>) -> ConnectionState {
        if self.state == ConnectionState::Disconnected {
            return self.state;
        }
        let reference = self.liveness_cfg.reference_channel;
        let changed = batch
            .and_then(|b| b.latest(reference))
            .map(|value| self.liveness.observe(value, now))
            .unwrap_or(false);
        let stale = self.liveness.stale_for(now);
        match self.state {
            ConnectionState::Connecting if changed => {
                chatter!(self.verbose, "board connected");
                self.state = ConnectionState::Connected;
            }
            ConnectionState::Connected if stale > self.liveness_cfg.stall_after() => {
                warn!("board connection faulty, please do not close the program");
                self.state = ConnectionState::Reconnecting;
            }
            ConnectionState::Reconnecting if changed => {
                chatter!(self.verbose, "board connection recovered");
                self.state = ConnectionState::Connected;
            }
            ConnectionState::Reconnecting if stale > self.liveness_cfg.disconnect_after() => {
                error!("board connection failed after {:.1}s without new data", stale.as_secs_f64());
                self.teardown();
                self.state = ConnectionState::Disconnected;
                chatter!(self.verbose, "it is now safe to stop the program");
            }
            _ => {}
        }
        self.state
    }
}

impl<S: SampleSource> Drop for ConnectionManager<S> {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn enumerate_serial_ports() -> Vec<String> {
    match serialport::available_ports() {
        Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
        Err(err) => {
            debug!("serial port enumeration failed: {err}");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{ManualSession, ManualSource};

    fn link() -> LinkConfig {
        LinkConfig {
            port_prefix: "COM".into(),
            ..LinkConfig::default()
        }
    }

    fn manager(source: ManualSource) -> ConnectionManager<ManualSource> {
        ConnectionManager::new(source, link(), LivenessConfig::default())
    }

    fn locked() -> ConnectError {
        ConnectError::DeviceLocked {
            target: String::new(),
            detail: "ANOTHER_BOARD_IS_CREATED_ERROR:16".into(),
        }
    }

    fn unavailable() -> ConnectError {
        ConnectError::TransportUnavailable {
            target: String::new(),
            detail: "UNABLE_TO_OPEN_PORT_ERROR:2".into(),
        }
    }

    fn value(v: f64) -> SampleBatch {
        SampleBatch::constant(2, 4, v)
    }

    #[test]
    fn locked_device_never_connects() {
        let mut mgr = manager(ManualSource::always(locked()));
        assert!(!mgr.connect(Instant::now()).unwrap());
        assert_eq!(mgr.status(), ConnectionState::Disconnected);
        assert_eq!(mgr.source().attempts().len(), 10);
        assert_eq!(mgr.session_channels(), None);
    }

    #[test]
    fn scan_stops_at_first_open_port_and_remembers_it() {
        let source = ManualSource::new()
            .refuse(unavailable())
            .refuse(unavailable())
            .accept(ManualSession::new(2));
        let mut mgr = manager(source);
        assert!(mgr.connect(Instant::now()).unwrap());
        assert_eq!(mgr.status(), ConnectionState::Connecting);
        assert_eq!(mgr.source().attempts().len(), 3);
        assert_eq!(mgr.link().default_address.as_deref(), Some("COM2"));
        assert_eq!(mgr.session_channels(), Some(2));
        assert_eq!(
            mgr.candidates(),
            vec![Target::Serial { port: "COM2".into() }]
        );
    }

    #[test]
    fn configured_address_is_the_only_serial_candidate() {
        let mut mgr = manager(ManualSource::always(unavailable()));
        mgr.link_mut().default_address = Some("COM6".into());
        assert!(!mgr.connect(Instant::now()).unwrap());
        assert_eq!(
            mgr.source().attempts(),
            &[Target::Serial { port: "COM6".into() }]
        );
    }

    #[test]
    fn wireless_is_tried_last_and_only_when_allowed() {
        let mut mgr = manager(ManualSource::always(unavailable()));
        mgr.link_mut().allow_wireless = true;
        mgr.link_mut().wireless_device_name = Some("OpenBCI-1A2B".into());
        assert!(!mgr.connect(Instant::now()).unwrap());
        let attempts = mgr.source().attempts();
        assert_eq!(attempts.len(), 11);
        assert_eq!(
            attempts.last(),
            Some(&Target::Wireless {
                device_name: Some("OpenBCI-1A2B".into()),
                port: 4000
            })
        );
    }

    #[test]
    fn unrecognized_failure_aborts_the_scan() {
        let source = ManualSource::new().refuse(unavailable()).refuse(ConnectError::Unrecognized {
            target: String::new(),
            detail: "BrainFlow code 99".into(),
        });
        let mut mgr = manager(source);
        let err = mgr.connect(Instant::now()).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(mgr.status(), ConnectionState::Disconnected);
        assert_eq!(mgr.source().attempts().len(), 2);
    }

    #[test]
    fn start_failure_releases_the_half_open_session() {
        let session = ManualSession::new(2).fail_start(ConnectError::DeviceNotReady {
            target: "COM0".into(),
            detail: "BOARD_NOT_READY_ERROR:7".into(),
        });
        let feed = session.feed();
        let mut mgr = manager(ManualSource::new().accept(session));
        assert!(!mgr.connect(Instant::now()).unwrap());
        assert_eq!(feed.stats().started(), 1);
        assert_eq!(feed.stats().released(), 1);
    }

    #[test]
    fn constant_stream_stays_connecting() {
        let session = ManualSession::new(2);
        let mut mgr = manager(ManualSource::new().accept(session));
        let t0 = Instant::now();
        mgr.connect(t0).unwrap();
        for i in 0..20 {
            let now = t0 + Duration::from_millis(100 * i);
            assert_eq!(mgr.tick(now, Some(&value(3.0))), ConnectionState::Connecting);
        }
        let now = t0 + Duration::from_secs(3);
        assert_eq!(mgr.tick(now, Some(&value(3.5))), ConnectionState::Connected);
    }

    #[test]
    fn stall_then_recovery_keeps_the_session() {
        let session = ManualSession::new(2);
        let feed = session.feed();
        let mut mgr = manager(ManualSource::new().accept(session));
        let t0 = Instant::now();
        mgr.connect(t0).unwrap();
        mgr.tick(t0, Some(&value(1.0)));
        assert_eq!(
            mgr.tick(t0 + Duration::from_millis(10), Some(&value(2.0))),
            ConnectionState::Connected
        );
        assert_eq!(
            mgr.tick(t0 + Duration::from_secs(4), Some(&value(2.0))),
            ConnectionState::Connected
        );
        assert_eq!(
            mgr.tick(t0 + Duration::from_secs(6), Some(&value(2.0))),
            ConnectionState::Reconnecting
        );
        assert_eq!(
            mgr.tick(t0 + Duration::from_secs(8), Some(&value(2.5))),
            ConnectionState::Connected
        );
        assert_eq!(feed.stats().stopped(), 0);
        assert_eq!(feed.stats().released(), 0);
        assert_eq!(mgr.session_channels(), Some(2));
    }

    #[test]
    fn missing_batches_count_as_stale() {
        let mut mgr = manager(ManualSource::new().accept(ManualSession::new(2)));
        let t0 = Instant::now();
        mgr.connect(t0).unwrap();
        mgr.tick(t0, Some(&value(1.0)));
        mgr.tick(t0, Some(&value(2.0)));
        assert_eq!(
            mgr.tick(t0 + Duration::from_secs(6), None),
            ConnectionState::Reconnecting
        );
    }

    #[test]
    fn prolonged_stall_tears_down_even_if_teardown_fails() {
        let session = ManualSession::new(2)
            .fail_teardown(FetchError::Unrecognized("stop_stream failed".into()));
        let feed = session.feed();
        let mut mgr = manager(ManualSource::new().accept(session));
        let t0 = Instant::now();
        mgr.connect(t0).unwrap();
        mgr.tick(t0, Some(&value(1.0)));
        mgr.tick(t0, Some(&value(2.0)));
        mgr.tick(t0 + Duration::from_secs(6), Some(&value(2.0)));
        assert_eq!(
            mgr.tick(t0 + Duration::from_secs(11), Some(&value(2.0))),
            ConnectionState::Disconnected
        );
        assert_eq!(feed.stats().stopped(), 1);
        assert_eq!(feed.stats().released(), 1);
        assert_eq!(mgr.session_channels(), None);
    }

    #[test]
    fn disconnect_while_connecting_is_clean() {
        let session = ManualSession::new(2)
            .fail_teardown(FetchError::SessionInvalidated("never streamed".into()));
        let feed = session.feed();
        let mut mgr = manager(ManualSource::new().accept(session));
        mgr.connect(Instant::now()).unwrap();
        assert_eq!(mgr.status(), ConnectionState::Connecting);
        mgr.disconnect();
        assert_eq!(mgr.status(), ConnectionState::Disconnected);
        assert_eq!(feed.stats().released(), 1);
        // a second disconnect has nothing left to release
        mgr.disconnect();
        assert_eq!(feed.stats().released(), 1);
    }

    #[test]
    fn disconnect_without_any_session() {
        let mut mgr = manager(ManualSource::new());
        mgr.disconnect();
        assert_eq!(mgr.status(), ConnectionState::Disconnected);
    }

    #[test]
    fn invalidated_session_drops_to_disconnected() {
        let session = ManualSession::new(2);
        let feed = session.feed();
        feed.push(value(1.0));
        feed.push_error(FetchError::SessionInvalidated("BOARD_NOT_CREATED_ERROR:15".into()));
        let mut mgr = manager(ManualSource::new().accept(session));
        mgr.connect(Instant::now()).unwrap();
        assert!(mgr.fetch(10).unwrap().is_some());
        assert!(mgr.fetch(10).unwrap().is_none());
        assert_eq!(mgr.status(), ConnectionState::Disconnected);
        assert_eq!(feed.stats().released(), 1);
    }

    #[test]
    fn unrecognized_fetch_error_propagates() {
        let session = ManualSession::new(2);
        let feed = session.feed();
        feed.push_error(FetchError::Unrecognized("GENERAL_ERROR:17".into()));
        let mut mgr = manager(ManualSource::new().accept(session));
        mgr.connect(Instant::now()).unwrap();
        assert!(mgr.fetch(10).is_err());
        assert_eq!(mgr.status(), ConnectionState::Disconnected);
    }

    #[test]
    fn fetch_while_disconnected_yields_nothing() {
        let mut mgr = manager(ManualSource::new());
        assert!(mgr.fetch(10).unwrap().is_none());
    }

    #[test]
    fn liveness_ignores_small_jitter() {
        let t0 = Instant::now();
        let mut tracker = LivenessTracker::new(0.01, t0);
        assert!(!tracker.observe(1.0, t0));
        assert!(!tracker.observe(1.005, t0 + Duration::from_secs(1)));
        assert_eq!(tracker.stale_for(t0 + Duration::from_secs(1)), Duration::from_secs(1));
        assert!(tracker.observe(1.5, t0 + Duration::from_secs(2)));
        assert_eq!(tracker.last_value(), Some(1.5));
    }
}
