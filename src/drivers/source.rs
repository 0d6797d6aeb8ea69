// src/drivers/source.rs
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use ndarray::{Array2, ArrayView1, ShapeError};

use crate::drivers::error::{ConnectError, FetchError};
use crate::types::Target;

/// One fetch worth of raw readings: channels x samples, newest sample last.
#[derive(Clone, Debug, PartialEq)]
pub struct SampleBatch {
    pub data: Array2<f64>,
}

impl SampleBatch {
    pub fn new(data: Array2<f64>) -> Self {
        Self { data }
    }

    /// Builds a batch from equally sized per-channel rows.
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self, ShapeError> {
        let channels = rows.len();
        let samples = rows.first().map(|r| r.len()).unwrap_or(0);
        let flat: Vec<f64> = rows.into_iter().flatten().collect();
        let data = Array2::from_shape_vec((channels, samples), flat)?;
        Ok(Self { data })
    }

    /// Every sample of every channel set to `value`.
    pub fn constant(channels: usize, samples: usize, value: f64) -> Self {
        Self {
            data: Array2::from_elem((channels, samples), value),
        }
    }

    pub fn num_channels(&self) -> usize {
        self.data.nrows()
    }

    pub fn num_samples(&self) -> usize {
        self.data.ncols()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn row(&self, channel: usize) -> Option<ArrayView1<'_, f64>> {
        (channel < self.num_channels()).then(|| self.data.row(channel))
    }

    /// Newest sample of a channel.
    pub fn latest(&self, channel: usize) -> Option<f64> {
        self.row(channel).and_then(|row| row.iter().next_back().copied())
    }
}

/// An open device session. Owned exclusively by the connection manager.
pub trait Session {
    fn num_channels(&self) -> usize;
    fn start(&mut self) -> Result<(), ConnectError>;
    /// Non-blocking. `Ok(None)` means no data is ready yet.
    fn fetch(&mut self, max_samples: usize) -> Result<Option<SampleBatch>, FetchError>;
    fn stop(&mut self) -> Result<(), FetchError>;
    fn release(&mut self) -> Result<(), FetchError>;
}

/// Something that can open sessions on a target.
pub trait SampleSource {
    type Session: Session;
    fn open(&mut self, target: &Target) -> Result<Self::Session, ConnectError>;
}

/// Releases `session`, logging a failure instead of returning it.
/// Returns whether the release went through.
pub fn release_logged<S: Session + ?Sized>(session: &mut S, context: &str) -> bool {
    match session.release() {
        Ok(()) => true,
        Err(err) => {
            log::warn!("releasing session ({context}) failed: {err}");
            false
        }
    }
}

/// Counters shared between a [`ManualSession`] and whoever scripted it.
#[derive(Debug, Default)]
pub struct SessionStats {
    started: AtomicUsize,
    fetched: AtomicUsize,
    stopped: AtomicUsize,
    released: AtomicUsize,
}

impl SessionStats {
    pub fn started(&self) -> usize {
        self.started.load(Ordering::Relaxed)
    }
    pub fn fetched(&self) -> usize {
        self.fetched.load(Ordering::Relaxed)
    }
    pub fn stopped(&self) -> usize {
        self.stopped.load(Ordering::Relaxed)
    }
    pub fn released(&self) -> usize {
        self.released.load(Ordering::Relaxed)
    }
}

type FetchResult = Result<Option<SampleBatch>, FetchError>;

/// Handle for feeding a [`ManualSession`] after it has been handed off.
#[derive(Clone, Default)]
pub struct SessionFeed {
    queue: Arc<Mutex<VecDeque<FetchResult>>>,
    stats: Arc<SessionStats>,
}

impl SessionFeed {
    pub fn push(&self, batch: SampleBatch) {
        self.lock().push_back(Ok(Some(batch)));
    }

    pub fn push_empty(&self) {
        self.lock().push_back(Ok(None));
    }

    pub fn push_error(&self, err: FetchError) {
        self.lock().push_back(Err(err));
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<FetchResult>> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// In-memory session useful for tests and deterministic playback.
pub struct ManualSession {
    num_channels: usize,
    feed: SessionFeed,
    start_error: Option<ConnectError>,
    teardown_error: Option<FetchError>,
}

impl ManualSession {
    pub fn new(num_channels: usize) -> Self {
        Self {
            num_channels,
            feed: SessionFeed::default(),
            start_error: None,
            teardown_error: None,
        }
    }

    pub fn feed(&self) -> SessionFeed {
        self.feed.clone()
    }

    pub fn fail_start(mut self, err: ConnectError) -> Self {
        self.start_error = Some(err);
        self
    }

    /// Makes both `stop` and `release` fail with `err`.
    pub fn fail_teardown(mut self, err: FetchError) -> Self {
        self.teardown_error = Some(err);
        self
    }
}

impl Session for ManualSession {
    fn num_channels(&self) -> usize {
        self.num_channels
    }

    fn start(&mut self) -> Result<(), ConnectError> {
        self.feed.stats.started.fetch_add(1, Ordering::Relaxed);
        match self.start_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn fetch(&mut self, _max_samples: usize) -> FetchResult {
        self.feed.stats.fetched.fetch_add(1, Ordering::Relaxed);
        self.feed.lock().pop_front().unwrap_or(Ok(None))
    }

    fn stop(&mut self) -> Result<(), FetchError> {
        self.feed.stats.stopped.fetch_add(1, Ordering::Relaxed);
        match &self.teardown_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn release(&mut self) -> Result<(), FetchError> {
        self.feed.stats.released.fetch_add(1, Ordering::Relaxed);
        match &self.teardown_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

/// Scripted source: each `open` pops the next scripted outcome.
///
/// Once the script runs out every further attempt fails with the
/// `exhausted` error (transport unavailable unless overridden).
pub struct ManualSource {
    script: VecDeque<Result<ManualSession, ConnectError>>,
    exhausted: Option<ConnectError>,
    attempts: Vec<Target>,
}

impl ManualSource {
    pub fn new() -> Self {
        Self {
            script: VecDeque::new(),
            exhausted: None,
            attempts: Vec::new(),
        }
    }

    /// A source that refuses every target with the same error.
    pub fn always(err: ConnectError) -> Self {
        Self {
            exhausted: Some(err),
            ..Self::new()
        }
    }

    pub fn accept(mut self, session: ManualSession) -> Self {
        self.script.push_back(Ok(session));
        self
    }

    pub fn refuse(mut self, err: ConnectError) -> Self {
        self.script.push_back(Err(err));
        self
    }

    pub fn attempts(&self) -> &[Target] {
        &self.attempts
    }
}

impl Default for ManualSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleSource for ManualSource {
    type Session = ManualSession;

    fn open(&mut self, target: &Target) -> Result<ManualSession, ConnectError> {
        self.attempts.push(target.clone());
        match self.script.pop_front() {
            Some(Ok(session)) => Ok(session),
            Some(Err(err)) => Err(with_target(err, target)),
            None => Err(match &self.exhausted {
                Some(err) => with_target(err.clone(), target),
                None => ConnectError::TransportUnavailable {
                    target: target.to_string(),
                    detail: "nothing scripted".into(),
                },
            }),
        }
    }
}

fn with_target(err: ConnectError, target: &Target) -> ConnectError {
    let target = target.to_string();
    match err {
        ConnectError::TransportUnavailable { detail, .. } => {
            ConnectError::TransportUnavailable { target, detail }
        }
        ConnectError::DeviceNotReady { detail, .. } => ConnectError::DeviceNotReady { target, detail },
        ConnectError::DeviceLocked { detail, .. } => ConnectError::DeviceLocked { target, detail },
        ConnectError::Unrecognized { detail, .. } => ConnectError::Unrecognized { target, detail },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_from_rows_keeps_channel_major_layout() {
        let batch = SampleBatch::from_rows(vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]).unwrap();
        assert_eq!(batch.num_channels(), 2);
        assert_eq!(batch.num_samples(), 3);
        assert_eq!(batch.latest(1), Some(6.0));
        assert_eq!(batch.latest(2), None);
    }

    #[test]
    fn failed_release_is_reported_not_raised() {
        let mut session = ManualSession::new(1).fail_teardown(FetchError::Unrecognized("gone".into()));
        let feed = session.feed();
        assert!(!release_logged(&mut session, "layout lookup"));
        assert_eq!(feed.stats().released(), 1);
        assert!(release_logged(&mut ManualSession::new(1), "shutdown"));
    }

    #[test]
    fn ragged_rows_are_rejected() {
        assert!(SampleBatch::from_rows(vec![vec![1.0, 2.0], vec![3.0]]).is_err());
    }

    #[test]
    fn manual_source_replays_script_then_refuses() {
        let session = ManualSession::new(4);
        let feed = session.feed();
        feed.push(SampleBatch::constant(4, 2, 1.0));
        let mut source = ManualSource::new()
            .refuse(ConnectError::DeviceNotReady {
                target: String::new(),
                detail: "BOARD_NOT_READY_ERROR:7".into(),
            })
            .accept(session);
        let com1 = Target::Serial { port: "COM1".into() };
        let com2 = Target::Serial { port: "COM2".into() };
        match source.open(&com1) {
            Err(ConnectError::DeviceNotReady { target, .. }) => assert_eq!(target, "COM1"),
            _ => panic!("expected a not-ready refusal"),
        }
        let mut opened = source.open(&com2).unwrap();
        assert_eq!(opened.num_channels(), 4);
        assert!(opened.fetch(10).unwrap().is_some());
        assert!(opened.fetch(10).unwrap().is_none());
        assert_eq!(feed.stats().fetched(), 2);
        assert!(matches!(
            source.open(&com1),
            Err(ConnectError::TransportUnavailable { .. })
        ));
        assert_eq!(source.attempts().len(), 3);
    }
}
