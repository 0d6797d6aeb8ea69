// src/classifier.rs
use log::warn;
use ndarray::{s, ArrayView1};

use crate::config::{ClassifierConfig, MAX_SENSITIVITY, MIN_SENSITIVITY};
use crate::drivers::{SampleBatch, SettingError};
use crate::types::ThresholdType;

/// Per-channel classification state.
#[derive(Clone, Debug, PartialEq)]
pub struct Channel {
    pub threshold: f64,
    pub threshold_type: ThresholdType,
    /// Samples per aggregation, in [`MIN_SENSITIVITY`, `MAX_SENSITIVITY`].
    pub sensitivity: usize,
    /// Latest aggregated reading.
    pub value: f64,
}

impl Channel {
    fn from_defaults(defaults: &ClassifierConfig) -> Self {
        Self {
            threshold: defaults.threshold,
            threshold_type: defaults.threshold_type,
            sensitivity: defaults.sensitivity,
            value: 0.0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.value > self.threshold
    }
}

/// Reduces the newest `sensitivity` samples of `row` to one reading.
///
/// With fewer samples than `sensitivity` the whole row is used. `None` for an
/// empty row.
pub fn aggregate(threshold_type: ThresholdType, sensitivity: usize, row: ArrayView1<'_, f64>) -> Option<f64> {
    let len = row.len();
    if len == 0 {
        return None;
    }
    let take = sensitivity.clamp(1, len);
    let window = row.slice(s![len - take..]);
    match threshold_type {
        ThresholdType::Average => window.mean(),
        ThresholdType::Max => window.iter().map(|v| v.abs()).reduce(f64::max),
        ThresholdType::Last => window.iter().next_back().copied(),
    }
}

/// Turns raw batches into one numeric reading and one on/off decision per channel.
///
/// Channels exist only while a session is open; `defaults` seeds them and is
/// updated by the all-channel setters so the next session inherits them.
pub struct ChannelClassifier {
    channels: Vec<Channel>,
    defaults: ClassifierConfig,
    verbose: bool,
}

impl ChannelClassifier {
    pub fn new(defaults: ClassifierConfig) -> Self {
        Self {
            channels: Vec::new(),
            defaults,
            verbose: false,
        }
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn defaults(&self) -> &ClassifierConfig {
        &self.defaults
    }

    /// Creates `num_channels` fresh channels from the defaults.
    pub fn open_session(&mut self, num_channels: usize) {
        self.channels = (0..num_channels)
            .map(|_| Channel::from_defaults(&self.defaults))
            .collect();
    }

    pub fn close_session(&mut self) {
        self.channels.clear();
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn channel(&self, channel: usize) -> Option<&Channel> {
        self.channels.get(channel)
    }

    /// Largest window any channel wants; the size of the next fetch.
    pub fn max_sensitivity(&self) -> usize {
        self.channels
            .iter()
            .map(|c| c.sensitivity)
            .max()
            .unwrap_or(self.defaults.sensitivity)
    }

    /// Aggregates every channel over the newest samples of `batch`.
    pub fn update(&mut self, batch: &SampleBatch) {
        if batch.is_empty() {
            return;
        }
        if batch.num_channels() != self.channels.len() {
            warn!(
                "batch has {} channels, classifier expects {}; extra channels ignored",
                batch.num_channels(),
                self.channels.len()
            );
        }
        for (index, channel) in self.channels.iter_mut().enumerate() {
            let Some(row) = batch.row(index) else { break };
            if let Some(value) = aggregate(channel.threshold_type, channel.sensitivity, row) {
                channel.value = value;
            }
        }
    }

    /// `read_numeric(channel) > threshold(channel)`; false for unknown channels.
    pub fn read_bool(&self, channel: usize) -> bool {
        self.channels.get(channel).map(Channel::is_active).unwrap_or(false)
    }

    /// Latest aggregated reading; 0.0 for unknown channels.
    pub fn read_numeric(&self, channel: usize) -> f64 {
        self.channels.get(channel).map(|c| c.value).unwrap_or(0.0)
    }

    pub fn threshold(&self, channel: usize) -> Option<f64> {
        self.channels.get(channel).map(|c| c.threshold)
    }

    pub fn set_threshold(&mut self, channel: usize, threshold: f64) -> Result<(), SettingError> {
        if !threshold.is_finite() {
            return Err(SettingError::InvalidThreshold(threshold));
        }
        chatter!(self.verbose, "setting threshold for channel {channel} to {threshold}");
        self.channel_mut(channel)?.threshold = threshold;
        Ok(())
    }

    pub fn threshold_type(&self, channel: usize) -> Option<ThresholdType> {
        self.channels.get(channel).map(|c| c.threshold_type)
    }

    pub fn set_threshold_type(
        &mut self,
        channel: usize,
        threshold_type: ThresholdType,
    ) -> Result<(), SettingError> {
        chatter!(self.verbose, "setting threshold type for channel {channel} to {threshold_type}");
        self.channel_mut(channel)?.threshold_type = threshold_type;
        Ok(())
    }

    pub fn set_threshold_type_all(&mut self, threshold_type: ThresholdType) {
        chatter!(self.verbose, "setting threshold type for all channels to {threshold_type}");
        self.defaults.threshold_type = threshold_type;
        for c in &mut self.channels {
            c.threshold_type = threshold_type;
        }
    }

    pub fn sensitivity(&self, channel: usize) -> Option<usize> {
        self.channels.get(channel).map(|c| c.sensitivity)
    }

    pub fn set_sensitivity(&mut self, channel: usize, sensitivity: usize) -> Result<(), SettingError> {
        check_sensitivity(sensitivity)?;
        chatter!(self.verbose, "setting threshold sensitivity for channel {channel} to {sensitivity}");
        self.channel_mut(channel)?.sensitivity = sensitivity;
        Ok(())
    }

    pub fn set_sensitivity_all(&mut self, sensitivity: usize) -> Result<(), SettingError> {
        check_sensitivity(sensitivity)?;
        chatter!(self.verbose, "setting threshold sensitivity for all channels to {sensitivity}");
        self.defaults.sensitivity = sensitivity;
        for c in &mut self.channels {
            c.sensitivity = sensitivity;
        }
        Ok(())
    }

    /// Moves the threshold just above the current reading so "now" counts as resting.
    pub fn auto_resting_threshold(&mut self, channel: usize) -> Result<(), SettingError> {
        let margin = self.defaults.resting_margin;
        let verbose = self.verbose;
        let c = self.channel_mut(channel)?;
        c.threshold = c.value * margin;
        chatter!(verbose, "auto resting threshold for channel {channel} = {}", c.threshold);
        Ok(())
    }

    pub fn auto_resting_threshold_all(&mut self) {
        let margin = self.defaults.resting_margin;
        for (index, c) in self.channels.iter_mut().enumerate() {
            c.threshold = c.value * margin;
            chatter!(self.verbose, "auto resting threshold for channel {index} = {}", c.threshold);
        }
    }

    fn channel_mut(&mut self, channel: usize) -> Result<&mut Channel, SettingError> {
        let num_channels = self.channels.len();
        self.channels
            .get_mut(channel)
            .ok_or(SettingError::ChannelOutOfRange {
                channel,
                num_channels,
            })
    }
}

fn check_sensitivity(sensitivity: usize) -> Result<(), SettingError> {
    if (MIN_SENSITIVITY..=MAX_SENSITIVITY).contains(&sensitivity) {
        Ok(())
    } else {
        Err(SettingError::SensitivityOutOfRange {
            value: sensitivity,
            min: MIN_SENSITIVITY,
            max: MAX_SENSITIVITY,
        })
    }
}
