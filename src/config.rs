// Tuning constants for the exposure controllers. The defaults are the values
// the controllers were tuned with; the binaries expose the interesting ones as
// command line flags.

use std::time::Duration;

use canonical_error::{CanonicalError, invalid_argument_error};

/// Proportional controller tuning.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ControllerConfig {
    /// Convergence is declared for an under-target image whose overexposure
    /// ratio is below this.
    pub convergence_overexposure_ratio: f64,

    /// Fraction of the brightness error applied per frame.
    pub adjustment_factor: f64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig{convergence_overexposure_ratio: 0.03,
                         adjustment_factor: 0.1}
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<(), CanonicalError> {
        let ratio = self.convergence_overexposure_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(invalid_argument_error(
                format!("convergence overexposure ratio {} not in (0, 1]", ratio).as_str()));
        }
        let factor = self.adjustment_factor;
        if !(factor > 0.0 && factor <= 1.0) {
            return Err(invalid_argument_error(
                format!("adjustment factor {} not in (0, 1]", factor).as_str()));
        }
        Ok(())
    }
}

/// Histogram-peak overexposure corrector tuning.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CorrectorConfig {
    /// The correction fires when the histogram peak bin is strictly above
    /// this.
    pub peak_bin_threshold: u8,

    /// Multiplier applied to both exposure and gain on each correction.
    pub decay: f64,

    /// Floors applied after decay, before device clamping.
    pub min_exposure_time: f64,
    pub min_gain: f64,
}

impl Default for CorrectorConfig {
    fn default() -> Self {
        CorrectorConfig{peak_bin_threshold: 200,
                        decay: 0.9,
                        min_exposure_time: 1000.0,
                        min_gain: 0.0}
    }
}

impl CorrectorConfig {
    pub fn validate(&self) -> Result<(), CanonicalError> {
        if !(self.decay > 0.0 && self.decay < 1.0) {
            return Err(invalid_argument_error(
                format!("decay {} not in (0, 1)", self.decay).as_str()));
        }
        if self.min_exposure_time < 0.0 || self.min_gain < 0.0 {
            return Err(invalid_argument_error("corrector floors must not be negative"));
        }
        Ok(())
    }
}

/// A fixed exposure time (microseconds) and gain (dB) pair.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ManualPreset {
    pub exposure_time: f64,
    pub gain: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AutoTuneConfig {
    /// Desired mean pixel value.
    pub target_brightness: f64,

    /// Pixels at or above this value count as overexposed.
    pub overexposure_threshold: u8,

    pub controller: ControllerConfig,

    /// Minimum wall-clock time between saved snapshots.
    pub snapshot_interval: Duration,

    /// How long to keep capturing (and saving snapshots) after convergence.
    /// Zero means stop on the convergence frame.
    pub post_convergence_run: Duration,
}

impl Default for AutoTuneConfig {
    fn default() -> Self {
        AutoTuneConfig{target_brightness: 125.0,
                       overexposure_threshold: 255,
                       controller: ControllerConfig::default(),
                       snapshot_interval: Duration::from_millis(500),
                       post_convergence_run: Duration::ZERO}
    }
}

impl AutoTuneConfig {
    pub fn validate(&self) -> Result<(), CanonicalError> {
        let target = self.target_brightness;
        if !(target > 0.0 && target <= 255.0) {
            return Err(invalid_argument_error(
                format!("target brightness {} not in (0, 255]", target).as_str()));
        }
        self.controller.validate()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct InteractiveConfig {
    /// Selected by the 'n' command.
    pub preset1: ManualPreset,
    /// Selected by the 'm' command.
    pub preset2: ManualPreset,

    pub corrector: CorrectorConfig,

    /// Nominal frame rate recorded for the session video.
    pub video_fps: f64,
}

impl Default for InteractiveConfig {
    fn default() -> Self {
        InteractiveConfig{preset1: ManualPreset{exposure_time: 5000.0, gain: 25.0},
                          preset2: ManualPreset{exposure_time: 6000.0, gain: 30.0},
                          corrector: CorrectorConfig::default(),
                          video_fps: 30.0}
    }
}

impl InteractiveConfig {
    pub fn validate(&self) -> Result<(), CanonicalError> {
        if !(self.video_fps > 0.0) {
            return Err(invalid_argument_error(
                format!("video fps {} must be positive", self.video_fps).as_str()));
        }
        self.corrector.validate()
    }
}
