use canonical_error::CanonicalError;
use log::info;

use crate::abstract_camera::{DeviceParameters, Frame, Parameter,
                             apply_manual_exposure_and_gain};
use crate::config::CorrectorConfig;
use crate::metering::compute_histogram;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum CorrectionOutcome {
    NotOverexposed { peak_bin: u8 },
    /// Carries the values written to the camera.
    Corrected { peak_bin: u8, exposure_time: f64, gain: f64 },
}

/// Reactive overexposure rule: if the most populated histogram bin is too
/// bright, back exposure and gain off by a fixed factor. This looks at where
/// the histogram mode lies, not at how many pixels clip, so it is much
/// cruder than ProportionalController.
#[derive(Clone, Debug)]
pub struct OverexposureCorrector {
    config: CorrectorConfig,
}

impl OverexposureCorrector {
    pub fn new(config: CorrectorConfig) -> Self {
        OverexposureCorrector{config}
    }

    pub fn correct_if_overexposed<P>(&self, frame: &Frame, params: &mut P)
                                     -> Result<CorrectionOutcome, CanonicalError>
    where P: DeviceParameters + ?Sized
    {
        let peak_bin = compute_histogram(frame).peak_bin();
        if peak_bin <= self.config.peak_bin_threshold {
            return Ok(CorrectionOutcome::NotOverexposed{peak_bin});
        }
        let exposure_time = params.get_value(Parameter::ExposureTime)?;
        let gain = params.get_value(Parameter::Gain)?;
        let new_exposure_time = f64::max(self.config.min_exposure_time,
                                         exposure_time * self.config.decay);
        let new_gain = f64::max(self.config.min_gain, gain * self.config.decay);
        info!("Histogram peak at {}, reducing exposure and gain", peak_bin);
        let (exposure_time, gain) =
            apply_manual_exposure_and_gain(params, new_exposure_time, new_gain)?;
        Ok(CorrectionOutcome::Corrected{peak_bin, exposure_time, gain})
    }
}
