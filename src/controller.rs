// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use canonical_error::CanonicalError;
use log::debug;

use crate::abstract_camera::{DeviceParameters, Parameter};
use crate::config::ControllerConfig;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AdjustOutcome {
    /// A parameter was adjusted; keep feeding frames.
    Continue,
    /// Stopping condition reached, or nothing is left to adjust. Nothing was
    /// written.
    Converged,
    /// Exposure or gain cannot be read and written. Nothing was written.
    Unavailable,
}

/// Walks gain, then exposure time, toward a target mean brightness.
///
/// Gain is moved first because gain changes settle quickly and do not
/// affect frame timing; exposure time is only touched once gain is pinned at
/// the end of its range.
#[derive(Clone, Debug)]
pub struct ProportionalController {
    config: ControllerConfig,
}

impl ProportionalController {
    pub fn new(config: ControllerConfig) -> Self {
        ProportionalController{config}
    }

    /// Makes one adjustment decision for a frame whose mean brightness is
    /// `current_brightness` and whose overexposure ratio is
    /// `overexposure_ratio`.
    ///
    /// An under-target image that is not overexposed counts as converged,
    /// even though it never reached `target_brightness`. So does an image
    /// for which neither gain nor exposure time can move any further.
    pub fn adjust<P>(&self, params: &mut P, target_brightness: f64,
                     current_brightness: f64, overexposure_ratio: f64)
                     -> Result<AdjustOutcome, CanonicalError>
    where P: DeviceParameters + ?Sized
    {
        if !params.is_accessible(Parameter::ExposureTime) ||
            !params.is_accessible(Parameter::Gain)
        {
            return Ok(AdjustOutcome::Unavailable);
        }
        let under_target = current_brightness < target_brightness;
        if under_target &&
            overexposure_ratio < self.config.convergence_overexposure_ratio
        {
            return Ok(AdjustOutcome::Converged);
        }

        // Avoid div0 on a black frame.
        let brightness_ratio = target_brightness / f64::max(current_brightness, 1.0);
        let step = 1.0 + self.config.adjustment_factor * (brightness_ratio - 1.0);

        // Gain first. A gain that the step cannot move (zero, or a ratio of
        // exactly one) hands over to exposure time as if it were pinned.
        for parameter in [Parameter::Gain, Parameter::ExposureTime] {
            if let Some(new_value) = Self::step_value(params, parameter, step, under_target)? {
                let applied = params.set_clamped(parameter, new_value)?;
                debug!("brightness {:.1} (target {:.1}), overexposed {:.4}: {} -> {:.3}",
                       current_brightness, target_brightness, overexposure_ratio,
                       parameter, applied);
                return Ok(AdjustOutcome::Continue);
            }
        }
        debug!("brightness {:.1} (target {:.1}), overexposed {:.4}: nothing left to adjust",
               current_brightness, target_brightness, overexposure_ratio);
        Ok(AdjustOutcome::Converged)
    }

    // The value `parameter` moves to, or None if it is already at the end of
    // its range in the direction of travel or the step leaves it unchanged.
    fn step_value<P>(params: &P, parameter: Parameter, step: f64, raise: bool)
                     -> Result<Option<f64>, CanonicalError>
    where P: DeviceParameters + ?Sized
    {
        let value = params.get_value(parameter)?;
        let new_value = if raise {
            let max = params.get_max(parameter)?;
            if value >= max {
                return Ok(None);
            }
            f64::min(value * step, max)
        } else {
            let min = params.get_min(parameter)?;
            if value <= min {
                return Ok(None);
            }
            f64::max(value * step, min)
        };
        if new_value == value {
            return Ok(None);
        }
        Ok(Some(new_value))
    }
}
