// Fake camera that renders a fixed scene image through a linear sensor model.
// For testing, and for running the exposure programs without hardware.

use std::sync::Arc;

use canonical_error::{CanonicalError, failed_precondition_error, internal_error,
                      invalid_argument_error, unavailable_error};
use image::GrayImage;
use log::debug;

use crate::abstract_camera::{AbstractCamera, AutoMode, BufferPool, CaptureParams,
                             DeviceParameters, Frame, FrameSource, Parameter};

// Number of frame buffers; mirrors the small fixed pools of real SDKs.
const NUM_BUFFERS: usize = 4;

// The built-in auto engine aims for this mean pixel value.
const AUTO_TARGET_MEAN: f64 = 125.0;

#[derive(Copy, Clone, Debug)]
struct ParameterState {
    value: f64,
    min: f64,
    max: f64,
    auto_mode: AutoMode,

    readable: bool,
    writable: bool,
    auto_mode_accessible: bool,
}

impl ParameterState {
    fn new(value: f64, min: f64, max: f64) -> ParameterState {
        ParameterState{value, min, max,
                       auto_mode: AutoMode::Off,
                       readable: true,
                       writable: true,
                       auto_mode_accessible: true}
    }

    fn clamp(&self, value: f64) -> f64 {
        f64::max(f64::min(value, self.max), self.min)
    }
}

pub struct ImageCamera {
    // The scene as seen at `reference_exposure` and zero gain.
    scene: Arc<GrayImage>,
    reference_exposure: f64,

    exposure: ParameterState,  // Microseconds.
    gain: ParameterState,  // dB.

    pool: Arc<BufferPool>,
    session_active: bool,
    sessions_started: i32,
    frame_id: i32,

    // Test hooks.
    incomplete_frames_pending: i32,
    timeouts_pending: i32,
    device_failure_pending: bool,
    write_count: i32,
}

impl ImageCamera {
    /// The scene renders unchanged at the default settings (5000us, 0dB).
    pub fn new(image: GrayImage) -> Result<Self, CanonicalError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(invalid_argument_error("ImageCamera needs a non-empty image"));
        }
        let buffer_size = width as usize * height as usize;
        Ok(ImageCamera{scene: Arc::new(image),
                       reference_exposure: 5000.0,
                       exposure: ParameterState::new(5000.0, 10.0, 30000.0),
                       gain: ParameterState::new(0.0, 0.0, 47.9),
                       pool: BufferPool::new(NUM_BUFFERS, buffer_size),
                       session_active: false,
                       sessions_started: 0,
                       frame_id: 0,
                       incomplete_frames_pending: 0,
                       timeouts_pending: 0,
                       device_failure_pending: false,
                       write_count: 0})
    }

    /// Replaces the range of `parameter`. The current value is clamped into
    /// the new range.
    pub fn set_range(&mut self, parameter: Parameter, min: f64, max: f64)
                     -> Result<(), CanonicalError> {
        if !(min <= max) {
            return Err(invalid_argument_error(
                format!("empty {} range [{}, {}]", parameter, min, max).as_str()));
        }
        let state = self.state_mut(parameter);
        state.min = min;
        state.max = max;
        state.value = state.clamp(state.value);
        Ok(())
    }

    /// Sets a value directly, bypassing auto mode and access checks.
    pub fn force_value(&mut self, parameter: Parameter, value: f64) {
        let state = self.state_mut(parameter);
        state.value = state.clamp(value);
    }

    pub fn set_parameter_access(&mut self, parameter: Parameter,
                                readable: bool, writable: bool) {
        let state = self.state_mut(parameter);
        state.readable = readable;
        state.writable = writable;
    }

    pub fn set_auto_mode_accessible(&mut self, parameter: Parameter, accessible: bool) {
        self.state_mut(parameter).auto_mode_accessible = accessible;
    }

    /// The next `count` frames are delivered flagged incomplete.
    pub fn inject_incomplete_frames(&mut self, count: i32) {
        self.incomplete_frames_pending += count;
    }

    /// The next `count` get_next_frame() calls time out.
    pub fn inject_timeouts(&mut self, count: i32) {
        self.timeouts_pending += count;
    }

    /// The next get_next_frame() call fails.
    pub fn inject_device_failure(&mut self) {
        self.device_failure_pending = true;
    }

    /// Number of successful set_value() calls.
    pub fn write_count(&self) -> i32 {
        self.write_count
    }

    pub fn sessions_started(&self) -> i32 {
        self.sessions_started
    }

    pub fn buffer_pool(&self) -> Arc<BufferPool> {
        self.pool.clone()
    }

    fn state(&self, parameter: Parameter) -> &ParameterState {
        match parameter {
            Parameter::ExposureTime => &self.exposure,
            Parameter::Gain => &self.gain,
        }
    }

    fn state_mut(&mut self, parameter: Parameter) -> &mut ParameterState {
        match parameter {
            Parameter::ExposureTime => &mut self.exposure,
            Parameter::Gain => &mut self.gain,
        }
    }

    // Linear response: scene value scaled by relative exposure and by gain.
    fn render(&self, buffer: &mut [u8]) -> f64 {
        let scale = self.exposure.value / self.reference_exposure *
            10_f64.powf(self.gain.value / 20.0);
        let mut sum = 0_u64;
        for (out, scene) in buffer.iter_mut().zip(self.scene.as_raw().iter()) {
            let value = f64::min((*scene as f64 * scale).round(), 255.0) as u8;
            *out = value;
            sum += value as u64;
        }
        sum as f64 / buffer.len() as f64
    }

    // Crude stand-in for the camera's built-in auto exposure / auto gain.
    // Exposure moves first; gain moves when exposure is pinned or manual.
    fn run_auto_engine(&mut self, mean: f64) {
        let ratio = (AUTO_TARGET_MEAN / f64::max(mean, 1.0)).clamp(0.5, 2.0);
        let mut exposure_moved = false;
        if self.exposure.auto_mode == AutoMode::Continuous {
            let new_exposure = self.exposure.clamp(self.exposure.value * ratio.sqrt());
            exposure_moved = new_exposure != self.exposure.value;
            self.exposure.value = new_exposure;
        }
        if self.gain.auto_mode == AutoMode::Continuous && !exposure_moved {
            self.gain.value = self.gain.clamp(self.gain.value + 10.0 * ratio.log10());
        }
    }
}

impl DeviceParameters for ImageCamera {
    fn is_readable(&self, parameter: Parameter) -> bool {
        self.state(parameter).readable
    }

    // As on GenICam cameras, a parameter under auto control cannot be
    // written.
    fn is_writable(&self, parameter: Parameter) -> bool {
        let state = self.state(parameter);
        state.writable && state.auto_mode == AutoMode::Off
    }

    fn get_value(&self, parameter: Parameter) -> Result<f64, CanonicalError> {
        let state = self.state(parameter);
        if !state.readable {
            return Err(failed_precondition_error(
                format!("{} is not readable", parameter).as_str()));
        }
        Ok(state.value)
    }

    fn set_value(&mut self, parameter: Parameter, value: f64)
                 -> Result<(), CanonicalError> {
        if !self.is_writable(parameter) {
            return Err(failed_precondition_error(
                format!("{} is not writable", parameter).as_str()));
        }
        let state = self.state_mut(parameter);
        if !(value >= state.min && value <= state.max) {
            return Err(invalid_argument_error(
                format!("{} value {} outside [{}, {}]",
                        parameter, value, state.min, state.max).as_str()));
        }
        state.value = value;
        self.write_count += 1;
        Ok(())
    }

    fn get_min(&self, parameter: Parameter) -> Result<f64, CanonicalError> {
        let state = self.state(parameter);
        if !state.readable {
            return Err(failed_precondition_error(
                format!("{} is not readable", parameter).as_str()));
        }
        Ok(state.min)
    }

    fn get_max(&self, parameter: Parameter) -> Result<f64, CanonicalError> {
        let state = self.state(parameter);
        if !state.readable {
            return Err(failed_precondition_error(
                format!("{} is not readable", parameter).as_str()));
        }
        Ok(state.max)
    }

    fn is_auto_mode_accessible(&self, parameter: Parameter) -> bool {
        self.state(parameter).auto_mode_accessible
    }

    fn get_auto_mode(&self, parameter: Parameter) -> Result<AutoMode, CanonicalError> {
        Ok(self.state(parameter).auto_mode)
    }

    fn set_auto_mode(&mut self, parameter: Parameter, mode: AutoMode)
                     -> Result<(), CanonicalError> {
        let state = self.state_mut(parameter);
        if !state.auto_mode_accessible {
            return Err(failed_precondition_error(
                format!("auto {} is not accessible", parameter).as_str()));
        }
        state.auto_mode = mode;
        Ok(())
    }
}

impl FrameSource for ImageCamera {
    fn begin_session(&mut self) -> Result<(), CanonicalError> {
        if self.session_active {
            return Err(failed_precondition_error("Acquisition already started"));
        }
        self.session_active = true;
        self.sessions_started += 1;
        debug!("ImageCamera acquisition started");
        Ok(())
    }

    fn end_session(&mut self) -> Result<(), CanonicalError> {
        if !self.session_active {
            return Err(failed_precondition_error("Acquisition not started"));
        }
        self.session_active = false;
        debug!("ImageCamera acquisition stopped");
        Ok(())
    }

    fn is_session_active(&self) -> bool {
        self.session_active
    }

    fn get_next_frame(&mut self) -> Result<Option<Frame>, CanonicalError> {
        if !self.session_active {
            return Err(failed_precondition_error("Acquisition not started"));
        }
        if self.device_failure_pending {
            self.device_failure_pending = false;
            return Err(internal_error("Simulated device failure"));
        }
        if self.timeouts_pending > 0 {
            self.timeouts_pending -= 1;
            return Ok(None);
        }
        let mut buffer = match self.pool.take() {
            Some(b) => b,
            None => return Err(unavailable_error("No free frame buffers")),
        };
        let mean = self.render(&mut buffer);
        let capture_params = CaptureParams{exposure_time: self.exposure.value,
                                           gain: self.gain.value};
        self.frame_id += 1;
        let (width, height) = self.scene.dimensions();
        let mut frame = Frame::new(width, height, buffer, self.frame_id, capture_params)?
            .return_buffer_to(self.pool.clone());
        if self.incomplete_frames_pending > 0 {
            self.incomplete_frames_pending -= 1;
            frame = frame.mark_incomplete("simulated dropped packets");
        } else {
            self.run_auto_engine(mean);
        }
        Ok(Some(frame))
    }
}

impl AbstractCamera for ImageCamera {
    fn model(&self) -> String {
        "ImageCamera".to_string()
    }

    fn dimensions(&self) -> (u32, u32) {
        self.scene.dimensions()
    }
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;
    use canonical_error::CanonicalErrorCode;
    use image::Luma;
    use super::*;
    use crate::metering::compute_brightness;

    fn flat_camera(value: u8) -> ImageCamera {
        ImageCamera::new(GrayImage::from_pixel(32, 24, Luma([value]))).unwrap()
    }

    #[test]
    fn test_renders_linear_response() {
        let mut camera = flat_camera(50);
        camera.begin_session().unwrap();
        let frame = camera.get_next_frame().unwrap().unwrap();
        assert!(frame.is_complete());
        assert_abs_diff_eq!(compute_brightness(&frame).unwrap(), 50.0);
        drop(frame);

        camera.set_clamped(Parameter::ExposureTime, 10000.0).unwrap();
        let frame = camera.get_next_frame().unwrap().unwrap();
        assert_abs_diff_eq!(compute_brightness(&frame).unwrap(), 100.0);
        assert_eq!(frame.capture_params().exposure_time, 10000.0);
        drop(frame);

        // 20dB is 10x; clips.
        camera.set_clamped(Parameter::Gain, 20.0).unwrap();
        let frame = camera.get_next_frame().unwrap().unwrap();
        assert_abs_diff_eq!(compute_brightness(&frame).unwrap(), 255.0);
    }

    #[test]
    fn test_not_writable_under_auto() {
        let mut camera = flat_camera(50);
        camera.set_auto_mode(Parameter::Gain, AutoMode::Continuous).unwrap();
        assert!(camera.is_readable(Parameter::Gain));
        assert!(!camera.is_writable(Parameter::Gain));
        assert!(camera.set_value(Parameter::Gain, 1.0).is_err());
        camera.set_auto_mode(Parameter::Gain, AutoMode::Off).unwrap();
        assert!(camera.set_value(Parameter::Gain, 1.0).is_ok());
        assert_eq!(camera.write_count(), 1);
    }

    #[test]
    fn test_rejects_out_of_range_write() {
        let mut camera = flat_camera(50);
        let err = camera.set_value(Parameter::ExposureTime, 40000.0).unwrap_err();
        assert!(err.code == CanonicalErrorCode::InvalidArgument);
        assert_eq!(camera.set_clamped(Parameter::ExposureTime, 40000.0).unwrap(), 30000.0);
        assert_eq!(camera.set_clamped(Parameter::ExposureTime, 1.0).unwrap(), 10.0);
    }

    #[test]
    fn test_auto_engine_moves_toward_target() {
        let mut camera = flat_camera(20);
        camera.set_auto_mode(Parameter::ExposureTime, AutoMode::Continuous).unwrap();
        camera.set_auto_mode(Parameter::Gain, AutoMode::Continuous).unwrap();
        camera.begin_session().unwrap();
        let mut brightness = 0.0;
        for _ in 0..30 {
            let frame = camera.get_next_frame().unwrap().unwrap();
            brightness = compute_brightness(&frame).unwrap();
        }
        assert!((brightness - AUTO_TARGET_MEAN).abs() < 10.0, "brightness {}", brightness);
    }

    #[test]
    fn test_session_and_pool() {
        let mut camera = flat_camera(50);
        let err = camera.get_next_frame().unwrap_err();
        assert!(err.code == CanonicalErrorCode::FailedPrecondition);
        camera.begin_session().unwrap();
        assert!(camera.begin_session().is_err());

        // Holding every buffer starves the source.
        let mut held = Vec::new();
        for _ in 0..NUM_BUFFERS {
            held.push(camera.get_next_frame().unwrap().unwrap());
        }
        let err = camera.get_next_frame().unwrap_err();
        assert!(err.code == CanonicalErrorCode::Unavailable);
        held.clear();
        assert_eq!(camera.buffer_pool().available(), NUM_BUFFERS);
        assert!(camera.get_next_frame().unwrap().is_some());

        camera.end_session().unwrap();
        assert!(camera.end_session().is_err());
        assert_eq!(camera.sessions_started(), 1);
    }

    #[test]
    fn test_injected_conditions() {
        let mut camera = flat_camera(50);
        camera.begin_session().unwrap();
        camera.inject_incomplete_frames(1);
        camera.inject_timeouts(1);
        assert!(camera.get_next_frame().unwrap().is_none());
        let frame = camera.get_next_frame().unwrap().unwrap();
        assert!(!frame.is_complete());
        assert_eq!(frame.status(), Some("simulated dropped packets"));
        drop(frame);
        camera.inject_device_failure();
        assert!(camera.get_next_frame().is_err());
        assert!(camera.get_next_frame().unwrap().unwrap().is_complete());
        assert_eq!(camera.buffer_pool().available(), NUM_BUFFERS);
    }
}
