use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use canonical_error::CanonicalError;
use log::{error, info, warn};

use crate::abstract_camera::{AbstractCamera, AcquisitionSession, AutoMode,
                             DeviceParameters, Frame, set_auto_exposure_and_gain};
use crate::config::AutoTuneConfig;
use crate::controller::{AdjustOutcome, ProportionalController};
use crate::frame_output::SnapshotSink;
use crate::metering::Metering;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ControlState {
    /// The camera's own auto exposure and auto gain are running; we only
    /// watch the results.
    HardwareAuto,
    /// Auto modes are off and ProportionalController adjusts once per frame.
    Converging,
    /// Adjustment finished and the auto modes are back on.
    Converged,
    /// Exposure or gain could not be controlled.
    Aborted,
}

/// Rate limiter for snapshot saving.
#[derive(Clone, Debug)]
pub struct SnapshotSchedule {
    interval: Duration,
    last: Instant,
}

impl SnapshotSchedule {
    pub fn new(interval: Duration, start: Instant) -> Self {
        SnapshotSchedule{interval, last: start}
    }

    /// Returns true if at least `interval` has passed since the last time
    /// this returned true (or since the last reset). A true result counts
    /// as a save.
    pub fn poll(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.last) >= self.interval {
            self.last = now;
            return true;
        }
        false
    }

    pub fn reset(&mut self, now: Instant) {
        self.last = now;
    }
}

/// What the capture loop should do with the frame just processed.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameDecision {
    pub save_snapshot: bool,
    /// Stop and restart acquisition before fetching the next frame.
    pub restart_acquisition: bool,
    pub finished: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AutoTuneReport {
    pub final_state: ControlState,
    /// Complete frames that were metered.
    pub frames_processed: u64,
    /// Incomplete frames plus fetch timeouts.
    pub frames_skipped: u64,
    pub controller_invocations: u64,
    pub snapshots_saved: u64,
    /// Time from leaving HardwareAuto to convergence.
    pub adjust_duration: Option<Duration>,
}

impl AutoTuneReport {
    /// Process exit status for this outcome. Errors that end the run early
    /// map to -1 at the call site.
    pub fn exit_code(&self) -> i32 {
        match self.final_state {
            ControlState::Aborted => 2,
            _ => 0,
        }
    }
}

/// The auto-tune state machine, fed one complete frame at a time.
pub struct AutoTuner {
    config: AutoTuneConfig,
    controller: ProportionalController,
    state: ControlState,
    schedule: SnapshotSchedule,

    converging_since: Option<Instant>,
    converged_at: Option<Instant>,

    frames_processed: u64,
    frames_skipped: u64,
    controller_invocations: u64,
    snapshots_saved: u64,
    adjust_duration: Option<Duration>,
}

impl AutoTuner {
    pub fn new(config: AutoTuneConfig, start: Instant) -> Self {
        let controller = ProportionalController::new(config.controller);
        let schedule = SnapshotSchedule::new(config.snapshot_interval, start);
        AutoTuner{config, controller,
                  state: ControlState::HardwareAuto,
                  schedule,
                  converging_since: None,
                  converged_at: None,
                  frames_processed: 0,
                  frames_skipped: 0,
                  controller_invocations: 0,
                  snapshots_saved: 0,
                  adjust_duration: None}
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    pub fn note_skipped_frame(&mut self) {
        self.frames_skipped += 1;
    }

    pub fn note_snapshot_saved(&mut self) {
        self.snapshots_saved += 1;
    }

    /// Meters `frame` and advances the state machine. `params` must be the
    /// camera that produced the frame.
    pub fn process_frame<P>(&mut self, frame: &Frame, params: &mut P, now: Instant)
                            -> Result<FrameDecision, CanonicalError>
    where P: DeviceParameters + ?Sized
    {
        let metering = Metering::measure(frame, self.config.overexposure_threshold)?;
        self.frames_processed += 1;
        let target = self.config.target_brightness;
        let mut decision = FrameDecision::default();
        match self.state {
            ControlState::HardwareAuto => {
                if metering.brightness >= target &&
                    metering.overexposure_ratio <
                    self.config.controller.convergence_overexposure_ratio
                {
                    decision.save_snapshot = self.schedule.poll(now);
                } else {
                    info!("Brightness {:.1} overexposed {:.4} under automatic control, \
                           adjusting manually",
                          metering.brightness, metering.overexposure_ratio);
                    set_auto_exposure_and_gain(params, AutoMode::Off)?;
                    self.state = ControlState::Converging;
                    self.converging_since = Some(now);
                    self.schedule.reset(now);
                    decision.restart_acquisition = true;
                }
            },
            ControlState::Converging => {
                self.controller_invocations += 1;
                match self.controller.adjust(params, target, metering.brightness,
                                             metering.overexposure_ratio)? {
                    AdjustOutcome::Continue => (),
                    AdjustOutcome::Converged => {
                        set_auto_exposure_and_gain(params, AutoMode::Continuous)?;
                        let started = self.converging_since.unwrap_or(now);
                        let duration = now.saturating_duration_since(started);
                        info!("Converged at brightness {:.1} after {} adjustments, \
                               adjust duration {:.3}s",
                              metering.brightness, self.controller_invocations,
                              duration.as_secs_f64());
                        self.adjust_duration = Some(duration);
                        self.state = ControlState::Converged;
                        self.converged_at = Some(now);
                        decision.save_snapshot = self.schedule.poll(now);
                        decision.finished = self.config.post_convergence_run.is_zero();
                    },
                    AdjustOutcome::Unavailable => {
                        error!("Exposure or gain is not accessible, aborting");
                        self.state = ControlState::Aborted;
                        decision.finished = true;
                    },
                }
            },
            ControlState::Converged => {
                decision.save_snapshot = self.schedule.poll(now);
                let converged_at = self.converged_at.unwrap_or(now);
                decision.finished = now.saturating_duration_since(converged_at) >=
                    self.config.post_convergence_run;
            },
            ControlState::Aborted => {
                decision.finished = true;
            },
        }
        Ok(decision)
    }

    pub fn report(&self) -> AutoTuneReport {
        AutoTuneReport{final_state: self.state,
                       frames_processed: self.frames_processed,
                       frames_skipped: self.frames_skipped,
                       controller_invocations: self.controller_invocations,
                       snapshots_saved: self.snapshots_saved,
                       adjust_duration: self.adjust_duration}
    }
}

/// Runs auto-tune on `camera` until the state machine finishes or `stop` is
/// raised. Acquisition is always ended before returning, including on error.
pub fn run_auto_tune<C>(camera: &mut C, config: &AutoTuneConfig,
                        snapshots: &mut dyn SnapshotSink, stop: &AtomicBool)
                        -> Result<AutoTuneReport, CanonicalError>
where C: AbstractCamera + ?Sized
{
    config.validate()?;
    info!("Auto-tuning {} toward brightness {:.1}",
          camera.model(), config.target_brightness);
    set_auto_exposure_and_gain(camera, AutoMode::Continuous)?;
    let mut tuner = AutoTuner::new(config.clone(), Instant::now());
    let mut session = AcquisitionSession::begin(&mut *camera)?;
    loop {
        if stop.load(Ordering::SeqCst) {
            info!("Stop requested");
            break;
        }
        let frame = match session.get_next_frame()? {
            Some(frame) if frame.is_complete() => frame,
            Some(frame) => {
                warn!("Image incomplete with image status {}",
                      frame.status().unwrap_or("unknown"));
                tuner.note_skipped_frame();
                continue;
            },
            None => {
                warn!("Timed out waiting for frame");
                tuner.note_skipped_frame();
                continue;
            },
        };
        let decision = tuner.process_frame(&frame, &mut *session, Instant::now())?;
        if decision.save_snapshot {
            snapshots.save_snapshot(&frame)?;
            tuner.note_snapshot_saved();
        }
        frame.release();
        if decision.finished {
            break;
        }
        if decision.restart_acquisition {
            session.end()?;
            session = AcquisitionSession::begin(&mut *camera)?;
        }
    }
    session.end()?;
    Ok(tuner.report())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use canonical_error::CanonicalErrorCode;
    use image::{GrayImage, Luma};
    use super::*;
    use crate::abstract_camera::{CaptureParams, FrameSource, Parameter};
    use crate::image_camera::ImageCamera;
    use crate::metering::compute_brightness;

    // Remembers the brightness of each saved frame. Optionally raises a stop
    // flag once `stop_after` snapshots have been taken.
    struct RecordingSink<'a> {
        brightness: Vec<f64>,
        stop_after: Option<(usize, &'a AtomicBool)>,
    }

    impl<'a> RecordingSink<'a> {
        fn new() -> Self {
            RecordingSink{brightness: Vec::new(), stop_after: None}
        }
    }

    impl SnapshotSink for RecordingSink<'_> {
        fn save_snapshot(&mut self, frame: &Frame) -> Result<PathBuf, CanonicalError> {
            self.brightness.push(compute_brightness(frame)?);
            if let Some((count, stop)) = self.stop_after {
                if self.brightness.len() >= count {
                    stop.store(true, Ordering::SeqCst);
                }
            }
            Ok(PathBuf::from(format!("snapshot-{}.jpg", self.brightness.len())))
        }
    }

    // Flat scenes render to integer mean brightness, so a fractional target
    // can never be hit exactly.
    fn test_config() -> AutoTuneConfig {
        AutoTuneConfig{target_brightness: 125.3,
                       snapshot_interval: Duration::ZERO,
                       ..Default::default()}
    }

    fn flat_camera(value: u8) -> ImageCamera {
        ImageCamera::new(GrayImage::from_pixel(64, 48, Luma([value]))).unwrap()
    }

    fn flat_frame(value: u8) -> Frame {
        Frame::new(8, 8, vec![value; 64], 0,
                   CaptureParams{exposure_time: 5000.0, gain: 0.0}).unwrap()
    }

    #[test]
    fn test_snapshot_schedule() {
        let start = Instant::now();
        let mut schedule = SnapshotSchedule::new(Duration::from_millis(500), start);
        assert!(!schedule.poll(start + Duration::from_millis(499)));
        assert!(schedule.poll(start + Duration::from_millis(500)));
        assert!(!schedule.poll(start + Duration::from_millis(900)));
        assert!(schedule.poll(start + Duration::from_millis(1000)));
        schedule.reset(start + Duration::from_millis(2000));
        assert!(!schedule.poll(start + Duration::from_millis(2400)));
        assert!(schedule.poll(start + Duration::from_millis(2600)));
    }

    #[test]
    fn test_hardware_auto_acceptable_frames_are_rate_limited() {
        let start = Instant::now();
        let mut tuner = AutoTuner::new(AutoTuneConfig::default(), start);
        let mut camera = flat_camera(10);
        let frame = flat_frame(150);

        let decision = tuner.process_frame(&frame, &mut camera,
                                           start + Duration::from_millis(100)).unwrap();
        assert_eq!(decision, FrameDecision::default());
        let decision = tuner.process_frame(&frame, &mut camera,
                                           start + Duration::from_millis(600)).unwrap();
        assert!(decision.save_snapshot);
        let decision = tuner.process_frame(&frame, &mut camera,
                                           start + Duration::from_millis(700)).unwrap();
        assert!(!decision.save_snapshot);
        assert_eq!(tuner.state(), ControlState::HardwareAuto);
        assert_eq!(camera.write_count(), 0);
    }

    #[test]
    fn test_unacceptable_frame_leaves_hardware_auto() {
        let start = Instant::now();
        let mut tuner = AutoTuner::new(AutoTuneConfig::default(), start);
        let mut camera = flat_camera(10);
        camera.set_auto_mode(Parameter::ExposureTime, AutoMode::Continuous).unwrap();
        camera.set_auto_mode(Parameter::Gain, AutoMode::Continuous).unwrap();

        // Bright enough but clipped.
        let decision = tuner.process_frame(&flat_frame(255), &mut camera, start).unwrap();
        assert!(decision.restart_acquisition);
        assert!(!decision.finished);
        assert_eq!(tuner.state(), ControlState::Converging);
        assert_eq!(camera.get_auto_mode(Parameter::ExposureTime).unwrap(), AutoMode::Off);
        assert_eq!(camera.get_auto_mode(Parameter::Gain).unwrap(), AutoMode::Off);
        assert_eq!(tuner.report().controller_invocations, 0);
    }

    #[test]
    fn test_converges_from_overexposure_and_hands_back_to_auto() {
        let mut camera = flat_camera(100);
        camera.force_value(Parameter::Gain, 12.0);
        let mut sink = RecordingSink::new();
        let stop = AtomicBool::new(false);
        let report = run_auto_tune(&mut camera, &test_config(), &mut sink, &stop).unwrap();

        assert_eq!(report.final_state, ControlState::Converged);
        assert_eq!(report.exit_code(), 0);
        assert!(report.controller_invocations > 10);
        assert!(report.adjust_duration.is_some());
        // One frame under hardware auto, then one per controller call.
        assert_eq!(report.frames_processed, report.controller_invocations + 1);
        assert_eq!(report.snapshots_saved, 1);
        assert_eq!(sink.brightness.len(), 1);
        assert!(sink.brightness[0] < 125.3);

        assert_eq!(camera.get_auto_mode(Parameter::ExposureTime).unwrap(),
                   AutoMode::Continuous);
        assert_eq!(camera.get_auto_mode(Parameter::Gain).unwrap(), AutoMode::Continuous);
        // Acquisition restarted around the handoff.
        assert_eq!(camera.sessions_started(), 2);
        assert!(!camera.is_session_active());
        let pool = camera.buffer_pool();
        assert_eq!(pool.available(), pool.capacity());
    }

    #[test]
    fn test_under_target_counts_as_converged() {
        let mut camera = flat_camera(40);
        let mut sink = RecordingSink::new();
        let stop = AtomicBool::new(false);
        let report = run_auto_tune(&mut camera, &test_config(), &mut sink, &stop).unwrap();
        assert_eq!(report.final_state, ControlState::Converged);
        assert_eq!(report.controller_invocations, 1);
        assert_eq!(camera.write_count(), 0);
    }

    // Dim scene whose highlight is clipped at any exposure the controller
    // reaches, so it is never accepted as converged from below.
    fn highlight_scene() -> GrayImage {
        GrayImage::from_fn(100, 10, |x, _| Luma([if x < 10 { 255 } else { 40 }]))
    }

    #[test]
    fn test_zero_gain_start_raises_exposure() {
        let mut camera = ImageCamera::new(highlight_scene()).unwrap();
        assert_eq!(camera.get_value(Parameter::Gain).unwrap(), 0.0);
        set_auto_exposure_and_gain(&mut camera, AutoMode::Continuous).unwrap();
        let start = Instant::now();
        let mut tuner = AutoTuner::new(AutoTuneConfig::default(), start);
        camera.begin_session().unwrap();

        let mut brightness = Vec::new();
        for _ in 0..100 {
            let frame = camera.get_next_frame().unwrap().unwrap();
            brightness.push(compute_brightness(&frame).unwrap());
            let decision = tuner.process_frame(&frame, &mut camera, start).unwrap();
            assert!(!decision.finished);
        }
        assert_eq!(tuner.state(), ControlState::Converging);
        assert_eq!(camera.get_value(Parameter::Gain).unwrap(), 0.0);
        assert!(camera.get_value(Parameter::ExposureTime).unwrap() > 10000.0);
        // Climbs from well below the target to within a frame's rounding of it.
        assert!(brightness[1] < 80.0);
        let last = brightness[brightness.len() - 1];
        assert!((last - 125.0).abs() < 2.0, "brightness {}", last);
    }

    #[test]
    fn test_zero_gain_start_converges_at_exposure_limit() {
        let mut camera = ImageCamera::new(highlight_scene()).unwrap();
        camera.set_range(Parameter::ExposureTime, 10.0, 9000.0).unwrap();
        let config = AutoTuneConfig{snapshot_interval: Duration::ZERO, ..Default::default()};
        let mut sink = RecordingSink::new();
        let stop = AtomicBool::new(false);
        let report = run_auto_tune(&mut camera, &config, &mut sink, &stop).unwrap();

        assert_eq!(report.final_state, ControlState::Converged);
        assert!((2..20).contains(&report.controller_invocations),
                "{} adjustments", report.controller_invocations);
        assert_eq!(camera.get_value(Parameter::Gain).unwrap(), 0.0);
        assert_eq!(camera.get_value(Parameter::ExposureTime).unwrap(), 9000.0);
        assert!(camera.write_count() > 0);
        assert_eq!(report.snapshots_saved, 1);
    }

    #[test]
    fn test_inaccessible_gain_aborts() {
        let mut camera = flat_camera(100);
        camera.force_value(Parameter::Gain, 12.0);
        camera.set_parameter_access(Parameter::Gain, true, false);
        let mut sink = RecordingSink::new();
        let stop = AtomicBool::new(false);
        let report = run_auto_tune(&mut camera, &test_config(), &mut sink, &stop).unwrap();
        assert_eq!(report.final_state, ControlState::Aborted);
        assert_eq!(report.exit_code(), 2);
        assert_eq!(report.controller_invocations, 1);
        assert_eq!(camera.write_count(), 0);
        assert!(!camera.is_session_active());
        let pool = camera.buffer_pool();
        assert_eq!(pool.available(), pool.capacity());
    }

    #[test]
    fn test_stop_flag_ends_hardware_auto_phase() {
        let mut camera = flat_camera(150);
        let stop = AtomicBool::new(false);
        let mut sink = RecordingSink{brightness: Vec::new(), stop_after: Some((3, &stop))};
        let report = run_auto_tune(&mut camera, &test_config(), &mut sink, &stop).unwrap();
        assert_eq!(report.final_state, ControlState::HardwareAuto);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.snapshots_saved, 3);
        assert_eq!(report.controller_invocations, 0);
        assert!(sink.brightness.iter().all(|b| *b >= 125.3));
        assert!(!camera.is_session_active());
    }

    #[test]
    fn test_incomplete_frames_are_skipped() {
        let mut camera = flat_camera(40);
        camera.inject_incomplete_frames(3);
        camera.inject_timeouts(2);
        let mut sink = RecordingSink::new();
        let stop = AtomicBool::new(false);
        let report = run_auto_tune(&mut camera, &test_config(), &mut sink, &stop).unwrap();
        assert_eq!(report.frames_skipped, 5);
        assert_eq!(report.final_state, ControlState::Converged);
        let pool = camera.buffer_pool();
        assert_eq!(pool.available(), pool.capacity());
    }

    #[test]
    fn test_device_failure_ends_session() {
        let mut camera = flat_camera(100);
        camera.inject_device_failure();
        let mut sink = RecordingSink::new();
        let stop = AtomicBool::new(false);
        let err = run_auto_tune(&mut camera, &test_config(), &mut sink, &stop).unwrap_err();
        assert!(err.code == CanonicalErrorCode::Internal);
        assert!(!camera.is_session_active());
        let pool = camera.buffer_pool();
        assert_eq!(pool.available(), pool.capacity());
    }

    #[test]
    fn test_post_convergence_window_keeps_capturing() {
        let mut camera = flat_camera(40);
        let mut config = test_config();
        config.post_convergence_run = Duration::from_millis(50);
        let mut sink = RecordingSink::new();
        let stop = AtomicBool::new(false);
        let report = run_auto_tune(&mut camera, &config, &mut sink, &stop).unwrap();
        assert_eq!(report.final_state, ControlState::Converged);
        assert!(report.frames_processed > 2);
        // Zero interval: every frame from convergence on is saved.
        assert_eq!(report.snapshots_saved, report.frames_processed - 1);
    }
}
