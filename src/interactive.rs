use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use canonical_error::CanonicalError;
use log::{debug, error, info, warn};

use crate::abstract_camera::{AbstractCamera, AcquisitionSession, AutoMode,
                             DeviceParameters, Frame, FrameSource, Parameter,
                             apply_manual_exposure_and_gain, set_auto_exposure_and_gain};
use crate::config::{InteractiveConfig, ManualPreset};
use crate::frame_output::{SnapshotSink, VideoSink};
use crate::operator_input::OperatorInput;
use crate::overexposure_corrector::{CorrectionOutcome, OverexposureCorrector};

/// Which exposure regime the operator last selected.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InteractiveMode {
    Idle,
    AutoContinuous,
    ManualPreset1,
    ManualPreset2,
    HistogramCorrected,
}

impl fmt::Display for InteractiveMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            InteractiveMode::Idle => write!(f, "idle"),
            InteractiveMode::AutoContinuous => write!(f, "built-in auto"),
            InteractiveMode::ManualPreset1 => write!(f, "mode 1"),
            InteractiveMode::ManualPreset2 => write!(f, "mode 2"),
            InteractiveMode::HistogramCorrected => write!(f, "mode histogram"),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    AutoContinuous,  // 'a'
    ManualPreset1,  // 'n'
    ManualPreset2,  // 'm'
    HistogramCorrect,  // 'h'
    Snapshot,  // 's'
    Quit,  // 'q'
    Invalid(char),
}

impl Command {
    pub fn from_char(c: char) -> Command {
        match c {
            'a' => Command::AutoContinuous,
            'n' => Command::ManualPreset1,
            'm' => Command::ManualPreset2,
            'h' => Command::HistogramCorrect,
            's' => Command::Snapshot,
            'q' => Command::Quit,
            other => Command::Invalid(other),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CommandOutcome {
    Continue,
    Quit,
}

#[derive(Clone, Debug, PartialEq)]
pub struct InteractiveReport {
    pub final_mode: InteractiveMode,
    pub commands_handled: u64,
    pub corrections_applied: u64,
    pub snapshots_saved: u64,
    pub frames_recorded: u64,
    pub frames_skipped: u64,
}

// Fetches one frame for a command. Incomplete frames and timeouts are
// reported and yield None.
fn grab_complete_frame<C>(camera: &mut C) -> Result<Option<Frame>, CanonicalError>
where C: FrameSource + ?Sized
{
    match camera.get_next_frame()? {
        Some(frame) if frame.is_complete() => Ok(Some(frame)),
        Some(frame) => {
            warn!("Image incomplete with image status {}",
                  frame.status().unwrap_or("unknown"));
            Ok(None)
        },
        None => {
            warn!("Timed out waiting for frame");
            Ok(None)
        },
    }
}

/// Applies operator commands to the camera and tracks the selected mode.
///
/// The histogram correction runs once per 'h' command, on the frame grabbed
/// for that command. Later frames are not corrected even though the mode
/// stays HistogramCorrected.
pub struct InteractiveController {
    preset1: ManualPreset,
    preset2: ManualPreset,
    corrector: OverexposureCorrector,
    mode: InteractiveMode,

    commands_handled: u64,
    corrections_applied: u64,
    snapshots_saved: u64,
}

impl InteractiveController {
    pub fn new(config: &InteractiveConfig) -> Self {
        InteractiveController{preset1: config.preset1,
                              preset2: config.preset2,
                              corrector: OverexposureCorrector::new(config.corrector),
                              mode: InteractiveMode::Idle,
                              commands_handled: 0,
                              corrections_applied: 0,
                              snapshots_saved: 0}
    }

    pub fn mode(&self) -> InteractiveMode {
        self.mode
    }

    /// Carries out `command`. Failures writing camera parameters are logged
    /// and swallowed; frame fetch and snapshot failures are returned.
    pub fn handle_command<C>(&mut self, command: Command, camera: &mut C,
                             snapshots: &mut dyn SnapshotSink)
                             -> Result<CommandOutcome, CanonicalError>
    where C: DeviceParameters + FrameSource + ?Sized
    {
        self.commands_handled += 1;
        match command {
            Command::AutoContinuous => {
                if let Err(e) = set_auto_exposure_and_gain(camera, AutoMode::Continuous) {
                    error!("Error enabling automatic exposure and gain: {}", e);
                }
                self.mode = InteractiveMode::AutoContinuous;
            },
            Command::ManualPreset1 => {
                Self::apply_preset(camera, &self.preset1);
                self.mode = InteractiveMode::ManualPreset1;
            },
            Command::ManualPreset2 => {
                Self::apply_preset(camera, &self.preset2);
                self.mode = InteractiveMode::ManualPreset2;
            },
            Command::HistogramCorrect => {
                if let Some(frame) = grab_complete_frame(camera)? {
                    match self.corrector.correct_if_overexposed(&frame, camera) {
                        Ok(CorrectionOutcome::Corrected{..}) => self.corrections_applied += 1,
                        Ok(CorrectionOutcome::NotOverexposed{peak_bin}) => {
                            info!("Histogram peak at {}, no correction needed", peak_bin);
                        },
                        Err(e) => error!("Error correcting overexposure: {}", e),
                    }
                }
                self.mode = InteractiveMode::HistogramCorrected;
            },
            Command::Snapshot => {
                if let Some(frame) = grab_complete_frame(camera)? {
                    snapshots.save_snapshot(&frame)?;
                    self.snapshots_saved += 1;
                }
            },
            Command::Quit => {
                info!("Quitting...");
                return Ok(CommandOutcome::Quit);
            },
            Command::Invalid(c) => {
                warn!("Invalid input '{}'. Please try again.", c);
            },
        }
        Ok(CommandOutcome::Continue)
    }

    fn apply_preset<C>(camera: &mut C, preset: &ManualPreset)
    where C: DeviceParameters + ?Sized
    {
        if let Err(e) = apply_manual_exposure_and_gain(
            camera, preset.exposure_time, preset.gain)
        {
            error!("Error setting exposure and gain: {}", e);
        }
    }
}

/// Records every complete frame to `video` while applying operator commands,
/// until 'q' (or end of input) or `stop`. Acquisition is ended and the video
/// closed before returning.
pub fn run_interactive<C>(camera: &mut C, config: &InteractiveConfig,
                          input: &mut dyn OperatorInput,
                          video: &mut dyn VideoSink,
                          snapshots: &mut dyn SnapshotSink,
                          stop: &AtomicBool) -> Result<InteractiveReport, CanonicalError>
where C: AbstractCamera + ?Sized
{
    config.validate()?;
    let mut controller = InteractiveController::new(config);
    let mut frames_skipped = 0;
    let mut session = AcquisitionSession::begin(&mut *camera)?;
    info!("Recording started...");
    loop {
        if stop.load(Ordering::SeqCst) {
            info!("Stop requested");
            break;
        }
        if let Some(c) = input.poll_command() {
            let command = Command::from_char(c);
            if controller.handle_command(command, &mut *session, snapshots)? ==
                CommandOutcome::Quit
            {
                break;
            }
        }
        match session.get_next_frame()? {
            Some(frame) if frame.is_complete() => {
                debug!("Current Mode: {} Exposure: {:.1}us, Gain: {:.2}dB",
                       controller.mode(),
                       session.get_value(Parameter::ExposureTime).unwrap_or(f64::NAN),
                       session.get_value(Parameter::Gain).unwrap_or(f64::NAN));
                video.write_frame(&frame)?;
            },
            Some(frame) => {
                warn!("Image incomplete with image status {}",
                      frame.status().unwrap_or("unknown"));
                frames_skipped += 1;
            },
            None => {
                warn!("Timed out waiting for frame");
                frames_skipped += 1;
            },
        }
    }
    video.close()?;
    session.end()?;
    info!("Recording stopped.");
    Ok(InteractiveReport{final_mode: controller.mode(),
                         commands_handled: controller.commands_handled,
                         corrections_applied: controller.corrections_applied,
                         snapshots_saved: controller.snapshots_saved,
                         frames_recorded: video.frames_written(),
                         frames_skipped})
}
