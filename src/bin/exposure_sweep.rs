// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::PathBuf;

use canonical_error::{CanonicalError, internal_error};
use clap::Parser;
use env_logger;
use log::{error, info, warn};

use exposure_control::abstract_camera::{AcquisitionSession, AutoMode, DeviceParameters,
                                        Frame, FrameSource, Parameter,
                                        set_auto_exposure_and_gain};
use exposure_control::metering::Metering;
use exposure_control::select_camera::select_camera;

/// Utility program for capturing a series of images from the camera over a
/// range of gain values and exposure times, logging the metering results.
/// Exits with 0 on success, -1 on any camera or output error.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// Image file to use in place of a camera.
    #[arg(long = "test_image")]
    test_image: Option<PathBuf>,

    /// Which of the detected cameras to use.
    #[arg(long, default_value_t = 0)]
    camera_index: usize,

    /// Base name of the output files. We add the gain and exposure values to
    /// the filename and a .bmp extension. If omitted, nothing is saved.
    #[arg(short, long)]
    output: Option<String>,

    /// Give up after this many consecutive missing or incomplete frames.
    #[arg(long, default_value_t = 20)]
    max_frame_attempts: u32,
}

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if let Err(e) = run(&args) {
        error!("Sweep failed: {}", e);
        std::process::exit(-1);
    }
}

fn run(args: &Args) -> Result<(), CanonicalError> {
    let mut camera = select_camera(args.test_image.as_deref(), args.camera_index)?;
    info!("camera: {} {:?}", camera.model(), camera.dimensions());
    set_auto_exposure_and_gain(camera.as_mut(), AutoMode::Off)?;
    info!("gain range [{}, {}], exposure range [{}, {}]",
          camera.get_min(Parameter::Gain)?, camera.get_max(Parameter::Gain)?,
          camera.get_min(Parameter::ExposureTime)?,
          camera.get_max(Parameter::ExposureTime)?);

    let mut session = AcquisitionSession::begin(camera.as_mut())?;
    for gain in [0.0, 3.0, 6.0, 12.0, 24.0] {
        let gain = session.set_clamped(Parameter::Gain, gain)?;
        for exp_ms in [1, 2, 5, 10] {
            session.set_clamped(Parameter::ExposureTime, exp_ms as f64 * 1000.0)?;
            let frame = next_complete_frame(&mut *session, args.max_frame_attempts)?;
            let metering = Metering::measure(&frame, 255)?;
            info!("params {:?}; brightness/overexposed/peak {:.2}/{:.4}/{}",
                  frame.capture_params(), metering.brightness,
                  metering.overexposure_ratio, metering.histogram.peak_bin());

            if let Some(output) = &args.output {
                let filename = format!("{}_g{}_e{}ms.bmp", output, gain, exp_ms);
                if let Err(e) = frame.to_gray_image().save(&filename) {
                    return Err(internal_error(
                        &format!("Could not save {}: {}", filename, e)));
                }
            }
        }
    }
    session.end()
}

fn next_complete_frame<S: FrameSource + ?Sized>(source: &mut S, max_attempts: u32)
                                                -> Result<Frame, CanonicalError> {
    for _ in 0..max_attempts {
        match source.get_next_frame()? {
            Some(frame) if frame.is_complete() => return Ok(frame),
            Some(frame) => warn!("Skipping incomplete frame {}", frame.frame_id()),
            None => warn!("Timed out waiting for frame"),
        }
    }
    Err(internal_error(
        &format!("No complete frame after {} attempts", max_attempts)))
}

#[cfg(test)]
mod tests {
    use canonical_error::CanonicalErrorCode;
    use image::{GrayImage, Luma};
    use exposure_control::image_camera::ImageCamera;
    use super::*;

    fn args(test_image: Option<PathBuf>, output: Option<String>) -> Args {
        Args{test_image, camera_index: 0, output, max_frame_attempts: 3}
    }

    #[test]
    fn test_frame_wait_is_bounded() {
        let mut camera = ImageCamera::new(GrayImage::from_pixel(8, 8, Luma([80]))).unwrap();
        camera.begin_session().unwrap();
        camera.inject_timeouts(2);
        camera.inject_incomplete_frames(1);
        let frame = next_complete_frame(&mut camera, 4).unwrap();
        assert!(frame.is_complete());
        drop(frame);

        camera.inject_timeouts(5);
        let err = next_complete_frame(&mut camera, 5).unwrap_err();
        assert!(err.code == CanonicalErrorCode::Internal);
    }

    #[test]
    fn test_camera_errors_are_returned() {
        assert!(run(&args(None, None)).is_err());
        let missing = PathBuf::from("/nonexistent/scene.png");
        let err = run(&args(Some(missing), None)).unwrap_err();
        assert!(err.code == CanonicalErrorCode::FailedPrecondition);
    }

    #[test]
    fn test_sweep_saves_every_setting() {
        let dir = tempfile::tempdir().unwrap();
        let scene = dir.path().join("scene.png");
        GrayImage::from_fn(32, 16, |x, _| Luma([(x * 4) as u8])).save(&scene).unwrap();
        let output = dir.path().join("sweep").to_str().unwrap().to_string();
        run(&args(Some(scene), Some(output))).unwrap();
        let saved = std::fs::read_dir(dir.path()).unwrap()
            .filter(|entry| {
                let name = entry.as_ref().unwrap().file_name();
                name.to_str().unwrap().ends_with(".bmp")
            })
            .count();
        assert_eq!(saved, 20);
    }
}
