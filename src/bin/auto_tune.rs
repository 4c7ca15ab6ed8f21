// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use env_logger;
use log::{error, info};

use exposure_control::auto_tune::run_auto_tune;
use exposure_control::config::AutoTuneConfig;
use exposure_control::frame_output::SnapshotWriter;
use exposure_control::select_camera::select_camera;

/// Lets the camera's automatic exposure and gain run while the image stays
/// acceptable. Otherwise takes over, adjusts gain and exposure until the
/// image converges, and hands control back to the camera. Exits with 0 on
/// success, 2 if exposure or gain cannot be controlled, -1 on other errors.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// Image file to use in place of a camera.
    #[arg(long = "test_image")]
    test_image: Option<PathBuf>,

    /// Which of the detected cameras to use.
    #[arg(long, default_value_t = 0)]
    camera_index: usize,

    /// Directory for the Exposure_Gain_auto-<n>.jpg snapshots.
    #[arg(long, default_value = "auto_adj")]
    output_dir: PathBuf,

    /// Desired mean pixel value.
    #[arg(long, default_value_t = 125.0)]
    target_brightness: f64,

    /// Minimum time between snapshots.
    #[arg(long, default_value_t = 500)]
    snapshot_interval_ms: u64,

    /// Keep capturing snapshots this long after convergence.
    #[arg(long, default_value_t = 0)]
    post_convergence_ms: u64,
}

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let stop = Arc::new(AtomicBool::new(false));
    let stop2 = stop.clone();
    ctrlc::set_handler(move || {
        info!("Got control-c");
        stop2.store(true, Ordering::SeqCst);
    }).unwrap();

    std::process::exit(run(&args, &stop));
}

fn run(args: &Args, stop: &AtomicBool) -> i32 {
    let config = AutoTuneConfig{
        target_brightness: args.target_brightness,
        snapshot_interval: Duration::from_millis(args.snapshot_interval_ms),
        post_convergence_run: Duration::from_millis(args.post_convergence_ms),
        ..Default::default()
    };
    let mut camera = match select_camera(args.test_image.as_deref(), args.camera_index) {
        Ok(camera) => camera,
        Err(e) => {
            error!("No camera detected: {}", e);
            return -1;
        },
    };
    info!("camera: {} {:?}", camera.model(), camera.dimensions());
    let mut snapshots = match SnapshotWriter::sequential(&args.output_dir,
                                                         "Exposure_Gain_auto") {
        Ok(snapshots) => snapshots,
        Err(e) => {
            error!("{}", e);
            return -1;
        },
    };
    match run_auto_tune(camera.as_mut(), &config, &mut snapshots, stop) {
        Ok(report) => {
            info!("Finished in state {:?}: {} frames processed, {} skipped, \
                   {} adjustments, {} snapshots",
                  report.final_state, report.frames_processed, report.frames_skipped,
                  report.controller_invocations, report.snapshots_saved);
            if let Some(duration) = report.adjust_duration {
                info!("Adjust duration: {:.3} seconds", duration.as_secs_f64());
            }
            report.exit_code()
        },
        Err(e) => {
            error!("Error during auto-tune: {}", e);
            -1
        },
    }
}
