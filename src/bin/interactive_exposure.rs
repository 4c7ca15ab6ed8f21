use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use env_logger;
use log::{error, info};
use tokio::io::BufReader;
use tokio::sync::mpsc;

use exposure_control::config::InteractiveConfig;
use exposure_control::frame_output::{Mp4VideoWriter, SnapshotWriter};
use exposure_control::interactive::run_interactive;
use exposure_control::operator_input::{ChannelInput, forward_commands};
use exposure_control::select_camera::select_camera;

/// Records video from the camera while switching between exposure modes on
/// single-key commands read from stdin (each followed by Enter):
///   a  camera's automatic exposure and gain
///   n  manual preset 1
///   m  manual preset 2
///   h  one histogram-based overexposure correction
///   s  save a snapshot
///   q  quit
#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// Image file to use in place of a camera.
    #[arg(long = "test_image")]
    test_image: Option<PathBuf>,

    /// Which of the detected cameras to use.
    #[arg(long, default_value_t = 0)]
    camera_index: usize,

    /// Directory for output.mp4 and the image_<time>.jpg snapshots.
    #[arg(long, default_value = "auto_adj")]
    output_dir: PathBuf,

    /// Frame rate recorded in the video file.
    #[arg(long, default_value_t = 30.0)]
    fps: f64,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let stop = Arc::new(AtomicBool::new(false));
    let stop2 = stop.clone();
    ctrlc::set_handler(move || {
        info!("Got control-c");
        stop2.store(true, Ordering::SeqCst);
    }).unwrap();

    std::process::exit(run(args, stop).await);
}

async fn run(args: Args, stop: Arc<AtomicBool>) -> i32 {
    let config = InteractiveConfig{video_fps: args.fps, ..Default::default()};
    let mut camera = match select_camera(args.test_image.as_deref(), args.camera_index) {
        Ok(camera) => camera,
        Err(e) => {
            error!("No camera detected: {}", e);
            return -1;
        },
    };
    info!("camera: {} {:?}", camera.model(), camera.dimensions());

    let video_path = args.output_dir.join("output.mp4");
    let mut video = match Mp4VideoWriter::open(&video_path, camera.dimensions(),
                                               config.video_fps) {
        Ok(video) => video,
        Err(e) => {
            error!("Could not open the video file for writing: {}", e);
            return -1;
        },
    };
    let mut snapshots = match SnapshotWriter::timestamped(&args.output_dir) {
        Ok(snapshots) => snapshots,
        Err(e) => {
            error!("{}", e);
            return -1;
        },
    };

    // Only the capture thread touches the camera; stdin is read on its own
    // task and forwarded.
    let (sender, receiver) = mpsc::unbounded_channel();
    tokio::spawn(forward_commands(BufReader::new(tokio::io::stdin()), sender));

    let result = tokio::task::spawn_blocking(move || {
        let mut input = ChannelInput::new(receiver);
        run_interactive(camera.as_mut(), &config, &mut input, &mut video,
                        &mut snapshots, &stop)
    }).await;
    match result {
        Ok(Ok(report)) => {
            info!("Final mode {}: {} frames recorded, {} skipped, {} commands, \
                   {} corrections, {} snapshots",
                  report.final_mode, report.frames_recorded, report.frames_skipped,
                  report.commands_handled, report.corrections_applied,
                  report.snapshots_saved);
            0
        },
        Ok(Err(e)) => {
            error!("Error during capture: {}", e);
            -1
        },
        Err(e) => {
            error!("Capture task failed: {}", e);
            -1
        },
    }
}
