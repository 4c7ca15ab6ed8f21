// Where frames go when they leave the control loop: still snapshots and the
// session video.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use canonical_error::{CanonicalError, failed_precondition_error, internal_error,
                      invalid_argument_error};
use chrono::Local;
use log::{debug, error, info, warn};
use muxide::api::{Metadata, Muxer, MuxerBuilder, VideoCodec};
use openh264::encoder::{Encoder, FrameType};
use openh264::formats::YUVBuffer;

use crate::abstract_camera::Frame;

pub trait SnapshotSink {
    /// Encodes and stores `frame`, returning where it went.
    fn save_snapshot(&mut self, frame: &Frame) -> Result<PathBuf, CanonicalError>;
}

pub trait VideoSink {
    fn write_frame(&mut self, frame: &Frame) -> Result<(), CanonicalError>;

    /// Finishes the video. Further writes fail.
    fn close(&mut self) -> Result<(), CanonicalError>;

    fn frames_written(&self) -> u64;
}

#[derive(Clone, Debug)]
enum Naming {
    // <prefix>-<n>.jpg, n counting from 0.
    Sequential(String),
    // image_<unix seconds>.jpg
    Timestamped,
}

/// Saves snapshots as JPEG files in a directory.
pub struct SnapshotWriter {
    directory: PathBuf,
    naming: Naming,
    saved: u32,
}

impl SnapshotWriter {
    pub fn sequential(directory: &Path, prefix: &str) -> Result<Self, CanonicalError> {
        Self::new(directory, Naming::Sequential(prefix.to_string()))
    }

    pub fn timestamped(directory: &Path) -> Result<Self, CanonicalError> {
        Self::new(directory, Naming::Timestamped)
    }

    fn new(directory: &Path, naming: Naming) -> Result<Self, CanonicalError> {
        fs::create_dir_all(directory).map_err(|e| failed_precondition_error(
            format!("Cannot create {}: {}", directory.display(), e).as_str()))?;
        Ok(SnapshotWriter{directory: directory.to_path_buf(), naming, saved: 0})
    }

    pub fn saved_count(&self) -> u32 {
        self.saved
    }

    fn next_path(&self) -> PathBuf {
        match &self.naming {
            Naming::Sequential(prefix) => {
                self.directory.join(format!("{}-{}.jpg", prefix, self.saved))
            },
            Naming::Timestamped => {
                let stamp = Local::now().timestamp();
                let path = self.directory.join(format!("image_{}.jpg", stamp));
                if !path.exists() {
                    return path;
                }
                // More than one save within the second.
                let mut n = 1;
                loop {
                    let path = self.directory.join(format!("image_{}-{}.jpg", stamp, n));
                    if !path.exists() {
                        return path;
                    }
                    n += 1;
                }
            },
        }
    }
}

impl SnapshotSink for SnapshotWriter {
    fn save_snapshot(&mut self, frame: &Frame) -> Result<PathBuf, CanonicalError> {
        let path = self.next_path();
        frame.to_gray_image().save(&path).map_err(|e| internal_error(
            format!("Saving {}: {}", path.display(), e).as_str()))?;
        self.saved += 1;
        info!("Image saved at {}", path.display());
        Ok(path)
    }
}

/// H.264 video in an MP4 container, with the frame rate stored in the track
/// timing. All frames must match the size given at open(). An odd width or
/// height loses its last column or row, as 4:2:0 chroma needs even sizes.
pub struct Mp4VideoWriter {
    path: PathBuf,
    encoder: Encoder,
    muxer: Option<Muxer<BufWriter<File>>>,
    dimensions: (u32, u32),
    encoded_dimensions: (u32, u32),
    fps: f64,
    frames_written: u64,
    frames_dropped: u64,
}

impl Mp4VideoWriter {
    pub fn open(path: &Path, dimensions: (u32, u32), fps: f64)
                -> Result<Self, CanonicalError> {
        let encoded_dimensions = (dimensions.0 & !1, dimensions.1 & !1);
        if encoded_dimensions.0 == 0 || encoded_dimensions.1 == 0 || !(fps > 0.0) {
            return Err(invalid_argument_error(
                format!("Bad video format {}x{} at {} fps",
                        dimensions.0, dimensions.1, fps).as_str()));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| failed_precondition_error(
                format!("Cannot create {}: {}", parent.display(), e).as_str()))?;
        }
        let file = File::create(path).map_err(|e| failed_precondition_error(
            format!("Could not open {} for writing: {}", path.display(), e).as_str()))?;
        let encoder = Encoder::new().map_err(|e| internal_error(
            format!("Could not create H.264 encoder: {}", e).as_str()))?;
        let muxer = MuxerBuilder::new(BufWriter::new(file))
            .video(VideoCodec::H264, encoded_dimensions.0, encoded_dimensions.1, fps)
            .with_fast_start(true)
            .with_metadata(Metadata::new().with_current_time())
            .build()
            .map_err(|e| internal_error(
                format!("Could not start {}: {}", path.display(), e).as_str()))?;
        if encoded_dimensions != dimensions {
            warn!("Cropping {}x{} frames to {}x{} for video",
                  dimensions.0, dimensions.1, encoded_dimensions.0, encoded_dimensions.1);
        }
        info!("Recording {}x{} at {} fps to {}",
              encoded_dimensions.0, encoded_dimensions.1, fps, path.display());
        Ok(Mp4VideoWriter{path: path.to_path_buf(),
                          encoder,
                          muxer: Some(muxer),
                          dimensions,
                          encoded_dimensions,
                          fps,
                          frames_written: 0,
                          frames_dropped: 0})
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    // Limited range luma, neutral chroma.
    fn to_yuv420(&self, frame: &Frame) -> Vec<u8> {
        let (width, height) = self.encoded_dimensions;
        let (width, height) = (width as usize, height as usize);
        let stride = self.dimensions.0 as usize;
        let pixels = frame.pixels();
        let mut yuv = Vec::with_capacity(width * height * 3 / 2);
        for row in pixels.chunks_exact(stride).take(height) {
            yuv.extend(row[..width].iter().map(|&v| (16 + (v as u32 * 219 + 127) / 255) as u8));
        }
        yuv.resize(width * height * 3 / 2, 128);
        yuv
    }
}

impl VideoSink for Mp4VideoWriter {
    fn write_frame(&mut self, frame: &Frame) -> Result<(), CanonicalError> {
        if self.muxer.is_none() {
            return Err(failed_precondition_error("Video already closed"));
        }
        let (width, height) = (frame.width(), frame.height());
        if (width, height) != self.dimensions {
            return Err(invalid_argument_error(
                format!("Frame size {}x{} does not match video size {}x{}",
                        width, height, self.dimensions.0, self.dimensions.1).as_str()));
        }
        let yuv = YUVBuffer::from_vec(self.to_yuv420(frame),
                                      self.encoded_dimensions.0 as usize,
                                      self.encoded_dimensions.1 as usize);
        let bitstream = self.encoder.encode(&yuv).map_err(|e| internal_error(
            format!("Encoding frame {}: {}", frame.frame_id(), e).as_str()))?;
        let is_keyframe = matches!(bitstream.frame_type(), FrameType::IDR | FrameType::I);
        let data = bitstream.to_vec();
        if data.is_empty() {
            // Rate control skipped the frame.
            self.frames_dropped += 1;
            debug!("Encoder produced no data for frame {}", frame.frame_id());
            return Ok(());
        }
        // Timestamps follow the nominal rate, not capture time.
        let pts = self.frames_written as f64 / self.fps;
        if let Some(muxer) = self.muxer.as_mut() {
            muxer.write_video(pts, &data, is_keyframe).map_err(|e| internal_error(
                format!("Writing frame {}: {}", frame.frame_id(), e).as_str()))?;
        }
        self.frames_written += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), CanonicalError> {
        if let Some(muxer) = self.muxer.take() {
            let stats = muxer.finish_with_stats().map_err(|e| internal_error(
                format!("Closing {}: {}", self.path.display(), e).as_str()))?;
            info!("Recording stopped after {} frames ({} dropped), {:.2}s, {} bytes",
                  stats.video_frames, self.frames_dropped, stats.duration_secs,
                  stats.bytes_written);
        }
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.frames_written
    }
}

impl Drop for Mp4VideoWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("{}", e);
        }
    }
}
