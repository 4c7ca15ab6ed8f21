use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use canonical_error::{CanonicalError, invalid_argument_error};
use image::GrayImage;
use log::{error, info};

/// The two camera controls that the exposure controllers manipulate.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Parameter {
    /// Sensor integration time, in microseconds.
    ExposureTime,
    /// Electronic amplification, in dB.
    Gain,
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Parameter::ExposureTime => write!(f, "exposure"),
            Parameter::Gain => write!(f, "gain"),
        }
    }
}

/// Whether the camera's built-in engine drives a parameter (Continuous) or
/// the parameter only changes when we write it (Off).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AutoMode {
    Continuous,
    Off,
}

/// Only 8-bit greyscale is supported.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Mono8,
}

/// Exposure and gain in effect when a frame was read out.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CaptureParams {
    pub exposure_time: f64,
    pub gain: f64,
}

/// Fixed-size set of pixel buffers shared between a FrameSource and the
/// frames it hands out. A Frame gives its buffer back when dropped, so a
/// buffer that is never returned shrinks the pool for good.
#[derive(Debug)]
pub struct BufferPool {
    capacity: usize,
    buffer_size: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(capacity: usize, buffer_size: usize) -> Arc<BufferPool> {
        let free = (0..capacity).map(|_| vec![0_u8; buffer_size]).collect();
        Arc::new(BufferPool{capacity, buffer_size, free: Mutex::new(free)})
    }

    /// Returns None when every buffer is checked out.
    pub fn take(&self) -> Option<Vec<u8>> {
        self.free.lock().unwrap().pop()
    }

    fn put_back(&self, mut buffer: Vec<u8>) {
        buffer.resize(self.buffer_size, 0);
        let mut free = self.free.lock().unwrap();
        if free.len() < self.capacity {
            free.push(buffer);
        }
    }

    pub fn available(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// One captured image. The pixel data is stored in row major order, one byte
/// per pixel. A Frame obtained from a FrameSource holds one of the source's
/// buffers; the buffer is released exactly once, when the Frame is dropped
/// (or explicitly via release()).
pub struct Frame {
    image: GrayImage,
    pixel_format: PixelFormat,

    // Incomplete frames carry the reason reported by the source.
    complete: bool,
    status: Option<String>,

    frame_id: i32,
    capture_params: CaptureParams,
    readout_time: SystemTime,

    pool: Option<Arc<BufferPool>>,
}

impl Frame {
    /// `pixels` must hold exactly width*height bytes.
    pub fn new(width: u32, height: u32, pixels: Vec<u8>, frame_id: i32,
               capture_params: CaptureParams) -> Result<Frame, CanonicalError> {
        let expected = width as usize * height as usize;
        if pixels.len() != expected {
            return Err(invalid_argument_error(
                format!("pixel buffer length {} does not match {}x{}",
                        pixels.len(), width, height).as_str()));
        }
        let image = GrayImage::from_raw(width, height, pixels).ok_or_else(
            || invalid_argument_error(
                format!("cannot wrap {}x{} pixel buffer", width, height).as_str()))?;
        Ok(Frame{image,
                 pixel_format: PixelFormat::Mono8,
                 complete: true,
                 status: None,
                 frame_id,
                 capture_params,
                 readout_time: SystemTime::now(),
                 pool: None})
    }

    /// Flags this frame as incomplete (e.g. dropped packets).
    pub fn mark_incomplete(mut self, status: &str) -> Frame {
        self.complete = false;
        self.status = Some(status.to_string());
        self
    }

    /// Arranges for the pixel buffer to go back to `pool` on release.
    pub fn return_buffer_to(mut self, pool: Arc<BufferPool>) -> Frame {
        self.pool = Some(pool);
        self
    }

    pub fn width(&self) -> u32 { self.image.width() }
    pub fn height(&self) -> u32 { self.image.height() }

    pub fn pixel_count(&self) -> u64 {
        self.image.width() as u64 * self.image.height() as u64
    }

    pub fn pixel_format(&self) -> PixelFormat { self.pixel_format }

    pub fn is_complete(&self) -> bool { self.complete }

    pub fn status(&self) -> Option<&str> { self.status.as_deref() }

    pub fn frame_id(&self) -> i32 { self.frame_id }

    pub fn capture_params(&self) -> CaptureParams { self.capture_params }

    pub fn readout_time(&self) -> SystemTime { self.readout_time }

    /// Read-only view of the pixel buffer.
    pub fn image(&self) -> &GrayImage { &self.image }

    pub fn pixels(&self) -> &[u8] { self.image.as_raw() }

    /// Copies the pixels into an image that outlives the frame, for encoding.
    pub fn to_gray_image(&self) -> GrayImage {
        self.image.clone()
    }

    /// Hands the buffer back to the source. Equivalent to dropping the frame.
    pub fn release(self) {}
}

impl Drop for Frame {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            let image = std::mem::replace(&mut self.image, GrayImage::new(0, 0));
            pool.put_back(image.into_raw());
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Frame")
            .field("frame_id", &self.frame_id)
            .field("dimensions", &self.image.dimensions())
            .field("complete", &self.complete)
            .field("status", &self.status)
            .field("capture_params", &self.capture_params)
            .finish()
    }
}

/// Typed access to the exposure time and gain controls of a camera.
pub trait DeviceParameters {
    fn is_readable(&self, parameter: Parameter) -> bool;
    fn is_writable(&self, parameter: Parameter) -> bool;

    fn get_value(&self, parameter: Parameter) -> Result<f64, CanonicalError>;

    /// Writes `value` as given. Most callers want set_clamped().
    fn set_value(&mut self, parameter: Parameter, value: f64)
                 -> Result<(), CanonicalError>;

    fn get_min(&self, parameter: Parameter) -> Result<f64, CanonicalError>;
    fn get_max(&self, parameter: Parameter) -> Result<f64, CanonicalError>;

    fn is_auto_mode_accessible(&self, parameter: Parameter) -> bool;
    fn get_auto_mode(&self, parameter: Parameter) -> Result<AutoMode, CanonicalError>;
    fn set_auto_mode(&mut self, parameter: Parameter, mode: AutoMode)
                     -> Result<(), CanonicalError>;

    /// Both readable and writable.
    fn is_accessible(&self, parameter: Parameter) -> bool {
        self.is_readable(parameter) && self.is_writable(parameter)
    }

    /// Clamps `value` into [min, max] and writes it. Returns the value
    /// written.
    fn set_clamped(&mut self, parameter: Parameter, value: f64)
                   -> Result<f64, CanonicalError> {
        if value.is_nan() {
            return Err(invalid_argument_error(
                format!("NaN is not a valid {} value", parameter).as_str()));
        }
        let min = self.get_min(parameter)?;
        let max = self.get_max(parameter)?;
        let clamped = f64::max(f64::min(value, max), min);
        self.set_value(parameter, clamped)?;
        Ok(clamped)
    }
}

/// A blocking, pull-model supplier of frames.
pub trait FrameSource {
    /// Starts image acquisition. get_next_frame() is only valid between
    /// begin_session() and end_session().
    fn begin_session(&mut self) -> Result<(), CanonicalError>;
    fn end_session(&mut self) -> Result<(), CanonicalError>;
    fn is_session_active(&self) -> bool;

    /// Blocks until the next frame is delivered. Returns Ok(None) if no frame
    /// arrived in time; callers treat that like an incomplete frame.
    fn get_next_frame(&mut self) -> Result<Option<Frame>, CanonicalError>;
}

/// AbstractCamera models an 8-bit greyscale camera with a linear response.
pub trait AbstractCamera: DeviceParameters + FrameSource {
    /// Returns a string identifying what kind of camera this is.
    fn model(&self) -> String;

    /// Returns the (width, height) of the frames this camera delivers.
    fn dimensions(&self) -> (u32, u32);
}

/// Switches the auto mode of both exposure and gain. A parameter whose auto
/// mode is not accessible is left alone.
pub fn set_auto_exposure_and_gain<P>(params: &mut P, mode: AutoMode)
                                     -> Result<(), CanonicalError>
where P: DeviceParameters + ?Sized
{
    let verb = match mode {
        AutoMode::Continuous => "enabled",
        AutoMode::Off => "disabled",
    };
    for parameter in [Parameter::ExposureTime, Parameter::Gain] {
        if params.is_auto_mode_accessible(parameter) {
            params.set_auto_mode(parameter, mode)?;
            info!("Automatic {} {}", parameter, verb);
        }
    }
    Ok(())
}

/// Turns off both auto modes and writes `exposure_time` and `gain`, each
/// clamped to the device range. Returns the values actually written.
pub fn apply_manual_exposure_and_gain<P>(params: &mut P, exposure_time: f64, gain: f64)
                                         -> Result<(f64, f64), CanonicalError>
where P: DeviceParameters + ?Sized
{
    set_auto_exposure_and_gain(params, AutoMode::Off)?;
    let exposure_time = params.set_clamped(Parameter::ExposureTime, exposure_time)?;
    let gain = params.set_clamped(Parameter::Gain, gain)?;
    info!("Exposure set to {:.1} and gain set to {:.2}", exposure_time, gain);
    Ok((exposure_time, gain))
}

/// RAII gadget pairing FrameSource::begin_session() with end_session(). The
/// session is ended when this goes out of scope, on every exit path.
pub struct AcquisitionSession<'a, C: FrameSource + ?Sized> {
    camera: &'a mut C,
    open: bool,
}

impl<'a, C: FrameSource + ?Sized> AcquisitionSession<'a, C> {
    pub fn begin(camera: &'a mut C) -> Result<Self, CanonicalError> {
        camera.begin_session()?;
        Ok(AcquisitionSession{camera, open: true})
    }

    /// Ends the session, reporting any failure to the caller.
    pub fn end(mut self) -> Result<(), CanonicalError> {
        self.open = false;
        self.camera.end_session()
    }
}

impl<C: FrameSource + ?Sized> Deref for AcquisitionSession<'_, C> {
    type Target = C;
    fn deref(&self) -> &C {
        &*self.camera
    }
}

impl<C: FrameSource + ?Sized> DerefMut for AcquisitionSession<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut *self.camera
    }
}

impl<C: FrameSource + ?Sized> Drop for AcquisitionSession<'_, C> {
    fn drop(&mut self) {
        if self.open {
            self.open = false;
            if let Err(e) = self.camera.end_session() {
                error!("Error ending acquisition: {}", e);
            }
        }
    }
}
