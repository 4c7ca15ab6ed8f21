use std::path::{Path, PathBuf};

use canonical_error::{CanonicalError, failed_precondition_error, not_found_error};
use image::ImageReader;
use log::info;

use crate::abstract_camera::AbstractCamera;
use crate::image_camera::ImageCamera;

/// A camera that select_camera() knows how to open.
#[derive(Clone, Debug, PartialEq)]
pub enum CameraInterface {
    /// Image file rendered through ImageCamera.
    TestImage(PathBuf),
}

// Lists the cameras that can be opened. No hardware backends are built into
// this crate, so only a test image (if given) shows up.
pub fn enumerate_cameras(test_image: Option<&Path>) -> Vec<CameraInterface> {
    let mut cameras = Vec::new();
    if let Some(path) = test_image {
        cameras.push(CameraInterface::TestImage(path.to_path_buf()));
    }
    cameras
}

// Returns the camera at `camera_index` among enumerate_cameras(). Fails with
// NotFound if there is no such camera.
pub fn select_camera(test_image: Option<&Path>, camera_index: usize)
                     -> Result<Box<dyn AbstractCamera + Send>, CanonicalError> {
    let cameras = enumerate_cameras(test_image);
    if cameras.is_empty() {
        return Err(not_found_error("No camera found"));
    }
    match cameras.get(camera_index) {
        None => Err(not_found_error(
            format!("Camera index {} requested but only {} found",
                    camera_index, cameras.len()).as_str())),
        Some(CameraInterface::TestImage(path)) => {
            let img = ImageReader::open(path)
                .map_err(|e| failed_precondition_error(
                    format!("Cannot open {}: {}", path.display(), e).as_str()))?
                .decode()
                .map_err(|e| failed_precondition_error(
                    format!("Cannot decode {}: {}", path.display(), e).as_str()))?;
            info!("Using test image {} instead of camera.", path.display());
            Ok(Box::new(ImageCamera::new(img.to_luma8())?))
        },
    }
}
