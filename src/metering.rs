use canonical_error::{CanonicalError, failed_precondition_error};
use imageproc::stats::histogram;

use crate::abstract_camera::Frame;

/// Pixel counts indexed by intensity value 0..=255.
#[derive(Clone, Debug, PartialEq)]
pub struct Histogram {
    counts: [u32; 256],
}

impl Histogram {
    pub fn from_counts(counts: [u32; 256]) -> Histogram {
        Histogram{counts}
    }

    pub fn counts(&self) -> &[u32; 256] {
        &self.counts
    }

    pub fn count(&self, value: u8) -> u32 {
        self.counts[value as usize]
    }

    /// Number of pixels counted; equals the frame's width*height.
    pub fn total(&self) -> u64 {
        self.counts.iter().map(|c| *c as u64).sum()
    }

    /// The intensity value with the highest count. Ties go to the lowest
    /// intensity.
    pub fn peak_bin(&self) -> u8 {
        let mut peak = 0;
        for bin in 1..256 {
            if self.counts[bin] > self.counts[peak] {
                peak = bin;
            }
        }
        peak as u8
    }

    /// Histogram-weighted mean intensity.
    pub fn mean(&self) -> Result<f64, CanonicalError> {
        let total = self.total();
        if total == 0 {
            return Err(failed_precondition_error("Mean of empty histogram"));
        }
        let weighted: u64 = self.counts.iter().enumerate()
            .map(|(value, count)| value as u64 * *count as u64).sum();
        Ok(weighted as f64 / total as f64)
    }
}

/// Counts pixel intensities over the whole frame.
pub fn compute_histogram(frame: &Frame) -> Histogram {
    let channel_histogram = histogram(frame.image());
    Histogram::from_counts(channel_histogram.channels[0])
}

/// Arithmetic mean of all pixel values, on [0, 255].
pub fn compute_brightness(frame: &Frame) -> Result<f64, CanonicalError> {
    let num_pixels = frame.pixel_count();
    if num_pixels == 0 {
        return Err(failed_precondition_error("Brightness of zero-pixel frame"));
    }
    let sum: u64 = frame.pixels().iter().map(|p| *p as u64).sum();
    Ok(sum as f64 / num_pixels as f64)
}

/// Fraction of pixels whose value is `threshold` or more. With the usual
/// threshold of 255 this is the fraction of pixels in the top bin.
pub fn compute_overexposure_ratio(histogram: &Histogram, threshold: u8)
                                  -> Result<f64, CanonicalError> {
    let total = histogram.total();
    if total == 0 {
        return Err(failed_precondition_error(
            "Overexposure ratio of empty histogram"));
    }
    let over: u64 = histogram.counts()[threshold as usize..].iter()
        .map(|c| *c as u64).sum();
    Ok(over as f64 / total as f64)
}

/// Everything the controllers need to know about one frame.
#[derive(Clone, Debug)]
pub struct Metering {
    pub histogram: Histogram,
    pub brightness: f64,
    pub overexposure_ratio: f64,
}

impl Metering {
    pub fn measure(frame: &Frame, overexposure_threshold: u8)
                   -> Result<Metering, CanonicalError> {
        let histogram = compute_histogram(frame);
        let overexposure_ratio =
            compute_overexposure_ratio(&histogram, overexposure_threshold)?;
        let brightness = compute_brightness(frame)?;
        Ok(Metering{histogram, brightness, overexposure_ratio})
    }
}
