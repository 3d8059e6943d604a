// THEORY:
// A `Detection` is a single hit from the upstream object detector: a located,
// sized plant candidate inside one region. The engine never produces
// detections; it only consumes them, for two purposes:
// 1.  **Mask building**: each detection "explains" a patch of the region, so
//     the residual-area calculation can focus on what the detector missed.
// 2.  **Calibration**: the real sizes of detected plants in a band are the
//     best available estimate of how big an undetected plant in that same
//     band would appear.
// Detections are validated at the boundary. A single malformed record is
// dropped without condemning its region; a region left with zero usable
// detections simply takes the fallback calibration path.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};

/// A single object-detector hit within a region, in region-local pixel space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Horizontal center of the detection box, in pixels.
    pub center_x: f64,
    /// Vertical center of the detection box, in pixels.
    pub center_y: f64,
    /// Width of the detection box, in pixels.
    pub width: f64,
    /// Height of the detection box, in pixels.
    pub height: f64,
    /// Detector confidence, expected in [0, 1].
    pub confidence: f64,
    /// Class label reported by the detector (e.g. "plant").
    pub class_label: String,
}

impl Detection {
    /// Pixel footprint of the detection box.
    pub fn area(&self) -> f64 {
        self.width * self.height
    }

    /// Boundary validation against the dimensions of the region the
    /// detection claims to live in.
    pub fn validate(&self, region_width: u32, region_height: u32) -> Result<(), ValidationError> {
        if !(self.width > 0.0) || !(self.height > 0.0) {
            return Err(ValidationError::NonPositiveDimensions {
                width: self.width,
                height: self.height,
            });
        }
        if self.center_x < 0.0
            || self.center_y < 0.0
            || self.center_x >= region_width as f64
            || self.center_y >= region_height as f64
        {
            return Err(ValidationError::CenterOutOfBounds {
                x: self.center_x,
                y: self.center_y,
                region_width,
                region_height,
            });
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(ValidationError::ConfidenceOutOfRange(self.confidence));
        }
        Ok(())
    }
}

/// Drops malformed detections, returning the survivors and the number of
/// records rejected. Rejection of individual records never fails the region.
pub fn retain_valid(
    detections: Vec<Detection>,
    region_width: u32,
    region_height: u32,
) -> (Vec<Detection>, usize) {
    let before = detections.len();
    let valid: Vec<Detection> = detections
        .into_iter()
        .filter(|d| d.validate(region_width, region_height).is_ok())
        .collect();
    let dropped = before - valid.len();
    (valid, dropped)
}
