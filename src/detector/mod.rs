//! Object-detection seam. The model itself is an external collaborator; the
//! service only depends on this trait.

use serde::{Deserialize, Serialize};

use crate::camera::Frame;

/// Axis-aligned box in normalized image coordinates, all fields in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x_min: f32,
    pub y_min: f32,
    pub x_max: f32,
    pub y_max: f32,
    pub x_center: f32,
    pub y_center: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    /// Build from pixel corners against the frame dimensions.
    pub fn from_pixel_corners(
        x1: f32,
        y1: f32,
        x2: f32,
        y2: f32,
        frame_width: u32,
        frame_height: u32,
    ) -> Self {
        let fw = frame_width.max(1) as f32;
        let fh = frame_height.max(1) as f32;
        let x_min = (x1 / fw).clamp(0.0, 1.0);
        let y_min = (y1 / fh).clamp(0.0, 1.0);
        let x_max = (x2 / fw).clamp(0.0, 1.0);
        let y_max = (y2 / fh).clamp(0.0, 1.0);
        Self {
            x_min,
            y_min,
            x_max,
            y_max,
            x_center: (x_min + x_max) / 2.0,
            y_center: (y_min + y_max) / 2.0,
            width: x_max - x_min,
            height: y_max - y_min,
        }
    }

    /// Pixel-space corners for a given image size, for overlay drawing.
    pub fn to_pixel_corners(&self, width: u32, height: u32) -> (i32, i32, i32, i32) {
        let w = width as f32;
        let h = height as f32;
        (
            (self.x_min * w) as i32,
            (self.y_min * h) as i32,
            (self.x_max * w) as i32,
            (self.y_max * h) as i32,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_name: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// A detector invocation never mutates the frame and may fail; callers
/// degrade to zero detections on failure.
pub trait Detector: Send + Sync {
    fn detect(&self, frame: &Frame, confidence_threshold: f32) -> anyhow::Result<Vec<Detection>>;
}

/// Detector used when no model is configured. Always reports nothing.
pub struct NoopDetector;

impl Detector for NoopDetector {
    fn detect(&self, _frame: &Frame, _confidence_threshold: f32) -> anyhow::Result<Vec<Detection>> {
        Ok(Vec::new())
    }
}
