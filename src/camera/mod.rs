//! Camera ownership and frame distribution.
//!
//! Exactly one component talks to the physical device: the [`CameraArbiter`].
//! It runs one acquisition loop per resolution tier and publishes each grabbed
//! frame into a single-slot channel, so readers always see the most recent
//! complete frame without ever touching device I/O.

use chrono::{DateTime, Utc};
use image::RgbImage;

use crate::error::Result;

mod arbiter;
mod synthetic;

pub use arbiter::CameraArbiter;
pub use synthetic::SyntheticSource;

/// High-res stream dimensions (capture pipeline).
pub const HIGH_RES_DIMENSIONS: (u32, u32) = (1920, 1080);
/// Low-res stream dimensions (live pipeline).
pub const LOW_RES_DIMENSIONS: (u32, u32) = (640, 480);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolutionTier {
    High,
    Low,
}

impl ResolutionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionTier::High => "high",
            ResolutionTier::Low => "low",
        }
    }
}

/// An immutable frame snapshot. Handed out as `Arc<Frame>`; holders may keep
/// it as long as they like, but must not assume it reflects the present.
#[derive(Debug, Clone)]
pub struct Frame {
    pub pixels: RgbImage,
    pub tier: ResolutionTier,
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    /// Age of this frame relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.captured_at
    }
}

/// Seam between the arbiter and the actual device. The arbiter is the only
/// caller; implementations do not need internal locking.
pub trait FrameSource: Send {
    /// Open the device. Called once before any grab.
    fn open(&mut self) -> Result<()>;

    /// Grab one frame at the given tier. Blocking; the arbiter wraps calls in
    /// `spawn_blocking`.
    fn grab(&mut self, tier: ResolutionTier) -> Result<RgbImage>;

    /// Release the device. Called once, after the acquisition loops exit.
    fn close(&mut self);

    fn dimensions(&self, tier: ResolutionTier) -> (u32, u32);
}
