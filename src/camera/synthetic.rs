use image::RgbImage;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::error::{Error, Result};

use super::{FrameSource, ResolutionTier, HIGH_RES_DIMENSIONS, LOW_RES_DIMENSIONS};

/// Frame source for running without camera hardware. Produces random noise
/// frames at the configured dimensions, like a disconnected analog feed.
pub struct SyntheticSource {
    high_dims: (u32, u32),
    low_dims: (u32, u32),
    rng: StdRng,
    open: bool,
    busy: bool,
}

impl SyntheticSource {
    pub fn new() -> Self {
        Self::with_dimensions(HIGH_RES_DIMENSIONS, LOW_RES_DIMENSIONS)
    }

    /// Smaller dimensions keep test frames cheap to fill and encode.
    pub fn with_dimensions(high_dims: (u32, u32), low_dims: (u32, u32)) -> Self {
        Self {
            high_dims,
            low_dims,
            rng: StdRng::from_entropy(),
            open: false,
            busy: false,
        }
    }

    /// A source whose device is already claimed elsewhere; `open` always
    /// fails with `DeviceUnavailable`.
    pub fn busy() -> Self {
        let mut source = Self::new();
        source.busy = true;
        source
    }
}

impl Default for SyntheticSource {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSource for SyntheticSource {
    fn open(&mut self) -> Result<()> {
        if self.busy {
            return Err(Error::DeviceUnavailable(
                "device is in use by another process".into(),
            ));
        }
        self.open = true;
        Ok(())
    }

    fn grab(&mut self, tier: ResolutionTier) -> Result<RgbImage> {
        if !self.open {
            return Err(Error::DeviceUnavailable("device is not open".into()));
        }

        let (width, height) = self.dimensions(tier);
        let mut pixels = vec![0u8; (width * height * 3) as usize];
        self.rng.fill(pixels.as_mut_slice());

        // Dimensions match the buffer length by construction.
        RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| Error::DeviceUnavailable("frame buffer size mismatch".into()))
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn dimensions(&self, tier: ResolutionTier) -> (u32, u32) {
        match tier {
            ResolutionTier::High => self.high_dims,
            ResolutionTier::Low => self.low_dims,
        }
    }
}
