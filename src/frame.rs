//! Captured camera frames.
//!
//! A `CapturedFrame` is the ephemeral RGB buffer a frame source hands to the
//! screenshot throttle. It lives only until the throttle either persists it
//! as a PNG or discards it on a cache hit.

use anyhow::{anyhow, Context, Result};
use image::{ImageFormat, RgbImage};
use std::path::Path;

/// Raw RGB24 frame.
pub struct CapturedFrame {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl CapturedFrame {
    /// Wrap an RGB24 buffer. The buffer length must match the dimensions.
    pub fn from_rgb(pixels: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = width
            .checked_mul(height)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("RGB frame dimensions overflow"))? as usize;
        if pixels.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                pixels.len()
            ));
        }
        Ok(Self {
            pixels,
            width,
            height,
        })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn into_image(self) -> Result<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.pixels)
            .ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))
    }

    /// Encode the frame as PNG at `path`.
    pub fn write_png(self, path: &Path) -> Result<()> {
        let image = self.into_image()?;
        image
            .save_with_format(path, ImageFormat::Png)
            .with_context(|| format!("write png {}", path.display()))
    }
}
