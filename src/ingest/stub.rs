//! Synthetic frame source for `stub://` devices.

use anyhow::{anyhow, Result};

use super::{CameraConfig, FrameSource};
use crate::frame::CapturedFrame;

/// Generates a slowly changing RGB test pattern.
pub struct SyntheticSource {
    config: CameraConfig,
    frame_count: u64,
    /// Simulated scene state; bumps every 50 frames.
    scene_state: u8,
    opened: bool,
}

impl SyntheticSource {
    pub fn new(config: CameraConfig) -> Self {
        Self {
            config,
            frame_count: 0,
            scene_state: 0,
            opened: false,
        }
    }

    pub fn frames_captured(&self) -> u64 {
        self.frame_count
    }

    fn generate_synthetic_pixels(&mut self) -> Vec<u8> {
        let pixel_count = (self.config.width * self.config.height * 3) as usize;
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64) % 256) as u8;
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn describe(&self) -> String {
        format!("{} (synthetic)", self.config.device)
    }

    fn open(&mut self) -> Result<()> {
        if self.config.width == 0 || self.config.height == 0 {
            return Err(anyhow!("synthetic camera needs non-zero dimensions"));
        }
        self.opened = true;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<CapturedFrame> {
        if !self.opened {
            return Err(anyhow!("synthetic camera not opened"));
        }
        self.frame_count += 1;
        let pixels = self.generate_synthetic_pixels();
        CapturedFrame::from_rgb(pixels, self.config.width, self.config.height)
    }

    fn release(&mut self) {
        self.opened = false;
    }
}
