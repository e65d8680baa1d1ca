//! Camera frame sources.
//!
//! This module provides the sources the screenshot throttle reads from:
//! - USB/V4L2 devices (feature: ingest-v4l2)
//! - Synthetic `stub://` source (testing, demos)
//!
//! A source is an exclusive device handle. It is wrapped in a `Camera`,
//! which owns the open/release lifecycle and releases the device exactly
//! once, on every exit path, when it is dropped.

pub mod stub;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use anyhow::{anyhow, Result};

use crate::frame::CapturedFrame;

pub use stub::SyntheticSource;
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Source;

/// Configuration for the capture device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CameraConfig {
    /// Device path (e.g., "/dev/video0") or `stub://<name>` for the synthetic source.
    pub device: String,
    /// Preferred frame width.
    pub width: u32,
    /// Preferred frame height.
    pub height: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "stub://camera".to_string(),
            width: 640,
            height: 480,
        }
    }
}

/// A device that produces frames on demand.
pub trait FrameSource: Send {
    /// Human-readable device description for logs.
    fn describe(&self) -> String;

    /// Acquire the device.
    fn open(&mut self) -> Result<()>;

    /// Read one frame. A failed read leaves the device usable for another attempt.
    fn read_frame(&mut self) -> Result<CapturedFrame>;

    /// Release the device. Called exactly once by `Camera`.
    fn release(&mut self);
}

/// Exclusive, scoped ownership of an opened frame source.
pub struct Camera {
    source: Box<dyn FrameSource>,
    released: bool,
}

impl Camera {
    /// Open `source` and take ownership of it.
    pub fn open(mut source: Box<dyn FrameSource>) -> Result<Self> {
        source.open()?;
        log::info!("camera opened: {}", source.describe());
        Ok(Self {
            source,
            released: false,
        })
    }

    pub fn read_frame(&mut self) -> Result<CapturedFrame> {
        if self.released {
            return Err(anyhow!("camera {} already released", self.source.describe()));
        }
        self.source.read_frame()
    }

    /// Release the device. Further calls are no-ops.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.source.release();
        log::info!("camera released: {}", self.source.describe());
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        self.release();
    }
}

/// Build and open the camera named by `config.device`.
pub fn open_camera(config: &CameraConfig) -> Result<Camera> {
    if config.device.starts_with("stub://") {
        return Camera::open(Box::new(SyntheticSource::new(config.clone())));
    }
    #[cfg(feature = "ingest-v4l2")]
    {
        Camera::open(Box::new(V4l2Source::new(config.clone())))
    }
    #[cfg(not(feature = "ingest-v4l2"))]
    {
        Err(anyhow!(
            "camera device '{}' requires the ingest-v4l2 feature",
            config.device
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSource {
        releases: Arc<AtomicUsize>,
    }

    impl FrameSource for CountingSource {
        fn describe(&self) -> String {
            "counting".to_string()
        }

        fn open(&mut self) -> Result<()> {
            Ok(())
        }

        fn read_frame(&mut self) -> Result<CapturedFrame> {
            CapturedFrame::from_rgb(vec![0u8; 3], 1, 1)
        }

        fn release(&mut self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn camera_releases_exactly_once() -> Result<()> {
        let releases = Arc::new(AtomicUsize::new(0));
        let mut camera = Camera::open(Box::new(CountingSource {
            releases: releases.clone(),
        }))?;
        camera.read_frame()?;
        camera.release();
        assert!(camera.read_frame().is_err());
        drop(camera);

        assert_eq!(releases.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn dropping_camera_releases_device() -> Result<()> {
        let releases = Arc::new(AtomicUsize::new(0));
        {
            let _camera = Camera::open(Box::new(CountingSource {
                releases: releases.clone(),
            }))?;
        }
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn stub_device_opens_synthetic_camera() -> Result<()> {
        let mut camera = open_camera(&CameraConfig {
            device: "stub://test".to_string(),
            width: 8,
            height: 6,
        })?;
        let frame = camera.read_frame()?;
        assert_eq!((frame.width, frame.height), (8, 6));
        Ok(())
    }
}
