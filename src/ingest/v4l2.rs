//! V4L2 frame source.
//!
//! This module provides `V4l2Source` for reading frames from local V4L2
//! devices (e.g., /dev/video0). Frames are requested as RGB24; the device
//! handle and its mmap stream are held together and dropped on release.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;

use super::{CameraConfig, FrameSource};
use crate::frame::CapturedFrame;

const STREAM_BUFFERS: u32 = 4;

pub struct V4l2Source {
    config: CameraConfig,
    state: Option<DeviceV4l2State>,
    active_width: u32,
    active_height: u32,
}

#[self_referencing]
struct DeviceV4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Source {
    pub fn new(config: CameraConfig) -> Self {
        Self {
            active_width: config.width,
            active_height: config.height,
            config,
            state: None,
        }
    }
}

impl FrameSource for V4l2Source {
    fn describe(&self) -> String {
        format!(
            "{} ({}x{})",
            self.config.device, self.active_width, self.active_height
        )
    }

    fn open(&mut self) -> Result<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let device = v4l::Device::with_path(&self.config.device)
            .with_context(|| format!("open v4l2 device {}", self.config.device))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = self.config.width;
        format.height = self.config.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Source: failed to set format on {}: {}",
                    self.config.device,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        if format.fourcc != v4l::FourCC::new(b"RGB3") {
            return Err(anyhow!(
                "v4l2 device {} does not deliver RGB24 frames (got {})",
                self.config.device,
                format.fourcc
            ));
        }

        self.active_width = format.width;
        self.active_height = format.height;

        let state = DeviceV4l2StateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, STREAM_BUFFERS)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;
        self.state = Some(state);
        Ok(())
    }

    fn read_frame(&mut self) -> Result<CapturedFrame> {
        use v4l::io::traits::CaptureStream;

        let state = self.state.as_mut().context("v4l2 device not opened")?;
        let (buf, _meta) = state
            .with_mut(|fields| fields.stream.next())
            .context("capture v4l2 frame")?;
        let expected = (self.active_width * self.active_height * 3) as usize;
        let pixels = buf
            .get(..expected)
            .ok_or_else(|| anyhow!("short v4l2 frame: {} of {} bytes", buf.len(), expected))?
            .to_vec();
        CapturedFrame::from_rgb(pixels, self.active_width, self.active_height)
    }

    fn release(&mut self) {
        self.state = None;
    }
}
