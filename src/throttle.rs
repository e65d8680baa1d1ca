//! Screenshot throttle.
//!
//! Decides whether a capture request persists a fresh screenshot or hands
//! back the previous one. A frame is always read first (up to
//! `CAPTURE_ATTEMPTS` tries); it is only written when the minimum interval
//! since the last written screenshot has elapsed.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use crate::artifact::ArtifactStamp;
use crate::error::PipelineError;
use crate::frame::CapturedFrame;
use crate::ingest::Camera;

/// Read attempts per capture request. No delay between attempts.
pub const CAPTURE_ATTEMPTS: u32 = 3;

/// Wall-clock source for throttle decisions and artifact stamps.
pub trait Clock: Send {
    fn now(&self) -> SystemTime;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Manually advanced clock; clones share the same time.
#[derive(Clone, Debug)]
pub struct ManualClock {
    now: Arc<Mutex<SystemTime>>,
}

impl ManualClock {
    pub fn new(start: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        self.now
            .lock()
            .map(|now| *now)
            .unwrap_or_else(|poisoned| *poisoned.into_inner())
    }
}

/// A persisted screenshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScreenshotRecord {
    pub path: PathBuf,
    pub created: ArtifactStamp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// A new file was written.
    Fresh,
    /// The previous screenshot was returned unchanged.
    Cached,
}

/// Per-camera throttle state. `last_record`, when present, names a file
/// that existed at the time it was last checked.
#[derive(Clone, Debug)]
pub struct ThrottleState {
    pub last_capture: Option<SystemTime>,
    pub last_record: Option<ScreenshotRecord>,
    pub min_interval: Duration,
}

pub struct ScreenshotThrottle {
    camera: Camera,
    output_dir: PathBuf,
    state: ThrottleState,
    clock: Box<dyn Clock>,
}

impl ScreenshotThrottle {
    /// Take ownership of `camera` and write screenshots under `output_dir`.
    pub fn new(
        camera: Camera,
        output_dir: impl Into<PathBuf>,
        min_interval: Duration,
    ) -> anyhow::Result<Self> {
        let output_dir = output_dir.into();
        std::fs::create_dir_all(&output_dir)?;
        Ok(Self {
            camera,
            output_dir,
            state: ThrottleState {
                last_capture: None,
                last_record: None,
                min_interval,
            },
            clock: Box::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn state(&self) -> &ThrottleState {
        &self.state
    }

    /// Return the path of a screenshot no older than the minimum interval.
    pub fn request_capture(&mut self) -> Result<ScreenshotRecord, PipelineError> {
        self.capture().map(|(record, _)| record)
    }

    /// Like `request_capture`, also reporting whether a file was written.
    pub fn capture(&mut self) -> Result<(ScreenshotRecord, CaptureOutcome), PipelineError> {
        let frame = self.read_with_retries()?;
        let now = self.clock.now();

        if let Some(record) = self.cached_record(now) {
            log::debug!("screenshot throttled; reusing {}", record.path.display());
            return Ok((record, CaptureOutcome::Cached));
        }

        let (path, created) = self.unused_path(ArtifactStamp::from_system_time(now));
        frame
            .write_png(&path)
            .map_err(|err| PipelineError::storage(&path, format!("{err:#}")))?;
        log::info!("screenshot saved as {}", path.display());

        let record = ScreenshotRecord { path, created };
        self.state.last_capture = Some(now);
        self.state.last_record = Some(record.clone());
        Ok((record, CaptureOutcome::Fresh))
    }

    /// Release the camera ahead of drop.
    pub fn shutdown(&mut self) {
        self.camera.release();
    }

    fn read_with_retries(&mut self) -> Result<CapturedFrame, PipelineError> {
        let mut last_error = None;
        for attempt in 1..=CAPTURE_ATTEMPTS {
            match self.camera.read_frame() {
                Ok(frame) => return Ok(frame),
                Err(err) => {
                    log::warn!("failed to grab frame ({attempt}/{CAPTURE_ATTEMPTS}): {err:#}");
                    last_error = Some(err);
                }
            }
        }
        log::error!("failed to take screenshot after {CAPTURE_ATTEMPTS} tries");
        Err(PipelineError::CaptureFailure {
            attempts: CAPTURE_ATTEMPTS,
            reason: last_error
                .map(|err| format!("{err:#}"))
                .unwrap_or_else(|| "no read attempted".to_string()),
        })
    }

    fn cached_record(&mut self, now: SystemTime) -> Option<ScreenshotRecord> {
        let last_capture = self.state.last_capture?;
        let record = self.state.last_record.as_ref()?;
        // A clock stepping backwards counts as no time elapsed.
        let elapsed = now.duration_since(last_capture).unwrap_or(Duration::ZERO);
        if elapsed >= self.state.min_interval {
            return None;
        }
        if !record.path.exists() {
            log::warn!(
                "cached screenshot {} disappeared; capturing a fresh one",
                record.path.display()
            );
            self.state.last_record = None;
            return None;
        }
        Some(record.clone())
    }

    /// First free screenshot name for `stamp`, bumping its collision
    /// sequence when the instant is already taken.
    fn unused_path(&self, stamp: ArtifactStamp) -> (PathBuf, ArtifactStamp) {
        let mut created = stamp;
        let mut sequence = 1;
        loop {
            let path = self.output_dir.join(created.screenshot_name());
            if !path.exists() {
                return (path, created);
            }
            sequence += 1;
            created = stamp.with_sequence(sequence);
        }
    }
}
