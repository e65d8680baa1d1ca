//! Emergency Watch
//!
//! Camera capture and alerting for an emergency-detection pipeline.
//!
//! # Architecture
//!
//! Two processes share this crate:
//!
//! 1. **Capture server** (`capture_server`): owns the camera, throttles
//!    screenshots, runs detectors, sweeps old artifacts and serves
//!    MessagePack envelopes over HTTP.
//! 2. **Alert poller** (`alert_poller`): polls the capture server, decodes
//!    the envelope, classifies the image and posts alarms to an alert sink.
//!
//! # Module Structure
//!
//! - `ingest`, `frame`: camera ownership and captured frames
//! - `throttle`, `artifact`, `retention`: screenshot persistence and cleanup
//! - `detect`: detector backends and crop extraction
//! - `envelope`: the wire format between server and poller
//! - `api`: the HTTP capture API
//! - `poller`: fetch, classify, alert
//! - `config`, `error`: configuration layering and failure taxonomy

pub mod api;
pub mod artifact;
pub mod config;
pub mod detect;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod poller;
pub mod retention;
pub mod throttle;

pub use api::{ApiConfig, ApiHandle, ApiServer, CaptureServices};
pub use artifact::ArtifactStamp;
pub use config::{PollerConfig, ServerConfig};
pub use detect::{CropService, DetectionCapability, DetectorBackend, StubBackend};
pub use envelope::{decode_response, DetectionEnvelope, ImageEncoding, WireFormat};
pub use error::PipelineError;
pub use frame::CapturedFrame;
pub use ingest::{open_camera, Camera, CameraConfig, FrameSource, SyntheticSource};
pub use poller::{AlertOutcome, AlertSink, Classifier, Label, PollReport, Poller};
pub use retention::{prune, ArtifactKind, RetentionSet};
pub use throttle::{Clock, ManualClock, ScreenshotRecord, ScreenshotThrottle, SystemClock};
