use std::path::PathBuf;

use thiserror::Error;

/// Typed outcomes for the capture, decode and delivery boundaries.
///
/// Plumbing (config, sockets, setup) stays on `anyhow`; these are the
/// failures a caller is expected to match on and turn into a status code
/// or a classification label.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The camera produced no frame after every read attempt.
    #[error("camera unreadable after {attempts} attempts: {reason}")]
    CaptureFailure { attempts: u32, reason: String },

    /// A response body did not carry a usable image payload.
    #[error("could not decode image payload: {0}")]
    DecodeFailure(String),

    /// A response envelope could not be serialised.
    #[error("could not encode response envelope: {0}")]
    EncodeFailure(String),

    /// Timeout, connection error or non-2xx status on an outbound request.
    #[error("request to {url} failed: {reason}")]
    NetworkFailure { url: String, reason: String },

    /// A detector ran cleanly but found nothing.
    #[error("no {kind} detected")]
    EmptyDetection { kind: &'static str },

    /// A detector backend failed while processing a screenshot.
    #[error("{kind} detection failed: {reason}")]
    DetectorFailure { kind: &'static str, reason: String },

    /// An artifact could not be written or read back.
    #[error("artifact {path} unavailable: {reason}")]
    Storage { path: PathBuf, reason: String },
}

impl PipelineError {
    pub(crate) fn storage(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        PipelineError::Storage {
            path: path.into(),
            reason: err.to_string(),
        }
    }
}
