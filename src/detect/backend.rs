use anyhow::Result;
use image::RgbImage;

use crate::detect::result::Detection;

/// What a backend can look for.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectionCapability {
    People,
    Weapons,
}

impl DetectionCapability {
    /// Plural noun used in logs, routes and error bodies.
    pub fn noun(&self) -> &'static str {
        match self {
            DetectionCapability::People => "people",
            DetectionCapability::Weapons => "weapons",
        }
    }
}

/// Detector backend trait.
///
/// Backends wrap pretrained models the pipeline treats as black boxes:
/// an image goes in, zero or more labelled boxes come out, and any call
/// may fail. Models are loaded when the backend is constructed, so a
/// missing model surfaces as a startup error.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Returns true when the backend supports a capability.
    fn supports(&self, capability: DetectionCapability) -> bool;

    /// Run detection on a decoded screenshot.
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
