use anyhow::Result;
use image::RgbImage;

use crate::detect::backend::{DetectionCapability, DetectorBackend};
use crate::detect::result::{BoundingBox, Detection};

/// A region in normalized (0..1) image coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StubRegion {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    pub confidence: f32,
}

/// Stub backend for testing. Reports the same regions for every image.
pub struct StubBackend {
    capability: DetectionCapability,
    label: String,
    regions: Vec<StubRegion>,
}

impl StubBackend {
    pub fn new(
        capability: DetectionCapability,
        label: impl Into<String>,
        regions: Vec<StubRegion>,
    ) -> Self {
        Self {
            capability,
            label: label.into(),
            regions,
        }
    }

    /// One person filling the centre of the frame.
    pub fn people() -> Self {
        Self::new(
            DetectionCapability::People,
            "person",
            vec![StubRegion {
                x: 0.25,
                y: 0.25,
                w: 0.5,
                h: 0.5,
                confidence: 0.87,
            }],
        )
    }

    /// One pistol in the lower right quadrant.
    pub fn weapons() -> Self {
        Self::new(
            DetectionCapability::Weapons,
            "pistol",
            vec![StubRegion {
                x: 0.5,
                y: 0.5,
                w: 0.4,
                h: 0.4,
                confidence: 0.62,
            }],
        )
    }

    /// Never detects anything.
    pub fn empty(capability: DetectionCapability) -> Self {
        let label = match capability {
            DetectionCapability::People => "person",
            _ => "weapon",
        };
        Self::new(capability, label, Vec::new())
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn supports(&self, capability: DetectionCapability) -> bool {
        capability == self.capability
    }

    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>> {
        let (width, height) = image.dimensions();
        let scale = |v: f32, size: u32| (v.clamp(0.0, 1.0) * size as f32).round() as u32;
        Ok(self
            .regions
            .iter()
            .map(|region| Detection {
                label: self.label.clone(),
                confidence: region.confidence,
                bbox: BoundingBox {
                    x1: scale(region.x, width),
                    y1: scale(region.y, height),
                    x2: scale(region.x + region.w, width),
                    y2: scale(region.y + region.h, height),
                },
            })
            .collect())
    }
}
