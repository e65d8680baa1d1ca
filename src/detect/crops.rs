//! Crop extraction for detection routes.
//!
//! A `CropService` owns one detector backend and an output directory. For
//! every screenshot with at least one detection it creates
//! `<output_dir>/<screenshot file name>/` and writes one JPEG per detection,
//! named `<label>_<index>_conf_<confidence>.jpg`. Detections at or below
//! the service's confidence floor, or smaller than `MIN_CROP_SIDE`, are
//! dropped before anything is written.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{imageops, RgbImage};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::detect::backend::{DetectionCapability, DetectorBackend};
use crate::error::PipelineError;

/// Crops narrower or shorter than this are skipped.
pub const MIN_CROP_SIDE: u32 = 10;

pub const PEOPLE_JPEG_QUALITY: u8 = 20;
pub const WEAPONS_JPEG_QUALITY: u8 = 100;

/// Detections must score above these to be cropped.
pub const PEOPLE_MIN_CONFIDENCE: f32 = 0.1;
pub const WEAPONS_MIN_CONFIDENCE: f32 = 0.4;

pub struct CropService {
    backend: Box<dyn DetectorBackend>,
    capability: DetectionCapability,
    output_dir: PathBuf,
    jpeg_quality: u8,
    min_confidence: f32,
}

impl CropService {
    /// Build the service, warming the backend up and creating `output_dir`.
    pub fn new(
        mut backend: Box<dyn DetectorBackend>,
        capability: DetectionCapability,
        output_dir: impl Into<PathBuf>,
        jpeg_quality: u8,
        min_confidence: f32,
    ) -> Result<Self> {
        if !backend.supports(capability) {
            return Err(anyhow!(
                "backend '{}' cannot detect {}",
                backend.name(),
                capability.noun()
            ));
        }
        backend
            .warm_up()
            .with_context(|| format!("warm up {} backend '{}'", capability.noun(), backend.name()))?;
        let output_dir = output_dir.into();
        std::fs::create_dir_all(&output_dir)
            .with_context(|| format!("create {}", output_dir.display()))?;
        Ok(Self {
            backend,
            capability,
            output_dir,
            jpeg_quality,
            min_confidence,
        })
    }

    pub fn people(backend: Box<dyn DetectorBackend>, output_dir: impl Into<PathBuf>) -> Result<Self> {
        Self::new(
            backend,
            DetectionCapability::People,
            output_dir,
            PEOPLE_JPEG_QUALITY,
            PEOPLE_MIN_CONFIDENCE,
        )
    }

    pub fn weapons(backend: Box<dyn DetectorBackend>, output_dir: impl Into<PathBuf>) -> Result<Self> {
        Self::new(
            backend,
            DetectionCapability::Weapons,
            output_dir,
            WEAPONS_JPEG_QUALITY,
            WEAPONS_MIN_CONFIDENCE,
        )
    }

    pub fn capability(&self) -> DetectionCapability {
        self.capability
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Detect on `screenshot` and write the crops. Returns crop paths in
    /// detection order; empty when nothing usable was found.
    pub fn detect(&mut self, screenshot: &Path) -> Result<Vec<PathBuf>, PipelineError> {
        let kind = self.capability.noun();
        let image = image::open(screenshot)
            .map_err(|err| PipelineError::storage(screenshot, err))?
            .to_rgb8();
        let detections = self
            .backend
            .detect(&image)
            .map_err(|err| PipelineError::DetectorFailure {
                kind,
                reason: format!("{err:#}"),
            })?;

        let (width, height) = image.dimensions();
        let mut usable = Vec::new();
        for (index, detection) in detections.iter().enumerate() {
            if detection.confidence <= self.min_confidence {
                log::debug!(
                    "skipping {} {} - confidence {:.2} not above {:.2}",
                    detection.label,
                    index,
                    detection.confidence,
                    self.min_confidence
                );
                continue;
            }
            let bbox = detection.bbox.clamp_to(width, height);
            if bbox.width() < MIN_CROP_SIDE || bbox.height() < MIN_CROP_SIDE {
                log::debug!("skipping {} {} - too small", detection.label, index);
                continue;
            }
            usable.push((index, detection, bbox));
        }
        if usable.is_empty() {
            log::info!("no {} detected in {}", kind, screenshot.display());
            return Ok(Vec::new());
        }

        let file_name = screenshot
            .file_name()
            .ok_or_else(|| PipelineError::storage(screenshot, "screenshot path has no file name"))?;
        let crop_dir = self.output_dir.join(file_name);
        std::fs::create_dir_all(&crop_dir).map_err(|err| PipelineError::storage(&crop_dir, err))?;

        let mut written = Vec::new();
        for (index, detection, bbox) in usable {
            let crop = imageops::crop_imm(&image, bbox.x1, bbox.y1, bbox.width(), bbox.height())
                .to_image();
            let path = crop_dir.join(format!(
                "{}_{}_conf_{:.2}.jpg",
                detection.label, index, detection.confidence
            ));
            write_jpeg(&crop, &path, self.jpeg_quality)
                .map_err(|err| PipelineError::storage(&path, format!("{err:#}")))?;
            log::info!("saved {}", path.display());
            written.push(path);
        }
        Ok(written)
    }
}

fn write_jpeg(image: &RgbImage, path: &Path, quality: u8) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    JpegEncoder::new_with_quality(&mut writer, quality).encode_image(image)?;
    writer.flush()?;
    Ok(())
}
