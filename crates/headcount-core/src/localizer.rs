//! Face localization: detect on the grayscale scene, crop from the color scene.

use crate::detector::{DetectionParams, Detector, DetectorError};
use crate::types::{BoundingBox, FaceCandidate, CANDIDATE_SIZE};
use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage};

/// Produces face candidates from a scene image.
pub trait Localizer {
    /// Find every face in `scene`. An empty result is a valid outcome.
    fn localize(&mut self, scene: &DynamicImage) -> Result<Vec<FaceCandidate>, DetectorError>;
}

/// Localizer that crops each detector box and resizes it to the canonical
/// candidate size. No landmark alignment is performed.
pub struct CropLocalizer<D> {
    detector: D,
    params: DetectionParams,
}

impl<D: Detector> CropLocalizer<D> {
    pub fn new(detector: D, params: DetectionParams) -> Self {
        Self { detector, params }
    }

    pub fn params(&self) -> &DetectionParams {
        &self.params
    }
}

impl<D: Detector> Localizer for CropLocalizer<D> {
    fn localize(&mut self, scene: &DynamicImage) -> Result<Vec<FaceCandidate>, DetectorError> {
        let gray = scene.to_luma8();
        let (width, height) = gray.dimensions();

        let boxes = self
            .detector
            .detect(gray.as_raw(), width, height, &self.params)?;

        let color = scene.to_rgb8();
        let candidates: Vec<FaceCandidate> = boxes
            .into_iter()
            .filter_map(|bbox| crop_candidate(&color, bbox))
            .collect();

        tracing::info!(width, height, faces = candidates.len(), "scene localized");
        Ok(candidates)
    }
}

/// Crop `bbox` (clamped to the image) out of `scene` and resize it.
///
/// Returns `None` when the clamped box has no area.
pub fn crop_candidate(scene: &RgbImage, bbox: BoundingBox) -> Option<FaceCandidate> {
    let (img_w, img_h) = scene.dimensions();

    let x0 = bbox.x.max(0.0).floor() as u32;
    let y0 = bbox.y.max(0.0).floor() as u32;
    let x1 = ((bbox.x + bbox.width).ceil().max(0.0) as u32).min(img_w);
    let y1 = ((bbox.y + bbox.height).ceil().max(0.0) as u32).min(img_h);

    if x0 >= x1 || y0 >= y1 {
        tracing::debug!(?bbox, "dropping detection outside the scene");
        return None;
    }

    let crop = imageops::crop_imm(scene, x0, y0, x1 - x0, y1 - y0).to_image();
    let pixels = imageops::resize(&crop, CANDIDATE_SIZE, CANDIDATE_SIZE, FilterType::Triangle);

    Some(FaceCandidate {
        pixels,
        bounding_box: bbox,
    })
}
