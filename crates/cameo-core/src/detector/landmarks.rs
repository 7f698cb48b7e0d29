//! 68-point landmark strategy.
//!
//! The face polygon is the jawline plus the eyebrows lifted into a synthetic
//! forehead, since the 68-point layout stops at the brow line.

use super::{ordered_eyes, portrait_roi, roi_tensor, roi_to_image, Budget, DetectorError};
use crate::types::{FaceRegion, StrategyKind};
use image::RgbaImage;
use ort::session::Session;
use ort::value::TensorRef;
use std::ops::RangeInclusive;
use std::path::Path;
use std::sync::Mutex;

const LANDMARK_INPUT_SIZE: u32 = 112;
const LANDMARK_COUNT: usize = 68;
const LANDMARK_ROI_FRACTION: f32 = 0.7;
/// Forehead height above the brow line as a fraction of brow-to-chin distance.
const FOREHEAD_RATIO: f32 = 0.35;

const JAW: RangeInclusive<usize> = 0..=16;
const BROWS: RangeInclusive<usize> = 17..=26;
const CHIN: usize = 8;
const LEFT_EYE: RangeInclusive<usize> = 36..=41;
const RIGHT_EYE: RangeInclusive<usize> = 42..=47;

pub struct LandmarkDetector {
    session: Mutex<Session>,
}

impl LandmarkDetector {
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }
        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;
        tracing::info!(path = %model_path.display(), "loaded 68-point landmark model");
        Ok(Self {
            session: Mutex::new(session),
        })
    }

    pub fn detect(&self, image: &RgbaImage, budget: &Budget) -> Result<Option<FaceRegion>, DetectorError> {
        budget.check()?;
        let roi = portrait_roi(image.width(), image.height(), LANDMARK_ROI_FRACTION);
        let input = roi_tensor(image, roi, LANDMARK_INPUT_SIZE, 0.0, 255.0);

        let mut session = self
            .session
            .lock()
            .map_err(|_| DetectorError::InferenceFailed("landmark session poisoned".into()))?;
        budget.check()?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("landmarks: {e}")))?;

        if raw.len() < LANDMARK_COUNT * 2 {
            return Err(DetectorError::InferenceFailed(format!(
                "landmark output has {} values, expected {}",
                raw.len(),
                LANDMARK_COUNT * 2
            )));
        }
        let points: Vec<(f32, f32)> = raw
            .chunks_exact(2)
            .take(LANDMARK_COUNT)
            .map(|c| (c[0], c[1]))
            .collect();
        let mapped = roi_to_image(&points, roi, LANDMARK_INPUT_SIZE as f32);
        Ok(face_polygon(&mapped))
    }
}

/// Jaw, then brows right-to-left lifted by the forehead estimate.
fn face_polygon(points: &[(f32, f32)]) -> Option<FaceRegion> {
    if points.len() < LANDMARK_COUNT {
        return None;
    }
    let brow_y = BROWS.map(|i| points[i].1).sum::<f32>() / BROWS.count() as f32;
    let face_height = points[CHIN].1 - brow_y;
    if face_height <= 0.0 {
        return None;
    }
    let lift = face_height * FOREHEAD_RATIO;

    let mut polygon: Vec<(f32, f32)> = JAW.map(|i| points[i]).collect();
    polygon.extend(BROWS.rev().map(|i| (points[i].0, points[i].1 - lift)));

    let left: Vec<(f32, f32)> = LEFT_EYE.map(|i| points[i]).collect();
    let right: Vec<(f32, f32)> = RIGHT_EYE.map(|i| points[i]).collect();
    let (l, r) = ordered_eyes(&left, &right);

    FaceRegion::from_polygon(polygon, StrategyKind::Landmarks68).map(|region| region.with_eyes(l, r))
}
