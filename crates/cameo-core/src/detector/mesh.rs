//! Dense 468-point face mesh strategy.
//!
//! Runs the mesh model on the portrait window of the frame and keeps the
//! face-oval ring as the masking polygon.

use super::{ordered_eyes, portrait_roi, roi_tensor, roi_to_image, sigmoid, Budget, DetectorError};
use crate::types::{FaceRegion, StrategyKind};
use image::RgbaImage;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;

const MESH_INPUT_SIZE: u32 = 192;
const MESH_LANDMARKS: usize = 468;
const MESH_PRESENCE_THRESHOLD: f32 = 0.5;
/// Share of the shorter image side covered by the inference window.
const MESH_ROI_FRACTION: f32 = 0.8;

/// Mesh indices tracing the face outline, forehead to chin and back.
const FACE_OVAL: [usize; 36] = [
    10, 338, 297, 332, 284, 251, 389, 356, 454, 323, 361, 288, 397, 365, 379, 378, 400, 377, 152,
    148, 176, 149, 150, 136, 172, 58, 132, 93, 234, 127, 162, 21, 54, 103, 67, 109,
];
const EYE_A: [usize; 2] = [33, 133];
const EYE_B: [usize; 2] = [362, 263];

pub struct FaceMeshDetector {
    session: Mutex<Session>,
    has_presence_output: bool,
}

impl FaceMeshDetector {
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }
        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;
        let has_presence_output = session.outputs().len() > 1;
        tracing::info!(path = %model_path.display(), has_presence_output, "loaded face mesh model");
        Ok(Self {
            session: Mutex::new(session),
            has_presence_output,
        })
    }

    pub fn detect(&self, image: &RgbaImage, budget: &Budget) -> Result<Option<FaceRegion>, DetectorError> {
        budget.check()?;
        let roi = portrait_roi(image.width(), image.height(), MESH_ROI_FRACTION);
        let input = roi_tensor(image, roi, MESH_INPUT_SIZE, 127.5, 127.5);

        let mut session = self
            .session
            .lock()
            .map_err(|_| DetectorError::InferenceFailed("face mesh session poisoned".into()))?;
        budget.check()?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let presence = if self.has_presence_output {
            let (_, score) = outputs[1]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("mesh presence: {e}")))?;
            score.first().copied().map(sigmoid).unwrap_or(0.0)
        } else {
            1.0
        };
        if presence < MESH_PRESENCE_THRESHOLD {
            return Ok(None);
        }

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("mesh landmarks: {e}")))?;
        let Some(points) = mesh_points(raw) else {
            return Err(DetectorError::InferenceFailed(format!(
                "mesh output has {} values, expected {}",
                raw.len(),
                MESH_LANDMARKS * 3
            )));
        };

        let mapped = roi_to_image(&points, roi, MESH_INPUT_SIZE as f32);
        Ok(oval_region(&mapped).map(|r| r.with_confidence(presence)))
    }
}

/// `(x, y)` pairs from a flat `[x, y, z] × 468` tensor.
fn mesh_points(raw: &[f32]) -> Option<Vec<(f32, f32)>> {
    if raw.len() < MESH_LANDMARKS * 3 {
        return None;
    }
    Some(
        raw.chunks_exact(3)
            .take(MESH_LANDMARKS)
            .map(|c| (c[0], c[1]))
            .collect(),
    )
}

/// Face-oval polygon plus eye centers from mapped mesh points.
fn oval_region(points: &[(f32, f32)]) -> Option<FaceRegion> {
    let polygon: Vec<(f32, f32)> = FACE_OVAL.iter().map(|&i| points[i]).collect();
    let eye_a: Vec<(f32, f32)> = EYE_A.iter().map(|&i| points[i]).collect();
    let eye_b: Vec<(f32, f32)> = EYE_B.iter().map(|&i| points[i]).collect();
    let (left, right) = ordered_eyes(&eye_a, &eye_b);
    FaceRegion::from_polygon(polygon, StrategyKind::FaceMesh).map(|r| r.with_eyes(left, right))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mesh_points_rejects_short_output() {
        assert!(mesh_points(&[0.0; 100]).is_none());
        assert_eq!(mesh_points(&[1.0; MESH_LANDMARKS * 3]).unwrap().len(), MESH_LANDMARKS);
    }

    #[test]
    fn test_oval_region_uses_outline_ring() {
        // Place every landmark on a circle keyed by index, so the oval spans it.
        let points: Vec<(f32, f32)> = (0..MESH_LANDMARKS)
            .map(|i| {
                let t = i as f32 / MESH_LANDMARKS as f32 * std::f32::consts::TAU;
                (100.0 + 50.0 * t.cos(), 100.0 + 50.0 * t.sin())
            })
            .collect();
        let region = oval_region(&points).unwrap();
        assert_eq!(region.polygon.as_ref().unwrap().len(), FACE_OVAL.len());
        assert_eq!(region.strategy, StrategyKind::FaceMesh);
        let [l, r] = region.eyes.unwrap();
        assert!(l.0 <= r.0);
    }
}
