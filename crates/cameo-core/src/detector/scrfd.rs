//! SCRFD bounding-box detector via ONNX Runtime.
//!
//! Anchor-free decoding over three strides followed by NMS. The best-scoring
//! box becomes the face region; its five keypoints supply the eye centers.

use super::{Budget, DetectorError};
use crate::types::{FaceRegion, StrategyKind};
use image::{imageops, RgbaImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;

// --- Named constants ---
const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

/// Raw SCRFD detection in image coordinates.
#[derive(Debug, Clone, PartialEq)]
struct Detection {
    x: f32,
    y: f32,
    width: f32,
    height: f32,
    confidence: f32,
    /// Left eye, right eye, nose, left mouth corner, right mouth corner.
    keypoints: Option<[(f32, f32); 5]>,
}

impl Detection {
    fn into_region(self) -> FaceRegion {
        let region = FaceRegion::from_box(self.x, self.y, self.width, self.height, StrategyKind::Scrfd)
            .with_confidence(self.confidence);
        match self.keypoints {
            Some(kps) => {
                let (l, r) = if kps[0].0 <= kps[1].0 {
                    (kps[0], kps[1])
                } else {
                    (kps[1], kps[0])
                };
                region.with_eyes(l, r)
            }
            None => region,
        }
    }
}

/// Letterbox placement of the source image inside the square model input.
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (score, bbox, kps).
type StrideOutputs = (usize, usize, usize);

pub struct FaceDetector {
    session: Mutex<Session>,
    stride_outputs: [StrideOutputs; 3],
}

impl FaceDetector {
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD needs 9 outputs (score/bbox/kps per stride), model has {}",
                output_names.len()
            )));
        }

        let stride_outputs = map_stride_outputs(&output_names);
        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            ?stride_outputs,
            "loaded SCRFD model"
        );

        Ok(Self {
            session: Mutex::new(session),
            stride_outputs,
        })
    }

    /// Highest-confidence face after NMS, if any clears the threshold.
    pub fn detect_best(
        &self,
        image: &RgbaImage,
        budget: &Budget,
    ) -> Result<Option<FaceRegion>, DetectorError> {
        let mut detections = self.detect_all(image, budget)?;
        Ok(if detections.is_empty() {
            None
        } else {
            Some(detections.swap_remove(0).into_region())
        })
    }

    fn detect_all(&self, image: &RgbaImage, budget: &Budget) -> Result<Vec<Detection>, DetectorError> {
        budget.check()?;
        let (input, letterbox) = letterbox_tensor(image);

        let mut session = self
            .session
            .lock()
            .map_err(|_| DetectorError::InferenceFailed("SCRFD session poisoned".into()))?;
        budget.check()?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_outputs[pos];
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let scores = extract(score_idx, "scores")?;
            let bboxes = extract(bbox_idx, "bboxes")?;
            let kps = extract(kps_idx, "kps")?;

            candidates.extend(decode_stride(
                scores,
                bboxes,
                kps,
                stride,
                &letterbox,
                SCRFD_CONFIDENCE_THRESHOLD,
            ));
        }

        Ok(nms(candidates, SCRFD_NMS_THRESHOLD))
    }
}

/// Letterbox an RGBA image into the SCRFD input tensor.
fn letterbox_tensor(image: &RgbaImage) -> (Array4<f32>, Letterbox) {
    let (w, h) = (image.width().max(1) as f32, image.height().max(1) as f32);
    let side = SCRFD_INPUT_SIZE as f32;
    let scale = (side / w).min(side / h);
    let new_w = ((w * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE as u32);
    let new_h = ((h * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE as u32);
    let pad_x = (SCRFD_INPUT_SIZE as u32 - new_w) as f32 / 2.0;
    let pad_y = (SCRFD_INPUT_SIZE as u32 - new_h) as f32 / 2.0;

    let resized = imageops::resize(image, new_w, new_h, imageops::FilterType::Triangle);

    // Zero is the normalized value of the mean, so padding stays neutral.
    let mut tensor = Array4::<f32>::zeros((1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE));
    let (ox, oy) = (pad_x.floor() as usize, pad_y.floor() as usize);
    for (x, y, p) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, oy + y as usize, ox + x as usize]] = (p[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (tensor, Letterbox { scale, pad_x, pad_y })
}

/// Resolve which output tensor carries scores, boxes, and keypoints for each stride.
///
/// Named exports (`score_8`, `bbox_16`, `kps_32`, ...) are matched by name;
/// anything else is assumed to follow the reference positional layout
/// (scores 0-2, boxes 3-5, keypoints 6-8).
fn map_stride_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let named: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?, find("kps", s)?)))
        .collect();

    match named.as_deref() {
        Some(&[a, b, c]) => [a, b, c],
        _ => [(0, 3, 6), (1, 4, 7), (2, 5, 8)],
    }
}

fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<Detection> {
    let grid = SCRFD_INPUT_SIZE / stride;
    let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;
    let unbox = |x: f32, y: f32| {
        (
            (x - letterbox.pad_x) / letterbox.scale,
            (y - letterbox.pad_y) / letterbox.scale,
        )
    };

    let mut out = Vec::new();
    for idx in 0..anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }
        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let ax = (cell % grid) as f32 * s;
        let ay = (cell / grid) as f32 * s;

        let Some(d) = bboxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };
        let (x1, y1) = unbox(ax - d[0] * s, ay - d[1] * s);
        let (x2, y2) = unbox(ax + d[2] * s, ay + d[3] * s);

        let keypoints = kps.get(idx * 10..idx * 10 + 10).map(|k| {
            std::array::from_fn(|i| unbox(ax + k[i * 2] * s, ay + k[i * 2 + 1] * s))
        });

        out.push(Detection {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
            keypoints,
        });
    }
    out
}

/// Greedy non-maximum suppression; output is sorted by confidence, best first.
fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<Detection> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| iou(k, &det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

fn iou(a: &Detection, b: &Detection) -> f32 {
    let iw = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let ih = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = iw * ih;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
