//! Portrait-matting pass over the detected face crop.
//!
//! The refined cutout can replace the geometric mask (polygon or ellipse) with
//! a per-pixel matte from a background-removal model. Matting runs on a
//! downscaled copy of the crop with its own time budget; any failure or
//! timeout leaves the geometric cutout in place.

use crate::cutout::{CutoutExtractor, Trim};
use crate::detector::{roi_tensor, sigmoid, Budget, CancelOnDrop, DetectorError, ModelPaths};
use crate::raster::WorkingCopy;
use crate::types::{Cutout, CutoutKind, Rect};
use image::{imageops, GrayImage, Luma, RgbaImage};
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const SEGMENTATION_MODEL: &str = "portrait_matte.onnx";
pub const DEFAULT_SEGMENT_TIMEOUT: Duration = Duration::from_millis(2500);
/// Longest edge of the crop handed to the matting worker.
pub const SEGMENT_MAX_SIZE: u32 = 320;

const MATTE_INPUT_SIZE: u32 = 320;
const MATTE_MEAN: f32 = 127.5;
const MATTE_STD: f32 = 127.5;

/// Produces a foreground matte (255 = keep) for a face crop.
pub trait Matting: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn matte(&self, image: &RgbaImage, budget: &Budget) -> Result<GrayImage, DetectorError>;
}

/// ONNX portrait-matting model taking a `1×3×320×320` RGB tensor and
/// returning a `1×1×320×320` foreground map.
pub struct PortraitMatting {
    session: Mutex<Session>,
}

impl PortraitMatting {
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }
        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;
        tracing::info!(path = %model_path.display(), "loaded portrait matting model");
        Ok(Self {
            session: Mutex::new(session),
        })
    }
}

impl Matting for PortraitMatting {
    fn name(&self) -> &'static str {
        "portrait_matte"
    }

    fn matte(&self, image: &RgbaImage, budget: &Budget) -> Result<GrayImage, DetectorError> {
        budget.check()?;
        let roi = Rect::new(0, 0, image.width(), image.height());
        let input = roi_tensor(image, roi, MATTE_INPUT_SIZE, MATTE_MEAN, MATTE_STD);

        let mut session = self
            .session
            .lock()
            .map_err(|_| DetectorError::InferenceFailed("matting session poisoned".into()))?;
        budget.check()?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("matte output: {e}")))?;
        budget.check()?;
        matte_from_raw(raw, MATTE_INPUT_SIZE)
    }
}

/// Turn a flat `size × size` foreground map into a grayscale matte.
///
/// Probabilities are used as-is; a map with values outside `0..1` is treated
/// as logits.
fn matte_from_raw(raw: &[f32], size: u32) -> Result<GrayImage, DetectorError> {
    let n = (size * size) as usize;
    if raw.len() < n {
        return Err(DetectorError::InferenceFailed(format!(
            "matte output has {} values, expected {n}",
            raw.len()
        )));
    }
    let logits = raw[..n].iter().any(|v| !(0.0..=1.0).contains(v));
    Ok(GrayImage::from_fn(size, size, |x, y| {
        let v = raw[(y * size + x) as usize];
        let p = if logits { sigmoid(v) } else { v };
        Luma([(p.clamp(0.0, 1.0) * 255.0).round() as u8])
    }))
}

/// Runs a [`Matting`] model on face crops under a time budget.
pub struct Segmenter {
    model: Arc<dyn Matting>,
    timeout: Duration,
}

impl Segmenter {
    pub fn new(model: impl Matting, timeout: Duration) -> Self {
        Self {
            model: Arc::new(model),
            timeout,
        }
    }

    /// Load the matting model if one is configured; `None` disables the pass.
    pub fn load(models: &ModelPaths, timeout: Duration) -> Option<Self> {
        let path = models.segmentation.as_ref()?;
        match PortraitMatting::load(path) {
            Ok(model) => Some(Self::new(model, timeout)),
            Err(e) => {
                tracing::warn!(error = %e, "portrait matting unavailable, using mask cutouts");
                None
            }
        }
    }

    pub fn name(&self) -> &'static str {
        self.model.name()
    }

    /// Matte the face found by detection. `base` is the geometric cutout for
    /// the same face; its crop square is what gets segmented.
    ///
    /// Returns `None` (after logging) when there was no detected face, or when
    /// the model fails, times out, or keeps nothing. The caller then uses `base`.
    pub async fn refine(
        &self,
        working: &WorkingCopy,
        base: &Cutout,
        extractor: &CutoutExtractor,
        trim: Trim,
    ) -> Option<Cutout> {
        if base.kind == CutoutKind::Fallback {
            return None;
        }
        let crop = base.crop;
        let face = imageops::crop_imm(working.image.as_ref(), crop.x, crop.y, crop.width, crop.height).to_image();
        let matte = self.matte(Arc::new(downscale(face))).await?;
        let cutout = extractor.from_matte(working, crop, &matte, trim);
        if cutout.is_none() {
            tracing::info!(model = self.name(), "matte kept nothing, using mask cutout");
        }
        cutout
    }

    async fn matte(&self, image: Arc<RgbaImage>) -> Option<GrayImage> {
        let budget = Budget::new(self.timeout);
        let _cancel = CancelOnDrop(budget.clone());

        let model = Arc::clone(&self.model);
        let worker_budget = budget.clone();
        let started = Instant::now();
        let handle = tokio::task::spawn_blocking(move || model.matte(&image, &worker_budget));

        match tokio::time::timeout(self.timeout, handle).await {
            Ok(Ok(Ok(matte))) => {
                tracing::debug!(
                    model = self.name(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "face crop segmented"
                );
                Some(matte)
            }
            Ok(Ok(Err(e))) => {
                tracing::warn!(model = self.name(), error = %e, "segmentation failed");
                None
            }
            Ok(Err(join_err)) => {
                tracing::warn!(model = self.name(), error = %join_err, "segmentation worker panicked");
                None
            }
            Err(_) => {
                tracing::warn!(
                    model = self.name(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "segmentation timed out"
                );
                None
            }
        }
    }
}

fn downscale(image: RgbaImage) -> RgbaImage {
    let edge = image.width().max(image.height());
    if edge <= SEGMENT_MAX_SIZE {
        return image;
    }
    let scale = SEGMENT_MAX_SIZE as f32 / edge as f32;
    let w = ((image.width() as f32 * scale).round() as u32).max(1);
    let h = ((image.height() as f32 * scale).round() as u32).max(1);
    imageops::resize(&image, w, h, imageops::FilterType::Triangle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FaceRegion, StrategyKind};
    use image::Rgba;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Matting stand-in: keeps a centered disc, fails, or stalls until cancelled.
    enum Scripted {
        Disc(Arc<AtomicUsize>),
        Fail,
        Stall(Arc<AtomicBool>),
    }

    impl Matting for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn matte(&self, image: &RgbaImage, budget: &Budget) -> Result<GrayImage, DetectorError> {
            match self {
                Scripted::Disc(calls) => {
                    calls.fetch_add(1, Ordering::SeqCst);
                    assert!(image.width().max(image.height()) <= SEGMENT_MAX_SIZE);
                    let (w, h) = image.dimensions();
                    let r = w.min(h) as f32 * 0.3;
                    Ok(GrayImage::from_fn(w, h, |x, y| {
                        let dx = x as f32 - w as f32 / 2.0;
                        let dy = y as f32 - h as f32 / 2.0;
                        Luma([if dx * dx + dy * dy <= r * r { 255 } else { 0 }])
                    }))
                }
                Scripted::Fail => Err(DetectorError::InferenceFailed("no person".into())),
                Scripted::Stall(saw_cancel) => {
                    while !budget.is_exhausted() {
                        std::thread::sleep(Duration::from_millis(5));
                    }
                    saw_cancel.store(true, Ordering::SeqCst);
                    Err(DetectorError::BudgetExhausted)
                }
            }
        }
    }

    fn working() -> WorkingCopy {
        let img = RgbaImage::from_fn(1200, 1200, |x, y| Rgba([(x % 251) as u8, (y % 251) as u8, 90, 255]));
        WorkingCopy::new(&img, 1200)
    }

    fn ellipse_cutout(working: &WorkingCopy) -> Cutout {
        let region = FaceRegion::from_box(400.0, 350.0, 400.0, 500.0, StrategyKind::Silhouette);
        CutoutExtractor::default().extract(working, Some(&region), Trim::default())
    }

    #[tokio::test]
    async fn test_matte_replaces_the_mask_cutout() {
        let working = working();
        let base = ellipse_cutout(&working);
        assert!(base.size > SEGMENT_MAX_SIZE);
        let calls = Arc::new(AtomicUsize::new(0));
        let segmenter = Segmenter::new(Scripted::Disc(Arc::clone(&calls)), Duration::from_secs(2));

        let cutout = segmenter
            .refine(&working, &base, &CutoutExtractor::default(), Trim::default())
            .await
            .expect("segmented cutout");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cutout.kind, CutoutKind::Segmented);
        assert_eq!(cutout.image.width(), cutout.image.height());
        // The disc is narrower than the ellipse mask and sits inside its crop.
        assert!(base.crop.contains_rect(&cutout.mask_bounds));
        assert!(cutout.size < base.size);
    }

    #[tokio::test]
    async fn test_failed_matting_keeps_the_mask_cutout() {
        let working = working();
        let base = ellipse_cutout(&working);
        let segmenter = Segmenter::new(Scripted::Fail, Duration::from_secs(2));
        assert!(segmenter
            .refine(&working, &base, &CutoutExtractor::default(), Trim::default())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_stalled_matting_is_bounded_and_cancelled() {
        let working = working();
        let base = ellipse_cutout(&working);
        let saw_cancel = Arc::new(AtomicBool::new(false));
        let segmenter = Segmenter::new(Scripted::Stall(Arc::clone(&saw_cancel)), Duration::from_millis(150));

        let started = Instant::now();
        let refined = segmenter
            .refine(&working, &base, &CutoutExtractor::default(), Trim::default())
            .await;
        assert!(refined.is_none());
        assert!(started.elapsed() < Duration::from_secs(1), "took {:?}", started.elapsed());

        // The blocking worker notices its budget ran out and stops.
        let deadline = Instant::now() + Duration::from_secs(1);
        while !saw_cancel.load(Ordering::SeqCst) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(saw_cancel.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_fallback_cutout_is_not_segmented() {
        let working = working();
        let base = CutoutExtractor::default().extract(&working, None, Trim::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let segmenter = Segmenter::new(Scripted::Disc(Arc::clone(&calls)), Duration::from_secs(2));
        assert!(segmenter
            .refine(&working, &base, &CutoutExtractor::default(), Trim::default())
            .await
            .is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_raw_logits_are_squashed() {
        let probs = matte_from_raw(&[0.0, 1.0, 0.5, 0.25], 2).unwrap();
        assert_eq!(probs.as_raw(), &vec![0, 255, 128, 64]);
        let logits = matte_from_raw(&[-20.0, 20.0, 0.0, 0.0], 2).unwrap();
        assert_eq!(logits.as_raw(), &vec![0, 255, 128, 128]);
        assert!(matte_from_raw(&[0.5; 3], 2).is_err());
    }

    #[test]
    fn test_missing_model_disables_the_pass() {
        assert!(Segmenter::load(&ModelPaths::default(), DEFAULT_SEGMENT_TIMEOUT).is_none());
        let models = ModelPaths {
            segmentation: Some("/nonexistent/portrait_matte.onnx".into()),
            ..ModelPaths::default()
        };
        assert!(Segmenter::load(&models, DEFAULT_SEGMENT_TIMEOUT).is_none());
    }
}
