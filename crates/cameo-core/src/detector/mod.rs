//! Ordered face-detection chain.
//!
//! Strategies run most precise first (dense face mesh, 68-point landmarks,
//! bounding box). Each stage gets its own time budget on the blocking pool; a
//! stage that errors, times out, or finds nothing hands over to the next one.
//! When every stage comes up empty the chain yields `None` and the caller falls
//! back to a centered crop.

mod landmarks;
mod mesh;
pub mod quality;
mod scrfd;
mod silhouette;

pub use landmarks::LandmarkDetector;
pub use mesh::FaceMeshDetector;
pub use scrfd::FaceDetector;
pub use silhouette::SilhouetteDetector;

use crate::raster::WorkingCopy;
use crate::types::{FaceRegion, Rect, StrategyKind};
use image::{imageops, RgbaImage};
use ndarray::Array4;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const DEFAULT_MESH_TIMEOUT: Duration = Duration::from_millis(2500);
pub const DEFAULT_LANDMARKS_TIMEOUT: Duration = Duration::from_millis(1800);
pub const DEFAULT_BOX_TIMEOUT: Duration = Duration::from_millis(1200);

pub const FACE_MESH_MODEL: &str = "face_mesh.onnx";
pub const LANDMARKS68_MODEL: &str = "landmarks68.onnx";
pub const SCRFD_MODEL: &str = "det_10g.onnx";

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("detection budget exhausted")]
    BudgetExhausted,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Time allowance for one strategy invocation.
///
/// Blocking workers cannot be aborted from outside, so long-running strategies
/// poll [`Budget::check`] between phases and bail out once the deadline has
/// passed or the chain has given up on them.
#[derive(Debug, Clone)]
pub struct Budget {
    deadline: Instant,
    cancelled: Arc<AtomicBool>,
}

impl Budget {
    pub fn new(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A budget that never runs out on its own (CLI and tests).
    pub fn unbounded() -> Self {
        Self::new(Duration::from_secs(60 * 60 * 24))
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_exhausted(&self) -> bool {
        self.cancelled.load(Ordering::Acquire) || Instant::now() >= self.deadline
    }

    pub fn check(&self) -> Result<(), DetectorError> {
        if self.is_exhausted() {
            Err(DetectorError::BudgetExhausted)
        } else {
            Ok(())
        }
    }
}

/// Cancels the stage budget when the awaiting future goes away.
pub(crate) struct CancelOnDrop(pub(crate) Budget);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// One way of locating a face in a working-resolution image.
pub trait FaceStrategy: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Returns `Ok(None)` when the strategy ran but found no face.
    fn try_detect(
        &self,
        image: &RgbaImage,
        budget: &Budget,
    ) -> Result<Option<FaceRegion>, DetectorError>;
}

/// The built-in strategies.
pub enum Strategy {
    FaceMesh(FaceMeshDetector),
    Landmarks68(LandmarkDetector),
    Scrfd(FaceDetector),
    Silhouette(SilhouetteDetector),
}

impl Strategy {
    pub fn kind(&self) -> StrategyKind {
        match self {
            Strategy::FaceMesh(_) => StrategyKind::FaceMesh,
            Strategy::Landmarks68(_) => StrategyKind::Landmarks68,
            Strategy::Scrfd(_) => StrategyKind::Scrfd,
            Strategy::Silhouette(_) => StrategyKind::Silhouette,
        }
    }
}

impl FaceStrategy for Strategy {
    fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    fn try_detect(
        &self,
        image: &RgbaImage,
        budget: &Budget,
    ) -> Result<Option<FaceRegion>, DetectorError> {
        match self {
            Strategy::FaceMesh(d) => d.detect(image, budget),
            Strategy::Landmarks68(d) => d.detect(image, budget),
            Strategy::Scrfd(d) => d.detect_best(image, budget),
            Strategy::Silhouette(d) => d.detect(image, budget),
        }
    }
}

/// Model files for the ONNX-backed strategies. A missing path skips that strategy.
#[derive(Debug, Clone, Default)]
pub struct ModelPaths {
    pub face_mesh: Option<PathBuf>,
    pub landmarks68: Option<PathBuf>,
    pub scrfd: Option<PathBuf>,
    /// Portrait-matting model for the segmented cutout.
    pub segmentation: Option<PathBuf>,
}

impl ModelPaths {
    /// Conventional file names inside one model directory.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            face_mesh: Some(dir.join(FACE_MESH_MODEL)),
            landmarks68: Some(dir.join(LANDMARKS68_MODEL)),
            scrfd: Some(dir.join(SCRFD_MODEL)),
            segmentation: Some(dir.join(crate::segment::SEGMENTATION_MODEL)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StageTimeouts {
    pub mesh: Duration,
    pub landmarks: Duration,
    pub bounding_box: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            mesh: DEFAULT_MESH_TIMEOUT,
            landmarks: DEFAULT_LANDMARKS_TIMEOUT,
            bounding_box: DEFAULT_BOX_TIMEOUT,
        }
    }
}

struct Stage<S> {
    strategy: Arc<S>,
    timeout: Duration,
}

enum StageOutcome {
    Found(FaceRegion),
    Empty,
    Failed(String),
    TimedOut,
}

/// Ordered list of strategies, each with its own timeout.
pub struct DetectorChain<S = Strategy> {
    stages: Vec<Stage<S>>,
}

impl<S> Default for DetectorChain<S> {
    fn default() -> Self {
        Self { stages: Vec::new() }
    }
}

impl DetectorChain<Strategy> {
    /// Build the standard chain from whatever models are available.
    ///
    /// Landmark stages are included only when their model loads. The bounding-box
    /// stage uses SCRFD when its model loads and the built-in silhouette detector
    /// otherwise, so the chain always ends with a box strategy.
    pub fn standard(models: &ModelPaths, timeouts: &StageTimeouts) -> Self {
        let mut chain = Self::default();

        if let Some(path) = &models.face_mesh {
            match FaceMeshDetector::load(path) {
                Ok(d) => chain.push(Strategy::FaceMesh(d), timeouts.mesh),
                Err(e) => tracing::warn!(error = %e, "face mesh strategy unavailable"),
            }
        }
        if let Some(path) = &models.landmarks68 {
            match LandmarkDetector::load(path) {
                Ok(d) => chain.push(Strategy::Landmarks68(d), timeouts.landmarks),
                Err(e) => tracing::warn!(error = %e, "68-point landmark strategy unavailable"),
            }
        }

        let scrfd = models.scrfd.as_ref().and_then(|path| match FaceDetector::load(path) {
            Ok(d) => Some(d),
            Err(e) => {
                tracing::warn!(error = %e, "SCRFD unavailable, using silhouette box detector");
                None
            }
        });
        match scrfd {
            Some(d) => chain.push(Strategy::Scrfd(d), timeouts.bounding_box),
            None => chain.push(
                Strategy::Silhouette(SilhouetteDetector::default()),
                timeouts.bounding_box,
            ),
        }

        tracing::info!(stages = ?chain.stage_names(), "detector chain ready");
        chain
    }
}

impl<S: FaceStrategy> DetectorChain<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, strategy: S, timeout: Duration) {
        self.stages.push(Stage {
            strategy: Arc::new(strategy),
            timeout,
        });
    }

    pub fn with_stage(mut self, strategy: S, timeout: Duration) -> Self {
        self.push(strategy, timeout);
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.strategy.name()).collect()
    }

    /// Run the stages in order on a working copy and return the first face,
    /// mapped back to source-image coordinates.
    pub async fn detect(&self, working: &WorkingCopy) -> Option<FaceRegion> {
        for stage in &self.stages {
            let name = stage.strategy.name();
            let started = Instant::now();
            match run_stage(stage, Arc::clone(&working.image)).await {
                StageOutcome::Found(region) => {
                    tracing::info!(
                        strategy = name,
                        confidence = region.confidence,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "face located"
                    );
                    return Some(working.to_source(&region));
                }
                StageOutcome::Empty => {
                    tracing::debug!(strategy = name, "no face from strategy");
                }
                StageOutcome::Failed(reason) => {
                    tracing::warn!(strategy = name, reason = %reason, "strategy failed");
                }
                StageOutcome::TimedOut => {
                    tracing::warn!(
                        strategy = name,
                        timeout_ms = stage.timeout.as_millis() as u64,
                        "strategy timed out"
                    );
                }
            }
        }
        tracing::debug!("detector chain exhausted without a face");
        None
    }
}

async fn run_stage<S: FaceStrategy>(stage: &Stage<S>, image: Arc<RgbaImage>) -> StageOutcome {
    let budget = Budget::new(stage.timeout);
    let _cancel = CancelOnDrop(budget.clone());

    let strategy = Arc::clone(&stage.strategy);
    let worker_budget = budget.clone();
    let handle =
        tokio::task::spawn_blocking(move || strategy.try_detect(&image, &worker_budget));

    match tokio::time::timeout(stage.timeout, handle).await {
        Err(_) => StageOutcome::TimedOut,
        Ok(Err(join_err)) => StageOutcome::Failed(format!("worker panicked: {join_err}")),
        Ok(Ok(Err(e))) => StageOutcome::Failed(e.to_string()),
        Ok(Ok(Ok(Some(region)))) if !region.is_empty() => StageOutcome::Found(region),
        Ok(Ok(Ok(_))) => StageOutcome::Empty,
    }
}

// --- Shared preprocessing ---

/// Square region in the upper-middle of a portrait where a kiosk subject's face sits.
///
/// `fraction` is the edge as a share of the shorter image side.
pub(crate) fn portrait_roi(width: u32, height: u32, fraction: f32) -> Rect {
    let edge = ((width.min(height) as f32 * fraction).round() as u32).clamp(1, width.min(height).max(1));
    let x = (width.saturating_sub(edge)) / 2;
    // Faces sit above center in a standing portrait; bias the window upward.
    let y = ((height as f32 * 0.35 - edge as f32 / 2.0).max(0.0) as u32).min(height.saturating_sub(edge));
    Rect::new(x, y, edge, edge)
}

/// Crop `roi`, resize to `size × size`, and pack into an NCHW RGB tensor
/// normalized as `(v - mean) / std`.
pub(crate) fn roi_tensor(image: &RgbaImage, roi: Rect, size: u32, mean: f32, std: f32) -> Array4<f32> {
    let crop = imageops::crop_imm(image, roi.x, roi.y, roi.width, roi.height).to_image();
    let resized = imageops::resize(&crop, size, size, imageops::FilterType::Triangle);
    let n = size as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, n, n));
    for (x, y, p) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (p[c] as f32 - mean) / std;
        }
    }
    tensor
}

/// Map model-space landmark coordinates back onto the source image.
///
/// Accepts both normalized (`0..1`) and pixel (`0..input_size`) model outputs.
pub(crate) fn roi_to_image(points: &[(f32, f32)], roi: Rect, input_size: f32) -> Vec<(f32, f32)> {
    let max_coord = points
        .iter()
        .flat_map(|&(x, y)| [x.abs(), y.abs()])
        .fold(0.0f32, f32::max);
    let unit = if max_coord <= 2.0 { 1.0 } else { input_size };
    points
        .iter()
        .map(|&(x, y)| {
            (
                roi.x as f32 + x / unit * roi.width as f32,
                roi.y as f32 + y / unit * roi.height as f32,
            )
        })
        .collect()
}

pub(crate) fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

fn mean_point(points: &[(f32, f32)]) -> (f32, f32) {
    let n = points.len().max(1) as f32;
    let (sx, sy) = points
        .iter()
        .fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
    (sx / n, sy / n)
}

/// Order two eye centers left-to-right in image space.
pub(crate) fn ordered_eyes(a: &[(f32, f32)], b: &[(f32, f32)]) -> ((f32, f32), (f32, f32)) {
    let ea = mean_point(a);
    let eb = mean_point(b);
    if ea.0 <= eb.0 {
        (ea, eb)
    } else {
        (eb, ea)
    }
}
