//! End-to-end pixel scenarios: detect → cut out → compose on synthetic photos.

use cameo_core::detector::{Budget, DetectorError, FaceStrategy};
use cameo_core::{
    CharacterCatalog, Compositor, CutoutExtractor, CutoutKind, DetectorChain, FaceRegion,
    ModelPaths, StageTimeouts, Trim, WorkingCopy,
};
use cameo_core::types::StrategyKind;
use image::{Rgba, RgbaImage};
use std::sync::Arc;
use std::time::{Duration, Instant};

const BACKDROP: Rgba<u8> = Rgba([235, 235, 235, 255]);
const SKIN: Rgba<u8> = Rgba([190, 120, 100, 255]);

/// 800×800 backdrop with a solid skin-colored ellipse centered at (400, 400).
fn ellipse_photo() -> RgbaImage {
    let (cx, cy, rx, ry) = (400.0f32, 400.0f32, 110.0f32, 140.0f32);
    RgbaImage::from_fn(800, 800, |x, y| {
        let dx = (x as f32 + 0.5 - cx) / rx;
        let dy = (y as f32 + 0.5 - cy) / ry;
        if dx * dx + dy * dy <= 1.0 {
            SKIN
        } else {
            BACKDROP
        }
    })
}

/// 1000×1400 template: transparent except an opaque strip along the bottom.
fn character_template() -> RgbaImage {
    RgbaImage::from_fn(1000, 1400, |_, y| {
        if y >= 1300 {
            Rgba([30, 60, 200, 255])
        } else {
            Rgba([0, 0, 0, 0])
        }
    })
}

fn standard_chain() -> DetectorChain {
    DetectorChain::standard(&ModelPaths::default(), &StageTimeouts::default())
}

fn compositor() -> Compositor {
    Compositor::new(Arc::new(CharacterCatalog::embedded().unwrap()))
}

/// Bounding-box center of pixels that still read as skin (red well above blue).
fn skin_center(image: &RgbaImage) -> Option<(f32, f32)> {
    let mut bounds: Option<(u32, u32, u32, u32)> = None;
    for (x, y, p) in image.enumerate_pixels() {
        if p[3] > 200 && p[0] as i32 - p[2] as i32 > 50 {
            bounds = Some(match bounds {
                None => (x, y, x, y),
                Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
            });
        }
    }
    bounds.map(|(x0, y0, x1, y1)| ((x0 + x1) as f32 / 2.0, (y0 + y1) as f32 / 2.0))
}

async fn run_pipeline(photo: &RgbaImage, character_id: &str) -> (Option<FaceRegion>, cameo_core::Cutout, RgbaImage) {
    let working = WorkingCopy::new(photo, 512);
    let region = standard_chain().detect(&working).await;
    let cutout = CutoutExtractor::default().extract(&working, region.as_ref(), Trim::default());
    let composite = compositor().compose(&character_template(), &cutout.image, character_id);
    (region, cutout, composite)
}

#[tokio::test]
async fn test_ellipse_face_lands_in_default_slot() {
    let (region, cutout, composite) = run_pipeline(&ellipse_photo(), "nobody").await;

    let region = region.expect("silhouette should find the ellipse");
    assert_eq!(region.strategy, StrategyKind::Silhouette);
    let (cx, cy) = region.center();
    assert!((cx - 400.0).abs() <= 80.0, "box center x = {cx}");
    assert!((cy - 400.0).abs() <= 80.0, "box center y = {cy}");

    assert_eq!(cutout.kind, CutoutKind::Ellipse);
    assert_eq!(cutout.image.width(), cutout.image.height());
    assert!(cutout.size >= 240, "cutout size = {}", cutout.size);

    assert_eq!(composite.dimensions(), (1000, 1400));
    // Default slot: cx 50%, cy 22%, size 32% of a 1000×1400 template.
    let (fx, fy) = skin_center(&composite).expect("face visible in composite");
    assert!((fx - 500.0).abs() <= 2.0, "face center x = {fx}");
    assert!((fy - 308.0).abs() <= 2.0, "face center y = {fy}");
    // Template strip stays on top.
    assert_eq!(*composite.get_pixel(500, 1350), Rgba([30, 60, 200, 255]));
}

#[tokio::test]
async fn test_round_face_above_center_lands_in_default_slot() {
    let photo = RgbaImage::from_fn(800, 800, |x, y| {
        let dx = x as f32 + 0.5 - 400.0;
        let dy = y as f32 + 0.5 - 300.0;
        if dx * dx + dy * dy <= 120.0 * 120.0 {
            SKIN
        } else {
            BACKDROP
        }
    });
    let (region, cutout, composite) = run_pipeline(&photo, "nobody").await;

    let (cx, cy) = region.expect("silhouette should find the circle").center();
    assert!((cx - 400.0).abs() <= 80.0, "box center x = {cx}");
    assert!((cy - 300.0).abs() <= 80.0, "box center y = {cy}");

    assert_eq!(cutout.kind, CutoutKind::Ellipse);
    assert!(cutout.size >= 240, "cutout size = {}", cutout.size);

    let (fx, fy) = skin_center(&composite).expect("face visible in composite");
    assert!((fx - 500.0).abs() <= 2.0, "face center x = {fx}");
    assert!((fy - 308.0).abs() <= 2.0, "face center y = {fy}");
}

#[tokio::test]
async fn test_blank_photo_uses_fallback_cutout() {
    let blank = RgbaImage::from_pixel(600, 900, BACKDROP);
    let (region, cutout, composite) = run_pipeline(&blank, "migu").await;

    assert!(region.is_none());
    assert_eq!(cutout.kind, CutoutKind::Fallback);
    // Working copy is 341×512; the fallback spans 70% of the shorter side.
    assert_eq!(cutout.size, (341.0f32 * 0.7).round() as u32);
    assert_eq!(composite.dimensions(), (1000, 1400));
}

#[tokio::test]
async fn test_pipeline_is_deterministic() {
    let photo = ellipse_photo();
    let (_, first_cutout, first) = run_pipeline(&photo, "liya").await;
    let (_, second_cutout, second) = run_pipeline(&photo, "liya").await;
    assert_eq!(first_cutout.image, second_cutout.image);
    assert_eq!(first, second);
}

enum Scripted {
    /// Spins until its budget runs out.
    Hang,
    Found,
}

impl FaceStrategy for Scripted {
    fn name(&self) -> &'static str {
        match self {
            Scripted::Hang => "hang",
            Scripted::Found => "found",
        }
    }

    fn try_detect(&self, _image: &RgbaImage, budget: &Budget) -> Result<Option<FaceRegion>, DetectorError> {
        match self {
            Scripted::Hang => {
                while !budget.is_exhausted() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(DetectorError::BudgetExhausted)
            }
            Scripted::Found => Ok(Some(FaceRegion::from_box(
                10.0,
                10.0,
                20.0,
                20.0,
                StrategyKind::Silhouette,
            ))),
        }
    }
}

#[tokio::test]
async fn test_hanging_strategy_is_bounded_by_its_timeout() {
    let working = WorkingCopy::new(&RgbaImage::from_pixel(64, 64, BACKDROP), 512);
    let chain = DetectorChain::new()
        .with_stage(Scripted::Hang, Duration::from_millis(1200))
        .with_stage(Scripted::Found, Duration::from_millis(1200));

    let started = Instant::now();
    let region = chain.detect(&working).await;
    let elapsed = started.elapsed();

    assert!(region.is_some(), "next stage should still run");
    assert!(elapsed < Duration::from_millis(1500), "took {elapsed:?}");
    assert!(elapsed >= Duration::from_millis(1150), "took {elapsed:?}");
}

#[tokio::test]
async fn test_polygon_cutout_tighter_than_box_cutout() {
    let working = WorkingCopy::new(&ellipse_photo(), 512);
    let boxed = FaceRegion::from_box(290.0, 260.0, 220.0, 280.0, StrategyKind::Scrfd);
    let ring: Vec<(f32, f32)> = (0..36)
        .map(|i| {
            let t = i as f32 / 36.0 * std::f32::consts::TAU;
            (400.0 + 110.0 * t.cos(), 400.0 + 140.0 * t.sin())
        })
        .collect();
    let outlined = FaceRegion::from_polygon(ring, StrategyKind::FaceMesh).unwrap();

    let extractor = CutoutExtractor::default();
    let by_box = extractor.extract(&working, Some(&boxed), Trim::default());
    let by_polygon = extractor.extract(&working, Some(&outlined), Trim::default());

    assert_eq!(by_polygon.kind, CutoutKind::Polygon);
    assert!(by_polygon.mask_bounds.area() < by_box.mask_bounds.area());
    assert!(by_polygon.size < by_box.size);
}
