use image::RgbaImage;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

/// Integer pixel rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    pub fn center(&self) -> (f32, f32) {
        (
            self.x as f32 + self.width as f32 / 2.0,
            self.y as f32 + self.height as f32 / 2.0,
        )
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// True if `other` lies entirely inside `self`.
    pub fn contains_rect(&self, other: &Rect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    /// Build a rectangle from fractions of a `width × height` canvas.
    ///
    /// The result is clamped to the canvas and is never smaller than 1×1.
    pub fn from_fractions(width: u32, height: u32, fx: f32, fy: f32, fw: f32, fh: f32) -> Self {
        let w = width.max(1);
        let h = height.max(1);
        let x = ((fx * w as f32).round().max(0.0) as u32).min(w - 1);
        let y = ((fy * h as f32).round().max(0.0) as u32).min(h - 1);
        let rw = ((fw * w as f32).round().max(1.0) as u32).min(w - x);
        let rh = ((fh * h as f32).round().max(1.0) as u32).min(h - y);
        Self::new(x, y, rw, rh)
    }

    /// Shrink by a fraction of the width/height on every side.
    pub fn inset_fraction(&self, fraction: f32) -> Self {
        let dx = (self.width as f32 * fraction).round() as u32;
        let dy = (self.height as f32 * fraction).round() as u32;
        let width = self.width.saturating_sub(dx * 2).max(1);
        let height = self.height.saturating_sub(dy * 2).max(1);
        Self::new(self.x + dx.min(self.width / 2), self.y + dy.min(self.height / 2), width, height)
    }
}

/// Identifies which detector strategy produced a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    FaceMesh,
    Landmarks68,
    Scrfd,
    Silhouette,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::FaceMesh => "face_mesh",
            StrategyKind::Landmarks68 => "landmarks68",
            StrategyKind::Scrfd => "scrfd",
            StrategyKind::Silhouette => "silhouette",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detected face location.
///
/// The box is in pixel coordinates of the image it was detected on. When a
/// polygon is present it supersedes the box for masking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Ordered face-boundary points (jaw, cheeks, forehead).
    pub polygon: Option<Vec<(f32, f32)>>,
    /// Eye centers `[left, right]` in image order, when the strategy provides them.
    pub eyes: Option<[(f32, f32); 2]>,
    pub confidence: f32,
    pub strategy: StrategyKind,
}

impl FaceRegion {
    pub fn from_box(x: f32, y: f32, width: f32, height: f32, strategy: StrategyKind) -> Self {
        Self {
            x,
            y,
            width,
            height,
            polygon: None,
            eyes: None,
            confidence: 1.0,
            strategy,
        }
    }

    /// Build a region whose box is the bounding box of `points`.
    pub fn from_polygon(points: Vec<(f32, f32)>, strategy: StrategyKind) -> Option<Self> {
        if points.len() < 3 {
            return None;
        }
        let (mut min_x, mut min_y) = (f32::MAX, f32::MAX);
        let (mut max_x, mut max_y) = (f32::MIN, f32::MIN);
        for &(px, py) in &points {
            min_x = min_x.min(px);
            min_y = min_y.min(py);
            max_x = max_x.max(px);
            max_y = max_y.max(py);
        }
        Some(Self {
            x: min_x,
            y: min_y,
            width: max_x - min_x,
            height: max_y - min_y,
            polygon: Some(points),
            eyes: None,
            confidence: 1.0,
            strategy,
        })
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_eyes(mut self, left: (f32, f32), right: (f32, f32)) -> Self {
        self.eyes = Some([left, right]);
        self
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// A region smaller than one pixel (or with a degenerate polygon) carries no face.
    pub fn is_empty(&self) -> bool {
        let bad_box = !(self.width >= 1.0 && self.height >= 1.0)
            || !self.x.is_finite()
            || !self.y.is_finite();
        let bad_polygon = self.polygon.as_ref().is_some_and(|p| p.len() < 3);
        bad_box || bad_polygon
    }

    /// Scale every coordinate by `factor`.
    pub fn scaled(&self, factor: f32) -> Self {
        let scale_pt = |(px, py): (f32, f32)| (px * factor, py * factor);
        Self {
            x: self.x * factor,
            y: self.y * factor,
            width: self.width * factor,
            height: self.height * factor,
            polygon: self
                .polygon
                .as_ref()
                .map(|p| p.iter().copied().map(scale_pt).collect()),
            eyes: self.eyes.map(|[l, r]| [scale_pt(l), scale_pt(r)]),
            confidence: self.confidence,
            strategy: self.strategy,
        }
    }
}

/// How a cutout was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CutoutKind {
    /// Landmark polygon mask.
    Polygon,
    /// Ellipse mask around a bounding box.
    Ellipse,
    /// Portrait-matting alpha over the detected face crop.
    Segmented,
    /// No detection; centered crop with a generic mask.
    Fallback,
}

/// Masked, square face crop at working resolution.
#[derive(Debug, Clone)]
pub struct Cutout {
    pub image: RgbaImage,
    /// Edge length in pixels (always `image.width() == image.height() == size`).
    pub size: u32,
    /// Crop rectangle in working-copy coordinates.
    pub crop: Rect,
    /// Bounds of the non-transparent mask in working-copy coordinates.
    pub mask_bounds: Rect,
    pub kind: CutoutKind,
}

impl Cutout {
    pub fn new(image: RgbaImage, crop: Rect, mask_bounds: Rect, kind: CutoutKind) -> Self {
        let size = image.width();
        debug_assert_eq!(image.width(), image.height(), "cutout must be square");
        Self {
            image,
            size,
            crop,
            mask_bounds,
            kind,
        }
    }
}

/// Content hash of a source photo (SHA-256, lowercase hex).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceKey(String);

impl SourceKey {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(format!("{:x}", Sha256::digest(bytes)))
    }

    /// Hash decoded pixels together with their dimensions.
    pub fn of_image(image: &RgbaImage) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(image.width().to_le_bytes());
        hasher.update(image.height().to_le_bytes());
        hasher.update(image.as_raw());
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell sessions apart in logs.
        f.write_str(&self.0[..self.0.len().min(12)])
    }
}

/// Whether the composite uses a stylized avatar or the raw cutout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AvatarMode {
    Off,
    Stylized,
}

/// Key for the cutout tier of the result cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CutoutKey {
    pub character_id: String,
    pub source: SourceKey,
}

/// Key for the composite tier of the result cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompositeKey {
    pub character_id: String,
    pub avatar_mode: AvatarMode,
    pub prompt_version: u32,
    pub source: SourceKey,
}

/// Final flattened image plus the key that produced it.
#[derive(Debug, Clone)]
pub struct CompositeResult {
    pub image: Arc<RgbaImage>,
    pub key: CompositeKey,
}
