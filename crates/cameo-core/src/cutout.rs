//! Face cutout extraction.
//!
//! Every path produces a square, masked crop at working resolution; the
//! fallback path cannot fail.

use crate::raster::{self, WorkingCopy};
use crate::regions::find_alpha_bounds;
use crate::types::{Cutout, CutoutKind, FaceRegion, Rect};
use image::{imageops, GrayImage, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};

// --- Named constants ---
pub const CUTOUT_PAD_RATIO: f32 = 0.12;
pub const ELLIPSE_RX_RATIO: f32 = 0.7;
pub const ELLIPSE_RY_RATIO: f32 = 0.95;
pub const ELLIPSE_BLUR_PX: f32 = 6.0;
pub const POLYGON_BLUR_PX: f32 = 2.0;
pub const FALLBACK_CROP_RATIO: f32 = 0.7;
pub const FALLBACK_TOP_RATIO: f32 = 0.08;
pub const FALLBACK_RX_RATIO: f32 = 0.45;
pub const FALLBACK_RY_RATIO: f32 = 0.55;
/// Upper share of a stylized avatar searched for the face when tightening it.
pub const AVATAR_Y_LIMIT_RATIO: f32 = 0.7;

/// Fractions of the cutout's rows cleared after cropping.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Trim {
    pub top: f32,
    pub bottom: f32,
}

impl Trim {
    pub fn is_none(&self) -> bool {
        self.top <= 0.0 && self.bottom <= 0.0
    }
}

#[derive(Debug, Clone)]
pub struct CutoutExtractor {
    pub pad_ratio: f32,
}

impl Default for CutoutExtractor {
    fn default() -> Self {
        Self {
            pad_ratio: CUTOUT_PAD_RATIO,
        }
    }
}

impl CutoutExtractor {
    /// Cut the face out of `working`. `region` is in source-image coordinates.
    pub fn extract(&self, working: &WorkingCopy, region: Option<&FaceRegion>, trim: Trim) -> Cutout {
        let image = working.image.as_ref();
        if image.width() == 0 || image.height() == 0 {
            return blank_cutout();
        }

        let local = region.map(|r| working.from_source(r)).filter(|r| !r.is_empty());
        let cutout = match &local {
            Some(r) if r.polygon.is_some() => self.polygon_cutout(image, r),
            Some(r) => self.ellipse_cutout(image, r),
            None => None,
        }
        .unwrap_or_else(|| fallback_cutout(image));

        tracing::debug!(
            kind = ?cutout.kind,
            size = cutout.size,
            crop = ?cutout.crop,
            "cutout extracted"
        );
        apply_trim(cutout, trim)
    }

    /// Detection-free cutout for the fast preview path.
    pub fn center_crop(&self, working: &WorkingCopy, trim: Trim) -> Cutout {
        self.extract(working, None, trim)
    }

    /// Cut the face out of `working` using a segmentation matte.
    ///
    /// `crop` is the square (in working coordinates) the matte was computed
    /// for; the matte may be at any resolution and is stretched over it.
    /// Returns `None` when the matte keeps nothing.
    pub fn from_matte(&self, working: &WorkingCopy, crop: Rect, matte: &GrayImage, trim: Trim) -> Option<Cutout> {
        let image = working.image.as_ref();
        if crop.width == 0 || crop.height == 0 || matte.width() == 0 || matte.height() == 0 {
            return None;
        }
        let matte = imageops::resize(matte, crop.width, crop.height, imageops::FilterType::Triangle);
        let mut mask = GrayImage::new(image.width(), image.height());
        imageops::replace(&mut mask, &matte, crop.x as i64, crop.y as i64);
        let cutout = self.crop_to_mask(image, &mask, CutoutKind::Segmented)?;
        tracing::debug!(size = cutout.size, crop = ?cutout.crop, "segmented cutout extracted");
        Some(apply_trim(cutout, trim))
    }

    fn polygon_cutout(&self, image: &RgbaImage, region: &FaceRegion) -> Option<Cutout> {
        let points = region.polygon.as_deref()?;
        let mask = raster::convex_polygon_mask(image.width(), image.height(), points);
        let mask = raster::soften_mask(&mask, POLYGON_BLUR_PX);
        self.crop_to_mask(image, &mask, CutoutKind::Polygon)
    }

    fn ellipse_cutout(&self, image: &RgbaImage, region: &FaceRegion) -> Option<Cutout> {
        let (cx, cy) = region.center();
        let mask = raster::ellipse_mask(
            image.width(),
            image.height(),
            cx,
            cy,
            region.width * ELLIPSE_RX_RATIO,
            region.height * ELLIPSE_RY_RATIO,
        );
        let mask = raster::soften_mask(&mask, ELLIPSE_BLUR_PX);
        self.crop_to_mask(image, &mask, CutoutKind::Ellipse)
    }

    /// Mask the image, then crop a padded square around the visible mask.
    fn crop_to_mask(&self, image: &RgbaImage, mask: &GrayImage, kind: CutoutKind) -> Option<Cutout> {
        let masked = raster::apply_mask(image, mask);
        let bounds = find_alpha_bounds(&masked, 1.0, 1)?;
        let (cx, cy) = bounds.center();
        let edge = bounds.width.max(bounds.height) as f32 * (1.0 + self.pad_ratio);
        let (crop, rect) = raster::crop_square(&masked, cx, cy, edge);
        Some(Cutout::new(crop, rect, bounds, kind))
    }
}

/// Centered square from the upper part of the frame with a generic oval mask.
fn fallback_cutout(image: &RgbaImage) -> Cutout {
    let (w, h) = image.dimensions();
    let edge = (w.min(h) as f32 * FALLBACK_CROP_RATIO).round().max(1.0);
    let top = (h as f32 * FALLBACK_TOP_RATIO).min(h as f32 - edge).max(0.0);
    let (crop, rect) = raster::crop_square(image, w as f32 / 2.0, top + edge / 2.0, edge);

    let size = crop.width() as f32;
    let mask = raster::ellipse_mask(
        crop.width(),
        crop.height(),
        size / 2.0,
        size / 2.0,
        size * FALLBACK_RX_RATIO,
        size * FALLBACK_RY_RATIO,
    );
    let mask = raster::soften_mask(&mask, ELLIPSE_BLUR_PX);
    let mut masked = raster::apply_mask(&crop, &mask);
    // Source alpha is opaque on the working copy, so the center survives; pin it anyway.
    let mid = crop.width() / 2;
    if masked.get_pixel(mid, mid)[3] == 0 {
        masked.get_pixel_mut(mid, mid)[3] = 255;
    }
    Cutout::new(masked, rect, rect, CutoutKind::Fallback)
}

fn blank_cutout() -> Cutout {
    let image = RgbaImage::from_pixel(1, 1, Rgba([255, 255, 255, 255]));
    let rect = Rect::new(0, 0, 1, 1);
    Cutout::new(image, rect, rect, CutoutKind::Fallback)
}

fn apply_trim(cutout: Cutout, trim: Trim) -> Cutout {
    if trim.is_none() {
        return cutout;
    }
    let image = raster::clear_rows(&cutout.image, trim.top, trim.bottom);
    Cutout { image, ..cutout }
}

/// Crop a stylized avatar to its visible face content with padding, square.
///
/// Content is searched in the upper part first, then the whole image. An image
/// with no visible content is returned unchanged.
pub fn tighten_to_content(image: &RgbaImage, pad_ratio: f32) -> RgbaImage {
    let bounds = find_alpha_bounds(image, AVATAR_Y_LIMIT_RATIO, 2)
        .or_else(|| find_alpha_bounds(image, 1.0, 2));
    let Some(bounds) = bounds else {
        return image.clone();
    };
    let pad_x = bounds.width as f32 * pad_ratio;
    let pad_y = bounds.height as f32 * pad_ratio;
    let x0 = (bounds.x as f32 - pad_x).max(0.0) as u32;
    let y0 = (bounds.y as f32 - pad_y).max(0.0) as u32;
    let x1 = ((bounds.right() as f32 + pad_x) as u32).min(image.width());
    let y1 = ((bounds.bottom() as f32 + pad_y) as u32).min(image.height());
    let padded = imageops::crop_imm(image, x0, y0, (x1 - x0).max(1), (y1 - y0).max(1)).to_image();

    // Center the padded content on a transparent square canvas.
    let edge = padded.width().max(padded.height());
    let mut square = RgbaImage::new(edge, edge);
    let ox = (edge - padded.width()) / 2;
    let oy = (edge - padded.height()) / 2;
    imageops::overlay(&mut square, &padded, ox as i64, oy as i64);
    square
}
