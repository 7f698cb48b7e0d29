//! Raster primitives shared by the cutout extractor, compositor, and print layout.
//!
//! All operations take an image by reference and return a new buffer, except the
//! `draw_*`/`fill_*` helpers which paint onto a canvas the caller owns.

use crate::types::{FaceRegion, Rect};
use image::{imageops, GrayImage, ImageEncoder, Luma, Rgba, RgbaImage};
use std::sync::Arc;

/// Longest edge of the working copy used for detection and masking.
pub const WORKING_MAX_DIM: u32 = 512;

/// Downscaled, opaque copy of a source photo.
///
/// `scale` maps source coordinates to working coordinates (`working = source * scale`).
#[derive(Debug, Clone)]
pub struct WorkingCopy {
    pub image: Arc<RgbaImage>,
    pub scale: f32,
}

impl WorkingCopy {
    /// Build a working copy no larger than `max_dim` on its longest edge.
    ///
    /// Captured photos are treated as opaque: the copy's alpha channel is forced to 255.
    pub fn new(source: &RgbaImage, max_dim: u32) -> Self {
        let (w, h) = source.dimensions();
        let longest = w.max(h);
        let max_dim = max_dim.max(1);

        let (mut image, scale) = if longest <= max_dim || w == 0 || h == 0 {
            (source.clone(), 1.0)
        } else {
            let scale = max_dim as f32 / longest as f32;
            let nw = ((w as f32 * scale).round() as u32).max(1);
            let nh = ((h as f32 * scale).round() as u32).max(1);
            (
                imageops::resize(source, nw, nh, imageops::FilterType::Triangle),
                scale,
            )
        };

        for px in image.pixels_mut() {
            px[3] = 255;
        }

        Self {
            image: Arc::new(image),
            scale,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Map a region from working coordinates back to source coordinates.
    pub fn to_source(&self, region: &FaceRegion) -> FaceRegion {
        region.scaled(1.0 / self.scale)
    }

    /// Map a region from source coordinates into working coordinates.
    pub fn from_source(&self, region: &FaceRegion) -> FaceRegion {
        region.scaled(self.scale)
    }
}

// --- Masks ---

/// Hard-edged filled ellipse mask.
pub fn ellipse_mask(width: u32, height: u32, cx: f32, cy: f32, rx: f32, ry: f32) -> GrayImage {
    let rx = rx.max(0.5);
    let ry = ry.max(0.5);
    GrayImage::from_fn(width, height, |x, y| {
        let dx = (x as f32 + 0.5 - cx) / rx;
        let dy = (y as f32 + 0.5 - cy) / ry;
        if dx * dx + dy * dy <= 1.0 {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

/// Convex hull of a point set (Andrew's monotone chain), counter-clockwise.
///
/// Non-finite points are ignored. Fewer than three distinct points are returned as-is.
pub fn convex_hull(points: &[(f32, f32)]) -> Vec<(f32, f32)> {
    let mut pts: Vec<(f32, f32)> = points
        .iter()
        .copied()
        .filter(|(x, y)| x.is_finite() && y.is_finite())
        .collect();
    pts.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.total_cmp(&b.1)));
    pts.dedup();
    if pts.len() < 3 {
        return pts;
    }

    let cross = |o: (f32, f32), a: (f32, f32), b: (f32, f32)| {
        (a.0 - o.0) * (b.1 - o.1) - (a.1 - o.1) * (b.0 - o.0)
    };

    let mut lower: Vec<(f32, f32)> = Vec::with_capacity(pts.len());
    for &p in &pts {
        while lower.len() >= 2 && cross(lower[lower.len() - 2], lower[lower.len() - 1], p) <= 0.0 {
            lower.pop();
        }
        lower.push(p);
    }

    let mut upper: Vec<(f32, f32)> = Vec::with_capacity(pts.len());
    for &p in pts.iter().rev() {
        while upper.len() >= 2 && cross(upper[upper.len() - 2], upper[upper.len() - 1], p) <= 0.0 {
            upper.pop();
        }
        upper.push(p);
    }

    lower.pop();
    upper.pop();
    lower.extend(upper);
    lower
}

/// Even-odd point-in-polygon test.
pub fn point_in_polygon(px: f32, py: f32, polygon: &[(f32, f32)]) -> bool {
    let n = polygon.len();
    if n < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = polygon[i];
        let (xj, yj) = polygon[j];
        if (yi > py) != (yj > py) && px < (xj - xi) * (py - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Filled mask of the convex hull of `points`.
pub fn convex_polygon_mask(width: u32, height: u32, points: &[(f32, f32)]) -> GrayImage {
    let hull = convex_hull(points);
    let mut mask = GrayImage::new(width, height);
    if hull.len() < 3 || width == 0 || height == 0 {
        return mask;
    }

    let min_x = hull.iter().map(|p| p.0).fold(f32::MAX, f32::min).floor().max(0.0) as u32;
    let min_y = hull.iter().map(|p| p.1).fold(f32::MAX, f32::min).floor().max(0.0) as u32;
    let max_x = (hull.iter().map(|p| p.0).fold(f32::MIN, f32::max).ceil().max(0.0) as u32).min(width - 1);
    let max_y = (hull.iter().map(|p| p.1).fold(f32::MIN, f32::max).ceil().max(0.0) as u32).min(height - 1);

    for y in min_y..=max_y {
        for x in min_x..=max_x {
            if point_in_polygon(x as f32 + 0.5, y as f32 + 0.5, &hull) {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
    }
    mask
}

/// Gaussian-soften a mask edge. `sigma <= 0` returns the mask unchanged.
pub fn soften_mask(mask: &GrayImage, sigma: f32) -> GrayImage {
    if sigma <= 0.0 {
        return mask.clone();
    }
    imageops::blur(mask, sigma)
}

/// Multiply each pixel's alpha by the mask value.
pub fn apply_mask(image: &RgbaImage, mask: &GrayImage) -> RgbaImage {
    debug_assert_eq!(image.dimensions(), mask.dimensions());
    let mut out = image.clone();
    for (px, m) in out.pixels_mut().zip(mask.pixels()) {
        px[3] = ((px[3] as u32 * m[0] as u32 + 127) / 255) as u8;
    }
    out
}

/// Crop a square of edge `size` centered on `(cx, cy)`, clamped inside the image.
///
/// The edge is clamped to the image's shorter side and is never below 1px.
/// Returns the crop and its rectangle in `image` coordinates.
pub fn crop_square(image: &RgbaImage, cx: f32, cy: f32, size: f32) -> (RgbaImage, Rect) {
    let (w, h) = image.dimensions();
    let max_edge = w.min(h).max(1);
    let size = (size.round().max(1.0) as u32).min(max_edge);

    let sx = (cx - size as f32 / 2.0)
        .round()
        .clamp(0.0, w.saturating_sub(size) as f32) as u32;
    let sy = (cy - size as f32 / 2.0)
        .round()
        .clamp(0.0, h.saturating_sub(size) as f32) as u32;

    let rect = Rect::new(sx, sy, size, size);
    (imageops::crop_imm(image, sx, sy, size, size).to_image(), rect)
}

/// Make a fraction of the top and bottom rows fully transparent.
///
/// Each fraction is clamped to `[0, 0.45]` so the center row always survives.
pub fn clear_rows(image: &RgbaImage, top: f32, bottom: f32) -> RgbaImage {
    let h = image.height();
    let top_rows = (h as f32 * top.clamp(0.0, 0.45)).round() as u32;
    let bottom_rows = (h as f32 * bottom.clamp(0.0, 0.45)).round() as u32;
    let keep_until = h.saturating_sub(bottom_rows);

    let mut out = image.clone();
    if top_rows == 0 && bottom_rows == 0 {
        return out;
    }
    for (_, y, px) in out.enumerate_pixels_mut() {
        if y < top_rows || y >= keep_until {
            px[3] = 0;
        }
    }
    out
}

// --- Geometry ---

/// 2×3 affine transform: `x' = a·x + c·y + tx`, `y' = b·x + d·y + ty`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine {
    pub a: f32,
    pub b: f32,
    pub c: f32,
    pub d: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Affine {
    pub const IDENTITY: Affine = Affine {
        a: 1.0,
        b: 0.0,
        c: 0.0,
        d: 1.0,
        tx: 0.0,
        ty: 0.0,
    };

    pub fn translate(tx: f32, ty: f32) -> Self {
        Self { tx, ty, ..Self::IDENTITY }
    }

    pub fn scale(sx: f32, sy: f32) -> Self {
        Self { a: sx, d: sy, ..Self::IDENTITY }
    }

    /// Rotation by `radians`; positive is clockwise in image space (y down).
    pub fn rotate(radians: f32) -> Self {
        let (sin, cos) = radians.sin_cos();
        Self {
            a: cos,
            b: sin,
            c: -sin,
            d: cos,
            tx: 0.0,
            ty: 0.0,
        }
    }

    /// Apply `self` first, then `next`.
    pub fn then(&self, next: &Affine) -> Affine {
        Affine {
            a: next.a * self.a + next.c * self.b,
            b: next.b * self.a + next.d * self.b,
            c: next.a * self.c + next.c * self.d,
            d: next.b * self.c + next.d * self.d,
            tx: next.a * self.tx + next.c * self.ty + next.tx,
            ty: next.b * self.tx + next.d * self.ty + next.ty,
        }
    }

    pub fn invert(&self) -> Option<Affine> {
        let det = self.a * self.d - self.b * self.c;
        if det.abs() < 1e-12 {
            return None;
        }
        let inv_det = 1.0 / det;
        let a = self.d * inv_det;
        let b = -self.b * inv_det;
        let c = -self.c * inv_det;
        let d = self.a * inv_det;
        Some(Affine {
            a,
            b,
            c,
            d,
            tx: -(a * self.tx + c * self.ty),
            ty: -(b * self.tx + d * self.ty),
        })
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x + self.c * y + self.tx,
            self.b * x + self.d * y + self.ty,
        )
    }
}

/// Region that limits where a draw call may paint.
#[derive(Debug, Clone, Copy)]
pub enum Clip {
    Ellipse { cx: f32, cy: f32, rx: f32, ry: f32 },
    /// Axis-aligned rectangle in a local space; `to_local` maps device to local coordinates.
    Rect {
        x0: f32,
        y0: f32,
        x1: f32,
        y1: f32,
        to_local: Affine,
    },
}

impl Clip {
    pub fn contains(&self, x: f32, y: f32) -> bool {
        match *self {
            Clip::Ellipse { cx, cy, rx, ry } => {
                if rx <= 0.0 || ry <= 0.0 {
                    return false;
                }
                let dx = (x - cx) / rx;
                let dy = (y - cy) / ry;
                dx * dx + dy * dy <= 1.0
            }
            Clip::Rect { x0, y0, x1, y1, to_local } => {
                let (lx, ly) = to_local.apply((x, y));
                lx >= x0 && lx < x1 && ly >= y0 && ly < y1
            }
        }
    }
}

// --- Color ---

/// CSS-style `brightness() contrast() saturate()` filter chain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorAdjust {
    pub brightness: f32,
    pub contrast: f32,
    pub saturation: f32,
}

impl ColorAdjust {
    pub const IDENTITY: ColorAdjust = ColorAdjust {
        brightness: 1.0,
        contrast: 1.0,
        saturation: 1.0,
    };

    /// Face-layer enhancement applied before drawing into a character slot.
    pub const FACE_ENHANCE: ColorAdjust = ColorAdjust {
        brightness: 1.12,
        contrast: 1.15,
        saturation: 1.25,
    };

    /// Adjust straight (non-premultiplied) RGB in `[0, 1]`.
    pub fn apply(&self, rgb: [f32; 3]) -> [f32; 3] {
        let c = rgb.map(|v| (v * self.brightness).clamp(0.0, 1.0));
        let c = c.map(|v| ((v - 0.5) * self.contrast + 0.5).clamp(0.0, 1.0));

        let s = self.saturation;
        let r = (0.213 + 0.787 * s) * c[0] + (0.715 - 0.715 * s) * c[1] + (0.072 - 0.072 * s) * c[2];
        let g = (0.213 - 0.213 * s) * c[0] + (0.715 + 0.285 * s) * c[1] + (0.072 - 0.072 * s) * c[2];
        let b = (0.213 - 0.213 * s) * c[0] + (0.715 - 0.715 * s) * c[1] + (0.072 + 0.928 * s) * c[2];
        [r, g, b].map(|v| v.clamp(0.0, 1.0))
    }
}

/// Separable blend function used when compositing a source over a backdrop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendMode {
    Normal,
    Multiply,
}

fn to_u8(v: f32) -> u8 {
    (v * 255.0).round().clamp(0.0, 255.0) as u8
}

/// Source-over composite a straight-alpha `src` (RGBA in `[0, 1]`) onto `dst`.
///
/// Follows the W3C compositing model: the blend result is mixed into the source
/// in proportion to the backdrop alpha, then composited source-over.
pub fn blend_pixel(dst: &mut Rgba<u8>, src: [f32; 4], mode: BlendMode) {
    let sa = src[3].clamp(0.0, 1.0);
    if sa <= 0.0 {
        return;
    }
    let da = dst[3] as f32 / 255.0;
    let ao = sa + da * (1.0 - sa);

    let mut out = [0u8; 4];
    for i in 0..3 {
        let cs = src[i];
        let cb = dst[i] as f32 / 255.0;
        let mixed = match mode {
            BlendMode::Normal => cs,
            BlendMode::Multiply => cs * cb,
        };
        let cs = (1.0 - da) * cs + da * mixed;
        let co = sa * cs + da * (1.0 - sa) * cb;
        out[i] = to_u8(if ao > 0.0 { co / ao } else { 0.0 });
    }
    out[3] = to_u8(ao);
    *dst = Rgba(out);
}

/// Bilinear sample at continuous image coordinates, premultiplied RGBA in `[0, 1]`.
///
/// Pixel centers sit at `+0.5`. Neighbours past the edge repeat the edge pixel.
pub fn sample_premultiplied(image: &RgbaImage, x: f32, y: f32) -> [f32; 4] {
    let (w, h) = (image.width() as i64, image.height() as i64);
    if w == 0 || h == 0 {
        return [0.0; 4];
    }
    let fx = x - 0.5;
    let fy = y - 0.5;
    let x0 = fx.floor();
    let y0 = fy.floor();
    let tx = fx - x0;
    let ty = fy - y0;
    let (x0, y0) = (x0 as i64, y0 as i64);

    let fetch = |xi: i64, yi: i64| -> [f32; 4] {
        let p = image.get_pixel(xi.clamp(0, w - 1) as u32, yi.clamp(0, h - 1) as u32).0;
        let a = p[3] as f32 / 255.0;
        [
            p[0] as f32 / 255.0 * a,
            p[1] as f32 / 255.0 * a,
            p[2] as f32 / 255.0 * a,
            a,
        ]
    };

    let tl = fetch(x0, y0);
    let tr = fetch(x0 + 1, y0);
    let bl = fetch(x0, y0 + 1);
    let br = fetch(x0 + 1, y0 + 1);

    let mut out = [0.0f32; 4];
    for i in 0..4 {
        let top = tl[i] * (1.0 - tx) + tr[i] * tx;
        let bot = bl[i] * (1.0 - tx) + br[i] * tx;
        out[i] = top * (1.0 - ty) + bot * ty;
    }
    out
}

/// Options for [`draw_image`].
#[derive(Debug, Clone, Copy)]
pub struct DrawOptions {
    pub clip: Option<Clip>,
    pub adjust: Option<ColorAdjust>,
    pub mode: BlendMode,
    pub opacity: f32,
}

impl Default for DrawOptions {
    fn default() -> Self {
        Self {
            clip: None,
            adjust: None,
            mode: BlendMode::Normal,
            opacity: 1.0,
        }
    }
}

/// Draw `src` onto `dst` through `transform` (source pixel space → destination space).
///
/// Each destination pixel whose center maps inside the source (and the clip) is
/// inverse-mapped and bilinearly sampled.
pub fn draw_image(dst: &mut RgbaImage, src: &RgbaImage, transform: &Affine, opts: &DrawOptions) {
    let (sw, sh) = (src.width() as f32, src.height() as f32);
    if sw == 0.0 || sh == 0.0 || dst.width() == 0 || dst.height() == 0 {
        return;
    }
    let Some(inverse) = transform.invert() else {
        return;
    };

    let corners = [(0.0, 0.0), (sw, 0.0), (0.0, sh), (sw, sh)].map(|p| transform.apply(p));
    let min_x = corners.iter().map(|p| p.0).fold(f32::MAX, f32::min);
    let max_x = corners.iter().map(|p| p.0).fold(f32::MIN, f32::max);
    let min_y = corners.iter().map(|p| p.1).fold(f32::MAX, f32::min);
    let max_y = corners.iter().map(|p| p.1).fold(f32::MIN, f32::max);

    let x_start = min_x.floor().max(0.0) as u32;
    let y_start = min_y.floor().max(0.0) as u32;
    let x_end = (max_x.ceil().max(0.0) as u32).min(dst.width());
    let y_end = (max_y.ceil().max(0.0) as u32).min(dst.height());

    let opacity = opts.opacity.clamp(0.0, 1.0);

    for y in y_start..y_end {
        for x in x_start..x_end {
            let (px, py) = (x as f32 + 0.5, y as f32 + 0.5);
            if let Some(clip) = &opts.clip {
                if !clip.contains(px, py) {
                    continue;
                }
            }
            let (sx, sy) = inverse.apply((px, py));
            if sx < 0.0 || sy < 0.0 || sx >= sw || sy >= sh {
                continue;
            }
            let s = sample_premultiplied(src, sx, sy);
            if s[3] <= 0.0 {
                continue;
            }
            let mut rgb = [s[0] / s[3], s[1] / s[3], s[2] / s[3]];
            if let Some(adjust) = &opts.adjust {
                rgb = adjust.apply(rgb);
            }
            blend_pixel(
                dst.get_pixel_mut(x, y),
                [rgb[0], rgb[1], rgb[2], s[3] * opacity],
                opts.mode,
            );
        }
    }
}

/// Composite `src` over `dst` pixel-for-pixel (same origin, no scaling).
pub fn overlay(dst: &mut RgbaImage, src: &RgbaImage) {
    let w = dst.width().min(src.width());
    let h = dst.height().min(src.height());
    for y in 0..h {
        for x in 0..w {
            let s = src.get_pixel(x, y);
            if s[3] == 0 {
                continue;
            }
            let straight = [
                s[0] as f32 / 255.0,
                s[1] as f32 / 255.0,
                s[2] as f32 / 255.0,
                s[3] as f32 / 255.0,
            ];
            blend_pixel(dst.get_pixel_mut(x, y), straight, BlendMode::Normal);
        }
    }
}

/// Two-stop radial gradient shared by shading passes.
#[derive(Debug, Clone, Copy)]
pub struct RadialGradient {
    pub center: (f32, f32),
    pub inner_radius: f32,
    pub outer_radius: f32,
    pub rgb: [f32; 3],
    pub inner_alpha: f32,
    pub outer_alpha: f32,
}

impl RadialGradient {
    /// Alpha at a point; stops extend flat beyond their radii.
    pub fn alpha_at(&self, x: f32, y: f32) -> f32 {
        let dist = ((x - self.center.0).powi(2) + (y - self.center.1).powi(2)).sqrt();
        let span = (self.outer_radius - self.inner_radius).max(f32::EPSILON);
        let t = ((dist - self.inner_radius) / span).clamp(0.0, 1.0);
        self.inner_alpha + (self.outer_alpha - self.inner_alpha) * t
    }
}

/// Fill `bounds` (intersected with `clip`) with a radial gradient.
pub fn fill_radial_gradient(
    dst: &mut RgbaImage,
    bounds: Rect,
    clip: Option<&Clip>,
    gradient: &RadialGradient,
    mode: BlendMode,
) {
    let x_end = bounds.right().min(dst.width());
    let y_end = bounds.bottom().min(dst.height());
    for y in bounds.y..y_end {
        for x in bounds.x..x_end {
            let (px, py) = (x as f32 + 0.5, y as f32 + 0.5);
            if clip.is_some_and(|c| !c.contains(px, py)) {
                continue;
            }
            let alpha = gradient.alpha_at(px, py);
            let [r, g, b] = gradient.rgb;
            blend_pixel(dst.get_pixel_mut(x, y), [r, g, b, alpha], mode);
        }
    }
}

// --- Codecs ---

/// Decode a captured photo or asset into RGBA.
pub fn decode_image(bytes: &[u8]) -> Result<RgbaImage, image::ImageError> {
    Ok(image::load_from_memory(bytes)?.to_rgba8())
}

/// Encode an RGBA image as PNG.
pub fn encode_png(image: &RgbaImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buffer = Vec::new();
    image::codecs::png::PngEncoder::new(&mut buffer).write_image(
        image.as_raw(),
        image.width(),
        image.height(),
        image::ExtendedColorType::Rgba8,
    )?;
    Ok(buffer)
}
