//! Pixel-predicate region search on template and cutout images.

use crate::types::Rect;
use image::{imageops, Rgba, RgbaImage};
use std::collections::VecDeque;

/// Pixels at or below this alpha count as empty when measuring content bounds.
pub const ALPHA_THRESHOLD: u8 = 12;
/// Pixels below this alpha count as a transparent hole in a character template.
pub const HOLE_ALPHA_MAX: u8 = 5;
/// Hole search runs on a copy no wider than this.
pub const HOLE_ANALYSIS_MAX_WIDTH: u32 = 320;
/// Inward padding applied to a found hole, as a fraction of its size.
pub const HOLE_INSET_RATIO: f32 = 0.06;

/// Sub-pixel rectangle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Bounds {
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// Tight bounding box of pixels matching `pred` inside `search`, sampled every `step` pixels.
pub fn find_bounds<F>(image: &RgbaImage, search: Rect, step: u32, pred: F) -> Option<Rect>
where
    F: Fn(&Rgba<u8>) -> bool,
{
    let x_end = search.right().min(image.width());
    let y_end = search.bottom().min(image.height());
    let step = step.max(1) as usize;

    let (mut min_x, mut min_y) = (u32::MAX, u32::MAX);
    let (mut max_x, mut max_y) = (0u32, 0u32);
    let mut found = false;

    for y in (search.y..y_end).step_by(step) {
        for x in (search.x..x_end).step_by(step) {
            if pred(image.get_pixel(x, y)) {
                found = true;
                min_x = min_x.min(x);
                min_y = min_y.min(y);
                max_x = max_x.max(x);
                max_y = max_y.max(y);
            }
        }
    }

    found.then(|| Rect::new(min_x, min_y, max_x - min_x + 1, max_y - min_y + 1))
}

/// Bounds of visible content (alpha above [`ALPHA_THRESHOLD`]) within the top
/// `y_limit_ratio` of the image.
pub fn find_alpha_bounds(image: &RgbaImage, y_limit_ratio: f32, step: u32) -> Option<Rect> {
    let (w, h) = image.dimensions();
    let y_max = ((h as f32 * y_limit_ratio.clamp(0.0, 1.0)).ceil() as u32).min(h);
    find_bounds(image, Rect::new(0, 0, w, y_max), step, |p| p[3] > ALPHA_THRESHOLD)
}

/// Opaque pixel whose three channels are all at least `min`.
pub fn is_near_white(p: &Rgba<u8>, min: u8) -> bool {
    p[3] >= 200 && p[0] >= min && p[1] >= min && p[2] >= min
}

/// Reserved placeholder color in print templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyColor {
    pub rgb: [u8; 3],
    /// Maximum per-channel difference still considered a match.
    pub tolerance: u8,
}

impl KeyColor {
    pub const MAGENTA: KeyColor = KeyColor {
        rgb: [255, 0, 255],
        tolerance: 40,
    };

    pub fn matches(&self, p: &Rgba<u8>) -> bool {
        p[3] >= 200
            && (0..3).all(|i| (p[i] as i16 - self.rgb[i] as i16).unsigned_abs() <= self.tolerance as u16)
    }
}

/// Find the transparent face opening of a character template.
///
/// Transparent pixels reachable from the border are the outside of the
/// character. Whatever transparent pixels remain are enclosed holes; the
/// bounding box of those, padded inward, is the face opening. Returns `None`
/// when the template has no enclosed transparency.
pub fn find_enclosed_hole(template: &RgbaImage) -> Option<Bounds> {
    let (tw, th) = template.dimensions();
    if tw == 0 || th == 0 {
        return None;
    }

    let factor = if tw > HOLE_ANALYSIS_MAX_WIDTH {
        HOLE_ANALYSIS_MAX_WIDTH as f32 / tw as f32
    } else {
        1.0
    };
    let small;
    let image = if factor < 1.0 {
        let nw = HOLE_ANALYSIS_MAX_WIDTH;
        let nh = ((th as f32 * factor).round() as u32).max(1);
        small = imageops::resize(template, nw, nh, imageops::FilterType::Nearest);
        &small
    } else {
        template
    };

    let (w, h) = image.dimensions();
    let idx = |x: u32, y: u32| (y * w + x) as usize;
    let transparent: Vec<bool> = image.pixels().map(|p| p[3] < HOLE_ALPHA_MAX).collect();
    let mut outside = vec![false; transparent.len()];
    let mut queue = VecDeque::new();

    let seed = |x: u32, y: u32, queue: &mut VecDeque<(u32, u32)>, outside: &mut Vec<bool>| {
        let i = idx(x, y);
        if transparent[i] && !outside[i] {
            outside[i] = true;
            queue.push_back((x, y));
        }
    };

    for x in 0..w {
        seed(x, 0, &mut queue, &mut outside);
        seed(x, h - 1, &mut queue, &mut outside);
    }
    for y in 0..h {
        seed(0, y, &mut queue, &mut outside);
        seed(w - 1, y, &mut queue, &mut outside);
    }

    while let Some((x, y)) = queue.pop_front() {
        if x > 0 {
            seed(x - 1, y, &mut queue, &mut outside);
        }
        if x + 1 < w {
            seed(x + 1, y, &mut queue, &mut outside);
        }
        if y > 0 {
            seed(x, y - 1, &mut queue, &mut outside);
        }
        if y + 1 < h {
            seed(x, y + 1, &mut queue, &mut outside);
        }
    }

    let (mut min_x, mut min_y) = (u32::MAX, u32::MAX);
    let (mut max_x, mut max_y) = (0u32, 0u32);
    let mut found = false;
    for y in 0..h {
        for x in 0..w {
            let i = idx(x, y);
            if transparent[i] && !outside[i] {
                found = true;
                min_x = min_x.min(x);
                min_y = min_y.min(y);
                max_x = max_x.max(x);
                max_y = max_y.max(y);
            }
        }
    }
    if !found {
        return None;
    }

    let inv = 1.0 / factor;
    let bw = (max_x - min_x + 1) as f32 * inv;
    let bh = (max_y - min_y + 1) as f32 * inv;
    let pad_x = bw * HOLE_INSET_RATIO;
    let pad_y = bh * HOLE_INSET_RATIO;

    Some(Bounds {
        x: min_x as f32 * inv + pad_x,
        y: min_y as f32 * inv + pad_y,
        width: (bw - pad_x * 2.0).max(1.0),
        height: (bh - pad_y * 2.0).max(1.0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_template(w: u32, h: u32, hole: Rect) -> RgbaImage {
        // Transparent outside margin, opaque body, transparent hole inside the body.
        RgbaImage::from_fn(w, h, |x, y| {
            let margin = 10;
            let in_body = x >= margin && y >= margin && x < w - margin && y < h - margin;
            let in_hole = x >= hole.x && y >= hole.y && x < hole.right() && y < hole.bottom();
            if in_body && !in_hole {
                Rgba([200, 100, 50, 255])
            } else {
                Rgba([0, 0, 0, 0])
            }
        })
    }

    #[test]
    fn test_find_alpha_bounds_with_limit() {
        let mut img = RgbaImage::new(50, 100);
        img.put_pixel(10, 20, Rgba([0, 0, 0, 255]));
        img.put_pixel(30, 90, Rgba([0, 0, 0, 255]));
        assert_eq!(find_alpha_bounds(&img, 0.5, 1), Some(Rect::new(10, 20, 1, 1)));
        assert_eq!(find_alpha_bounds(&img, 1.0, 1), Some(Rect::new(10, 20, 21, 71)));
    }

    #[test]
    fn test_find_alpha_bounds_ignores_faint_pixels() {
        let mut img = RgbaImage::new(10, 10);
        img.put_pixel(5, 5, Rgba([0, 0, 0, ALPHA_THRESHOLD]));
        assert_eq!(find_alpha_bounds(&img, 1.0, 1), None);
    }

    #[test]
    fn test_key_color_tolerance() {
        let key = KeyColor::MAGENTA;
        assert!(key.matches(&Rgba([230, 20, 240, 255])));
        assert!(!key.matches(&Rgba([200, 0, 255, 255])));
        assert!(!key.matches(&Rgba([255, 0, 255, 0])));
    }

    #[test]
    fn test_find_enclosed_hole() {
        let hole = Rect::new(40, 30, 50, 60);
        let template = ring_template(200, 200, hole);
        let found = find_enclosed_hole(&template).unwrap();
        assert!((found.x - 43.0).abs() < 0.01);
        assert!((found.y - 33.6).abs() < 0.01);
        assert!((found.width - 44.0).abs() < 0.01);
        assert!((found.height - 52.8).abs() < 0.01);
    }

    #[test]
    fn test_find_enclosed_hole_none_when_only_outside_transparency() {
        let template = ring_template(100, 100, Rect::new(0, 0, 0, 0));
        assert!(find_enclosed_hole(&template).is_none());
    }

    #[test]
    fn test_find_enclosed_hole_downscales_wide_templates() {
        let hole = Rect::new(300, 200, 200, 200);
        let template = ring_template(1280, 800, hole);
        let found = find_enclosed_hole(&template).unwrap();
        let (cx, cy) = found.center();
        assert!((cx - 400.0).abs() < 6.0, "cx={cx}");
        assert!((cy - 300.0).abs() < 6.0, "cy={cy}");
    }
}
