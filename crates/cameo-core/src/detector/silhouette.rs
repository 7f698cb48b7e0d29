//! Model-free bounding-box strategy for kiosk backdrops.
//!
//! The booth photographs subjects against a plain backdrop, so the subject is
//! the largest blob that differs from the border color. When the blob reaches
//! the bottom edge (head and shoulders in frame) only its upper part is kept
//! as the head box.

use super::{Budget, DetectorError};
use crate::types::{FaceRegion, StrategyKind};
use image::RgbaImage;

/// Max per-channel difference from the backdrop still counted as backdrop.
const BACKGROUND_TOLERANCE: u8 = 60;
/// Smallest blob, as a share of the image, that counts as a subject.
const MIN_AREA_FRACTION: f32 = 0.01;
/// Rows from the top of a body blob used to measure head width.
const HEAD_SAMPLE_FRACTION: f32 = 0.3;
/// Head box height relative to the measured head width.
const HEAD_ASPECT: f32 = 1.3;

#[derive(Debug, Clone)]
pub struct SilhouetteDetector {
    pub tolerance: u8,
    pub min_area_fraction: f32,
}

impl Default for SilhouetteDetector {
    fn default() -> Self {
        Self {
            tolerance: BACKGROUND_TOLERANCE,
            min_area_fraction: MIN_AREA_FRACTION,
        }
    }
}

struct Blob {
    area: usize,
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
    /// Per-row horizontal extent `(y, min_x, max_x)`.
    rows: Vec<(u32, u32, u32)>,
}

impl SilhouetteDetector {
    pub fn detect(&self, image: &RgbaImage, budget: &Budget) -> Result<Option<FaceRegion>, DetectorError> {
        let (w, h) = image.dimensions();
        if w < 3 || h < 3 {
            return Ok(None);
        }
        budget.check()?;

        let backdrop = border_median(image);
        let tol = self.tolerance as i16;
        let foreground: Vec<bool> = image
            .pixels()
            .map(|p| p[3] > 0 && (0..3).any(|c| (p[c] as i16 - backdrop[c] as i16).abs() > tol))
            .collect();
        budget.check()?;

        let Some(blob) = largest_blob(&foreground, w, h, budget)? else {
            return Ok(None);
        };
        if (blob.area as f32) < (w as f32 * h as f32) * self.min_area_fraction {
            return Ok(None);
        }

        let fill = blob.area as f32
            / ((blob.max_x - blob.min_x + 1) as f32 * (blob.max_y - blob.min_y + 1) as f32);

        let region = if blob.max_y + 1 >= h {
            head_of_body(&blob)
        } else {
            FaceRegion::from_box(
                blob.min_x as f32,
                blob.min_y as f32,
                (blob.max_x - blob.min_x + 1) as f32,
                (blob.max_y - blob.min_y + 1) as f32,
                StrategyKind::Silhouette,
            )
        };
        Ok(Some(region.with_confidence(fill.clamp(0.0, 1.0))))
    }
}

/// Per-channel median of the top, left, and right border pixels.
///
/// The bottom edge is skipped; a subject's torso usually covers it.
fn border_median(image: &RgbaImage) -> [u8; 3] {
    let (w, h) = image.dimensions();
    let mut samples: Vec<[u8; 3]> = Vec::with_capacity((w + 2 * h) as usize);
    for x in 0..w {
        let p = image.get_pixel(x, 0);
        samples.push([p[0], p[1], p[2]]);
    }
    for y in 1..h {
        for x in [0, w - 1] {
            let p = image.get_pixel(x, y);
            samples.push([p[0], p[1], p[2]]);
        }
    }
    let mut out = [0u8; 3];
    for (c, slot) in out.iter_mut().enumerate() {
        let mut channel: Vec<u8> = samples.iter().map(|s| s[c]).collect();
        let mid = channel.len() / 2;
        *slot = *channel.select_nth_unstable(mid).1;
    }
    out
}

/// Largest 4-connected foreground component.
fn largest_blob(mask: &[bool], w: u32, h: u32, budget: &Budget) -> Result<Option<Blob>, DetectorError> {
    let mut visited = vec![false; mask.len()];
    let mut best: Option<Blob> = None;
    let mut stack = Vec::new();
    let mut popped = 0usize;

    for start in 0..mask.len() {
        if !mask[start] || visited[start] {
            continue;
        }
        visited[start] = true;
        stack.push(start);

        let mut area = 0usize;
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (u32::MAX, u32::MAX, 0u32, 0u32);
        let mut row_spans: std::collections::BTreeMap<u32, (u32, u32)> = Default::default();

        while let Some(i) = stack.pop() {
            popped += 1;
            if popped % 8192 == 0 {
                budget.check()?;
            }
            let x = (i % w as usize) as u32;
            let y = (i / w as usize) as u32;
            area += 1;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
            let span = row_spans.entry(y).or_insert((x, x));
            span.0 = span.0.min(x);
            span.1 = span.1.max(x);

            let mut visit = |j: usize| {
                if mask[j] && !visited[j] {
                    visited[j] = true;
                    stack.push(j);
                }
            };
            if x > 0 {
                visit(i - 1);
            }
            if x + 1 < w {
                visit(i + 1);
            }
            if y > 0 {
                visit(i - w as usize);
            }
            if y + 1 < h {
                visit(i + w as usize);
            }
        }

        if best.as_ref().map_or(true, |b| area > b.area) {
            best = Some(Blob {
                area,
                min_x,
                min_y,
                max_x,
                max_y,
                rows: row_spans.into_iter().map(|(y, (a, b))| (y, a, b)).collect(),
            });
        }
    }
    Ok(best)
}

/// Head box for a blob that continues off the bottom of the frame.
fn head_of_body(blob: &Blob) -> FaceRegion {
    let total_rows = blob.rows.len().max(1);
    let sample = ((total_rows as f32 * HEAD_SAMPLE_FRACTION).ceil() as usize).clamp(1, total_rows);
    let top_rows = &blob.rows[..sample.min(blob.rows.len())];

    let mut widths: Vec<u32> = top_rows.iter().map(|&(_, a, b)| b - a + 1).collect();
    widths.sort_unstable();
    let head_width = widths.get(widths.len() / 2).copied().unwrap_or(1) as f32;
    let center_x = top_rows
        .iter()
        .map(|&(_, a, b)| (a + b + 1) as f32 / 2.0)
        .sum::<f32>()
        / top_rows.len().max(1) as f32;

    let body_height = (blob.max_y - blob.min_y + 1) as f32;
    let height = (head_width * HEAD_ASPECT).min(body_height);
    FaceRegion::from_box(
        center_x - head_width / 2.0,
        blob.min_y as f32,
        head_width,
        height,
        StrategyKind::Silhouette,
    )
}
