//! Print layout: drop the character card into the photo frame of a print template.
//!
//! The frame is located by pixel analysis rather than fixed coordinates, so the
//! print template artwork can change without a config update.

use crate::assets::{AssetError, AssetStore, PrintAssets};
use crate::catalog::{CardLayout, CharacterCatalog, Placement};
use crate::raster::{draw_image, Affine, Clip, DrawOptions};
use crate::regions::{find_bounds, is_near_white, KeyColor};
use crate::types::Rect;
use image::{Rgba, RgbaImage};
use std::sync::Arc;

// --- Named constants ---
/// Frame search window `(x, y, w, h)` as fractions of the template.
const FRAME_SEARCH: (f32, f32, f32, f32) = (0.04, 0.08, 0.92, 0.84);
const FRAME_FALLBACK: (f32, f32, f32, f32) = (0.12, 0.18, 0.76, 0.56);
const NEAR_WHITE_MIN: u8 = 240;
const INNER_FALLBACK_INSET: f32 = 0.08;
const FRAME_ROTATION_DEG: f32 = 8.0;
const CARD_SCALE: f32 = 1.06;

/// Frame and card placement found on a print template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrintLayout {
    pub frame: Rect,
    pub inner: Rect,
}

/// Print result; `warning` is set when the layout could not be used.
#[derive(Debug, Clone)]
pub struct PrintOutcome {
    pub image: RgbaImage,
    pub warning: Option<String>,
}

/// Locate the photo frame and the key-colored placement region inside it.
pub fn locate_layout(template: &RgbaImage) -> PrintLayout {
    let (w, h) = template.dimensions();
    let (sx, sy, sw, sh) = FRAME_SEARCH;
    let search = Rect::from_fractions(w, h, sx, sy, sw, sh);
    let frame = find_bounds(template, search, 1, |p| is_near_white(p, NEAR_WHITE_MIN))
        .unwrap_or_else(|| {
            let (fx, fy, fw, fh) = FRAME_FALLBACK;
            tracing::debug!("no near-white frame found, using fallback frame");
            Rect::from_fractions(w, h, fx, fy, fw, fh)
        });

    let inner = find_bounds(template, frame, 1, |p| KeyColor::MAGENTA.matches(p))
        .unwrap_or_else(|| frame.inset_fraction(INNER_FALLBACK_INSET));

    PrintLayout { frame, inner }
}

/// Replace key-colored pixels with opaque white.
pub fn neutralize_key_color(template: &RgbaImage, key: KeyColor) -> RgbaImage {
    let mut out = template.clone();
    for px in out.pixels_mut() {
        if key.matches(px) {
            *px = Rgba([255, 255, 255, 255]);
        }
    }
    out
}

fn place(card: &mut RgbaImage, layer: &RgbaImage, placement: &Placement) {
    if layer.width() == 0 || layer.height() == 0 {
        return;
    }
    let (cw, ch) = (card.width() as f32, card.height() as f32);
    let scale = placement.width / 100.0 * cw / layer.width() as f32;
    let transform = Affine::scale(scale, scale)
        .then(&Affine::translate(placement.x / 100.0 * cw, placement.y / 100.0 * ch));
    draw_image(card, layer, &transform, &DrawOptions::default());
}

/// Render the card at `width × height`: background, shape, label, then the character.
pub fn render_card(assets: &PrintAssets, composite: &RgbaImage, layout: &CardLayout, width: u32, height: u32) -> RgbaImage {
    let mut card = RgbaImage::new(width.max(1), height.max(1));
    let bg = &assets.background;
    if bg.width() > 0 && bg.height() > 0 {
        let stretch = Affine::scale(
            card.width() as f32 / bg.width() as f32,
            card.height() as f32 / bg.height() as f32,
        );
        draw_image(&mut card, bg, &stretch, &DrawOptions::default());
    }
    place(&mut card, &assets.shape, &layout.shape);
    place(&mut card, &assets.label, &layout.label);
    place(&mut card, composite, &layout.character);
    card
}

/// Draw the card into the template's frame, rotated and slightly enlarged.
pub fn compose_print_with(assets: &PrintAssets, composite: &RgbaImage, card_layout: &CardLayout) -> RgbaImage {
    let layout = locate_layout(&assets.template);
    let mut out = neutralize_key_color(&assets.template, KeyColor::MAGENTA);
    let card = render_card(assets, composite, card_layout, layout.inner.width, layout.inner.height);

    let (fcx, fcy) = layout.frame.center();
    let rotation = Affine::translate(-fcx, -fcy)
        .then(&Affine::rotate(FRAME_ROTATION_DEG.to_radians()))
        .then(&Affine::translate(fcx, fcy));
    let Some(to_local) = rotation.invert() else {
        return out;
    };
    let frame = layout.frame;
    let clip = Clip::Rect {
        x0: frame.x as f32,
        y0: frame.y as f32,
        x1: frame.right() as f32,
        y1: frame.bottom() as f32,
        to_local,
    };

    let (icx, icy) = layout.inner.center();
    let card_to_device = Affine::translate(-(card.width() as f32) / 2.0, -(card.height() as f32) / 2.0)
        .then(&Affine::scale(CARD_SCALE, CARD_SCALE))
        .then(&Affine::translate(icx, icy))
        .then(&rotation);
    draw_image(
        &mut out,
        &card,
        &card_to_device,
        &DrawOptions {
            clip: Some(clip),
            ..DrawOptions::default()
        },
    );
    out
}

/// Print compositor bound to an asset directory and catalog.
#[derive(Debug, Clone)]
pub struct PrintCompositor {
    assets: AssetStore,
    catalog: Arc<CharacterCatalog>,
}

impl PrintCompositor {
    pub fn new(assets: AssetStore, catalog: Arc<CharacterCatalog>) -> Self {
        Self { assets, catalog }
    }

    /// Lay out the composite for print. Missing assets degrade to the plain composite.
    pub fn compose_print(&self, composite: &RgbaImage, character_id: &str) -> PrintOutcome {
        let character = self.catalog.get(character_id);
        match self.assets.print_assets(&self.catalog, character) {
            Ok(assets) => PrintOutcome {
                image: compose_print_with(&assets, composite, &character.card),
                warning: None,
            },
            Err(e) => {
                tracing::warn!(character = %character.id, error = %e, "print assets unavailable");
                PrintOutcome {
                    image: composite.clone(),
                    warning: Some(print_warning(&e)),
                }
            }
        }
    }
}

fn print_warning(err: &AssetError) -> String {
    match err {
        AssetError::NotConfigured { .. } => "Print layout is not set up for this character; printing the character only.".into(),
        AssetError::Load { .. } => "Print template could not be loaded; printing the character only.".into(),
    }
}
