//! Character compositing: face layer clipped into the template's slot.

use crate::catalog::{CharacterCatalog, FaceSlot};
use crate::raster::{
    draw_image, fill_radial_gradient, overlay, Affine, BlendMode, Clip, ColorAdjust, DrawOptions,
    RadialGradient,
};
use crate::types::Rect;
use image::RgbaImage;
use std::sync::Arc;

/// Shadow center, as a fraction of the slot height from its top edge.
const SHADOW_CENTER_Y: f32 = 0.55;
const SHADOW_INNER_RADIUS: f32 = 0.2;
const SHADOW_OUTER_RADIUS: f32 = 0.75;
const SHADOW_ALPHA: f32 = 0.35;

#[derive(Debug, Clone)]
pub struct Compositor {
    catalog: Arc<CharacterCatalog>,
    enhance: ColorAdjust,
    shadow_alpha: f32,
}

impl Compositor {
    pub fn new(catalog: Arc<CharacterCatalog>) -> Self {
        Self {
            catalog,
            enhance: ColorAdjust::FACE_ENHANCE,
            shadow_alpha: SHADOW_ALPHA,
        }
    }

    pub fn catalog(&self) -> &CharacterCatalog {
        &self.catalog
    }

    /// Blend `face` into `template` at the slot configured for `character_id`.
    ///
    /// Unknown ids use the default character's slot. The result always has the
    /// template's dimensions.
    pub fn compose(&self, template: &RgbaImage, face: &RgbaImage, character_id: &str) -> RgbaImage {
        let config = self.catalog.get(character_id);
        self.compose_with_slot(template, face, &config.slot)
    }

    pub fn compose_with_slot(&self, template: &RgbaImage, face: &RgbaImage, slot: &FaceSlot) -> RgbaImage {
        let (w, h) = template.dimensions();
        let mut canvas = RgbaImage::new(w, h);
        let (cx, cy, size) = slot.resolve(w, h);
        let radius = size / 2.0;
        let clip = Clip::Ellipse {
            cx,
            cy,
            rx: radius,
            ry: radius,
        };

        if face.width() > 0 && face.height() > 0 && size > 0.0 {
            let (fw, fh) = (face.width() as f32, face.height() as f32);
            let place = Affine::translate(-fw / 2.0, -fh / 2.0)
                .then(&Affine::scale(size * slot.scale_x / fw, size * slot.scale_y / fh))
                .then(&Affine::rotate(slot.rotation_deg.to_radians()))
                .then(&Affine::translate(cx, cy));
            draw_image(
                &mut canvas,
                face,
                &place,
                &DrawOptions {
                    clip: Some(clip),
                    adjust: Some(self.enhance),
                    mode: BlendMode::Normal,
                    opacity: 1.0,
                },
            );

            let left = cx - radius;
            let top = cy - radius;
            let shadow = RadialGradient {
                center: (cx, top + size * SHADOW_CENTER_Y),
                inner_radius: size * SHADOW_INNER_RADIUS,
                outer_radius: size * SHADOW_OUTER_RADIUS,
                rgb: [0.0; 3],
                inner_alpha: 0.0,
                outer_alpha: self.shadow_alpha,
            };
            let bounds = Rect::new(
                left.floor().max(0.0) as u32,
                top.floor().max(0.0) as u32,
                size.ceil() as u32 + 1,
                size.ceil() as u32 + 1,
            );
            fill_radial_gradient(&mut canvas, bounds, Some(&clip), &shadow, BlendMode::Multiply);
        }

        overlay(&mut canvas, template);
        canvas
    }
}
