//! Capture gate: decide whether a live frame is good enough to shoot.

use crate::types::FaceRegion;
use serde::Serialize;

/// Face must fill at least this share of the frame width or height.
pub const MIN_FACE_RATIO: f32 = 0.18;
/// Maximum roll between the eyes, in degrees.
pub const MAX_FACE_TILT_DEG: f32 = 8.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum CaptureVerdict {
    Accept,
    NoFace,
    TooFar { ratio: f32 },
    Tilted { degrees: f32 },
}

impl CaptureVerdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, CaptureVerdict::Accept)
    }

    /// Prompt shown to the subject when the frame is rejected.
    pub fn message(&self) -> Option<&'static str> {
        match self {
            CaptureVerdict::Accept => None,
            CaptureVerdict::NoFace => Some("Face was not detected. Please move into better lighting."),
            CaptureVerdict::TooFar { .. } => Some("Kindly move slightly closer to the camera."),
            CaptureVerdict::Tilted { .. } => Some("Please keep your face straight."),
        }
    }
}

/// Head roll from the eye line, in degrees.
pub fn eye_tilt_degrees(left: (f32, f32), right: (f32, f32)) -> f32 {
    let (dx, dy) = (right.0 - left.0, right.1 - left.1);
    dy.atan2(dx).to_degrees()
}

pub fn assess_capture(region: Option<&FaceRegion>, frame_width: u32, frame_height: u32) -> CaptureVerdict {
    let Some(region) = region.filter(|r| !r.is_empty()) else {
        return CaptureVerdict::NoFace;
    };

    let ratio = (region.width / frame_width.max(1) as f32).max(region.height / frame_height.max(1) as f32);
    if ratio < MIN_FACE_RATIO {
        return CaptureVerdict::TooFar { ratio };
    }

    if let Some([left, right]) = region.eyes {
        let degrees = eye_tilt_degrees(left, right);
        if degrees.abs() > MAX_FACE_TILT_DEG {
            return CaptureVerdict::Tilted { degrees };
        }
    }

    CaptureVerdict::Accept
}
