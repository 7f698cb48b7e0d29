//! cameo-core — Face-to-character compositing engine.
//!
//! Locates a face with a cascade of detectors (ONNX Runtime models plus a
//! built-in silhouette fallback), cuts it out on a downscaled working copy,
//! and blends it into a character template or a print layout.

pub mod assets;
pub mod cache;
pub mod catalog;
pub mod compositor;
pub mod cutout;
pub mod detector;
pub mod print;
pub mod raster;
pub mod regions;
pub mod segment;
pub mod types;

use std::path::PathBuf;

pub use assets::{AssetError, AssetStore};
pub use cache::{CompositePolicy, ResultCache, SingleFlight, TtlCache, RESULT_TTL};
pub use catalog::{CharacterCatalog, CharacterConfig, FaceSlot};
pub use compositor::Compositor;
pub use cutout::{CutoutExtractor, Trim};
pub use detector::{DetectorChain, DetectorError, ModelPaths, StageTimeouts, Strategy};
pub use print::{PrintCompositor, PrintOutcome};
pub use raster::WorkingCopy;
pub use segment::{Matting, PortraitMatting, Segmenter};
pub use types::{
    AvatarMode, CompositeKey, CompositeResult, Cutout, CutoutKey, CutoutKind, FaceRegion, Rect,
    SourceKey,
};

/// Default directory for ONNX model files: `$XDG_DATA_HOME/cameo/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("cameo/models")
}
