//! Template and print asset loading from the asset directory.

use crate::catalog::{CharacterCatalog, CharacterConfig};
use image::RgbaImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AssetError {
    #[error("character {character} has no {what} asset configured")]
    NotConfigured { character: String, what: &'static str },
    #[error("failed to load asset {path}: {source}")]
    Load {
        path: String,
        #[source]
        source: image::ImageError,
    },
}

/// Everything the print layout needs for one character.
#[derive(Debug, Clone)]
pub struct PrintAssets {
    pub template: RgbaImage,
    pub background: RgbaImage,
    pub shape: RgbaImage,
    pub label: RgbaImage,
}

#[derive(Debug, Clone)]
pub struct AssetStore {
    root: PathBuf,
}

impl AssetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Load an image relative to the asset root.
    pub fn load(&self, relative: &str) -> Result<RgbaImage, AssetError> {
        let path = self.root.join(relative);
        let image = image::open(&path).map_err(|source| AssetError::Load {
            path: path.display().to_string(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "asset loaded");
        Ok(image.to_rgba8())
    }

    pub fn template_for(&self, character: &CharacterConfig) -> Result<RgbaImage, AssetError> {
        self.load(&character.assets.template)
    }

    pub fn print_assets(
        &self,
        catalog: &CharacterCatalog,
        character: &CharacterConfig,
    ) -> Result<PrintAssets, AssetError> {
        let required = |what: &'static str, name: &Option<String>| -> Result<RgbaImage, AssetError> {
            match name {
                Some(name) => self.load(name),
                None => Err(AssetError::NotConfigured {
                    character: character.id.clone(),
                    what,
                }),
            }
        };
        Ok(PrintAssets {
            template: self.load(&catalog.print_template)?,
            background: required("background", &character.assets.background)?,
            shape: required("shape", &character.assets.shape)?,
            label: required("label", &character.assets.label)?,
        })
    }
}
