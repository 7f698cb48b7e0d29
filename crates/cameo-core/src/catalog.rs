//! Character catalog: face-slot placement, trims, and asset names per character.
//!
//! The default catalog is embedded at compile time from
//! `contrib/characters.toml`; a deployment can point at its own file instead.

use crate::cutout::Trim;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

const EMBEDDED_CATALOG: &str = include_str!("../../../contrib/characters.toml");

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("failed to read catalog {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid catalog TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("duplicate character id: {0}")]
    DuplicateId(String),
    #[error("character {id}: {reason}")]
    InvalidSlot { id: String, reason: String },
}

fn one() -> f32 {
    1.0
}

/// Where the face goes on a character template.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceSlot {
    /// Center x, percent of template width.
    pub cx: f32,
    /// Center y, percent of template height.
    pub cy: f32,
    /// Diameter, percent of template width.
    pub size: f32,
    #[serde(default)]
    pub rotation_deg: f32,
    #[serde(default = "one")]
    pub scale_x: f32,
    #[serde(default = "one")]
    pub scale_y: f32,
}

impl FaceSlot {
    /// Slot center and diameter in pixels of a `width × height` template.
    pub fn resolve(&self, width: u32, height: u32) -> (f32, f32, f32) {
        (
            self.cx / 100.0 * width as f32,
            self.cy / 100.0 * height as f32,
            self.size / 100.0 * width as f32,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterAssets {
    pub template: String,
    #[serde(default)]
    pub background: Option<String>,
    #[serde(default)]
    pub shape: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
}

/// Box on the print card, in percent of the card size. Height follows the asset's aspect.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub x: f32,
    pub y: f32,
    pub width: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CardLayout {
    pub shape: Placement,
    pub label: Placement,
    pub character: Placement,
}

impl Default for CardLayout {
    fn default() -> Self {
        Self {
            shape: Placement {
                x: 5.0,
                y: 50.0,
                width: 90.0,
            },
            label: Placement {
                x: 15.0,
                y: 82.0,
                width: 70.0,
            },
            character: Placement {
                x: 15.0,
                y: 6.0,
                width: 70.0,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterConfig {
    pub id: String,
    pub name: String,
    pub slot: FaceSlot,
    #[serde(default)]
    pub trim: Trim,
    pub assets: CharacterAssets,
    #[serde(default)]
    pub card: CardLayout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterCatalog {
    pub print_template: String,
    pub default: CharacterConfig,
    #[serde(default, rename = "character")]
    pub characters: Vec<CharacterConfig>,
}

impl CharacterCatalog {
    /// The catalog shipped with the binary.
    pub fn embedded() -> Result<Self, CatalogError> {
        Self::from_toml_str(EMBEDDED_CATALOG)
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let text = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let catalog = Self::from_toml_str(&text)?;
        tracing::info!(
            path = %path.display(),
            characters = catalog.characters.len(),
            "loaded character catalog"
        );
        Ok(catalog)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, CatalogError> {
        let catalog: CharacterCatalog = toml::from_str(text)?;
        catalog.validate()?;
        Ok(catalog)
    }

    fn validate(&self) -> Result<(), CatalogError> {
        let mut seen = HashSet::new();
        for c in std::iter::once(&self.default).chain(&self.characters) {
            if !seen.insert(c.id.as_str()) {
                return Err(CatalogError::DuplicateId(c.id.clone()));
            }
            let s = &c.slot;
            let invalid = |reason: &str| CatalogError::InvalidSlot {
                id: c.id.clone(),
                reason: reason.to_string(),
            };
            if !(s.size > 0.0 && s.size.is_finite()) {
                return Err(invalid("slot size must be positive"));
            }
            if !(s.scale_x > 0.0 && s.scale_y > 0.0) {
                return Err(invalid("slot scale must be positive"));
            }
            if !(0.0..1.0).contains(&(c.trim.top + c.trim.bottom)) {
                return Err(invalid("trim must leave part of the cutout"));
            }
        }
        Ok(())
    }

    /// Config for `id`, or the default character when the id is unknown.
    pub fn get(&self, id: &str) -> &CharacterConfig {
        self.characters
            .iter()
            .find(|c| c.id == id)
            .unwrap_or(&self.default)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.characters.iter().any(|c| c.id == id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.characters.iter().map(|c| c.id.as_str())
    }
}
