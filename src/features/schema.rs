//! Feature schemas: the declared, ordered feature layout of each schema version.
//!
//! Rules for editing a layout:
//! 1. Adding, removing or reordering a feature requires a new schema version.
//! 2. A name appears at most once per scope and version.
//! 3. Released versions are never edited; the layout hash catches accidental changes.

use super::{image, process, Scope};
use crate::normalize::{CanonicalImage, CanonicalProcess};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

/// One declared feature: its name, the plugins it is computed from, and its evaluator.
#[derive(Clone, Copy)]
pub struct FeatureSpec<F> {
    pub name: &'static str,
    /// Plugins that must have contributed; otherwise the feature is the sentinel
    pub requires: &'static [&'static str],
    pub eval: F,
}

pub type ImageFeature = FeatureSpec<fn(&CanonicalImage) -> f64>;
pub type ProcessFeature = FeatureSpec<fn(&CanonicalProcess, &CanonicalImage) -> f64>;

pub struct FeatureSchema {
    pub version: u16,
    pub image: Vec<ImageFeature>,
    pub process: Vec<ProcessFeature>,
    image_hash: String,
    process_hash: String,
}

impl FeatureSchema {
    fn new(version: u16, image: Vec<ImageFeature>, process: Vec<ProcessFeature>) -> Self {
        let image_hash = layout_hash(version, Scope::Image, image.iter().map(|f| f.name));
        let process_hash = layout_hash(version, Scope::Process, process.iter().map(|f| f.name));
        Self {
            version,
            image,
            process,
            image_hash,
            process_hash,
        }
    }

    pub fn layout_hash(&self, scope: Scope) -> &str {
        match scope {
            Scope::Image => &self.image_hash,
            Scope::Process => &self.process_hash,
        }
    }

    pub fn names(&self, scope: Scope) -> Vec<&'static str> {
        match scope {
            Scope::Image => self.image.iter().map(|f| f.name).collect(),
            Scope::Process => self.process.iter().map(|f| f.name).collect(),
        }
    }

    pub fn layout(&self, scope: Scope) -> LayoutInfo {
        let feature_names: Vec<String> = self.names(scope).into_iter().map(String::from).collect();
        LayoutInfo {
            version: self.version,
            scope,
            hash: self.layout_hash(scope).to_string(),
            feature_count: feature_names.len(),
            feature_names,
        }
    }
}

/// Serializable description of one layout, for logs and model files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutInfo {
    pub version: u16,
    pub scope: Scope,
    pub hash: String,
    pub feature_count: usize,
    pub feature_names: Vec<String>,
}

/// SHA-256 over version, scope and the ordered names.
pub fn layout_hash<'a>(version: u16, scope: Scope, names: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(version.to_be_bytes());
    hasher.update(scope.as_str().as_bytes());
    for name in names {
        hasher.update([0u8]);
        hasher.update(name.as_bytes());
    }
    hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

static SCHEMAS: OnceLock<Vec<FeatureSchema>> = OnceLock::new();

fn builtin() -> Vec<FeatureSchema> {
    vec![
        FeatureSchema::new(1, image::V1.to_vec(), process::V1.to_vec()),
        FeatureSchema::new(
            2,
            image::V1.iter().chain(image::GRAPH).copied().collect(),
            process::V1.iter().chain(process::GRAPH).copied().collect(),
        ),
    ]
}

/// Schema of `version`, if this build knows it.
pub fn schema(version: u16) -> Option<&'static FeatureSchema> {
    SCHEMAS.get_or_init(builtin).iter().find(|s| s.version == version)
}

pub fn versions() -> impl Iterator<Item = u16> {
    SCHEMAS.get_or_init(builtin).iter().map(|s| s.version)
}
