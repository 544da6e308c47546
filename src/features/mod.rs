//! Feature extraction: canonical artifact graph → fixed-layout, versioned feature vectors.

mod extract;
mod image;
mod process;
pub mod schema;

pub use extract::{extract_image_features, extract_process_features, FeatureExtractor};
pub use schema::{schema, FeatureSchema, FeatureSpec, ImageFeature, LayoutInfo, ProcessFeature};

use serde::{Deserialize, Serialize};

/// Schema used when the configuration does not pin one.
pub const CURRENT_SCHEMA_VERSION: u16 = 2;

/// Value of a feature whose input plugins did not contribute.
pub const SENTINEL: f64 = -1.0;

/// Ratio with a zero denominator is 0.
pub(crate) fn safe_div(num: f64, denom: f64) -> f64 {
    if denom == 0.0 {
        0.0
    } else {
        num / denom
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Image,
    Process,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Image => "image",
            Scope::Process => "process",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub name: String,
    pub value: f64,
}

/// Ordered feature values under one schema version. Same version, same names, same length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub schema_version: u16,
    pub layout_hash: String,
    pub scope: Scope,
    /// Dump id for image vectors, process key for process vectors
    pub key_id: String,
    pub features: Vec<Feature>,
}

impl FeatureVector {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.features.iter().find(|f| f.name == name).map(|f| f.value)
    }

    pub fn values(&self) -> Vec<f64> {
        self.features.iter().map(|f| f.value).collect()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.features.iter().map(|f| f.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn sentinel_count(&self) -> usize {
        self.features.iter().filter(|f| f.value == SENTINEL).count()
    }
}
