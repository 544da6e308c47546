//! Classifier and explainer boundary. Feature vectors go in; a label, a score and
//! per-feature contributions come out.

mod linear;

pub use linear::LinearModel;

use crate::features::FeatureVector;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Label {
    Benign,
    Malware,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: Label,
    /// Malware probability in [0, 1]
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub feature_name: String,
    pub contribution: f64,
}

/// Prediction plus its explanation for one vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub key_id: String,
    pub prediction: Prediction,
    pub contributions: Vec<Contribution>,
}

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("model expects schema version {expected}, vector has {actual}")]
    SchemaMismatch { expected: u16, actual: u16 },

    #[error("model weights feature {name}, which the vector does not carry")]
    UnknownFeature { name: String },

    #[error("cannot read model {}: {source}", path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid model file: {0}")]
    Format(#[from] serde_json::Error),
}

pub trait Classifier: Send + Sync {
    fn predict(&self, features: &FeatureVector) -> Result<Prediction, ClassifyError>;
}

/// Contributions ordered by descending absolute value.
pub trait Explainer: Send + Sync {
    fn explain(&self, features: &FeatureVector) -> Result<Vec<Contribution>, ClassifyError>;
}

pub fn classify(
    classifier: &dyn Classifier,
    explainer: &dyn Explainer,
    features: &FeatureVector,
) -> Result<Verdict, ClassifyError> {
    Ok(Verdict {
        key_id: features.key_id.clone(),
        prediction: classifier.predict(features)?,
        contributions: explainer.explain(features)?,
    })
}

/// Sort by |contribution| descending; ties keep feature order.
pub(crate) fn rank(contributions: &mut [Contribution]) {
    contributions.sort_by(|a, b| {
        b.contribution
            .abs()
            .partial_cmp(&a.contribution.abs())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}
