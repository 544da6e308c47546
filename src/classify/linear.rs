//! Logistic model over named features. Serves as both classifier and explainer.

use super::{rank, ClassifyError, Classifier, Contribution, Explainer, Label, Prediction};
use crate::features::FeatureVector;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

fn default_threshold() -> f64 {
    0.5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub schema_version: u16,
    pub bias: f64,
    /// Score at or above which the label is `malware`
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    /// Feature name → weight. Unweighted features contribute nothing.
    pub weights: BTreeMap<String, f64>,
}

impl LinearModel {
    pub fn load(path: &Path) -> Result<Self, ClassifyError> {
        let text = std::fs::read_to_string(path).map_err(|source| ClassifyError::Load {
            path: path.to_path_buf(),
            source,
        })?;
        let model: LinearModel = serde_json::from_str(&text)?;
        info!(
            path = %path.display(),
            schema_version = model.schema_version,
            weights = model.weights.len(),
            "linear model loaded"
        );
        Ok(model)
    }

    fn check(&self, features: &FeatureVector) -> Result<(), ClassifyError> {
        if features.schema_version != self.schema_version {
            return Err(ClassifyError::SchemaMismatch {
                expected: self.schema_version,
                actual: features.schema_version,
            });
        }
        if let Some(name) = self.weights.keys().find(|n| features.get(n).is_none()) {
            return Err(ClassifyError::UnknownFeature { name: name.clone() });
        }
        Ok(())
    }

    fn terms<'a>(&'a self, features: &'a FeatureVector) -> impl Iterator<Item = (&'a str, f64)> + 'a {
        features
            .features
            .iter()
            .filter_map(|f| self.weights.get(&f.name).map(|w| (f.name.as_str(), w * f.value)))
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

impl Classifier for LinearModel {
    fn predict(&self, features: &FeatureVector) -> Result<Prediction, ClassifyError> {
        self.check(features)?;
        let z = self.bias + self.terms(features).map(|(_, t)| t).sum::<f64>();
        let score = sigmoid(z);
        let label = if score >= self.threshold {
            Label::Malware
        } else {
            Label::Benign
        };
        Ok(Prediction { label, score })
    }
}

impl Explainer for LinearModel {
    fn explain(&self, features: &FeatureVector) -> Result<Vec<Contribution>, ClassifyError> {
        self.check(features)?;
        let mut out: Vec<Contribution> = self
            .terms(features)
            .map(|(name, c)| Contribution {
                feature_name: name.to_string(),
                contribution: c,
            })
            .collect();
        rank(&mut out);
        Ok(out)
    }
}
