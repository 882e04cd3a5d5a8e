pub mod bagging;
pub mod stacking;

pub use bagging::{
    train_ensemble, AggregationMethod, EnsembleConfig, EnsembleModel, EnsembleOutcome, EnsemblePrediction,
    EnsembleTrainer,
};
pub use stacking::{
    train_stacked, BasePredictionSource, StackedModel, StackingConfig, StackingMethod, StackingOutcome,
    StackingTrainer,
};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ml::classifier::{Classifier, ModelType};
use crate::ml::gbm::{train_gbm, GbmConfig, GbmModel};
use crate::ml::linear::{train_linear, LinearTrainingOptions, ModelCoefficients};
use crate::types::{FeatureVector, TrainingExample};

/// Which base learner an ensemble member is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MemberSpec {
    Linear(LinearTrainingOptions),
    Gbm(GbmConfig),
}

impl Default for MemberSpec {
    fn default() -> Self {
        MemberSpec::Gbm(GbmConfig::default())
    }
}

impl MemberSpec {
    pub fn validate(&self) -> Result<()> {
        match self {
            MemberSpec::Linear(options) => options.validate(),
            MemberSpec::Gbm(config) => config.validate(),
        }
    }

    /// Train one member; `seed` replaces the boosted config's own seed.
    pub fn train(
        &self,
        train: &[TrainingExample],
        validation: &[TrainingExample],
        seed: u64,
    ) -> Result<MemberModel> {
        match self {
            MemberSpec::Linear(options) => Ok(MemberModel::Linear(train_linear(train, options)?)),
            MemberSpec::Gbm(config) => {
                let config = GbmConfig {
                    seed,
                    ..config.clone()
                };
                Ok(MemberModel::Gbm(train_gbm(train, validation, &config)?))
            }
        }
    }
}

/// A trained ensemble member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MemberModel {
    Linear(ModelCoefficients),
    Gbm(GbmModel),
}

impl Classifier for MemberModel {
    fn predict_proba(&self, features: &FeatureVector) -> f64 {
        match self {
            MemberModel::Linear(model) => model.predict_proba(features),
            MemberModel::Gbm(model) => model.predict_proba(features),
        }
    }

    fn model_type(&self) -> ModelType {
        match self {
            MemberModel::Linear(_) => ModelType::LogisticRegression,
            MemberModel::Gbm(_) => ModelType::GradientBoosting,
        }
    }
}

/// Scale non-negative scores to sum to 1. Falls back to uniform weights when
/// the total is not positive.
pub fn normalize_weights(scores: &[f64]) -> Vec<f64> {
    if scores.is_empty() {
        return Vec::new();
    }
    let clean: Vec<f64> = scores
        .iter()
        .map(|&s| if s.is_finite() && s > 0.0 { s } else { 0.0 })
        .collect();
    let total: f64 = clean.iter().sum();
    if total <= 0.0 {
        return vec![1.0 / scores.len() as f64; scores.len()];
    }
    clean.iter().map(|s| s / total).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_weights_sums_to_one() {
        let w = normalize_weights(&[0.9, 0.7, 0.55]);
        assert!((w.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert!(w[0] > w[1] && w[1] > w[2]);
    }

    #[test]
    fn test_normalize_weights_uniform_fallback() {
        assert_eq!(normalize_weights(&[0.0, 0.0]), vec![0.5, 0.5]);
        assert_eq!(normalize_weights(&[f64::NAN, -1.0, 0.0, 0.0]), vec![0.25; 4]);
        assert!(normalize_weights(&[]).is_empty());
    }

    #[test]
    fn test_member_spec_serde_tag() {
        let json = serde_json::to_string(&MemberSpec::Linear(LinearTrainingOptions::default())).unwrap();
        assert!(json.starts_with("{\"kind\":\"linear\""));
    }
}
