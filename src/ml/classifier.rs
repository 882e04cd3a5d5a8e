use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{EngineError, Result};
use crate::types::{FeatureVector, TrainingExample};

/// Model family identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    LogisticRegression,
    GradientBoosting,
    Stacked,
    Ensemble,
}

impl ModelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::LogisticRegression => "logistic_regression",
            ModelType::GradientBoosting => "gradient_boosting",
            ModelType::Stacked => "stacked",
            ModelType::Ensemble => "ensemble",
        }
    }
}

impl FromStr for ModelType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "logistic_regression" | "linear" | "logistic" => Ok(ModelType::LogisticRegression),
            "gradient_boosting" | "gbm" => Ok(ModelType::GradientBoosting),
            "stacked" | "stacking" => Ok(ModelType::Stacked),
            "ensemble" | "bagging" => Ok(ModelType::Ensemble),
            _ => Err(EngineError::config(format!("Unknown model type: {}", s))),
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A trained binary classifier scoring trade candidates.
pub trait Classifier: Send + Sync {
    /// Win probability in [0, 1].
    fn predict_proba(&self, features: &FeatureVector) -> f64;

    fn model_type(&self) -> ModelType;
}

/// Something that fits a [`Classifier`] from labelled examples.
///
/// `seed` is unit-specific (fold id, bootstrap index) so callers can fan work
/// out across threads without sharing RNG state.
pub trait ModelTrainer: Send + Sync {
    type Model: Classifier;

    fn fit(
        &self,
        train: &[TrainingExample],
        validation: &[TrainingExample],
        seed: u64,
    ) -> Result<Self::Model>;

    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_type_from_str() {
        assert_eq!(ModelType::from_str("gbm").unwrap(), ModelType::GradientBoosting);
        assert_eq!(
            ModelType::from_str("logistic_regression").unwrap(),
            ModelType::LogisticRegression
        );
        assert!(ModelType::from_str("lstm").is_err());
    }

    #[test]
    fn test_model_type_serde_name() {
        let json = serde_json::to_string(&ModelType::GradientBoosting).unwrap();
        assert_eq!(json, "\"gradient_boosting\"");
    }
}
