//! Gradient boosted decision trees for binary classification.

pub mod booster;
pub mod tree;

pub use booster::{train_gbm, GbmModel, GbmTrainer, RoundMetrics};
pub use tree::{RegressionTree, TreeNode};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Boosting hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GbmConfig {
    pub num_trees: usize,
    pub max_depth: usize,
    pub learning_rate: f64,
    /// Row sample ratio per tree, drawn with replacement
    pub subsample: f64,
    /// Column sample ratio per tree, drawn without replacement
    pub colsample: f64,
    pub min_samples_leaf: usize,
    pub min_samples_split: usize,
    pub l2_regularization: f64,
    pub seed: u64,
    /// 0 disables early stopping
    pub early_stopping_rounds: usize,
}

impl Default for GbmConfig {
    fn default() -> Self {
        Self {
            num_trees: 100,
            max_depth: 4,
            learning_rate: 0.1,
            subsample: 0.8,
            colsample: 0.8,
            min_samples_leaf: 5,
            min_samples_split: 10,
            l2_regularization: 1.0,
            seed: 42,
            early_stopping_rounds: 10,
        }
    }
}

impl GbmConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_depth == 0 {
            return Err(EngineError::config("gbm max_depth must be >= 1"));
        }
        if self.learning_rate < 0.0 || !self.learning_rate.is_finite() {
            return Err(EngineError::config("gbm learning_rate must be finite and >= 0"));
        }
        if !(self.subsample > 0.0 && self.subsample <= 1.0) {
            return Err(EngineError::config("gbm subsample must be in (0, 1]"));
        }
        if !(self.colsample > 0.0 && self.colsample <= 1.0) {
            return Err(EngineError::config("gbm colsample must be in (0, 1]"));
        }
        if self.min_samples_leaf == 0 {
            return Err(EngineError::config("gbm min_samples_leaf must be >= 1"));
        }
        if self.min_samples_split < 2 {
            return Err(EngineError::config("gbm min_samples_split must be >= 2"));
        }
        if self.l2_regularization < 0.0 || !self.l2_regularization.is_finite() {
            return Err(EngineError::config("gbm l2_regularization must be >= 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = GbmConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.num_trees, 100);
        assert_eq!(config.early_stopping_rounds, 10);
    }

    #[test]
    fn test_invalid_ratios_rejected() {
        let bad = GbmConfig {
            subsample: 0.0,
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(EngineError::Configuration(_))));

        let bad = GbmConfig {
            colsample: 1.5,
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let bad = GbmConfig {
            learning_rate: f64::NAN,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: GbmConfig = serde_json::from_str(r#"{"num_trees": 7}"#).unwrap();
        assert_eq!(config.num_trees, 7);
        assert_eq!(config.max_depth, 4);
    }
}
