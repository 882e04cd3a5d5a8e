use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::ml::gbm::GbmConfig;
use crate::ml::linear::LinearTrainingOptions;
use crate::registry::PromotionCriteria;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub paths: PathSettings,
    pub training: TrainingSettings,
    pub promotion: PromotionCriteria,
    pub pit: PitSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            paths: PathSettings::default(),
            training: TrainingSettings::default(),
            promotion: PromotionCriteria::default(),
            pit: PitSettings::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        // Paths
        if self.paths.store_root.as_os_str().is_empty() {
            errors.push("paths.store_root must not be empty".to_string());
        }

        // Training
        if self.training.cv_folds < 2 {
            errors.push("training.cv_folds must be >= 2".to_string());
        }
        let f = self.training.min_train_fraction;
        if !(f > 0.0 && f < 1.0) {
            errors.push("training.min_train_fraction must be in (0, 1)".to_string());
        }
        if let Err(e) = self.training.gbm.validate() {
            errors.push(e.to_string());
        }
        if let Err(e) = self.training.linear.validate() {
            errors.push(e.to_string());
        }

        // Promotion gate
        if !(0.0..=1.0).contains(&self.promotion.min_auc) {
            errors.push("promotion.min_auc must be between 0 and 1".to_string());
        }
        if self.promotion.max_calibration_error < 0.0 {
            errors.push("promotion.max_calibration_error must be >= 0".to_string());
        }
        if let Some(w) = self.promotion.min_backtest_win_rate {
            if !(0.0..=1.0).contains(&w) {
                errors.push("promotion.min_backtest_win_rate must be between 0 and 1".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    /// Root of the model registry and experiment store
    pub store_root: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            store_root: PathBuf::from("./model_store"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    pub seed: u64,
    pub cv_folds: usize,
    /// Smallest expanding window used by walk-forward validation
    pub min_train_fraction: f64,
    pub gbm: GbmConfig,
    pub linear: LinearTrainingOptions,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            seed: 42,
            cv_folds: 5,
            min_train_fraction: 0.4,
            gbm: GbmConfig::default(),
            linear: LinearTrainingOptions::default(),
        }
    }
}

impl TrainingSettings {
    /// GBM settings with the training seed applied.
    pub fn seeded_gbm(&self) -> GbmConfig {
        GbmConfig {
            seed: self.seed,
            ..self.gbm.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PitSettings {
    pub enforcement_enabled: bool,
}

impl Default for PitSettings {
    fn default() -> Self {
        Self {
            enforcement_enabled: true,
        }
    }
}
