use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

use super::{normalize_weights, MemberModel, MemberSpec};
use crate::error::{EngineError, Result};
use crate::ml::classifier::{Classifier, ModelTrainer, ModelType};
use crate::ml::metrics::{evaluate_classifier, EvaluationMetrics};
use crate::ml::rng::SeededRng;
use crate::ml::split::{stratified_split, SplitRatios};
use crate::types::{FeatureVector, TrainingExample};

/// Member variance (in squared percentage points) at which confidence hits 0.
pub const MAX_MEMBER_VARIANCE: f64 = 2500.0;

/// Seed stride between consecutive members.
pub const MEMBER_SEED_STRIDE: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMethod {
    Average,
    Weighted,
    Voting,
}

impl AggregationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationMethod::Average => "average",
            AggregationMethod::Weighted => "weighted",
            AggregationMethod::Voting => "voting",
        }
    }
}

impl FromStr for AggregationMethod {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "average" => Ok(AggregationMethod::Average),
            "weighted" => Ok(AggregationMethod::Weighted),
            "voting" => Ok(AggregationMethod::Voting),
            _ => Err(EngineError::config(format!("Unknown aggregation method: {}", s))),
        }
    }
}

impl fmt::Display for AggregationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    pub num_models: usize,
    /// Bootstrap sample size as a share of the training slice
    pub bootstrap_ratio: f64,
    pub base_seed: u64,
    pub method: AggregationMethod,
    pub member: MemberSpec,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            num_models: 5,
            bootstrap_ratio: 1.0,
            base_seed: 42,
            method: AggregationMethod::Weighted,
            member: MemberSpec::default(),
        }
    }
}

impl EnsembleConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_models == 0 {
            return Err(EngineError::config("ensemble needs at least one model"));
        }
        if !(self.bootstrap_ratio > 0.0 && self.bootstrap_ratio <= 1.0) {
            return Err(EngineError::config("bootstrap_ratio must be in (0, 1]"));
        }
        self.member.validate()
    }

    pub fn member_seed(&self, index: usize) -> u64 {
        self.base_seed.wrapping_add(index as u64 * MEMBER_SEED_STRIDE)
    }
}

/// Aggregated prediction. Probabilities are percentages in [0, 100].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsemblePrediction {
    pub probability: f64,
    pub confidence: f64,
    pub member_probabilities: Vec<f64>,
}

/// Bagged models with one weight per member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleModel {
    pub models: Vec<MemberModel>,
    pub weights: Vec<f64>,
    pub method: AggregationMethod,
}

impl EnsembleModel {
    pub fn new(models: Vec<MemberModel>, weights: Vec<f64>, method: AggregationMethod) -> Result<Self> {
        if models.is_empty() || models.len() != weights.len() {
            return Err(EngineError::config(format!(
                "ensemble has {} models and {} weights",
                models.len(),
                weights.len()
            )));
        }
        Ok(Self {
            models,
            weights: normalize_weights(&weights),
            method,
        })
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn predict(&self, features: &FeatureVector) -> EnsemblePrediction {
        let member_probabilities: Vec<f64> = self
            .models
            .iter()
            .map(|m| m.predict_proba(features) * 100.0)
            .collect();

        let probability = match self.method {
            AggregationMethod::Voting => self
                .weights
                .iter()
                .zip(member_probabilities.iter())
                .filter(|(_, p)| **p >= 50.0)
                .map(|(w, _)| w)
                .sum::<f64>()
                * 100.0,
            AggregationMethod::Average | AggregationMethod::Weighted => self
                .weights
                .iter()
                .zip(member_probabilities.iter())
                .map(|(w, p)| w * p)
                .sum(),
        };

        EnsemblePrediction {
            probability: probability.clamp(0.0, 100.0),
            confidence: confidence_from_spread(&member_probabilities),
            member_probabilities,
        }
    }
}

/// `100 × (1 − min(var, 2500) / 2500)` over member percentages.
pub fn confidence_from_spread(member_probabilities: &[f64]) -> f64 {
    if member_probabilities.is_empty() {
        return 0.0;
    }
    let n = member_probabilities.len() as f64;
    let mean = member_probabilities.iter().sum::<f64>() / n;
    let variance = member_probabilities.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / n;
    100.0 * (1.0 - variance.min(MAX_MEMBER_VARIANCE) / MAX_MEMBER_VARIANCE)
}

impl Classifier for EnsembleModel {
    fn predict_proba(&self, features: &FeatureVector) -> f64 {
        self.predict(features).probability / 100.0
    }

    fn model_type(&self) -> ModelType {
        ModelType::Ensemble
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleOutcome {
    pub model: EnsembleModel,
    pub validation_metrics: EvaluationMetrics,
    pub member_metrics: Vec<EvaluationMetrics>,
}

/// Weights for `method` given each member's validation AUC.
pub fn aggregation_weights(method: AggregationMethod, member_aucs: &[f64]) -> Vec<f64> {
    match method {
        AggregationMethod::Weighted => normalize_weights(member_aucs),
        AggregationMethod::Average | AggregationMethod::Voting => {
            normalize_weights(&vec![1.0; member_aucs.len()])
        }
    }
}

/// Bootstrap-aggregate `num_models` members over an 80/20 stratified split.
pub fn train_ensemble(examples: &[TrainingExample], config: &EnsembleConfig) -> Result<EnsembleOutcome> {
    config.validate()?;
    let split = stratified_split(examples, SplitRatios::new(0.8, 0.2, 0.0), config.base_seed)?;
    if split.train.is_empty() {
        return Err(EngineError::InsufficientData("ensemble training slice is empty".to_string()));
    }

    let n = split.train.len();
    let sample_size = ((n as f64 * config.bootstrap_ratio).round() as usize).max(1);

    let trained: Vec<(MemberModel, EvaluationMetrics)> = (0..config.num_models)
        .into_par_iter()
        .map(|i| {
            let seed = config.member_seed(i);
            let rows = SeededRng::new(seed).sample_with_replacement(n, sample_size);
            let sample: Vec<TrainingExample> = rows.iter().map(|&r| split.train[r].clone()).collect();

            let model = config.member.train(&sample, &split.validation, seed)?;
            let metrics = evaluate_classifier(&model, &split.validation);
            debug!("Ensemble member {} (seed {}): val auc {:.4}", i, seed, metrics.auc);
            Ok((model, metrics))
        })
        .collect::<Result<Vec<_>>>()?;

    let (models, member_metrics): (Vec<MemberModel>, Vec<EvaluationMetrics>) = trained.into_iter().unzip();
    let aucs: Vec<f64> = member_metrics.iter().map(|m| m.auc).collect();
    let weights = aggregation_weights(config.method, &aucs);

    let model = EnsembleModel::new(models, weights, config.method)?;
    let validation_metrics = evaluate_classifier(&model, &split.validation);
    info!(
        "Ensemble trained: {} members ({}), val auc {:.4}",
        model.len(),
        config.method,
        validation_metrics.auc
    );

    Ok(EnsembleOutcome {
        model,
        validation_metrics,
        member_metrics,
    })
}

/// [`ModelTrainer`] adapter; the fit seed becomes `base_seed`. The validation
/// slice is ignored since bagging carves its own holdout.
#[derive(Debug, Clone, Default)]
pub struct EnsembleTrainer {
    pub config: EnsembleConfig,
}

impl EnsembleTrainer {
    pub fn new(config: EnsembleConfig) -> Self {
        Self { config }
    }
}

impl ModelTrainer for EnsembleTrainer {
    type Model = EnsembleModel;

    fn fit(&self, train: &[TrainingExample], _validation: &[TrainingExample], seed: u64) -> Result<EnsembleModel> {
        let config = EnsembleConfig {
            base_seed: seed,
            ..self.config.clone()
        };
        Ok(train_ensemble(train, &config)?.model)
    }

    fn name(&self) -> &'static str {
        "ensemble"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::gbm::GbmConfig;
    use crate::ml::linear::tests::separable_examples;
    use crate::ml::linear::{LinearTrainingOptions, ModelCoefficients};
    use std::collections::BTreeMap;

    fn fast_config(method: AggregationMethod) -> EnsembleConfig {
        EnsembleConfig {
            num_models: 3,
            method,
            member: MemberSpec::Gbm(GbmConfig {
                num_trees: 10,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn constant_member(intercept: f64) -> MemberModel {
        MemberModel::Linear(ModelCoefficients {
            intercept,
            weights: BTreeMap::new(),
            feature_means: BTreeMap::new(),
            feature_stds: BTreeMap::new(),
            version: "draft".to_string(),
            training_samples: 0,
        })
    }

    #[test]
    fn test_weights_sum_to_one_for_every_method() {
        let data = separable_examples(300, 6);
        for method in [AggregationMethod::Average, AggregationMethod::Weighted, AggregationMethod::Voting] {
            let outcome = train_ensemble(&data, &fast_config(method)).unwrap();
            let sum: f64 = outcome.model.weights.iter().sum();
            assert!((sum - 1.0).abs() < 1e-9, "{} sums to {}", method, sum);
            assert_eq!(outcome.model.len(), 3);
            assert_eq!(outcome.member_metrics.len(), 3);
        }
    }

    #[test]
    fn test_member_seeds_are_strided() {
        let config = EnsembleConfig {
            base_seed: 7,
            ..Default::default()
        };
        assert_eq!(config.member_seed(0), 7);
        assert_eq!(config.member_seed(2), 2007);
    }

    #[test]
    fn test_training_is_deterministic_across_threads() {
        let data = separable_examples(300, 14);
        let a = train_ensemble(&data, &fast_config(AggregationMethod::Weighted)).unwrap();
        let b = train_ensemble(&data, &fast_config(AggregationMethod::Weighted)).unwrap();
        assert_eq!(
            serde_json::to_string(&a.model).unwrap(),
            serde_json::to_string(&b.model).unwrap()
        );
    }

    #[test]
    fn test_voting_and_confidence() {
        // sigmoid(0) = 50%, sigmoid(+-ln 3) = 75% / 25%
        let members = vec![
            constant_member(3f64.ln()),
            constant_member(0.0),
            constant_member(-(3f64.ln())),
        ];
        let model = EnsembleModel::new(members, vec![1.0; 3], AggregationMethod::Voting).unwrap();
        let fv = separable_examples(1, 1).remove(0).features;
        let prediction = model.predict(&fv);

        assert!((prediction.probability - 200.0 / 3.0).abs() < 1e-9);
        // variance of [75, 50, 25] is 416.67
        let expected = 100.0 * (1.0 - (1250.0 / 3.0) / MAX_MEMBER_VARIANCE);
        assert!((prediction.confidence - expected).abs() < 1e-6);
    }

    #[test]
    fn test_identical_members_are_fully_confident() {
        let model = EnsembleModel::new(
            vec![constant_member(0.4), constant_member(0.4)],
            vec![0.3, 0.7],
            AggregationMethod::Average,
        )
        .unwrap();
        let fv = separable_examples(1, 2).remove(0).features;
        let prediction = model.predict(&fv);
        assert_eq!(prediction.confidence, 100.0);
        assert!((model.weights.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_weighted_fallback_when_all_aucs_zero() {
        assert_eq!(aggregation_weights(AggregationMethod::Weighted, &[0.0, 0.0]), vec![0.5, 0.5]);
    }

    #[test]
    fn test_linear_members() {
        let data = separable_examples(400, 3);
        let config = EnsembleConfig {
            num_models: 2,
            member: MemberSpec::Linear(LinearTrainingOptions {
                iterations: 200,
                ..Default::default()
            }),
            ..Default::default()
        };
        let outcome = train_ensemble(&data, &config).unwrap();
        assert!(outcome.validation_metrics.auc > 0.95);
    }

    #[test]
    fn test_rejects_empty_ensemble() {
        let config = EnsembleConfig {
            num_models: 0,
            ..Default::default()
        };
        assert!(train_ensemble(&separable_examples(50, 1), &config).is_err());
    }
}
