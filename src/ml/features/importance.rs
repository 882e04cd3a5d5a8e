use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::ml::classifier::{Classifier, ModelTrainer};
use crate::ml::cross_validation::CancellationToken;
use crate::ml::gbm::GbmModel;
use crate::ml::linear::ModelCoefficients;
use crate::ml::metrics::{auc, evaluate_classifier};
use crate::ml::rng::SeededRng;
use crate::ml::split::{stratified_split, SplitRatios};
use crate::types::{labels, FeatureSchema, TrainingExample};

/// Normalized importance of one feature. `signed` carries the raw linear
/// weight when there is one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureImportance {
    pub feature: String,
    pub importance: f64,
    pub signed: Option<f64>,
}

fn sort_desc(items: &mut [FeatureImportance]) {
    items.sort_by(|a, b| {
        b.importance
            .total_cmp(&a.importance)
            .then_with(|| a.feature.cmp(&b.feature))
    });
}

/// `|weight|` shares of the linear model, strongest first.
pub fn coefficient_importance(coefficients: &ModelCoefficients) -> Vec<FeatureImportance> {
    let total: f64 = coefficients.weights.values().map(|w| w.abs()).sum();
    let mut out: Vec<FeatureImportance> = coefficients
        .weights
        .iter()
        .map(|(name, &w)| FeatureImportance {
            feature: name.clone(),
            importance: if total > 0.0 { w.abs() / total } else { 0.0 },
            signed: Some(w),
        })
        .collect();
    sort_desc(&mut out);
    out
}

/// Gain-times-samples importance of a boosted model, strongest first.
pub fn gbm_importance(model: &GbmModel) -> Vec<FeatureImportance> {
    model
        .feature_importance()
        .into_iter()
        .map(|(feature, importance)| FeatureImportance {
            feature,
            importance,
            signed: None,
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PermutationConfig {
    pub n_repeats: usize,
    pub seed: u64,
}

impl Default for PermutationConfig {
    fn default() -> Self {
        Self { n_repeats: 5, seed: 42 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermutationImportance {
    pub feature: String,
    /// Mean AUC lost when the column is shuffled
    pub mean_drop: f64,
    pub std_drop: f64,
}

/// AUC drop from shuffling each column, averaged over `n_repeats` seeded
/// permutations. Features run in parallel; repeat `r` of feature `f` uses
/// stream `f * n_repeats + r`.
pub fn permutation_importance(
    model: &dyn Classifier,
    examples: &[TrainingExample],
    config: &PermutationConfig,
    cancel: &CancellationToken,
) -> Result<Vec<PermutationImportance>> {
    let first = examples
        .first()
        .ok_or_else(|| EngineError::InsufficientData("permutation importance needs examples".to_string()))?;
    if config.n_repeats == 0 {
        return Err(EngineError::config("n_repeats must be >= 1"));
    }

    let schema = Arc::clone(first.features.schema());
    if let Some(row) = examples.iter().position(|e| e.features.schema() != &schema) {
        return Err(EngineError::InvalidFeatures(format!(
            "example {} does not share the batch feature schema ({})",
            row, schema
        )));
    }
    let y = labels(examples);
    let baseline_scores: Vec<f64> = examples.iter().map(|e| model.predict_proba(&e.features)).collect();
    let baseline = auc(&baseline_scores, &y);

    let mut results: Vec<PermutationImportance> = schema
        .names()
        .par_iter()
        .enumerate()
        .map(|(f, name)| {
            cancel.check("permutation importance")?;
            let column: Vec<f64> = examples.iter().map(|e| e.features.value(f)).collect();

            let drops: Vec<f64> = (0..config.n_repeats)
                .map(|r| {
                    let mut shuffled = column.clone();
                    SeededRng::derive(config.seed, (f * config.n_repeats + r) as u64).shuffle(&mut shuffled);
                    let scores: Vec<f64> = examples
                        .iter()
                        .zip(shuffled.iter())
                        .map(|(e, &v)| model.predict_proba(&e.features.with_value(f, v)))
                        .collect();
                    baseline - auc(&scores, &y)
                })
                .collect();

            let n = drops.len() as f64;
            let mean_drop = drops.iter().sum::<f64>() / n;
            let std_drop = (drops.iter().map(|d| (d - mean_drop).powi(2)).sum::<f64>() / n).sqrt();
            debug!("Permutation {}: drop {:.4} ± {:.4}", name, mean_drop, std_drop);
            Ok(PermutationImportance {
                feature: name.clone(),
                mean_drop,
                std_drop,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    results.sort_by(|a, b| {
        b.mean_drop
            .total_cmp(&a.mean_drop)
            .then_with(|| a.feature.cmp(&b.feature))
    });
    Ok(results)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AblationConfig {
    pub holdout_fraction: f64,
    pub seed: u64,
}

impl Default for AblationConfig {
    fn default() -> Self {
        Self {
            holdout_fraction: 0.2,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AblationResult {
    pub feature: String,
    pub auc_without: f64,
    /// Baseline AUC minus AUC without the feature; positive means it helps
    pub auc_delta: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AblationReport {
    pub baseline_auc: f64,
    pub results: Vec<AblationResult>,
}

fn project_all(examples: &[TrainingExample], schema: &Arc<FeatureSchema>) -> Result<Vec<TrainingExample>> {
    examples
        .iter()
        .map(|e| Ok(e.with_features(e.features.project(schema)?)))
        .collect()
}

/// Retrain without each feature in turn and measure the holdout AUC lost.
pub fn ablation_study<T: ModelTrainer>(
    examples: &[TrainingExample],
    trainer: &T,
    config: &AblationConfig,
    cancel: &CancellationToken,
) -> Result<AblationReport> {
    let first = examples
        .first()
        .ok_or_else(|| EngineError::InsufficientData("ablation needs examples".to_string()))?;
    let holdout = config.holdout_fraction;
    if !(holdout > 0.0 && holdout < 1.0) {
        return Err(EngineError::config("holdout_fraction must be in (0, 1)"));
    }

    let schema = Arc::clone(first.features.schema());
    let split = stratified_split(examples, SplitRatios::new(1.0 - holdout, holdout, 0.0), config.seed)?;

    cancel.check("ablation")?;
    let baseline_model = trainer.fit(&split.train, &split.validation, config.seed)?;
    let baseline_auc = evaluate_classifier(&baseline_model, &split.validation).auc;

    let mut results: Vec<AblationResult> = schema
        .names()
        .par_iter()
        .enumerate()
        .map(|(i, name)| {
            cancel.check("ablation")?;
            let reduced = Arc::new(schema.without(name)?);
            let train = project_all(&split.train, &reduced)?;
            let validation = project_all(&split.validation, &reduced)?;

            let model = trainer.fit(&train, &validation, config.seed.wrapping_add(i as u64 + 1))?;
            let auc_without = evaluate_classifier(&model, &validation).auc;
            debug!("Ablation -{}: auc {:.4}", name, auc_without);
            Ok(AblationResult {
                feature: name.clone(),
                auc_without,
                auc_delta: baseline_auc - auc_without,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    results.sort_by(|a, b| {
        b.auc_delta
            .total_cmp(&a.auc_delta)
            .then_with(|| a.feature.cmp(&b.feature))
    });

    info!(
        "Ablation over {} features: baseline auc {:.4}, most useful {}",
        results.len(),
        baseline_auc,
        results.first().map(|r| r.feature.as_str()).unwrap_or("-")
    );
    Ok(AblationReport { baseline_auc, results })
}
