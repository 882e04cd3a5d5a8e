use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use super::classifier::ModelTrainer;
use super::metrics::{evaluate_classifier, EvaluationMetrics};
use super::split::{
    stratified_k_fold, stratified_split, temporal_split, walk_forward_splits, Fold, SplitRatios,
    MIN_WALK_FORWARD_TRAIN_FRACTION,
};
use crate::error::{EngineError, Result};
use crate::types::TrainingExample;

/// Two-sided 95% t critical values for df = 1..=30.
const T_TABLE_95: [f64; 30] = [
    12.706, 4.303, 3.182, 2.776, 2.571, 2.447, 2.365, 2.306, 2.262, 2.228, 2.201, 2.179, 2.160, 2.145, 2.131,
    2.120, 2.110, 2.101, 2.093, 2.086, 2.080, 2.074, 2.069, 2.064, 2.060, 2.056, 2.052, 2.048, 2.045, 2.042,
];

/// t critical value for a 95% interval with `df` degrees of freedom.
pub fn t_value_95(df: usize) -> f64 {
    match df {
        0 => 0.0,
        1..=30 => T_TABLE_95[df - 1],
        _ => 1.96,
    }
}

/// Cooperative cancellation flag checked between units of work.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancelled.
    pub fn check(&self, operation: &str) -> Result<()> {
        if self.is_cancelled() {
            return Err(EngineError::Cancelled(operation.to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub mean: f64,
    /// Sample standard deviation (n - 1)
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub ci95: (f64, f64),
}

impl MetricSummary {
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self {
                mean: 0.0,
                std: 0.0,
                min: 0.0,
                max: 0.0,
                ci95: (0.0, 0.0),
            };
        }

        let n = values.len();
        let mean = values.iter().sum::<f64>() / n as f64;
        let std = if n > 1 {
            (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64).sqrt()
        } else {
            0.0
        };
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let margin = t_value_95(n - 1) * std / (n as f64).sqrt();

        Self {
            mean,
            std,
            min,
            max,
            ci95: (mean - margin, mean + margin),
        }
    }
}

/// How much fold-to-fold AUC varies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stability {
    Excellent,
    Good,
    Moderate,
    Unreliable,
}

impl Stability {
    pub fn from_auc_std(std: f64) -> Self {
        if std < 0.02 {
            Stability::Excellent
        } else if std < 0.03 {
            Stability::Good
        } else if std < 0.05 {
            Stability::Moderate
        } else {
            Stability::Unreliable
        }
    }
}

impl fmt::Display for Stability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stability::Excellent => "excellent",
            Stability::Good => "good",
            Stability::Moderate => "moderate",
            Stability::Unreliable => "unreliable",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossValidationConfig {
    pub folds: usize,
    pub seed: u64,
    /// Walk-forward only
    pub min_train_fraction: f64,
    /// Share of each fold's training window handed to the trainer as its
    /// validation slice (early stopping, blend weights). 0 passes none.
    pub inner_validation_fraction: f64,
}

impl Default for CrossValidationConfig {
    fn default() -> Self {
        Self {
            folds: 5,
            seed: 42,
            min_train_fraction: MIN_WALK_FORWARD_TRAIN_FRACTION,
            inner_validation_fraction: 0.2,
        }
    }
}

impl CrossValidationConfig {
    pub fn validate(&self) -> Result<()> {
        let f = self.inner_validation_fraction;
        if !(0.0..1.0).contains(&f) {
            return Err(EngineError::config(format!(
                "inner_validation_fraction must be in [0, 1), got {}",
                f
            )));
        }
        Ok(())
    }
}

/// How the trainer's validation slice is carved out of a fold's training rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InnerHoldout {
    /// Class-balanced random slice
    Stratified,
    /// Most recent rows of the window
    Trailing,
}

/// Split a fold's training rows into `(fit, validation)`. The scored fold
/// never reaches the trainer.
fn inner_split(
    train: &[TrainingExample],
    holdout: InnerHoldout,
    fraction: f64,
    seed: u64,
) -> Result<(Vec<TrainingExample>, Vec<TrainingExample>)> {
    if fraction <= 0.0 {
        return Ok((train.to_vec(), Vec::new()));
    }
    let ratios = SplitRatios::new(1.0 - fraction, fraction, 0.0);
    let split = match holdout {
        InnerHoldout::Stratified => stratified_split(train, ratios, seed)?,
        InnerHoldout::Trailing => temporal_split(train, ratios)?,
    };
    Ok((split.train, split.validation))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoldResult {
    pub index: usize,
    /// Rows the model was fitted on
    pub train_size: usize,
    /// Rows of the training window held out as the trainer's validation slice
    pub holdout_size: usize,
    pub validation_size: usize,
    pub metrics: EvaluationMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossValidationResult {
    pub trainer: String,
    pub folds: Vec<FoldResult>,
    pub summary: BTreeMap<String, MetricSummary>,
    pub stability: Stability,
}

impl CrossValidationResult {
    pub fn metric(&self, name: &str) -> Option<&MetricSummary> {
        self.summary.get(name)
    }
}

/// Aggregate each reported metric across folds.
pub fn summarize_folds(metrics: &[EvaluationMetrics]) -> BTreeMap<String, MetricSummary> {
    EvaluationMetrics::NAMES
        .iter()
        .map(|&name| {
            let values: Vec<f64> = metrics.iter().filter_map(|m| m.get(name)).collect();
            (name.to_string(), MetricSummary::from_values(&values))
        })
        .collect()
}

fn run_folds<T: ModelTrainer>(
    folds: Vec<Fold>,
    trainer: &T,
    config: &CrossValidationConfig,
    holdout: InnerHoldout,
    cancel: &CancellationToken,
) -> Result<CrossValidationResult> {
    let mut results: Vec<FoldResult> = folds
        .par_iter()
        .map(|fold| {
            cancel.check("cross-validation")?;
            let fold_seed = config.seed.wrapping_add(fold.index as u64);
            let (fit_rows, inner_val) =
                inner_split(&fold.train, holdout, config.inner_validation_fraction, fold_seed)?;
            let model = trainer.fit(&fit_rows, &inner_val, fold_seed)?;
            let metrics = evaluate_classifier(&model, &fold.validation);
            debug!(
                "Fold {}: train={} holdout={} val={} auc={:.4}",
                fold.index + 1,
                fit_rows.len(),
                inner_val.len(),
                fold.validation.len(),
                metrics.auc
            );
            Ok(FoldResult {
                index: fold.index,
                train_size: fit_rows.len(),
                holdout_size: inner_val.len(),
                validation_size: fold.validation.len(),
                metrics,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    results.sort_by_key(|r| r.index);

    let per_fold: Vec<EvaluationMetrics> = results.iter().map(|r| r.metrics).collect();
    let summary = summarize_folds(&per_fold);
    let auc_std = summary.get("auc").map(|s| s.std).unwrap_or(0.0);
    let stability = Stability::from_auc_std(auc_std);

    if let Some(auc) = summary.get("auc") {
        info!(
            "CV {} ({} folds): auc {:.4} ± {:.4} [{:.4}, {:.4}], {}",
            trainer.name(),
            results.len(),
            auc.mean,
            auc.std,
            auc.ci95.0,
            auc.ci95.1,
            stability
        );
    }

    Ok(CrossValidationResult {
        trainer: trainer.name().to_string(),
        folds: results,
        summary,
        stability,
    })
}

/// Stratified k-fold cross-validation; fold `i` trains with seed `seed + i`
/// and tunes on a stratified slice of its own training rows.
pub fn cross_validate<T: ModelTrainer>(
    examples: &[TrainingExample],
    trainer: &T,
    config: &CrossValidationConfig,
    cancel: &CancellationToken,
) -> Result<CrossValidationResult> {
    config.validate()?;
    cancel.check("cross-validation")?;
    let folds = stratified_k_fold(examples, config.folds, config.seed)?;
    run_folds(folds, trainer, config, InnerHoldout::Stratified, cancel)
}

/// Walk-forward cross-validation over chronologically ordered windows. The
/// trainer's validation slice is the tail of each training window.
pub fn time_series_cross_validate<T: ModelTrainer>(
    examples: &[TrainingExample],
    trainer: &T,
    config: &CrossValidationConfig,
    cancel: &CancellationToken,
) -> Result<CrossValidationResult> {
    config.validate()?;
    cancel.check("time-series cross-validation")?;
    let folds = walk_forward_splits(examples, config.folds, config.min_train_fraction)?;
    run_folds(folds, trainer, config, InnerHoldout::Trailing, cancel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::linear::tests::separable_examples;
    use crate::ml::linear::{LinearTrainer, LinearTrainingOptions, ModelCoefficients};
    use crate::ml::split::Fold;
    use chrono::{DateTime, Utc};
    use parking_lot::Mutex;
    use std::collections::BTreeSet;

    /// Records every row `fit` is shown and returns a constant model.
    #[derive(Default)]
    struct RecordingTrainer {
        calls: Mutex<Vec<(BTreeSet<DateTime<Utc>>, BTreeSet<DateTime<Utc>>)>>,
    }

    impl ModelTrainer for RecordingTrainer {
        type Model = ModelCoefficients;

        fn fit(&self, train: &[TrainingExample], validation: &[TrainingExample], _seed: u64) -> Result<ModelCoefficients> {
            let fit_ts = train.iter().map(|e| e.timestamp).collect();
            let val_ts = validation.iter().map(|e| e.timestamp).collect();
            self.calls.lock().push((fit_ts, val_ts));
            Ok(ModelCoefficients {
                intercept: 0.0,
                weights: BTreeMap::new(),
                feature_means: BTreeMap::new(),
                feature_stds: BTreeMap::new(),
                version: "draft".to_string(),
                training_samples: train.len(),
            })
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    fn timestamps(rows: &[TrainingExample]) -> BTreeSet<DateTime<Utc>> {
        rows.iter().map(|e| e.timestamp).collect()
    }

    /// The fold whose training window is exactly what `fit` saw.
    fn matching_fold<'a>(folds: &'a [Fold], seen: &BTreeSet<DateTime<Utc>>) -> &'a Fold {
        folds
            .iter()
            .find(|f| timestamps(&f.train) == *seen)
            .expect("fit saw rows outside every training window")
    }

    fn trainer() -> LinearTrainer {
        LinearTrainer::new(LinearTrainingOptions {
            iterations: 200,
            ..Default::default()
        })
    }

    #[test]
    fn test_identical_folds_have_zero_spread() {
        let auc = 0.8125;
        let metrics = vec![
            EvaluationMetrics {
                auc,
                ..Default::default()
            };
            5
        ];
        let summary = summarize_folds(&metrics);
        let s = &summary["auc"];
        assert_eq!(s.std, 0.0);
        assert_eq!(s.ci95, (s.mean, s.mean));
        assert_eq!(s.min, auc);
        assert_eq!(s.max, auc);
    }

    #[test]
    fn test_summary_uses_sample_std_and_t_table() {
        let s = MetricSummary::from_values(&[1.0, 2.0, 3.0]);
        assert_eq!(s.mean, 2.0);
        assert!((s.std - 1.0).abs() < 1e-12);
        let margin = 4.303 / 3f64.sqrt();
        assert!((s.ci95.0 - (2.0 - margin)).abs() < 1e-9);
        assert!((s.ci95.1 - (2.0 + margin)).abs() < 1e-9);
    }

    #[test]
    fn test_t_value_falls_back_to_normal() {
        assert_eq!(t_value_95(4), 2.776);
        assert_eq!(t_value_95(30), 2.042);
        assert_eq!(t_value_95(31), 1.96);
    }

    #[test]
    fn test_stability_thresholds() {
        assert_eq!(Stability::from_auc_std(0.01), Stability::Excellent);
        assert_eq!(Stability::from_auc_std(0.025), Stability::Good);
        assert_eq!(Stability::from_auc_std(0.04), Stability::Moderate);
        assert_eq!(Stability::from_auc_std(0.05), Stability::Unreliable);
    }

    #[test]
    fn test_cross_validate_reports_every_metric() {
        let data = separable_examples(400, 50);
        let result = cross_validate(&data, &trainer(), &CrossValidationConfig::default(), &CancellationToken::new())
            .unwrap();
        assert_eq!(result.folds.len(), 5);
        assert_eq!(result.trainer, "logistic_regression");
        for name in EvaluationMetrics::NAMES {
            assert!(result.metric(name).is_some(), "missing {}", name);
        }
        assert!(result.metric("auc").unwrap().mean > 0.95);
        assert!(result.folds.windows(2).all(|w| w[0].index < w[1].index));
    }

    #[test]
    fn test_time_series_cross_validate() {
        let data = separable_examples(500, 51);
        let config = CrossValidationConfig {
            folds: 3,
            ..Default::default()
        };
        let result = time_series_cross_validate(&data, &trainer(), &config, &CancellationToken::new()).unwrap();
        assert_eq!(result.folds.len(), 3);
        // expanding window
        assert!(result.folds[0].train_size < result.folds[2].train_size);
        assert_eq!(result.folds[0].train_size + result.folds[0].holdout_size, 200);
        assert_eq!(result.folds[0].holdout_size, 40);
    }

    #[test]
    fn test_k_fold_trainer_never_sees_scored_rows() {
        let data = separable_examples(200, 53);
        let config = CrossValidationConfig::default();
        let trainer = RecordingTrainer::default();
        cross_validate(&data, &trainer, &config, &CancellationToken::new()).unwrap();

        let folds = stratified_k_fold(&data, config.folds, config.seed).unwrap();
        let calls = trainer.calls.lock();
        assert_eq!(calls.len(), folds.len());
        for (fit_ts, val_ts) in calls.iter() {
            assert!(!val_ts.is_empty());
            assert!(fit_ts.is_disjoint(val_ts));
            let seen: BTreeSet<_> = fit_ts.union(val_ts).copied().collect();
            let fold = matching_fold(&folds, &seen);
            assert!(timestamps(&fold.validation).is_disjoint(&seen));
        }
    }

    #[test]
    fn test_walk_forward_tunes_on_tail_of_training_window() {
        let data = separable_examples(300, 54);
        let config = CrossValidationConfig {
            folds: 3,
            ..Default::default()
        };
        let trainer = RecordingTrainer::default();
        time_series_cross_validate(&data, &trainer, &config, &CancellationToken::new()).unwrap();

        let folds = walk_forward_splits(&data, config.folds, config.min_train_fraction).unwrap();
        for (fit_ts, val_ts) in trainer.calls.lock().iter() {
            let seen: BTreeSet<_> = fit_ts.union(val_ts).copied().collect();
            let fold = matching_fold(&folds, &seen);
            let scored_start = fold.validation.iter().map(|e| e.timestamp).min().unwrap();
            assert!(fit_ts.iter().max().unwrap() < val_ts.iter().min().unwrap());
            assert!(*val_ts.iter().max().unwrap() < scored_start);
        }
    }

    #[test]
    fn test_zero_inner_fraction_passes_no_validation() {
        let data = separable_examples(100, 55);
        let config = CrossValidationConfig {
            inner_validation_fraction: 0.0,
            ..Default::default()
        };
        let trainer = RecordingTrainer::default();
        let result = cross_validate(&data, &trainer, &config, &CancellationToken::new()).unwrap();
        assert!(trainer.calls.lock().iter().all(|(_, val)| val.is_empty()));
        assert!(result.folds.iter().all(|f| f.holdout_size == 0));

        let bad = CrossValidationConfig {
            inner_validation_fraction: 1.0,
            ..Default::default()
        };
        assert!(matches!(
            cross_validate(&data, &trainer, &bad, &CancellationToken::new()),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn test_cancelled_run_returns_error() {
        let data = separable_examples(200, 52);
        let token = CancellationToken::new();
        token.cancel();
        let err = cross_validate(&data, &trainer(), &CrossValidationConfig::default(), &token).unwrap_err();
        assert!(matches!(err, EngineError::Cancelled(_)));
    }
}
