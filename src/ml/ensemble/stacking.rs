use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::normalize_weights;
use crate::error::{EngineError, Result};
use crate::ml::classifier::{Classifier, ModelTrainer, ModelType};
use crate::ml::gbm::{train_gbm, GbmConfig, GbmModel};
use crate::ml::linear::{train_linear, LinearTrainingOptions, ModelCoefficients};
use crate::ml::metrics::{evaluate_classifier, sigmoid, EvaluationMetrics};
use crate::ml::split::stratified_k_fold;
use crate::types::{labels, FeatureVector, TrainingExample};

const MIN_STD: f64 = 1e-10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackingMethod {
    SimpleAverage,
    WeightedAverage,
    MetaLearner,
}

/// Where the meta-learner's training inputs come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BasePredictionSource {
    /// Base models score the same rows they were fitted on
    InSample,
    /// Each row is scored by base models that never saw it
    OutOfFold { folds: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackingConfig {
    pub method: StackingMethod,
    pub linear: LinearTrainingOptions,
    pub gbm: GbmConfig,
    pub base_predictions: BasePredictionSource,
    pub meta_iterations: usize,
    pub meta_learning_rate: f64,
    pub meta_l2: f64,
}

impl Default for StackingConfig {
    fn default() -> Self {
        Self {
            method: StackingMethod::MetaLearner,
            linear: LinearTrainingOptions::default(),
            gbm: GbmConfig::default(),
            base_predictions: BasePredictionSource::InSample,
            meta_iterations: 500,
            meta_learning_rate: 0.01,
            meta_l2: 0.01,
        }
    }
}

impl StackingConfig {
    pub fn validate(&self) -> Result<()> {
        self.linear.validate()?;
        self.gbm.validate()?;
        if let BasePredictionSource::OutOfFold { folds } = self.base_predictions {
            if folds < 2 {
                return Err(EngineError::config("out-of-fold stacking needs at least 2 folds"));
            }
        }
        if self.meta_learning_rate <= 0.0 || !self.meta_learning_rate.is_finite() {
            return Err(EngineError::config("meta_learning_rate must be > 0"));
        }
        Ok(())
    }
}

/// Blend weights. For the averaging methods `intercept` is 0 and the weights
/// act on raw probabilities; for the meta-learner they act on standardized
/// base predictions and the sum goes through a sigmoid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetaWeights {
    pub logistic: f64,
    pub gbm: f64,
    pub intercept: f64,
}

/// Mean/std of each base model's predictions on the meta-training rows.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BaseStats {
    pub logistic_mean: f64,
    pub logistic_std: f64,
    pub gbm_mean: f64,
    pub gbm_std: f64,
}

impl Default for BaseStats {
    fn default() -> Self {
        Self {
            logistic_mean: 0.0,
            logistic_std: 1.0,
            gbm_mean: 0.0,
            gbm_std: 1.0,
        }
    }
}

fn z_score(value: f64, mean: f64, std: f64) -> f64 {
    if std <= MIN_STD {
        0.0
    } else {
        (value - mean) / std
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackedModel {
    pub logistic_model: ModelCoefficients,
    pub gbm_model: GbmModel,
    pub method: StackingMethod,
    pub meta_weights: MetaWeights,
    pub base_stats: BaseStats,
}

impl StackedModel {
    /// `(logistic, gbm)` probabilities in [0, 1].
    pub fn base_predictions(&self, features: &FeatureVector) -> (f64, f64) {
        (
            self.logistic_model.predict_proba(features),
            self.gbm_model.predict_proba(features),
        )
    }

    /// Win probability in [0, 1].
    pub fn predict(&self, features: &FeatureVector) -> f64 {
        let (lin, gbm) = self.base_predictions(features);
        self.combine(lin, gbm)
    }

    fn combine(&self, lin: f64, gbm: f64) -> f64 {
        let w = &self.meta_weights;
        match self.method {
            StackingMethod::SimpleAverage | StackingMethod::WeightedAverage => w.logistic * lin + w.gbm * gbm,
            StackingMethod::MetaLearner => {
                let s = &self.base_stats;
                let z_lin = z_score(lin, s.logistic_mean, s.logistic_std);
                let z_gbm = z_score(gbm, s.gbm_mean, s.gbm_std);
                sigmoid(w.intercept + w.logistic * z_lin + w.gbm * z_gbm)
            }
        }
    }
}

impl Classifier for StackedModel {
    fn predict_proba(&self, features: &FeatureVector) -> f64 {
        self.predict(features)
    }

    fn model_type(&self) -> ModelType {
        ModelType::Stacked
    }
}

/// Stacked model plus a side-by-side validation report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackingOutcome {
    pub model: StackedModel,
    pub stacked_metrics: EvaluationMetrics,
    pub logistic_metrics: EvaluationMetrics,
    pub gbm_metrics: EvaluationMetrics,
}

/// Train both base learners and combine them with `config.method`.
pub fn train_stacked(
    train: &[TrainingExample],
    validation: &[TrainingExample],
    config: &StackingConfig,
) -> Result<StackingOutcome> {
    config.validate()?;

    let logistic_model = train_linear(train, &config.linear)?;
    let gbm_model = train_gbm(train, validation, &config.gbm)?;

    let logistic_val = evaluate_classifier(&logistic_model, validation);
    let gbm_val = evaluate_classifier(&gbm_model, validation);

    let (meta_weights, base_stats) = match config.method {
        StackingMethod::SimpleAverage => (
            MetaWeights {
                logistic: 0.5,
                gbm: 0.5,
                intercept: 0.0,
            },
            BaseStats::default(),
        ),
        StackingMethod::WeightedAverage => {
            let aucs = if validation.is_empty() {
                warn!("Stacking: no validation rows, weighting by training AUC");
                [
                    evaluate_classifier(&logistic_model, train).auc,
                    evaluate_classifier(&gbm_model, train).auc,
                ]
            } else {
                [logistic_val.auc, gbm_val.auc]
            };
            let w = normalize_weights(&aucs);
            (
                MetaWeights {
                    logistic: w[0],
                    gbm: w[1],
                    intercept: 0.0,
                },
                BaseStats::default(),
            )
        }
        StackingMethod::MetaLearner => {
            let (lin_preds, gbm_preds, targets) = match config.base_predictions {
                BasePredictionSource::InSample => {
                    let lin: Vec<f64> = train.iter().map(|e| logistic_model.predict_proba(&e.features)).collect();
                    let gbm: Vec<f64> = train.iter().map(|e| gbm_model.predict_proba(&e.features)).collect();
                    (lin, gbm, labels(train))
                }
                BasePredictionSource::OutOfFold { folds } => out_of_fold_predictions(train, config, folds)?,
            };
            fit_meta_learner(&lin_preds, &gbm_preds, &targets, config)?
        }
    };

    let model = StackedModel {
        logistic_model,
        gbm_model,
        method: config.method,
        meta_weights,
        base_stats,
    };
    let stacked_val = evaluate_classifier(&model, validation);

    info!(
        "Stacked model trained ({:?}): val auc stacked={:.4} logistic={:.4} gbm={:.4}",
        config.method, stacked_val.auc, logistic_val.auc, gbm_val.auc
    );

    Ok(StackingOutcome {
        model,
        stacked_metrics: stacked_val,
        logistic_metrics: logistic_val,
        gbm_metrics: gbm_val,
    })
}

/// Base predictions for every training row from models fitted on the other
/// folds. Rows come back grouped by fold, with matching targets.
fn out_of_fold_predictions(
    train: &[TrainingExample],
    config: &StackingConfig,
    folds: usize,
) -> Result<(Vec<f64>, Vec<f64>, Vec<f64>)> {
    let mut lin_preds = Vec::with_capacity(train.len());
    let mut gbm_preds = Vec::with_capacity(train.len());
    let mut targets = Vec::with_capacity(train.len());

    for fold in stratified_k_fold(train, folds, config.gbm.seed)? {
        let lin = train_linear(&fold.train, &config.linear)?;
        let gbm = train_gbm(&fold.train, &[], &config.gbm)?;
        for example in &fold.validation {
            lin_preds.push(lin.predict_proba(&example.features));
            gbm_preds.push(gbm.predict_proba(&example.features));
            targets.push(example.target());
        }
        debug!("Stacking OOF fold {}: {} rows scored", fold.index, fold.validation.len());
    }

    Ok((lin_preds, gbm_preds, targets))
}

fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 1.0);
    }
    let arr = Array1::from(values.to_vec());
    (arr.mean().unwrap_or(0.0), arr.std(0.0))
}

/// Logistic regression over the two standardized base predictions.
fn fit_meta_learner(
    lin_preds: &[f64],
    gbm_preds: &[f64],
    targets: &[f64],
    config: &StackingConfig,
) -> Result<(MetaWeights, BaseStats)> {
    let n = targets.len();
    if n == 0 {
        return Err(EngineError::InsufficientData("meta-learner has no rows".to_string()));
    }

    let (logistic_mean, logistic_std) = mean_std(lin_preds);
    let (gbm_mean, gbm_std) = mean_std(gbm_preds);
    let stats = BaseStats {
        logistic_mean,
        logistic_std,
        gbm_mean,
        gbm_std,
    };

    let mut data = Vec::with_capacity(n * 2);
    for (l, g) in lin_preds.iter().zip(gbm_preds.iter()) {
        data.push(z_score(*l, logistic_mean, logistic_std));
        data.push(z_score(*g, gbm_mean, gbm_std));
    }
    let x = Array2::from_shape_vec((n, 2), data)?;
    let y = Array1::from(targets.to_vec());

    let mut w = Array1::<f64>::zeros(2);
    let mut b = 0.0;
    for _ in 0..config.meta_iterations {
        let errors = (x.dot(&w) + b).mapv(sigmoid) - &y;
        let grad_w = x.t().dot(&errors) / n as f64 + &w * config.meta_l2;
        let grad_b = errors.sum() / n as f64;
        w = &w - &(grad_w * config.meta_learning_rate);
        b -= config.meta_learning_rate * grad_b;
    }

    debug!("Meta-learner weights: logistic={:.4} gbm={:.4} intercept={:.4}", w[0], w[1], b);
    Ok((
        MetaWeights {
            logistic: w[0],
            gbm: w[1],
            intercept: b,
        },
        stats,
    ))
}

/// [`ModelTrainer`] adapter; the fit seed drives the boosted base model.
#[derive(Debug, Clone, Default)]
pub struct StackingTrainer {
    pub config: StackingConfig,
}

impl StackingTrainer {
    pub fn new(config: StackingConfig) -> Self {
        Self { config }
    }
}

impl ModelTrainer for StackingTrainer {
    type Model = StackedModel;

    fn fit(&self, train: &[TrainingExample], validation: &[TrainingExample], seed: u64) -> Result<StackedModel> {
        let mut config = self.config.clone();
        config.gbm.seed = seed;
        Ok(train_stacked(train, validation, &config)?.model)
    }

    fn name(&self) -> &'static str {
        "stacked"
    }
}
