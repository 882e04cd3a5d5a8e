use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::tree::{RegressionTree, TreeBuilder, TreeNode, TreeParams};
use super::GbmConfig;
use crate::error::{EngineError, Result};
use crate::ml::classifier::{Classifier, ModelTrainer, ModelType};
use crate::ml::metrics::{auc, evaluate_classifier, log_loss, logit, sigmoid, EvaluationMetrics};
use crate::ml::rng::SeededRng;
use crate::types::{feature_matrix, feature_names, labels, positive_rate, FeatureVector, TrainingExample};

const MIN_STD: f64 = 1e-10;
/// Hessian floor so near-certain rows keep the Newton step bounded.
const MIN_HESSIAN: f64 = 1e-7;

/// Loss and AUC after one boosting round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundMetrics {
    pub round: usize,
    pub train_loss: f64,
    pub train_auc: f64,
    pub val_loss: Option<f64>,
    pub val_auc: Option<f64>,
}

/// A trained boosted ensemble of regression trees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GbmModel {
    pub feature_names: Vec<String>,
    pub feature_means: Vec<f64>,
    pub feature_stds: Vec<f64>,
    pub base_score: f64,
    pub learning_rate: f64,
    pub trees: Vec<RegressionTree>,
    /// Normalized gain-times-samples importance, aligned with `feature_names`
    pub importance: Vec<f64>,
    pub best_iteration: usize,
    pub history: Vec<RoundMetrics>,
    pub config: GbmConfig,
    pub training_samples: usize,
}

impl GbmModel {
    fn standardize(&self, raw: &[f64]) -> Vec<f64> {
        raw.iter()
            .zip(self.feature_means.iter().zip(self.feature_stds.iter()))
            .map(|(&v, (&mean, &std))| standardize_value(v, mean, std))
            .collect()
    }

    /// Log-odds score.
    pub fn predict_raw(&self, features: &FeatureVector) -> f64 {
        let row = self.standardize(&features.aligned(&self.feature_names));
        self.score_row(&row)
    }

    fn score_row(&self, standardized: &[f64]) -> f64 {
        self.trees
            .iter()
            .fold(self.base_score, |acc, tree| acc + self.learning_rate * tree.predict(standardized))
    }

    pub fn predict_proba(&self, features: &FeatureVector) -> f64 {
        sigmoid(self.predict_raw(features))
    }

    pub fn evaluate(&self, examples: &[TrainingExample]) -> EvaluationMetrics {
        evaluate_classifier(self, examples)
    }

    /// `(feature, importance)` sorted by importance descending, ties by name.
    pub fn feature_importance(&self) -> Vec<(String, f64)> {
        let mut ranked: Vec<(String, f64)> = self
            .feature_names
            .iter()
            .cloned()
            .zip(self.importance.iter().copied())
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked
    }

    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }

    pub fn best_iteration(&self) -> usize {
        self.best_iteration
    }

    pub fn history(&self) -> &[RoundMetrics] {
        &self.history
    }
}

impl Classifier for GbmModel {
    fn predict_proba(&self, features: &FeatureVector) -> f64 {
        GbmModel::predict_proba(self, features)
    }

    fn model_type(&self) -> ModelType {
        ModelType::GradientBoosting
    }
}

fn standardize_value(value: f64, mean: f64, std: f64) -> f64 {
    if !value.is_finite() || std <= MIN_STD {
        0.0
    } else {
        (value - mean) / std
    }
}

fn standardize_matrix(raw: &Array2<f64>, means: &Array1<f64>, stds: &Array1<f64>) -> Array2<f64> {
    let mut out = raw.clone();
    for ((_, j), v) in out.indexed_iter_mut() {
        *v = standardize_value(*v, means[j], stds[j]);
    }
    out
}

/// Running log-odds for every row of `x` given the trees so far.
struct ScoreTracker {
    x: Array2<f64>,
    y: Vec<f64>,
    scores: Vec<f64>,
}

impl ScoreTracker {
    fn new(x: Array2<f64>, y: Vec<f64>, base_score: f64) -> Self {
        let n = y.len();
        Self {
            x,
            y,
            scores: vec![base_score; n],
        }
    }

    fn add_tree(&mut self, tree: &RegressionTree, learning_rate: f64) {
        for (i, row) in self.x.axis_iter(Axis(0)).enumerate() {
            let output = match row.as_slice() {
                Some(slice) => tree.predict(slice),
                None => tree.predict(&row.to_vec()),
            };
            self.scores[i] += learning_rate * output;
        }
    }

    fn probabilities(&self) -> Vec<f64> {
        self.scores.iter().map(|&s| sigmoid(s)).collect()
    }

    fn loss_and_auc(&self) -> (f64, f64) {
        let probs = self.probabilities();
        (log_loss(&probs, &self.y), auc(&probs, &self.y))
    }

    fn is_empty(&self) -> bool {
        self.y.is_empty()
    }
}

/// Train a boosted classifier. An empty `validation` slice disables early
/// stopping.
pub fn train_gbm(
    train: &[TrainingExample],
    validation: &[TrainingExample],
    config: &GbmConfig,
) -> Result<GbmModel> {
    config.validate()?;
    if train.is_empty() {
        return Err(EngineError::InsufficientData("gbm needs at least one training example".to_string()));
    }

    let names = feature_names(train)?;
    let n_features = names.len();
    let raw = feature_matrix(train, &names)?;

    let finite = raw.mapv(|v| if v.is_finite() { v } else { 0.0 });
    let means = finite
        .mean_axis(Axis(0))
        .ok_or_else(|| EngineError::InsufficientData("empty feature matrix".to_string()))?;
    let stds = finite.std_axis(Axis(0), 0.0);
    let x_train = standardize_matrix(&raw, &means, &stds);

    let positive = positive_rate(train);
    let base_score = logit(positive);

    let mut model = GbmModel {
        feature_names: names.clone(),
        feature_means: means.to_vec(),
        feature_stds: stds.to_vec(),
        base_score,
        learning_rate: config.learning_rate,
        trees: Vec::new(),
        importance: vec![0.0; n_features],
        best_iteration: 0,
        history: Vec::new(),
        config: config.clone(),
        training_samples: train.len(),
    };

    if positive == 0.0 || positive == 1.0 || config.num_trees == 0 {
        info!(
            "GBM prior-only model: {} samples, positive rate {:.3}",
            train.len(),
            positive
        );
        return Ok(model);
    }

    let mut train_scores = ScoreTracker::new(x_train, labels(train), base_score);
    let x_val = if validation.is_empty() {
        Array2::zeros((0, n_features))
    } else {
        standardize_matrix(&feature_matrix(validation, &names)?, &means, &stds)
    };
    let mut val_scores = ScoreTracker::new(x_val, labels(validation), base_score);
    let early_stopping = !val_scores.is_empty() && config.early_stopping_rounds > 0;

    let params = TreeParams {
        max_depth: config.max_depth,
        min_samples_leaf: config.min_samples_leaf,
        min_samples_split: config.min_samples_split,
        lambda: config.l2_regularization,
    };
    let n = train.len();
    let rows_per_tree = ((n as f64 * config.subsample).round() as usize).max(1);
    let cols_per_tree = ((n_features as f64 * config.colsample).round() as usize).clamp(1, n_features);

    let mut rng = SeededRng::new(config.seed);
    let mut best_loss = f64::INFINITY;
    let mut best_iteration = 0;
    let mut rounds_without_improvement = 0;

    for round in 0..config.num_trees {
        let probs = train_scores.probabilities();
        let grad: Vec<f64> = probs.iter().zip(train_scores.y.iter()).map(|(p, y)| p - y).collect();
        let hess: Vec<f64> = probs.iter().map(|p| (p * (1.0 - p)).max(MIN_HESSIAN)).collect();

        let rows = rng.sample_with_replacement(n, rows_per_tree);
        let cols = rng.sample_without_replacement(n_features, cols_per_tree);

        let tree = TreeBuilder::new(&train_scores.x, &grad, &hess, &cols, params).build(&rows);
        train_scores.add_tree(&tree, config.learning_rate);
        model.trees.push(tree);

        let (train_loss, train_auc) = train_scores.loss_and_auc();
        let (val_loss, val_auc) = if val_scores.is_empty() {
            (None, None)
        } else {
            val_scores.add_tree(&model.trees[round], config.learning_rate);
            let (loss, auc) = val_scores.loss_and_auc();
            (Some(loss), Some(auc))
        };

        debug!(
            "GBM round {}: train_loss={:.5} train_auc={:.4} val_loss={:?}",
            round + 1,
            train_loss,
            train_auc,
            val_loss
        );
        model.history.push(RoundMetrics {
            round: round + 1,
            train_loss,
            train_auc,
            val_loss,
            val_auc,
        });

        if early_stopping {
            let loss = val_loss.unwrap_or(f64::INFINITY);
            if loss < best_loss {
                best_loss = loss;
                best_iteration = round + 1;
                rounds_without_improvement = 0;
            } else {
                rounds_without_improvement += 1;
                if rounds_without_improvement >= config.early_stopping_rounds {
                    info!(
                        "GBM early stop at round {} (best {}, val_loss {:.5})",
                        round + 1,
                        best_iteration,
                        best_loss
                    );
                    break;
                }
            }
        }
    }

    if early_stopping {
        model.trees.truncate(best_iteration);
        model.best_iteration = best_iteration;
    } else {
        model.best_iteration = model.trees.len();
    }
    model.importance = accumulate_importance(&model.trees, n_features);

    info!(
        "GBM trained: {} samples, {} features, {} trees",
        n,
        n_features,
        model.trees.len()
    );
    Ok(model)
}

/// Sum of `gain × samples` over every split, normalized to 1.
fn accumulate_importance(trees: &[RegressionTree], n_features: usize) -> Vec<f64> {
    let mut importance = vec![0.0; n_features];
    for tree in trees {
        for node in tree.nodes() {
            if let TreeNode::Split { feature, gain, samples, .. } = node {
                importance[*feature] += gain * *samples as f64;
            }
        }
    }
    let total: f64 = importance.iter().sum();
    if total > 0.0 {
        for v in importance.iter_mut() {
            *v /= total;
        }
    }
    importance
}

/// [`ModelTrainer`] adapter; the fit seed overrides `config.seed`.
#[derive(Debug, Clone, Default)]
pub struct GbmTrainer {
    pub config: GbmConfig,
}

impl GbmTrainer {
    pub fn new(config: GbmConfig) -> Self {
        Self { config }
    }
}

impl ModelTrainer for GbmTrainer {
    type Model = GbmModel;

    fn fit(&self, train: &[TrainingExample], validation: &[TrainingExample], seed: u64) -> Result<GbmModel> {
        let config = GbmConfig {
            seed,
            ..self.config.clone()
        };
        train_gbm(train, validation, &config)
    }

    fn name(&self) -> &'static str {
        "gradient_boosting"
    }
}
