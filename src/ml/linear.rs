use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::classifier::{Classifier, ModelTrainer, ModelType};
use super::metrics::{sigmoid, EvaluationMetrics};
use crate::error::{EngineError, Result};
use crate::types::{feature_matrix, feature_names, labels, FeatureVector, TrainingExample};

/// Features with a training std below this contribute nothing.
const MIN_STD: f64 = 1e-10;

/// Version stamped on coefficients before the registry assigns one.
pub const DRAFT_VERSION: &str = "draft";

/// Gradient-descent settings for the logistic baseline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinearTrainingOptions {
    pub learning_rate: f64,
    pub iterations: usize,
    pub l2_lambda: f64,
    /// Reweight classes to equal total mass
    pub class_weighting: bool,
    pub standardize: bool,
    pub min_samples: usize,
}

impl Default for LinearTrainingOptions {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            iterations: 1000,
            l2_lambda: 0.01,
            class_weighting: false,
            standardize: true,
            min_samples: 30,
        }
    }
}

impl LinearTrainingOptions {
    pub fn validate(&self) -> Result<()> {
        if self.learning_rate <= 0.0 || !self.learning_rate.is_finite() {
            return Err(EngineError::config("linear learning_rate must be > 0"));
        }
        if self.l2_lambda < 0.0 {
            return Err(EngineError::config("linear l2_lambda must be >= 0"));
        }
        Ok(())
    }
}

/// Logistic regression coefficients plus the frozen standardization stats
/// they were fitted against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCoefficients {
    pub intercept: f64,
    pub weights: BTreeMap<String, f64>,
    pub feature_means: BTreeMap<String, f64>,
    pub feature_stds: BTreeMap<String, f64>,
    pub version: String,
    pub training_samples: usize,
}

impl ModelCoefficients {
    fn standardized(&self, name: &str, value: f64) -> f64 {
        let mean = self.feature_means.get(name).copied().unwrap_or(0.0);
        let std = self.feature_stds.get(name).copied().unwrap_or(1.0);
        if !value.is_finite() || std <= MIN_STD {
            0.0
        } else {
            (value - mean) / std
        }
    }

    /// Raw linear score (log-odds).
    pub fn decision_function(&self, features: &FeatureVector) -> f64 {
        let mut z = self.intercept;
        for (name, weight) in &self.weights {
            let value = features.get(name).unwrap_or(f64::NAN);
            z += weight * self.standardized(name, value);
        }
        z
    }

    pub fn feature_count(&self) -> usize {
        self.weights.len()
    }
}

impl Classifier for ModelCoefficients {
    fn predict_proba(&self, features: &FeatureVector) -> f64 {
        sigmoid(self.decision_function(features))
    }

    fn model_type(&self) -> ModelType {
        ModelType::LogisticRegression
    }
}

/// Win probability in percent, [0, 100].
pub fn predict(features: &FeatureVector, coefficients: &ModelCoefficients) -> f64 {
    coefficients.predict_proba(features) * 100.0
}

pub fn evaluate(examples: &[TrainingExample], coefficients: &ModelCoefficients) -> EvaluationMetrics {
    super::metrics::evaluate_classifier(coefficients, examples)
}

/// Train the baseline from labelled examples
pub fn train_linear(
    examples: &[TrainingExample],
    options: &LinearTrainingOptions,
) -> Result<ModelCoefficients> {
    options.validate()?;
    let n = examples.len();
    if n < options.min_samples.max(1) {
        return Err(EngineError::InsufficientData(format!(
            "Not enough training samples: {} < {}",
            n, options.min_samples
        )));
    }

    let names = feature_names(examples)?;
    let features = feature_matrix(examples, &names)?;
    let y = Array1::from(labels(examples));
    let num_features = names.len();

    // Compute feature means and stds for normalization
    let (means, stds) = if options.standardize {
        let means = features
            .mean_axis(Axis(0))
            .ok_or_else(|| EngineError::InsufficientData("empty feature matrix".to_string()))?;
        (means, features.std_axis(Axis(0), 0.0))
    } else {
        (Array1::zeros(num_features), Array1::ones(num_features))
    };

    let mut normalized = features.clone();
    for j in 0..num_features {
        let std = stds[j];
        let mut column = normalized.column_mut(j);
        if std > MIN_STD {
            column.mapv_inplace(|v| (v - means[j]) / std);
        } else {
            column.fill(0.0);
        }
    }

    let sample_weights = class_weights(&y, options.class_weighting);
    let (coefficients, intercept) = fit_logistic_regression(&normalized, &y, &sample_weights, options);

    let to_map = |values: &Array1<f64>| -> BTreeMap<String, f64> {
        names.iter().cloned().zip(values.iter().copied()).collect()
    };

    let model = ModelCoefficients {
        intercept,
        weights: to_map(&coefficients),
        feature_means: to_map(&means),
        feature_stds: to_map(&stds),
        version: DRAFT_VERSION.to_string(),
        training_samples: n,
    };

    let wins = y.iter().filter(|&&v| v >= 0.5).count();
    info!(
        "Linear model trained: {} samples, {} features, {}/{} wins",
        n, num_features, wins, n
    );
    Ok(model)
}

/// Balanced weights give each class half of the total mass.
fn class_weights(y: &Array1<f64>, balanced: bool) -> Array1<f64> {
    let n = y.len() as f64;
    let positives = y.iter().filter(|&&v| v >= 0.5).count() as f64;
    let negatives = n - positives;
    if !balanced || positives == 0.0 || negatives == 0.0 {
        return Array1::ones(y.len());
    }
    let w_pos = n / (2.0 * positives);
    let w_neg = n / (2.0 * negatives);
    y.mapv(|v| if v >= 0.5 { w_pos } else { w_neg })
}

/// Fit logistic regression via full-batch gradient descent with L2 on the
/// weights (not the intercept).
fn fit_logistic_regression(
    features: &Array2<f64>,
    labels: &Array1<f64>,
    sample_weights: &Array1<f64>,
    options: &LinearTrainingOptions,
) -> (Array1<f64>, f64) {
    let num_features = features.ncols();
    let total_weight: f64 = sample_weights.sum().max(f64::MIN_POSITIVE);

    let mut coefficients = Array1::<f64>::zeros(num_features);
    let mut intercept = 0.0;

    for iter in 0..options.iterations {
        let z = features.dot(&coefficients) + intercept;
        let errors = (z.mapv(sigmoid) - labels) * sample_weights;

        let grad_coef = features.t().dot(&errors) / total_weight;
        let grad_intercept = errors.sum() / total_weight;

        intercept -= options.learning_rate * grad_intercept;
        coefficients = &coefficients
            - &((grad_coef + &coefficients * options.l2_lambda) * options.learning_rate);

        if iter % 250 == 0 {
            debug!("Linear GD iter {}: |grad_b|={:.6}", iter, grad_intercept.abs());
        }
    }

    (coefficients, intercept)
}

/// [`ModelTrainer`] adapter for the baseline.
#[derive(Debug, Clone, Default)]
pub struct LinearTrainer {
    pub options: LinearTrainingOptions,
}

impl LinearTrainer {
    pub fn new(options: LinearTrainingOptions) -> Self {
        Self { options }
    }
}

impl ModelTrainer for LinearTrainer {
    type Model = ModelCoefficients;

    fn fit(&self, train: &[TrainingExample], _validation: &[TrainingExample], _seed: u64) -> Result<ModelCoefficients> {
        train_linear(train, &self.options)
    }

    fn name(&self) -> &'static str {
        "logistic_regression"
    }
}
