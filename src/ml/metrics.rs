use serde::{Deserialize, Serialize};

use super::classifier::Classifier;
use crate::types::TrainingExample;

/// Probabilities are clamped to [EPS, 1 - EPS] before taking logs.
pub const PROBABILITY_EPSILON: f64 = 1e-15;

pub const CALIBRATION_BUCKETS: usize = 10;

pub fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

/// Log-odds of `p`, with `p` clamped away from 0 and 1.
pub fn logit(p: f64) -> f64 {
    let p = clamp_probability(p);
    (p / (1.0 - p)).ln()
}

pub fn clamp_probability(p: f64) -> f64 {
    if p.is_nan() {
        return 0.5;
    }
    p.clamp(PROBABILITY_EPSILON, 1.0 - PROBABILITY_EPSILON)
}

/// Area under the ROC curve via the Mann-Whitney statistic, ties sharing the
/// average rank. Returns 0.5 when either class is absent.
pub fn auc(scores: &[f64], labels: &[f64]) -> f64 {
    let n = scores.len().min(labels.len());
    let n_pos = labels[..n].iter().filter(|&&y| y >= 0.5).count();
    let n_neg = n - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return 0.5;
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut rank_sum_pos = 0.0;
    let mut i = 0;
    while i < n {
        let mut j = i;
        while j + 1 < n && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        // ranks are 1-based; the tie group [i, j] shares the average
        let avg_rank = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            if labels[idx] >= 0.5 {
                rank_sum_pos += avg_rank;
            }
        }
        i = j + 1;
    }

    let n_pos_f = n_pos as f64;
    (rank_sum_pos - n_pos_f * (n_pos_f + 1.0) / 2.0) / (n_pos_f * n_neg as f64)
}

/// Mean binary cross-entropy. 0 for empty input.
pub fn log_loss(probabilities: &[f64], labels: &[f64]) -> f64 {
    let n = probabilities.len().min(labels.len());
    if n == 0 {
        return 0.0;
    }
    let total: f64 = probabilities
        .iter()
        .zip(labels.iter())
        .map(|(&p, &y)| {
            let p = clamp_probability(p);
            -(y * p.ln() + (1.0 - y) * (1.0 - p).ln())
        })
        .sum();
    total / n as f64
}

/// Count-weighted mean absolute gap between mean predicted probability and
/// observed positive frequency over equal-width probability buckets.
pub fn calibration_error(probabilities: &[f64], labels: &[f64], buckets: usize) -> f64 {
    let n = probabilities.len().min(labels.len());
    if n == 0 || buckets == 0 {
        return 0.0;
    }

    let mut sum_pred = vec![0.0; buckets];
    let mut sum_true = vec![0.0; buckets];
    let mut counts = vec![0usize; buckets];

    for (&p, &y) in probabilities.iter().zip(labels.iter()) {
        let p = if p.is_nan() { 0.5 } else { p.clamp(0.0, 1.0) };
        let b = ((p * buckets as f64) as usize).min(buckets - 1);
        sum_pred[b] += p;
        sum_true[b] += y;
        counts[b] += 1;
    }

    let mut error = 0.0;
    for b in 0..buckets {
        if counts[b] == 0 {
            continue;
        }
        let c = counts[b] as f64;
        error += (c / n as f64) * (sum_pred[b] / c - sum_true[b] / c).abs();
    }
    error
}

/// Standard binary-classification report. All rates are fractions in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    pub auc: f64,
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub calibration_error: f64,
    pub log_loss: f64,
    pub samples: usize,
}

impl Default for EvaluationMetrics {
    fn default() -> Self {
        Self {
            auc: 0.5,
            accuracy: 0.0,
            precision: 0.0,
            recall: 0.0,
            f1: 0.0,
            calibration_error: 0.0,
            log_loss: 0.0,
            samples: 0,
        }
    }
}

impl EvaluationMetrics {
    /// Names of the metrics aggregated by cross-validation.
    pub const NAMES: [&'static str; 6] = ["auc", "accuracy", "precision", "recall", "f1", "calibration_error"];

    /// Metrics at a 0.5 decision threshold.
    pub fn from_predictions(probabilities: &[f64], labels: &[f64]) -> Self {
        let n = probabilities.len().min(labels.len());
        if n == 0 {
            return Self::default();
        }

        let (mut tp, mut fp, mut tn, mut fn_) = (0usize, 0usize, 0usize, 0usize);
        for (&p, &y) in probabilities.iter().zip(labels.iter()) {
            let predicted = p >= 0.5;
            let actual = y >= 0.5;
            match (predicted, actual) {
                (true, true) => tp += 1,
                (true, false) => fp += 1,
                (false, false) => tn += 1,
                (false, true) => fn_ += 1,
            }
        }

        let accuracy = (tp + tn) as f64 / n as f64;
        let precision = if tp + fp > 0 { tp as f64 / (tp + fp) as f64 } else { 0.0 };
        let recall = if tp + fn_ > 0 { tp as f64 / (tp + fn_) as f64 } else { 0.0 };
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };

        Self {
            auc: auc(probabilities, labels),
            accuracy,
            precision,
            recall,
            f1,
            calibration_error: calibration_error(probabilities, labels, CALIBRATION_BUCKETS),
            log_loss: log_loss(probabilities, labels),
            samples: n,
        }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        match name {
            "auc" => Some(self.auc),
            "accuracy" => Some(self.accuracy),
            "precision" => Some(self.precision),
            "recall" => Some(self.recall),
            "f1" => Some(self.f1),
            "calibration_error" => Some(self.calibration_error),
            "log_loss" => Some(self.log_loss),
            _ => None,
        }
    }
}

/// Evaluate any classifier on labelled examples.
pub fn evaluate_classifier(model: &dyn Classifier, examples: &[TrainingExample]) -> EvaluationMetrics {
    let probabilities: Vec<f64> = examples.iter().map(|e| model.predict_proba(&e.features)).collect();
    let labels: Vec<f64> = examples.iter().map(TrainingExample::target).collect();
    EvaluationMetrics::from_predictions(&probabilities, &labels)
}
