use serde::{Deserialize, Serialize};
use tracing::debug;

use super::rng::SeededRng;
use crate::error::{EngineError, Result};
use crate::types::{positive_rate, TrainingExample};

/// Share of the data kept as the first training window in walk-forward mode.
pub const MIN_WALK_FORWARD_TRAIN_FRACTION: f64 = 0.4;

/// Default tolerance for per-partition positive-rate drift.
pub const STRATIFICATION_TOLERANCE: f64 = 0.02;

const RATIO_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SplitRatios {
    pub train: f64,
    pub validation: f64,
    pub test: f64,
}

impl Default for SplitRatios {
    fn default() -> Self {
        Self {
            train: 0.7,
            validation: 0.15,
            test: 0.15,
        }
    }
}

impl SplitRatios {
    pub fn new(train: f64, validation: f64, test: f64) -> Self {
        Self { train, validation, test }
    }

    pub fn validate(&self) -> Result<()> {
        let parts = [self.train, self.validation, self.test];
        if parts.iter().any(|r| !r.is_finite() || *r < 0.0) {
            return Err(EngineError::config(format!("split ratios must be non-negative: {:?}", self)));
        }
        let sum: f64 = parts.iter().sum();
        if (sum - 1.0).abs() > RATIO_TOLERANCE {
            return Err(EngineError::config(format!("split ratios must sum to 1, got {:.6}", sum)));
        }
        Ok(())
    }

    /// Partition sizes for `n` items; rounding remainder goes to test.
    fn sizes(&self, n: usize) -> (usize, usize, usize) {
        let train = ((n as f64) * self.train).round() as usize;
        let train = train.min(n);
        let validation = (((n as f64) * self.validation).round() as usize).min(n - train);
        (train, validation, n - train - validation)
    }
}

/// Three-way partition of a dataset.
#[derive(Debug, Clone, Default)]
pub struct SplitResult {
    pub train: Vec<TrainingExample>,
    pub validation: Vec<TrainingExample>,
    pub test: Vec<TrainingExample>,
}

/// One train/validation fold.
#[derive(Debug, Clone)]
pub struct Fold {
    pub index: usize,
    pub train: Vec<TrainingExample>,
    pub validation: Vec<TrainingExample>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassBalance {
    pub positives: usize,
    pub negatives: usize,
    pub positive_rate: f64,
}

pub fn class_balance(examples: &[TrainingExample]) -> ClassBalance {
    let positives = examples.iter().filter(|e| e.label).count();
    ClassBalance {
        positives,
        negatives: examples.len() - positives,
        positive_rate: positive_rate(examples),
    }
}

fn pick(examples: &[TrainingExample], indices: &[usize]) -> Vec<TrainingExample> {
    indices.iter().map(|&i| examples[i].clone()).collect()
}

/// Shuffled three-way split.
pub fn train_val_test_split(
    examples: &[TrainingExample],
    ratios: SplitRatios,
    seed: u64,
) -> Result<SplitResult> {
    ratios.validate()?;
    let mut indices: Vec<usize> = (0..examples.len()).collect();
    SeededRng::new(seed).shuffle(&mut indices);

    let (n_train, n_val, _) = ratios.sizes(indices.len());
    Ok(SplitResult {
        train: pick(examples, &indices[..n_train]),
        validation: pick(examples, &indices[n_train..n_train + n_val]),
        test: pick(examples, &indices[n_train + n_val..]),
    })
}

/// Three-way split preserving the positive rate in every partition.
pub fn stratified_split(
    examples: &[TrainingExample],
    ratios: SplitRatios,
    seed: u64,
) -> Result<SplitResult> {
    ratios.validate()?;
    let mut rng = SeededRng::new(seed);

    let (mut positives, mut negatives): (Vec<usize>, Vec<usize>) =
        (0..examples.len()).partition(|&i| examples[i].label);
    rng.shuffle(&mut positives);
    rng.shuffle(&mut negatives);

    let mut train = Vec::new();
    let mut validation = Vec::new();
    let mut test = Vec::new();
    for class in [&positives, &negatives] {
        let (n_train, n_val, _) = ratios.sizes(class.len());
        train.extend_from_slice(&class[..n_train]);
        validation.extend_from_slice(&class[n_train..n_train + n_val]);
        test.extend_from_slice(&class[n_train + n_val..]);
    }
    rng.shuffle(&mut train);
    rng.shuffle(&mut validation);
    rng.shuffle(&mut test);

    Ok(SplitResult {
        train: pick(examples, &train),
        validation: pick(examples, &validation),
        test: pick(examples, &test),
    })
}

/// Indices in chronological order; ties keep input order.
fn chronological_order(examples: &[TrainingExample]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..examples.len()).collect();
    order.sort_by_key(|&i| examples[i].timestamp);
    order
}

/// Contiguous chronological split: oldest data trains, newest data tests.
pub fn temporal_split(examples: &[TrainingExample], ratios: SplitRatios) -> Result<SplitResult> {
    ratios.validate()?;
    let order = chronological_order(examples);
    let (n_train, n_val, _) = ratios.sizes(order.len());
    Ok(SplitResult {
        train: pick(examples, &order[..n_train]),
        validation: pick(examples, &order[n_train..n_train + n_val]),
        test: pick(examples, &order[n_train + n_val..]),
    })
}

fn check_fold_count(n: usize, k: usize) -> Result<()> {
    if k < 2 {
        return Err(EngineError::config("number of folds must be at least 2"));
    }
    if n < k {
        return Err(EngineError::InsufficientData(format!(
            "{} examples cannot fill {} folds",
            n, k
        )));
    }
    Ok(())
}

fn folds_from_assignment(examples: &[TrainingExample], assignment: &[Vec<usize>]) -> Vec<Fold> {
    (0..assignment.len())
        .map(|f| {
            let train: Vec<usize> = assignment
                .iter()
                .enumerate()
                .filter(|(g, _)| *g != f)
                .flat_map(|(_, members)| members.iter().copied())
                .collect();
            Fold {
                index: f,
                train: pick(examples, &train),
                validation: pick(examples, &assignment[f]),
            }
        })
        .collect()
}

/// Plain shuffled k-fold.
pub fn k_fold(examples: &[TrainingExample], k: usize, seed: u64) -> Result<Vec<Fold>> {
    check_fold_count(examples.len(), k)?;
    let mut indices: Vec<usize> = (0..examples.len()).collect();
    SeededRng::new(seed).shuffle(&mut indices);

    let mut assignment = vec![Vec::new(); k];
    for (pos, &idx) in indices.iter().enumerate() {
        assignment[pos % k].push(idx);
    }
    Ok(folds_from_assignment(examples, &assignment))
}

/// Stratified k-fold: positives and negatives are shuffled independently and
/// dealt round-robin, negatives continuing where positives stopped so fold
/// sizes stay balanced.
pub fn stratified_k_fold(examples: &[TrainingExample], k: usize, seed: u64) -> Result<Vec<Fold>> {
    check_fold_count(examples.len(), k)?;
    let mut rng = SeededRng::new(seed);

    let (mut positives, mut negatives): (Vec<usize>, Vec<usize>) =
        (0..examples.len()).partition(|&i| examples[i].label);
    rng.shuffle(&mut positives);
    rng.shuffle(&mut negatives);

    let mut assignment = vec![Vec::new(); k];
    for (pos, &idx) in positives.iter().chain(negatives.iter()).enumerate() {
        assignment[pos % k].push(idx);
    }

    debug!(
        "Stratified {}-fold: {} positives, {} negatives",
        k,
        positives.len(),
        negatives.len()
    );
    Ok(folds_from_assignment(examples, &assignment))
}

/// Expanding-window walk-forward folds over chronologically sorted data.
///
/// The first training window holds at least `min_train_fraction` of the data;
/// each validation window is the next non-overlapping block and the last one
/// runs to the end. Training windows never reach the validation start.
pub fn walk_forward_splits(
    examples: &[TrainingExample],
    n_splits: usize,
    min_train_fraction: f64,
) -> Result<Vec<Fold>> {
    if n_splits == 0 {
        return Err(EngineError::config("walk-forward needs at least one split"));
    }
    if !(0.0..1.0).contains(&min_train_fraction) {
        return Err(EngineError::config(format!(
            "min_train_fraction must be in [0, 1), got {}",
            min_train_fraction
        )));
    }

    let n = examples.len();
    let min_train = ((n as f64 * min_train_fraction).ceil() as usize).max(1);
    let remaining = n.saturating_sub(min_train);
    if remaining < n_splits {
        return Err(EngineError::InsufficientData(format!(
            "{} examples leave {} for {} walk-forward windows",
            n, remaining, n_splits
        )));
    }

    let order = chronological_order(examples);
    let window = remaining / n_splits;

    let folds = (0..n_splits)
        .map(|i| {
            let start = min_train + i * window;
            let end = if i == n_splits - 1 { n } else { start + window };
            debug!("Walk-forward window {}: train [0, {}), validate [{}, {})", i + 1, start, start, end);
            Fold {
                index: i,
                train: pick(examples, &order[..start]),
                validation: pick(examples, &order[start..end]),
            }
        })
        .collect();
    Ok(folds)
}

/// Largest absolute gap between a fold's validation positive rate and the
/// global rate.
pub fn max_stratification_drift(folds: &[Fold], global_rate: f64) -> f64 {
    folds
        .iter()
        .filter(|f| !f.validation.is_empty())
        .map(|f| (positive_rate(&f.validation) - global_rate).abs())
        .fold(0.0, f64::max)
}

pub fn check_stratification(folds: &[Fold], global_rate: f64, tolerance: f64) -> bool {
    max_stratification_drift(folds, global_rate) <= tolerance
}
