use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use super::importance::FeatureImportance;
use crate::error::{EngineError, Result};
use crate::types::{feature_matrix, feature_names, TrainingExample};

const MIN_STD: f64 = 1e-10;

/// Symmetric Pearson correlation matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationMatrix {
    pub names: Vec<String>,
    pub values: Vec<Vec<f64>>,
}

impl CorrelationMatrix {
    pub fn get(&self, a: &str, b: &str) -> Option<f64> {
        let i = self.names.iter().position(|n| n == a)?;
        let j = self.names.iter().position(|n| n == b)?;
        Some(self.values[i][j])
    }
}

fn finite_matrix(examples: &[TrainingExample]) -> Result<(Vec<String>, Array2<f64>)> {
    let names = feature_names(examples)?;
    let x = feature_matrix(examples, &names)?.mapv(|v| if v.is_finite() { v } else { 0.0 });
    Ok((names, x))
}

/// Pearson correlation between every pair of features. Pairs involving a
/// zero-variance column are 0; the diagonal is 1.
pub fn correlation_matrix(examples: &[TrainingExample]) -> Result<CorrelationMatrix> {
    let (names, x) = finite_matrix(examples)?;
    let n_features = names.len();
    let means = x
        .mean_axis(Axis(0))
        .ok_or_else(|| EngineError::InsufficientData("empty feature matrix".to_string()))?;
    let centered = &x - &means;
    let stds = x.std_axis(Axis(0), 0.0);
    let n = x.nrows() as f64;

    let mut values = vec![vec![0.0; n_features]; n_features];
    for i in 0..n_features {
        values[i][i] = 1.0;
        for j in (i + 1)..n_features {
            let r = if stds[i] <= MIN_STD || stds[j] <= MIN_STD {
                0.0
            } else {
                let cov = centered.column(i).dot(&centered.column(j)) / n;
                (cov / (stds[i] * stds[j])).clamp(-1.0, 1.0)
            };
            values[i][j] = r;
            values[j][i] = r;
        }
    }

    Ok(CorrelationMatrix { names, values })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PruneReport {
    pub kept: Vec<String>,
    /// `(dropped, kept_partner, correlation)`
    pub dropped: Vec<(String, String, f64)>,
}

/// Drop the lower-ranked feature of every pair whose |correlation| exceeds
/// `threshold`. Features missing from `ranking` rank last; ties drop the
/// name that sorts later.
pub fn prune_correlated_features(
    examples: &[TrainingExample],
    threshold: f64,
    ranking: &[FeatureImportance],
) -> Result<PruneReport> {
    if !(0.0..=1.0).contains(&threshold) {
        return Err(EngineError::config("correlation threshold must be in [0, 1]"));
    }
    let matrix = correlation_matrix(examples)?;
    let score: BTreeMap<&str, f64> = ranking.iter().map(|r| (r.feature.as_str(), r.importance)).collect();
    let rank_of = |name: &str| score.get(name).copied().unwrap_or(f64::NEG_INFINITY);

    let mut removed: BTreeSet<usize> = BTreeSet::new();
    let mut dropped = Vec::new();
    let names = &matrix.names;

    for i in 0..names.len() {
        for j in (i + 1)..names.len() {
            if removed.contains(&i) || removed.contains(&j) {
                continue;
            }
            let r = matrix.values[i][j];
            if r.abs() <= threshold {
                continue;
            }
            let (drop, keep) = if rank_of(&names[j]) > rank_of(&names[i]) {
                (i, j)
            } else if rank_of(&names[i]) > rank_of(&names[j]) {
                (j, i)
            } else if names[i] > names[j] {
                (i, j)
            } else {
                (j, i)
            };
            debug!("Pruning {} (|r|={:.3} with {})", names[drop], r.abs(), names[keep]);
            removed.insert(drop);
            dropped.push((names[drop].clone(), names[keep].clone(), r));
        }
    }

    let kept: Vec<String> = names
        .iter()
        .enumerate()
        .filter(|(i, _)| !removed.contains(i))
        .map(|(_, n)| n.clone())
        .collect();
    info!("Correlation pruning at {:.2}: kept {}, dropped {}", threshold, kept.len(), dropped.len());
    Ok(PruneReport { kept, dropped })
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionCriteria {
    pub top_k: Option<usize>,
    pub min_importance: Option<f64>,
}

/// Names passing `criteria`, strongest first.
pub fn select_features(importances: &[FeatureImportance], criteria: &SelectionCriteria) -> Vec<String> {
    let mut ranked: Vec<&FeatureImportance> = importances
        .iter()
        .filter(|f| criteria.min_importance.map_or(true, |min| f.importance >= min))
        .collect();
    ranked.sort_by(|a, b| {
        b.importance
            .total_cmp(&a.importance)
            .then_with(|| a.feature.cmp(&b.feature))
    });
    let limit = criteria.top_k.unwrap_or(ranked.len());
    ranked.into_iter().take(limit).map(|f| f.feature.clone()).collect()
}

/// Features whose population std is below `min_std`.
pub fn low_variance_features(examples: &[TrainingExample], min_std: f64) -> Result<Vec<String>> {
    let (names, x) = finite_matrix(examples)?;
    let stds = x.std_axis(Axis(0), 0.0);
    Ok(names
        .into_iter()
        .zip(stds.iter())
        .filter(|(_, &s)| s < min_std)
        .map(|(n, _)| n)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FeatureSchema, FeatureVector};
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    /// `b` duplicates `a` (scaled), `c` is independent, `k` is constant.
    fn correlated_examples() -> Vec<TrainingExample> {
        let schema = FeatureSchema::shared(1, ["a", "b", "c", "k"]).unwrap();
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..40)
            .map(|i| {
                let a = i as f64;
                let c = ((i * 7) % 11) as f64;
                let fv = FeatureVector::new(Arc::clone(&schema), vec![a, 2.0 * a + 1.0, c, 3.0]).unwrap();
                TrainingExample::new(fv, i % 2 == 0, ts)
            })
            .collect()
    }

    fn ranking(pairs: &[(&str, f64)]) -> Vec<FeatureImportance> {
        pairs
            .iter()
            .map(|(f, v)| FeatureImportance {
                feature: f.to_string(),
                importance: *v,
                signed: None,
            })
            .collect()
    }

    #[test]
    fn test_correlation_matrix() {
        let m = correlation_matrix(&correlated_examples()).unwrap();
        assert!((m.get("a", "b").unwrap() - 1.0).abs() < 1e-9);
        assert_eq!(m.get("a", "k").unwrap(), 0.0);
        assert_eq!(m.get("c", "c").unwrap(), 1.0);
        assert_eq!(m.get("a", "c"), m.get("c", "a"));
    }

    #[test]
    fn test_prune_drops_duplicate_column() {
        let report = prune_correlated_features(
            &correlated_examples(),
            0.95,
            &ranking(&[("b", 0.6), ("a", 0.3), ("c", 0.1)]),
        )
        .unwrap();
        assert_eq!(report.dropped.len(), 1);
        assert_eq!(report.dropped[0].0, "a");
        assert_eq!(report.kept, vec!["b", "c", "k"]);
    }

    #[test]
    fn test_select_features_top_k_and_floor() {
        let imps = ranking(&[("x", 0.5), ("y", 0.3), ("z", 0.15), ("w", 0.05)]);
        let top2 = select_features(
            &imps,
            &SelectionCriteria {
                top_k: Some(2),
                min_importance: None,
            },
        );
        assert_eq!(top2, vec!["x", "y"]);

        let floor = select_features(
            &imps,
            &SelectionCriteria {
                top_k: None,
                min_importance: Some(0.1),
            },
        );
        assert_eq!(floor, vec!["x", "y", "z"]);
    }

    #[test]
    fn test_low_variance_features() {
        let low = low_variance_features(&correlated_examples(), 1e-6).unwrap();
        assert_eq!(low, vec!["k"]);
    }
}
