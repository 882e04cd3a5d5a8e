use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::error::{EngineError, Result};
use crate::ml::gbm::{GbmModel, TreeNode};
use crate::types::TrainingExample;

/// Two features that split one after the other in the boosted trees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionPair {
    pub first: String,
    pub second: String,
    /// Summed gain of child splits under a parent split on the partner
    pub strength: f64,
}

pub fn interaction_name(a: &str, b: &str) -> String {
    format!("{}_x_{}", a, b)
}

/// Rank feature pairs by how much gain their parent→child splits carry.
pub fn detect_interactions(model: &GbmModel, top_n: usize) -> Vec<InteractionPair> {
    let mut strength: BTreeMap<(usize, usize), f64> = BTreeMap::new();

    for tree in &model.trees {
        let nodes = tree.nodes();
        for node in nodes {
            let TreeNode::Split { feature: parent, left, right, .. } = node else {
                continue;
            };
            for child in [*left, *right] {
                if let TreeNode::Split { feature, gain, .. } = &nodes[child] {
                    if feature != parent {
                        let key = ((*parent).min(*feature), (*parent).max(*feature));
                        *strength.entry(key).or_insert(0.0) += gain;
                    }
                }
            }
        }
    }

    let mut pairs: Vec<InteractionPair> = strength
        .into_iter()
        .map(|((a, b), s)| InteractionPair {
            first: model.feature_names[a].clone(),
            second: model.feature_names[b].clone(),
            strength: s,
        })
        .collect();
    pairs.sort_by(|x, y| y.strength.total_cmp(&x.strength));
    pairs.truncate(top_n);
    pairs
}

/// Append `a_x_b` product features for each pair through an extended schema.
pub fn add_interaction_features(
    examples: &[TrainingExample],
    pairs: &[(String, String)],
) -> Result<Vec<TrainingExample>> {
    let first = examples
        .first()
        .ok_or_else(|| EngineError::InsufficientData("no examples".to_string()))?;
    let schema = first.features.schema();

    let mut indices = Vec::with_capacity(pairs.len());
    for (a, b) in pairs {
        let ia = schema
            .index_of(a)
            .ok_or_else(|| EngineError::InvalidFeatures(format!("unknown feature: {}", a)))?;
        let ib = schema
            .index_of(b)
            .ok_or_else(|| EngineError::InvalidFeatures(format!("unknown feature: {}", b)))?;
        indices.push((ia, ib));
    }

    let extra: Vec<String> = pairs.iter().map(|(a, b)| interaction_name(a, b)).collect();
    let extended = Arc::new(schema.with_extra(&extra)?);

    let out = examples
        .iter()
        .map(|e| {
            if e.features.schema() != schema {
                return Err(EngineError::InvalidFeatures("examples mix feature schemas".to_string()));
            }
            let products: Vec<f64> = indices
                .iter()
                .map(|&(ia, ib)| e.features.value(ia) * e.features.value(ib))
                .collect();
            Ok(e.with_features(e.features.extend(&extended, &products)?))
        })
        .collect::<Result<Vec<_>>>()?;

    info!("Added {} interaction features ({})", extra.len(), extended);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::gbm::{train_gbm, GbmConfig, RegressionTree};
    use crate::types::{FeatureSchema, FeatureVector};
    use chrono::{TimeZone, Utc};

    fn grid_examples() -> Vec<TrainingExample> {
        let schema = FeatureSchema::shared(1, ["a", "b", "c"]).unwrap();
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..200)
            .map(|i| {
                let a = if i % 2 == 0 { 1.0 } else { -1.0 };
                let b = if (i / 2) % 2 == 0 { 1.0 } else { -1.0 };
                let c = (i % 13) as f64;
                let fv = FeatureVector::new(Arc::clone(&schema), vec![a, b, c]).unwrap();
                TrainingExample::new(fv, (a > 0.0) != (b > 0.0), ts)
            })
            .collect()
    }

    fn leaf() -> serde_json::Value {
        serde_json::json!({"kind": "leaf", "prediction": 0.1, "samples": 10})
    }

    fn split(feature: usize, left: usize, right: usize, gain: f64) -> serde_json::Value {
        serde_json::json!({
            "kind": "split", "feature": feature, "threshold": 0.0,
            "left": left, "right": right, "gain": gain, "samples": 50
        })
    }

    #[test]
    fn test_detects_parent_child_pairs() {
        // a -> b carries gain 3, a -> c carries gain 1
        let tree: RegressionTree = serde_json::from_value(serde_json::json!({
            "nodes": [
                split(0, 1, 4, 5.0),
                split(1, 2, 3, 3.0),
                leaf(),
                leaf(),
                split(2, 5, 6, 1.0),
                leaf(),
                leaf()
            ]
        }))
        .unwrap();
        let mut model = train_gbm(&grid_examples(), &[], &GbmConfig {
            num_trees: 0,
            ..Default::default()
        })
        .unwrap();
        model.trees = vec![tree.clone(), tree];

        let pairs = detect_interactions(&model, 5);
        assert_eq!(pairs.len(), 2);
        assert_eq!((pairs[0].first.as_str(), pairs[0].second.as_str()), ("a", "b"));
        assert_eq!(pairs[0].strength, 6.0);
        assert_eq!((pairs[1].first.as_str(), pairs[1].second.as_str()), ("a", "c"));
        assert_eq!(detect_interactions(&model, 1).len(), 1);
    }

    #[test]
    fn test_add_interaction_features() {
        let data = grid_examples();
        let out = add_interaction_features(&data, &[("a".to_string(), "b".to_string())]).unwrap();
        let fv = &out[0].features;
        assert_eq!(fv.schema().version(), 2);
        assert_eq!(fv.get("a_x_b"), Some(data[0].features.get("a").unwrap() * data[0].features.get("b").unwrap()));
        assert_eq!(out.len(), data.len());
        assert_eq!(out[5].label, data[5].label);
    }

    #[test]
    fn test_unknown_interaction_feature_rejected() {
        let err = add_interaction_features(&grid_examples(), &[("a".to_string(), "zz".to_string())]).unwrap_err();
        assert!(matches!(err, EngineError::InvalidFeatures(_)));
    }
}
