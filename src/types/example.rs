use chrono::{DateTime, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use super::{FeatureSchema, FeatureVector};
use crate::error::{EngineError, Result};

/// One labelled trade candidate: features known at `timestamp` plus the
/// realized outcome (win = true).
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingExample {
    pub features: FeatureVector,
    pub label: bool,
    pub timestamp: DateTime<Utc>,
}

impl TrainingExample {
    pub fn new(features: FeatureVector, label: bool, timestamp: DateTime<Utc>) -> Self {
        Self { features, label, timestamp }
    }

    pub fn target(&self) -> f64 {
        if self.label { 1.0 } else { 0.0 }
    }

    /// Same label and timestamp with a re-expressed feature vector.
    pub fn with_features(&self, features: FeatureVector) -> Self {
        Self {
            features,
            label: self.label,
            timestamp: self.timestamp,
        }
    }
}

/// On-disk representation used by the CLI example files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExampleRecord {
    pub features: BTreeMap<String, f64>,
    pub label: u8,
    pub timestamp: DateTime<Utc>,
}

/// Load a JSON array of [`ExampleRecord`]s. The schema is taken from the first
/// record (sorted names) and every later record must match it exactly.
pub fn load_examples(path: impl AsRef<Path>) -> Result<Vec<TrainingExample>> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(EngineError::config(format!("example file not found: {}", path.display())));
    }
    let raw = std::fs::read_to_string(path)?;
    let records: Vec<ExampleRecord> = serde_json::from_str(&raw)?;
    let examples = examples_from_records(records)?;
    info!("Loaded {} training examples from {}", examples.len(), path.display());
    Ok(examples)
}

pub fn examples_from_records(records: Vec<ExampleRecord>) -> Result<Vec<TrainingExample>> {
    let Some(first) = records.first() else {
        return Ok(Vec::new());
    };
    let schema = FeatureSchema::shared(1, first.features.keys().cloned())?;

    records
        .into_iter()
        .enumerate()
        .map(|(i, record)| {
            let label = match record.label {
                0 => false,
                1 => true,
                other => {
                    return Err(EngineError::InvalidFeatures(format!(
                        "record {}: label must be 0 or 1, got {}",
                        i, other
                    )))
                }
            };
            let features = FeatureVector::from_pairs(Arc::clone(&schema), record.features)
                .map_err(|e| EngineError::InvalidFeatures(format!("record {}: {}", i, e)))?;
            Ok(TrainingExample::new(features, label, record.timestamp))
        })
        .collect()
}

pub fn to_records(examples: &[TrainingExample]) -> Vec<ExampleRecord> {
    examples
        .iter()
        .map(|e| ExampleRecord {
            features: e.features.to_map(),
            label: e.label as u8,
            timestamp: e.timestamp,
        })
        .collect()
}

pub fn positive_count(examples: &[TrainingExample]) -> usize {
    examples.iter().filter(|e| e.label).count()
}

/// Share of positive labels; 0 for an empty slice.
pub fn positive_rate(examples: &[TrainingExample]) -> f64 {
    if examples.is_empty() {
        return 0.0;
    }
    positive_count(examples) as f64 / examples.len() as f64
}

pub fn labels(examples: &[TrainingExample]) -> Vec<f64> {
    examples.iter().map(TrainingExample::target).collect()
}

/// Feature names of the first example's schema.
pub fn feature_names(examples: &[TrainingExample]) -> Result<Vec<String>> {
    examples
        .first()
        .map(|e| e.features.schema().names().to_vec())
        .ok_or_else(|| EngineError::InsufficientData("no examples".to_string()))
}

/// Dense `n × features` matrix aligned with `names`.
pub fn feature_matrix(examples: &[TrainingExample], names: &[String]) -> Result<Array2<f64>> {
    let mut data = Vec::with_capacity(examples.len() * names.len());
    for example in examples {
        data.extend_from_slice(&example.features.aligned(names));
    }
    Ok(Array2::from_shape_vec((examples.len(), names.len()), data)?)
}
