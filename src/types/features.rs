use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{EngineError, Result};

/// Ordered, duplicate-free list of feature names with a schema version tag.
///
/// Every [`FeatureVector`] points at exactly one schema; models record the
/// names they were trained on and re-align vectors at prediction time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SchemaRepr", into = "SchemaRepr")]
pub struct FeatureSchema {
    version: u32,
    names: Vec<String>,
    index: BTreeMap<String, usize>,
}

#[derive(Serialize, Deserialize)]
struct SchemaRepr {
    version: u32,
    names: Vec<String>,
}

impl TryFrom<SchemaRepr> for FeatureSchema {
    type Error = EngineError;

    fn try_from(repr: SchemaRepr) -> Result<Self> {
        FeatureSchema::new(repr.version, repr.names)
    }
}

impl From<FeatureSchema> for SchemaRepr {
    fn from(schema: FeatureSchema) -> Self {
        SchemaRepr {
            version: schema.version,
            names: schema.names,
        }
    }
}

impl FeatureSchema {
    pub fn new<S: Into<String>>(version: u32, names: impl IntoIterator<Item = S>) -> Result<Self> {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        if names.is_empty() {
            return Err(EngineError::InvalidFeatures("schema has no features".to_string()));
        }

        let mut index = BTreeMap::new();
        for (i, name) in names.iter().enumerate() {
            if name.trim().is_empty() {
                return Err(EngineError::InvalidFeatures(format!("empty feature name at position {}", i)));
            }
            if index.insert(name.clone(), i).is_some() {
                return Err(EngineError::InvalidFeatures(format!("duplicate feature name: {}", name)));
            }
        }

        Ok(Self { version, names, index })
    }

    /// Convenience constructor returning a shareable schema.
    pub fn shared<S: Into<String>>(version: u32, names: impl IntoIterator<Item = S>) -> Result<Arc<Self>> {
        Ok(Arc::new(Self::new(version, names)?))
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Schema with one feature removed (used by ablation studies).
    pub fn without(&self, name: &str) -> Result<Self> {
        if !self.contains(name) {
            return Err(EngineError::InvalidFeatures(format!("unknown feature: {}", name)));
        }
        Self::new(
            self.version,
            self.names.iter().filter(|n| n.as_str() != name).cloned(),
        )
    }

    /// Schema restricted to the given names, in this schema's order.
    pub fn select(&self, keep: &[String]) -> Result<Self> {
        for name in keep {
            if !self.contains(name) {
                return Err(EngineError::InvalidFeatures(format!("unknown feature: {}", name)));
            }
        }
        Self::new(
            self.version,
            self.names.iter().filter(|n| keep.contains(n)).cloned(),
        )
    }

    /// Schema extended with derived features. Bumps the schema version.
    pub fn with_extra(&self, extra: &[String]) -> Result<Self> {
        Self::new(
            self.version + 1,
            self.names.iter().cloned().chain(extra.iter().cloned()),
        )
    }
}

impl fmt::Display for FeatureSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "schema v{} ({} features)", self.version, self.names.len())
    }
}

/// Fixed-schema numeric feature record.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    schema: Arc<FeatureSchema>,
    values: Vec<f64>,
}

impl FeatureVector {
    /// Build from values aligned with `schema`. All values must be finite.
    pub fn new(schema: Arc<FeatureSchema>, values: Vec<f64>) -> Result<Self> {
        if values.len() != schema.len() {
            return Err(EngineError::InvalidFeatures(format!(
                "expected {} values for {}, got {}",
                schema.len(),
                schema,
                values.len()
            )));
        }
        if let Some(i) = values.iter().position(|v| !v.is_finite()) {
            return Err(EngineError::InvalidFeatures(format!(
                "non-finite value for feature {}",
                schema.names()[i]
            )));
        }
        Ok(Self { schema, values })
    }

    /// Build from `(name, value)` pairs. Every schema feature must be present
    /// exactly once and no unknown names are accepted.
    pub fn from_pairs<S: AsRef<str>>(
        schema: Arc<FeatureSchema>,
        pairs: impl IntoIterator<Item = (S, f64)>,
    ) -> Result<Self> {
        let mut values: Vec<Option<f64>> = vec![None; schema.len()];
        for (name, value) in pairs {
            let name = name.as_ref();
            let idx = schema
                .index_of(name)
                .ok_or_else(|| EngineError::InvalidFeatures(format!("unknown feature: {}", name)))?;
            if values[idx].replace(value).is_some() {
                return Err(EngineError::InvalidFeatures(format!("feature given twice: {}", name)));
            }
        }

        let mut dense = Vec::with_capacity(values.len());
        for (i, value) in values.into_iter().enumerate() {
            match value {
                Some(v) => dense.push(v),
                None => {
                    return Err(EngineError::InvalidFeatures(format!(
                        "missing feature: {}",
                        schema.names()[i]
                    )))
                }
            }
        }
        Self::new(schema, dense)
    }

    pub fn schema(&self) -> &Arc<FeatureSchema> {
        &self.schema
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn value(&self, index: usize) -> f64 {
        self.values[index]
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.schema.index_of(name).map(|i| self.values[i])
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Values re-ordered to match `names`. Names absent from this vector's
    /// schema come back as NaN; models treat NaN as "at the training mean".
    pub fn aligned(&self, names: &[String]) -> Cow<'_, [f64]> {
        if self.schema.names() == names {
            return Cow::Borrowed(&self.values);
        }
        Cow::Owned(
            names
                .iter()
                .map(|n| self.get(n).unwrap_or(f64::NAN))
                .collect(),
        )
    }

    /// Re-express this vector in `target`'s schema. Every target feature must
    /// exist in the current schema.
    pub fn project(&self, target: &Arc<FeatureSchema>) -> Result<Self> {
        let mut values = Vec::with_capacity(target.len());
        for name in target.names() {
            let v = self
                .get(name)
                .ok_or_else(|| EngineError::InvalidFeatures(format!("cannot project, missing: {}", name)))?;
            values.push(v);
        }
        Ok(Self {
            schema: Arc::clone(target),
            values,
        })
    }

    /// Copy with one value replaced. The schema is unchanged.
    pub fn with_value(&self, index: usize, value: f64) -> Self {
        let mut values = self.values.clone();
        values[index] = value;
        Self {
            schema: Arc::clone(&self.schema),
            values,
        }
    }

    /// Append derived values under an extended schema.
    pub fn extend(&self, extended: &Arc<FeatureSchema>, extra: &[f64]) -> Result<Self> {
        let values: Vec<f64> = self.values.iter().chain(extra.iter()).copied().collect();
        Self::new(Arc::clone(extended), values)
    }

    pub fn to_map(&self) -> BTreeMap<String, f64> {
        self.schema
            .names()
            .iter()
            .cloned()
            .zip(self.values.iter().copied())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Arc<FeatureSchema> {
        FeatureSchema::shared(1, ["rsi_14", "atr_pct", "volume_ratio"]).unwrap()
    }

    #[test]
    fn test_schema_rejects_duplicates() {
        assert!(FeatureSchema::new(1, ["a", "b", "a"]).is_err());
        assert!(FeatureSchema::new(1, Vec::<String>::new()).is_err());
    }

    #[test]
    fn test_from_pairs_requires_every_feature() {
        let s = schema();
        let missing = FeatureVector::from_pairs(Arc::clone(&s), [("rsi_14", 55.0), ("atr_pct", 1.2)]);
        assert!(missing.is_err());

        let unknown = FeatureVector::from_pairs(
            Arc::clone(&s),
            [("rsi_14", 55.0), ("atr_pct", 1.2), ("volume_ratio", 1.0), ("bogus", 3.0)],
        );
        assert!(unknown.is_err());

        let ok = FeatureVector::from_pairs(
            Arc::clone(&s),
            [("volume_ratio", 1.0), ("rsi_14", 55.0), ("atr_pct", 1.2)],
        )
        .unwrap();
        assert_eq!(ok.values(), &[55.0, 1.2, 1.0]);
        assert_eq!(ok.get("atr_pct"), Some(1.2));
    }

    #[test]
    fn test_rejects_non_finite_values() {
        assert!(FeatureVector::new(schema(), vec![1.0, f64::NAN, 2.0]).is_err());
    }

    #[test]
    fn test_aligned_reorders_and_fills_missing() {
        let v = FeatureVector::new(schema(), vec![50.0, 2.0, 0.8]).unwrap();
        let names = vec!["volume_ratio".to_string(), "rsi_14".to_string(), "macd".to_string()];
        let aligned = v.aligned(&names);
        assert_eq!(aligned[0], 0.8);
        assert_eq!(aligned[1], 50.0);
        assert!(aligned[2].is_nan());
    }

    #[test]
    fn test_project_to_smaller_schema() {
        let s = schema();
        let v = FeatureVector::new(Arc::clone(&s), vec![50.0, 2.0, 0.8]).unwrap();
        let reduced = Arc::new(s.without("atr_pct").unwrap());
        let p = v.project(&reduced).unwrap();
        assert_eq!(p.values(), &[50.0, 0.8]);
        assert_eq!(p.schema().len(), 2);
    }

    #[test]
    fn test_schema_serde_rebuilds_index() {
        let s = FeatureSchema::new(3, ["x", "y"]).unwrap();
        let json = serde_json::to_string(&s).unwrap();
        let back: FeatureSchema = serde_json::from_str(&json).unwrap();
        assert_eq!(back.index_of("y"), Some(1));
        assert_eq!(back.version(), 3);
    }
}
