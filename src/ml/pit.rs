//! Point-in-time enforcement: rejects data that was not knowable at the
//! decision time.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::types::{FeatureVector, TrainingExample};

const DEFAULT_VALUE_TOLERANCE: f64 = 1e-12;

/// Per-caller enforcement state. Violations fail only while `enabled`;
/// otherwise they are logged and the context is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnforcementContext {
    enabled: bool,
    violation_count: u64,
}

impl Default for EnforcementContext {
    fn default() -> Self {
        Self::new(true)
    }
}

impl EnforcementContext {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            violation_count: 0,
        }
    }

    pub fn disabled() -> Self {
        Self::new(false)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn violation_count(&self) -> u64 {
        self.violation_count
    }

    /// Wrap for callers that must share one context across threads.
    pub fn into_shared(self) -> SharedEnforcement {
        Arc::new(Mutex::new(self))
    }

    fn violation(&mut self, operation: &str, detail: String) -> Result<()> {
        if !self.enabled {
            warn!("PIT check degraded in {}: {}", operation, detail);
            return Ok(());
        }
        self.violation_count += 1;
        Err(EngineError::pit(operation, detail))
    }
}

pub type SharedEnforcement = Arc<Mutex<EnforcementContext>>;

/// A caller must say which date it is acting as of.
pub fn validate_as_of_date(
    ctx: &mut EnforcementContext,
    operation: &str,
    as_of: Option<DateTime<Utc>>,
) -> Result<()> {
    match as_of {
        Some(_) => Ok(()),
        None => ctx.violation(operation, "missing as-of date".to_string()),
    }
}

/// `data_ts` must not be later than `as_of`.
pub fn assert_date_not_future(
    ctx: &mut EnforcementContext,
    operation: &str,
    data_ts: DateTime<Utc>,
    as_of: DateTime<Utc>,
) -> Result<()> {
    if data_ts > as_of {
        return ctx.violation(
            operation,
            format!("data at {} is after as-of {}", data_ts.to_rfc3339(), as_of.to_rfc3339()),
        );
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeatureSafety {
    Safe,
    /// Only `default_value` may be carried; anything else leaks future data
    Unsafe { default_value: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRule {
    pub safety: FeatureSafety,
    pub reason: String,
}

/// Declarative per-feature safety table. Unlisted features are safe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PitFeatureRegistry {
    rules: BTreeMap<String, FeatureRule>,
}

impl PitFeatureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_safe(mut self, feature: impl Into<String>, reason: impl Into<String>) -> Self {
        self.rules.insert(
            feature.into(),
            FeatureRule {
                safety: FeatureSafety::Safe,
                reason: reason.into(),
            },
        );
        self
    }

    pub fn with_unsafe(mut self, feature: impl Into<String>, default_value: f64, reason: impl Into<String>) -> Self {
        self.rules.insert(
            feature.into(),
            FeatureRule {
                safety: FeatureSafety::Unsafe { default_value },
                reason: reason.into(),
            },
        );
        self
    }

    pub fn rule(&self, feature: &str) -> Option<&FeatureRule> {
        self.rules.get(feature)
    }

    pub fn is_safe(&self, feature: &str) -> bool {
        !matches!(
            self.rules.get(feature).map(|r| r.safety),
            Some(FeatureSafety::Unsafe { .. })
        )
    }

    pub fn unsafe_features(&self) -> Vec<&str> {
        self.rules
            .iter()
            .filter(|(_, r)| matches!(r.safety, FeatureSafety::Unsafe { .. }))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Every unsafe feature present in `features` must hold its default value.
pub fn validate_feature_vector(
    ctx: &mut EnforcementContext,
    registry: &PitFeatureRegistry,
    features: &FeatureVector,
) -> Result<()> {
    for (name, rule) in &registry.rules {
        let FeatureSafety::Unsafe { default_value } = rule.safety else {
            continue;
        };
        let Some(value) = features.get(name) else {
            continue;
        };
        if (value - default_value).abs() > DEFAULT_VALUE_TOLERANCE {
            ctx.violation(
                "validate_feature_vector",
                format!("{}={} is not point-in-time safe ({})", name, value, rule.reason),
            )?;
        }
    }
    Ok(())
}

/// Check a training batch against `as_of`. Returns the number of examples
/// checked.
pub fn validate_training_examples(
    ctx: &mut EnforcementContext,
    registry: &PitFeatureRegistry,
    examples: &[TrainingExample],
    as_of: Option<DateTime<Utc>>,
) -> Result<usize> {
    validate_as_of_date(ctx, "validate_training_examples", as_of)?;
    for example in examples {
        if let Some(as_of) = as_of {
            assert_date_not_future(ctx, "validate_training_examples", example.timestamp, as_of)?;
        }
        validate_feature_vector(ctx, registry, &example.features)?;
    }
    debug!("PIT checked {} examples", examples.len());
    Ok(examples.len())
}
