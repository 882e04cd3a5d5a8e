use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use super::store::{read_json, write_json, ArtifactStore, FileStore};
use super::version::{ModelVersion, VersionBump};
use crate::error::{EngineError, Result};
use crate::ml::classifier::{Classifier, ModelType};
use crate::ml::ensemble::{EnsembleModel, StackedModel};
use crate::ml::gbm::GbmModel;
use crate::ml::linear::ModelCoefficients;
use crate::ml::metrics::EvaluationMetrics;
use crate::types::FeatureVector;

pub const REGISTRY_KEY: &str = "registry.json";
pub const PRODUCTION_KEY: &str = "production.json";

/// Minimum AUC gain for `compare_models` to recommend the newer model.
pub const COMPARE_AUC_MARGIN: f64 = 0.01;
/// Calibration error increase tolerated alongside that gain.
pub const COMPARE_CALIBRATION_TOLERANCE: f64 = 0.02;

const FLOAT_SLACK: f64 = 1e-12;

pub fn artifact_key(version: &ModelVersion) -> String {
    format!("models/{}.json", version)
}

/// Any trained model the registry can hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelArtifact {
    Linear(ModelCoefficients),
    Gbm(GbmModel),
    Stacked(StackedModel),
    Ensemble(EnsembleModel),
}

impl Classifier for ModelArtifact {
    fn predict_proba(&self, features: &FeatureVector) -> f64 {
        match self {
            ModelArtifact::Linear(m) => m.predict_proba(features),
            ModelArtifact::Gbm(m) => m.predict_proba(features),
            ModelArtifact::Stacked(m) => m.predict_proba(features),
            ModelArtifact::Ensemble(m) => m.predict_proba(features),
        }
    }

    fn model_type(&self) -> ModelType {
        match self {
            ModelArtifact::Linear(_) => ModelType::LogisticRegression,
            ModelArtifact::Gbm(_) => ModelType::GradientBoosting,
            ModelArtifact::Stacked(_) => ModelType::Stacked,
            ModelArtifact::Ensemble(_) => ModelType::Ensemble,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BacktestMetrics {
    pub win_rate: f64,
    pub sharpe: f64,
    pub trades: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Active,
    Production,
    Retired,
}

/// Registry metadata for one immutable model version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredModel {
    pub version: ModelVersion,
    pub coefficients_path: String,
    pub model_type: ModelType,
    pub validation_metrics: EvaluationMetrics,
    pub backtest_metrics: Option<BacktestMetrics>,
    pub is_production: bool,
    pub status: ModelStatus,
    pub tags: Vec<String>,
    pub parent_version: Option<ModelVersion>,
    pub description: Option<String>,
    pub registered_at: DateTime<Utc>,
    /// SHA-256 of the stored artifact bytes
    pub checksum: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionAction {
    Promote,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionRecord {
    pub version: ModelVersion,
    pub previous_version: Option<ModelVersion>,
    pub action: PromotionAction,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryIndex {
    pub current_production_version: Option<ModelVersion>,
    pub models: Vec<RegisteredModel>,
    #[serde(default)]
    pub promotion_history: Vec<PromotionRecord>,
    pub last_updated: DateTime<Utc>,
}

impl Default for RegistryIndex {
    fn default() -> Self {
        Self {
            current_production_version: None,
            models: Vec::new(),
            promotion_history: Vec::new(),
            last_updated: Utc::now(),
        }
    }
}

impl RegistryIndex {
    fn find(&self, version: &ModelVersion) -> Option<usize> {
        self.models.iter().position(|m| &m.version == version)
    }

    fn set_production(&mut self, target: usize) {
        for (i, model) in self.models.iter_mut().enumerate() {
            if i == target {
                model.is_production = true;
                model.status = ModelStatus::Production;
            } else if model.is_production {
                model.is_production = false;
                model.status = ModelStatus::Active;
            }
        }
        self.current_production_version = Some(self.models[target].version);
    }
}

/// The file written to `models/<version>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredArtifact {
    pub version: ModelVersion,
    pub model_type: ModelType,
    pub trained_at: DateTime<Utc>,
    pub metrics: EvaluationMetrics,
    pub artifact: ModelArtifact,
}

#[derive(Debug, Clone)]
pub struct RegisterRequest {
    pub artifact: ModelArtifact,
    pub validation_metrics: EvaluationMetrics,
    pub backtest_metrics: Option<BacktestMetrics>,
    pub bump: VersionBump,
    pub tags: Vec<String>,
    pub parent_version: Option<ModelVersion>,
    pub description: Option<String>,
}

impl RegisterRequest {
    pub fn new(artifact: ModelArtifact, validation_metrics: EvaluationMetrics) -> Self {
        Self {
            artifact,
            validation_metrics,
            backtest_metrics: None,
            bump: VersionBump::Patch,
            tags: Vec::new(),
            parent_version: None,
            description: None,
        }
    }
}

/// Gate a model must pass before it can serve production traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromotionCriteria {
    pub min_auc: f64,
    pub max_calibration_error: f64,
    pub min_backtest_win_rate: Option<f64>,
    pub min_backtest_sharpe: Option<f64>,
    pub require_backtest: bool,
}

pub const DEFAULT_PROMOTION_CRITERIA: PromotionCriteria = PromotionCriteria {
    min_auc: 0.65,
    max_calibration_error: 0.10,
    min_backtest_win_rate: None,
    min_backtest_sharpe: None,
    require_backtest: false,
};

impl Default for PromotionCriteria {
    fn default() -> Self {
        DEFAULT_PROMOTION_CRITERIA
    }
}

impl PromotionCriteria {
    /// Every failed condition, empty when the model qualifies.
    pub fn failures(&self, model: &RegisteredModel) -> Vec<String> {
        let mut failures = Vec::new();
        let m = &model.validation_metrics;
        if m.auc < self.min_auc {
            failures.push(format!("AUC {:.4} below minimum {:.4}", m.auc, self.min_auc));
        }
        if m.calibration_error > self.max_calibration_error {
            failures.push(format!(
                "calibration error {:.4} above maximum {:.4}",
                m.calibration_error, self.max_calibration_error
            ));
        }

        match &model.backtest_metrics {
            None if self.require_backtest => failures.push("backtest metrics required".to_string()),
            None => {}
            Some(bt) => {
                if let Some(min) = self.min_backtest_win_rate {
                    if bt.win_rate < min {
                        failures.push(format!("backtest win rate {:.4} below minimum {:.4}", bt.win_rate, min));
                    }
                }
                if let Some(min) = self.min_backtest_sharpe {
                    if bt.sharpe < min {
                        failures.push(format!("backtest Sharpe {:.3} below minimum {:.3}", bt.sharpe, min));
                    }
                }
            }
        }
        failures
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionResult {
    pub success: bool,
    pub version: String,
    pub previous_version: Option<ModelVersion>,
    pub reason: Option<String>,
}

impl PromotionResult {
    fn rejected(version: &str, reason: impl Into<String>) -> Self {
        Self {
            success: false,
            version: version.to_string(),
            previous_version: None,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackResult {
    pub success: bool,
    pub restored_version: Option<ModelVersion>,
    pub retired_version: Option<ModelVersion>,
    pub reason: Option<String>,
}

impl RollbackResult {
    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            restored_version: None,
            retired_version: None,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    PromoteV2,
    KeepV1,
    NeedsReview,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelComparison {
    pub v1: ModelVersion,
    pub v2: ModelVersion,
    /// v2 minus v1
    pub auc_delta: f64,
    pub accuracy_delta: f64,
    pub f1_delta: f64,
    pub calibration_delta: f64,
    pub recommendation: Recommendation,
}

pub fn recommend(auc_delta: f64, calibration_delta: f64) -> Recommendation {
    if auc_delta >= COMPARE_AUC_MARGIN - FLOAT_SLACK && calibration_delta <= COMPARE_CALIBRATION_TOLERANCE + FLOAT_SLACK {
        Recommendation::PromoteV2
    } else if auc_delta < -COMPARE_AUC_MARGIN {
        Recommendation::KeepV1
    } else {
        Recommendation::NeedsReview
    }
}

fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Append-only model registry with a single production pointer.
///
/// Mutations hold `write_lock` for their whole read-modify-write cycle.
pub struct ModelRegistry {
    store: Arc<dyn ArtifactStore>,
    write_lock: Mutex<()>,
}

impl ModelRegistry {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Arc::new(FileStore::open(root.as_ref())?)))
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    fn load_index(&self) -> Result<RegistryIndex> {
        Ok(read_json(self.store.as_ref(), REGISTRY_KEY)?.unwrap_or_default())
    }

    fn save_index(&self, index: &mut RegistryIndex) -> Result<()> {
        index.last_updated = Utc::now();
        write_json(self.store.as_ref(), REGISTRY_KEY, index)
    }

    /// Save `index`, then copy `bytes` to `production.json`. If the copy fails
    /// `previous` is written back so the pointer and the copy stay in step.
    fn commit_production(&self, index: &mut RegistryIndex, previous: &mut RegistryIndex, bytes: &[u8]) -> Result<()> {
        self.save_index(index)?;
        if let Err(e) = self.store.write(PRODUCTION_KEY, bytes) {
            warn!("Writing {} failed, restoring registry index: {}", PRODUCTION_KEY, e);
            if let Err(restore) = self.save_index(previous) {
                warn!("Restoring registry index failed: {}", restore);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Persist `request.artifact` under the next version.
    pub fn register_model(&self, request: RegisterRequest) -> Result<RegisteredModel> {
        let _guard = self.write_lock.lock();
        let mut index = self.load_index()?;

        let version = ModelVersion::next_after(index.models.iter().map(|m| &m.version), request.bump);
        let key = artifact_key(&version);
        // The index is written after the artifact, so a file for an unindexed
        // version is what a failed registration left behind.
        if self.store.exists(&key)? {
            warn!("Replacing orphaned artifact {} (not in the registry index)", key);
        }
        if let Some(parent) = &request.parent_version {
            if index.find(parent).is_none() {
                return Err(EngineError::NotFound(format!("parent version {}", parent)));
            }
        }

        let now = Utc::now();
        let model_type = request.artifact.model_type();
        let stored = StoredArtifact {
            version,
            model_type,
            trained_at: now,
            metrics: request.validation_metrics,
            artifact: request.artifact,
        };
        let bytes = serde_json::to_vec_pretty(&stored)?;
        self.store.write(&key, &bytes)?;

        let record = RegisteredModel {
            version,
            coefficients_path: key,
            model_type,
            validation_metrics: request.validation_metrics,
            backtest_metrics: request.backtest_metrics,
            is_production: false,
            status: ModelStatus::Active,
            tags: request.tags,
            parent_version: request.parent_version,
            description: request.description,
            registered_at: now,
            checksum: checksum(&bytes),
        };
        index.models.push(record.clone());
        self.save_index(&mut index)?;

        info!(
            "Registered {} model {} (auc {:.4})",
            model_type, version, record.validation_metrics.auc
        );
        Ok(record)
    }

    pub fn get_model(&self, version: &str) -> Result<Option<RegisteredModel>> {
        let Ok(version) = ModelVersion::from_str(version) else {
            return Ok(None);
        };
        let index = self.load_index()?;
        Ok(index.find(&version).map(|i| index.models[i].clone()))
    }

    /// All registered models, oldest version first.
    pub fn list_models(&self) -> Result<Vec<RegisteredModel>> {
        let mut models = self.load_index()?.models;
        models.sort_by_key(|m| m.version);
        Ok(models)
    }

    pub fn production_model(&self) -> Result<Option<RegisteredModel>> {
        let index = self.load_index()?;
        Ok(index
            .current_production_version
            .and_then(|v| index.find(&v))
            .map(|i| index.models[i].clone()))
    }

    fn read_verified(&self, record: &RegisteredModel) -> Result<Vec<u8>> {
        let bytes = self
            .store
            .read(&record.coefficients_path)?
            .ok_or_else(|| EngineError::NotFound(format!("artifact file {}", record.coefficients_path)))?;
        let actual = checksum(&bytes);
        if actual != record.checksum {
            return Err(EngineError::Integrity(format!(
                "{}: expected sha256 {}, found {}",
                record.coefficients_path, record.checksum, actual
            )));
        }
        Ok(bytes)
    }

    /// Read and checksum-verify a stored artifact.
    pub fn load_artifact(&self, version: &str) -> Result<StoredArtifact> {
        let record = self
            .get_model(version)?
            .ok_or_else(|| EngineError::NotFound(format!("model version {}", version)))?;
        let bytes = self.read_verified(&record)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Promote `version` if it passes `criteria`. A rejected promotion
    /// leaves the store untouched.
    pub fn promote_to_production(&self, version: &str, criteria: &PromotionCriteria) -> Result<PromotionResult> {
        let _guard = self.write_lock.lock();
        let mut index = self.load_index()?;

        let Some(target) = ModelVersion::from_str(version).ok().and_then(|v| index.find(&v)) else {
            warn!("Promotion rejected: unknown version {}", version);
            return Ok(PromotionResult::rejected(version, "model version not found"));
        };
        let record = index.models[target].clone();
        if record.is_production {
            return Ok(PromotionResult::rejected(version, "already in production"));
        }

        let failures = criteria.failures(&record);
        if !failures.is_empty() {
            let reason = failures.join("; ");
            warn!("Promotion of {} rejected: {}", record.version, reason);
            return Ok(PromotionResult::rejected(version, reason));
        }

        let bytes = self.read_verified(&record)?;
        let mut before = index.clone();

        let previous = index.current_production_version;
        index.set_production(target);
        index.promotion_history.push(PromotionRecord {
            version: record.version,
            previous_version: previous,
            action: PromotionAction::Promote,
            at: Utc::now(),
        });
        self.commit_production(&mut index, &mut before, &bytes)?;

        info!(
            "Promoted {} to production (previous: {})",
            record.version,
            previous.map(|v| v.to_string()).unwrap_or_else(|| "none".to_string())
        );
        Ok(PromotionResult {
            success: true,
            version: record.version.to_string(),
            previous_version: previous,
            reason: None,
        })
    }

    /// Restore `target` (default: the production version before the current
    /// one) and retire the current production model.
    pub fn rollback_model(&self, target: Option<&str>) -> Result<RollbackResult> {
        let _guard = self.write_lock.lock();
        let mut index = self.load_index()?;
        let current = index.current_production_version;

        let target_version = match target {
            Some(v) => match ModelVersion::from_str(v) {
                Ok(v) => v,
                Err(_) => return Ok(RollbackResult::rejected(format!("invalid version {}", v))),
            },
            None => {
                let previous = index
                    .promotion_history
                    .iter()
                    .rev()
                    .map(|r| r.version)
                    .find(|v| Some(*v) != current);
                match previous {
                    Some(v) => v,
                    None => return Ok(RollbackResult::rejected("no previous production version")),
                }
            }
        };

        if Some(target_version) == current {
            return Ok(RollbackResult::rejected(format!("{} is already in production", target_version)));
        }
        let Some(target_idx) = index.find(&target_version) else {
            return Ok(RollbackResult::rejected(format!("model version {} not found", target_version)));
        };

        let bytes = self.read_verified(&index.models[target_idx])?;
        let mut before = index.clone();

        index.set_production(target_idx);
        if let Some(retired) = current.and_then(|v| index.find(&v)) {
            index.models[retired].status = ModelStatus::Retired;
        }
        index.promotion_history.push(PromotionRecord {
            version: target_version,
            previous_version: current,
            action: PromotionAction::Rollback,
            at: Utc::now(),
        });
        self.commit_production(&mut index, &mut before, &bytes)?;

        info!(
            "Rolled back production to {} (retired {})",
            target_version,
            current.map(|v| v.to_string()).unwrap_or_else(|| "none".to_string())
        );
        Ok(RollbackResult {
            success: true,
            restored_version: Some(target_version),
            retired_version: current,
            reason: None,
        })
    }

    /// Metric deltas of `v2` over `v1`; `None` if either is unknown.
    pub fn compare_models(&self, v1: &str, v2: &str) -> Result<Option<ModelComparison>> {
        let (Some(a), Some(b)) = (self.get_model(v1)?, self.get_model(v2)?) else {
            return Ok(None);
        };
        let (ma, mb) = (&a.validation_metrics, &b.validation_metrics);
        let auc_delta = mb.auc - ma.auc;
        let calibration_delta = mb.calibration_error - ma.calibration_error;
        Ok(Some(ModelComparison {
            v1: a.version,
            v2: b.version,
            auc_delta,
            accuracy_delta: mb.accuracy - ma.accuracy,
            f1_delta: mb.f1 - ma.f1,
            calibration_delta,
            recommendation: recommend(auc_delta, calibration_delta),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::super::store::{MemoryStore, MockArtifactStore};
    use super::*;
    use std::collections::BTreeMap;
    use std::io::ErrorKind;

    /// In-memory store whose next writes to chosen keys fail.
    #[derive(Default)]
    struct FailingStore {
        inner: MemoryStore,
        failures: Mutex<BTreeMap<String, usize>>,
    }

    impl FailingStore {
        fn fail_next(&self, key: &str, times: usize) {
            self.failures.lock().insert(key.to_string(), times);
        }
    }

    impl ArtifactStore for FailingStore {
        fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.inner.read(key)
        }

        fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
            if let Some(left) = self.failures.lock().get_mut(key) {
                if *left > 0 {
                    *left -= 1;
                    return Err(std::io::Error::new(ErrorKind::Other, "disk full").into());
                }
            }
            self.inner.write(key, bytes)
        }

        fn exists(&self, key: &str) -> Result<bool> {
            self.inner.exists(key)
        }

        fn list(&self, prefix: &str) -> Result<Vec<String>> {
            self.inner.list(prefix)
        }
    }

    fn artifact(intercept: f64) -> ModelArtifact {
        ModelArtifact::Linear(ModelCoefficients {
            intercept,
            weights: BTreeMap::from([("x".to_string(), 0.5)]),
            feature_means: BTreeMap::from([("x".to_string(), 0.0)]),
            feature_stds: BTreeMap::from([("x".to_string(), 1.0)]),
            version: "draft".to_string(),
            training_samples: 100,
        })
    }

    fn metrics(auc: f64, calibration_error: f64) -> EvaluationMetrics {
        EvaluationMetrics {
            auc,
            calibration_error,
            ..Default::default()
        }
    }

    fn registry() -> ModelRegistry {
        ModelRegistry::new(Arc::new(MemoryStore::new()))
    }

    fn register(registry: &ModelRegistry, auc: f64, bump: VersionBump) -> RegisteredModel {
        let mut request = RegisterRequest::new(artifact(auc), metrics(auc, 0.05));
        request.bump = bump;
        registry.register_model(request).unwrap()
    }

    #[test]
    fn test_first_version_then_patch() {
        let reg = registry();
        assert_eq!(register(&reg, 0.7, VersionBump::Patch).version.to_string(), "v1.0.0");
        assert_eq!(register(&reg, 0.7, VersionBump::Patch).version.to_string(), "v1.0.1");
        assert_eq!(register(&reg, 0.7, VersionBump::Minor).version.to_string(), "v1.1.0");
        assert_eq!(register(&reg, 0.7, VersionBump::Major).version.to_string(), "v2.0.0");
        assert_eq!(reg.list_models().unwrap().len(), 4);
    }

    #[test]
    fn test_promotion_gate_rejects_low_auc() {
        let reg = registry();
        register(&reg, 0.72, VersionBump::Patch);
        assert!(reg.promote_to_production("v1.0.0", &DEFAULT_PROMOTION_CRITERIA).unwrap().success);
        register(&reg, 0.60, VersionBump::Patch);

        let result = reg.promote_to_production("v1.0.1", &DEFAULT_PROMOTION_CRITERIA).unwrap();
        assert!(!result.success);
        assert!(result.reason.unwrap().contains("AUC"));
        assert_eq!(reg.production_model().unwrap().unwrap().version.to_string(), "v1.0.0");
    }

    #[test]
    fn test_failed_promotion_never_writes() {
        let mut index = RegistryIndex::default();
        index.models.push(RegisteredModel {
            version: ModelVersion::initial(),
            coefficients_path: "models/v1.0.0.json".to_string(),
            model_type: ModelType::LogisticRegression,
            validation_metrics: metrics(0.60, 0.05),
            backtest_metrics: None,
            is_production: false,
            status: ModelStatus::Active,
            tags: Vec::new(),
            parent_version: None,
            description: None,
            registered_at: Utc::now(),
            checksum: String::new(),
        });
        let bytes = serde_json::to_vec(&index).unwrap();

        let mut store = MockArtifactStore::new();
        store
            .expect_read()
            .withf(|key| key == REGISTRY_KEY)
            .returning(move |_| Ok(Some(bytes.clone())));
        store.expect_write().times(0);

        let reg = ModelRegistry::new(Arc::new(store));
        let result = reg.promote_to_production("v1.0.0", &DEFAULT_PROMOTION_CRITERIA).unwrap();
        assert!(!result.success);
    }

    #[test]
    fn test_failed_index_write_does_not_block_registration() {
        let store = Arc::new(FailingStore::default());
        store.fail_next(REGISTRY_KEY, 1);
        let reg = ModelRegistry::new(store.clone());

        let first = reg.register_model(RegisterRequest::new(artifact(0.7), metrics(0.7, 0.05)));
        assert!(matches!(first, Err(EngineError::Io(_))));
        assert!(reg.list_models().unwrap().is_empty());
        assert!(store.exists("models/v1.0.0.json").unwrap());

        assert_eq!(register(&reg, 0.71, VersionBump::Patch).version, ModelVersion::initial());
        assert_eq!(register(&reg, 0.72, VersionBump::Patch).version.to_string(), "v1.0.1");
        let stored = reg.load_artifact("v1.0.0").unwrap();
        assert_eq!(stored.metrics.auc, 0.71);
    }

    #[test]
    fn test_failed_production_copy_leaves_pointer_in_place() {
        let store = Arc::new(FailingStore::default());
        let reg = ModelRegistry::new(store.clone());
        register(&reg, 0.70, VersionBump::Patch);
        register(&reg, 0.75, VersionBump::Patch);
        assert!(reg.promote_to_production("v1.0.0", &DEFAULT_PROMOTION_CRITERIA).unwrap().success);
        let copy_before = store.read(PRODUCTION_KEY).unwrap();

        store.fail_next(PRODUCTION_KEY, 1);
        let err = reg.promote_to_production("v1.0.1", &DEFAULT_PROMOTION_CRITERIA).unwrap_err();
        assert!(matches!(err, EngineError::Io(_)));
        assert_eq!(reg.production_model().unwrap().unwrap().version, ModelVersion::initial());
        assert_eq!(reg.list_models().unwrap().iter().filter(|m| m.is_production).count(), 1);
        assert_eq!(store.read(PRODUCTION_KEY).unwrap(), copy_before);

        assert!(reg.promote_to_production("v1.0.1", &DEFAULT_PROMOTION_CRITERIA).unwrap().success);
        let copy: StoredArtifact = serde_json::from_slice(&store.read(PRODUCTION_KEY).unwrap().unwrap()).unwrap();
        assert_eq!(copy.version.to_string(), "v1.0.1");
    }

    #[test]
    fn test_promotion_writes_production_copy_and_history() {
        let reg = registry();
        register(&reg, 0.70, VersionBump::Patch);
        register(&reg, 0.75, VersionBump::Patch);
        reg.promote_to_production("v1.0.0", &DEFAULT_PROMOTION_CRITERIA).unwrap();
        let result = reg.promote_to_production("v1.0.1", &DEFAULT_PROMOTION_CRITERIA).unwrap();
        assert!(result.success);
        assert_eq!(result.previous_version, Some(ModelVersion::initial()));

        let models = reg.list_models().unwrap();
        assert_eq!(models.iter().filter(|m| m.is_production).count(), 1);
        assert_eq!(models[0].status, ModelStatus::Active);

        let production = reg.store().read(PRODUCTION_KEY).unwrap().unwrap();
        let stored: StoredArtifact = serde_json::from_slice(&production).unwrap();
        assert_eq!(stored.version.to_string(), "v1.0.1");
    }

    #[test]
    fn test_backtest_requirements() {
        let reg = registry();
        register(&reg, 0.80, VersionBump::Patch);
        let strict = PromotionCriteria {
            require_backtest: true,
            ..Default::default()
        };
        let result = reg.promote_to_production("v1.0.0", &strict).unwrap();
        assert!(!result.success);
        assert!(result.reason.unwrap().contains("backtest"));
    }

    #[test]
    fn test_rollback_retires_current() {
        let reg = registry();
        register(&reg, 0.70, VersionBump::Patch);
        register(&reg, 0.75, VersionBump::Patch);
        reg.promote_to_production("v1.0.0", &DEFAULT_PROMOTION_CRITERIA).unwrap();
        reg.promote_to_production("v1.0.1", &DEFAULT_PROMOTION_CRITERIA).unwrap();

        let result = reg.rollback_model(None).unwrap();
        assert!(result.success);
        assert_eq!(result.restored_version, Some(ModelVersion::initial()));

        let retired = reg.get_model("v1.0.1").unwrap().unwrap();
        assert_eq!(retired.status, ModelStatus::Retired);
        assert!(!retired.is_production);
        assert_eq!(reg.production_model().unwrap().unwrap().version, ModelVersion::initial());
        // retired models stay loadable
        assert!(reg.load_artifact("v1.0.1").is_ok());
    }

    #[test]
    fn test_rollback_without_history_fails_softly() {
        let reg = registry();
        register(&reg, 0.70, VersionBump::Patch);
        let result = reg.rollback_model(None).unwrap();
        assert!(!result.success);
        assert!(!reg.rollback_model(Some("v9.9.9")).unwrap().success);
    }

    #[test]
    fn test_compare_models_recommendations() {
        assert_eq!(recommend(0.02, 0.0), Recommendation::PromoteV2);
        assert_eq!(recommend(0.02, 0.05), Recommendation::NeedsReview);
        assert_eq!(recommend(-0.02, 0.0), Recommendation::KeepV1);
        assert_eq!(recommend(0.005, 0.0), Recommendation::NeedsReview);

        let reg = registry();
        register(&reg, 0.70, VersionBump::Patch);
        register(&reg, 0.73, VersionBump::Patch);
        let cmp = reg.compare_models("v1.0.0", "v1.0.1").unwrap().unwrap();
        assert!((cmp.auc_delta - 0.03).abs() < 1e-9);
        assert_eq!(cmp.recommendation, Recommendation::PromoteV2);
        assert!(reg.compare_models("v1.0.0", "v3.0.0").unwrap().is_none());
    }

    #[test]
    fn test_tampered_artifact_detected() {
        let dir = tempfile::tempdir().unwrap();
        let reg = ModelRegistry::open(dir.path()).unwrap();
        register(&reg, 0.70, VersionBump::Patch);
        assert!(reg.load_artifact("v1.0.0").is_ok());

        std::fs::write(dir.path().join("models").join("v1.0.0.json"), b"{\"tampered\":true}").unwrap();
        assert!(matches!(reg.load_artifact("v1.0.0"), Err(EngineError::Integrity(_))));
    }

    #[test]
    fn test_unknown_version_lookups() {
        let reg = registry();
        assert!(reg.get_model("v1.0.0").unwrap().is_none());
        assert!(reg.get_model("garbage").unwrap().is_none());
        assert!(!reg.promote_to_production("v1.0.0", &DEFAULT_PROMOTION_CRITERIA).unwrap().success);
        assert!(matches!(reg.load_artifact("v1.0.0"), Err(EngineError::NotFound(_))));
    }
}
