//! Versioned model artifacts and experiment history on a key/value store.

pub mod experiments;
pub mod models;
pub mod store;
pub mod version;

pub use experiments::{Experiment, ExperimentFilter, ExperimentStatus, ExperimentTracker, NewExperiment};
pub use models::{
    BacktestMetrics, ModelArtifact, ModelComparison, ModelRegistry, ModelStatus, PromotionCriteria,
    PromotionResult, Recommendation, RegisterRequest, RegisteredModel, RollbackResult, StoredArtifact,
    DEFAULT_PROMOTION_CRITERIA,
};
pub use store::{ArtifactStore, FileStore, MemoryStore};
pub use version::{ModelVersion, VersionBump};
