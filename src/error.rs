use thiserror::Error;

/// Errors surfaced by the training engine and the registry.
///
/// Numeric degeneracy (zero-variance features, single-class batches) is never
/// reported here; trainers clamp or fall back internally.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("PIT violation in {operation}: {detail}")]
    PitViolation { operation: String, detail: String },

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Invalid feature vector: {0}")]
    InvalidFeatures(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Artifact integrity check failed: {0}")]
    Integrity(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

impl EngineError {
    pub fn config(msg: impl Into<String>) -> Self {
        EngineError::Configuration(msg.into())
    }

    pub fn pit(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        EngineError::PitViolation {
            operation: operation.into(),
            detail: detail.into(),
        }
    }

    pub fn is_pit_violation(&self) -> bool {
        matches!(self, EngineError::PitViolation { .. })
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
