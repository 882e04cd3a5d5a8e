//! Training, evaluation and promotion engine for binary trade-candidate
//! scoring models.

pub mod config;
pub mod error;
pub mod ml;
pub mod registry;
pub mod types;

pub use error::{EngineError, Result};
