pub mod classifier;
pub mod cross_validation;
pub mod ensemble;
pub mod features;
pub mod gbm;
pub mod linear;
pub mod metrics;
pub mod pit;
pub mod rng;
pub mod split;

pub use classifier::{Classifier, ModelTrainer, ModelType};
pub use cross_validation::{cross_validate, time_series_cross_validate, CancellationToken, CrossValidationResult};
pub use ensemble::{EnsembleModel, StackedModel};
pub use gbm::{train_gbm, GbmConfig, GbmModel};
pub use linear::{train_linear, LinearTrainingOptions, ModelCoefficients};
pub use metrics::EvaluationMetrics;
pub use pit::EnforcementContext;
pub use rng::SeededRng;
