//! Feature importance, selection and interaction tooling.

pub mod importance;
pub mod interactions;
pub mod selection;

pub use importance::{
    ablation_study, coefficient_importance, gbm_importance, permutation_importance, AblationConfig,
    AblationReport, AblationResult, FeatureImportance, PermutationConfig, PermutationImportance,
};
pub use interactions::{add_interaction_features, detect_interactions, interaction_name, InteractionPair};
pub use selection::{
    correlation_matrix, low_variance_features, prune_correlated_features, select_features, CorrelationMatrix,
    PruneReport, SelectionCriteria,
};
