pub mod example;
pub mod features;

pub use example::*;
pub use features::{FeatureSchema, FeatureVector};
