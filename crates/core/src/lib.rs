pub mod config;
pub mod error;
pub mod merge;
pub mod metrics;
pub mod moe;
pub mod prune;
pub mod source;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use config::{
    DeltaSharing, InferenceStage, MergeOptions, MergePolicy, MoeMergeConfig, ScalePolicy,
};
pub use error::MergeError;
