//! Merged Mixture-of-Experts runtime.
//!
//! ## Submodules
//!
//! - [`router`]: top-k gating with softmax normalization
//! - [`expert`]: the merged expert (mean backbone + low-rank delta) and its
//!   forward modes
//! - [`layer`]: dispatch/combine over merged experts plus the shared expert

pub mod expert;
pub mod layer;
pub mod router;

pub use expert::{
    build_expert_deltas, DeltaFactors, ExpertForward, LowRank, MeanWeights, MergedExpert,
    PruneSettings, SharedActivations, SharedUvBasis, SharedVBasis,
};
pub use layer::{LayerForward, MergedMoELayer};
pub use router::{RouterConfig, TopKRouter};
