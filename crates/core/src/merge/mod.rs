//! Offline expert-merging pipeline.
//!
//! One-shot transformation of an MoE layer's expert population into a shared
//! mean weight plus low-rank per-expert deltas:
//!
//! - [`svd`]: truncated SVD factorization with scale correction and the
//!   noise-injection retry ladder
//! - [`mean`]: cross-expert mean weights (mean / freq / fisher policies)
//! - [`basis`]: factor sharing across experts (private / shared-V /
//!   shared-VU)
//! - [`merger`]: the orchestrator emitting a complete weight bundle

pub mod basis;
pub mod mean;
pub mod merger;
pub mod svd;

pub use basis::{aggregate_deltas, average_u_blocks, factorize_stacked, ProjectionDeltas};
pub use mean::{mean_weight, merge_weights};
pub use merger::{average_scales, ExpertMerger, LayerDeltas, MeanProjections, MergedLayerWeights};
pub use svd::{DeltaFactorPair, DeltaFactorizer, MassSplit, PowerIterationSvd, RankSpec, SvdBackend, SvdFactors};
