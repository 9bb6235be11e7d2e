//! Read-only interface to the original (unmerged) model.
//!
//! The merge pipeline never owns the original weights; it reads them through
//! this trait, keyed by projection and expert index. Scale statistics and
//! Fisher scalars are optional collaborator-supplied inputs.

use candle_core::{Result, Tensor};

/// One of the three expert FFN projections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Projection {
    Gate,
    Up,
    Down,
}

impl Projection {
    pub const ALL: [Projection; 3] = [Projection::Gate, Projection::Up, Projection::Down];

    /// Stable identifier used to key external statistics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Projection::Gate => "gate_proj",
            Projection::Up => "up_proj",
            Projection::Down => "down_proj",
        }
    }
}

/// Per-expert gate/up/down weights for one expert.
#[derive(Debug, Clone)]
pub struct ExpertWeights {
    /// `[intermediate, hidden]`
    pub gate: Tensor,
    /// `[intermediate, hidden]`
    pub up: Tensor,
    /// `[hidden, intermediate]`
    pub down: Tensor,
}

impl ExpertWeights {
    pub fn get(&self, projection: Projection) -> &Tensor {
        match projection {
            Projection::Gate => &self.gate,
            Projection::Up => &self.up,
            Projection::Down => &self.down,
        }
    }
}

/// Collaborator supplying the original model's MoE-layer weights and
/// statistics. Read-only for the duration of a merge.
pub trait ExpertWeightSource {
    /// Number of routed experts.
    fn num_experts(&self) -> usize;

    /// Weight matrix of `projection` for expert `expert`.
    fn expert_weight(&self, projection: Projection, expert: usize) -> Result<Tensor>;

    /// Router gate weight, `[num_experts, hidden]`.
    fn router_weight(&self) -> Result<Tensor>;

    /// Shared-expert weight for `projection`.
    fn shared_expert_weight(&self, projection: Projection) -> Result<Tensor>;

    /// Shared-expert sigmoid gate weight, `[1, hidden]`.
    fn shared_expert_gate_weight(&self) -> Result<Tensor>;

    /// Per-expert usage counts; must sum to a positive value.
    fn expert_frequency(&self) -> &[f64];

    /// Optional covariance-like scale statistic for `(projection, expert)`,
    /// square `[cols, cols]` for the projection's input dimension.
    fn scale(&self, _projection: Projection, _expert: usize) -> Option<Tensor> {
        None
    }

    /// Optional Fisher-information scalar for `(projection, expert)`.
    fn fisher(&self, _projection: Projection, _expert: usize) -> Option<f64> {
        None
    }
}
