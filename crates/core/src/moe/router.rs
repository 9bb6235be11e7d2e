//! Top-k routing over merged experts.
//!
//! Routes tokens with a learned gate: softmax over router logits (computed
//! in f32 for stability), top-k selection, optional renormalization of the
//! selected weights. Raw logits are returned alongside the routing decision
//! for auxiliary-loss computation by the training side.

use candle_core::{DType, Tensor};
use candle_nn::{Linear, Module};

use crate::error::MergeError;

/// Routing configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub hidden_size: usize,
    pub num_experts: usize,
    pub top_k: usize,
    /// Renormalize the selected top-k weights to sum to 1.
    pub renormalize: bool,
}

/// Top-K router with softmax normalization.
pub struct TopKRouter {
    gate: Linear,
    config: RouterConfig,
}

impl TopKRouter {
    /// Build from a merged gate weight `[num_experts, hidden_size]`.
    pub fn new(gate_weight: Tensor, config: RouterConfig) -> Result<Self, MergeError> {
        let dims = gate_weight.dims2()?;
        if dims != (config.num_experts, config.hidden_size) {
            return Err(MergeError::InvalidConfig(format!(
                "router weight is {dims:?}, expected ({}, {})",
                config.num_experts, config.hidden_size
            )));
        }
        if config.top_k == 0 || config.top_k > config.num_experts {
            return Err(MergeError::InvalidConfig(format!(
                "top_k ({}) must be in 1..={}",
                config.top_k, config.num_experts
            )));
        }
        Ok(Self {
            gate: Linear::new(gate_weight, None),
            config,
        })
    }

    /// Route a flat token batch.
    ///
    /// # Arguments
    /// * `hidden_states` - `[num_tokens, hidden_size]`
    ///
    /// # Returns
    /// * routing weights `[num_tokens, top_k]` (input dtype)
    /// * selected expert indices `[num_tokens, top_k]`
    /// * raw router logits `[num_tokens, num_experts]`
    pub fn route(&self, hidden_states: &Tensor) -> Result<(Tensor, Tensor, Tensor), MergeError> {
        let router_logits = self.gate.forward(hidden_states)?;

        // Softmax in f32 regardless of the model dtype.
        let probs = candle_nn::ops::softmax(
            &router_logits.to_dtype(DType::F32)?,
            candle_core::D::Minus1,
        )?;

        let (top_k_weights, top_k_indices) = top_k_with_indices(&probs, self.config.top_k)?;

        let weights = if self.config.renormalize {
            let sum = top_k_weights.sum_keepdim(candle_core::D::Minus1)?;
            top_k_weights.broadcast_div(&sum)?
        } else {
            top_k_weights
        };

        let weights = weights.to_dtype(hidden_states.dtype())?;
        Ok((weights, top_k_indices, router_logits))
    }

    pub fn num_experts(&self) -> usize {
        self.config.num_experts
    }

    pub fn top_k(&self) -> usize {
        self.config.top_k
    }
}

/// Top-k values and indices along the last dimension.
fn top_k_with_indices(tensor: &Tensor, k: usize) -> candle_core::Result<(Tensor, Tensor)> {
    let dim = tensor.dims().len() - 1;
    let n = tensor.dim(dim)?;

    if k >= n {
        let indices = tensor.arg_sort_last_dim(false)?;
        return Ok((tensor.contiguous()?, indices.contiguous()?));
    }

    let sorted_indices = tensor.arg_sort_last_dim(false)?;
    let top_k_indices = sorted_indices.narrow(dim, 0, k)?.contiguous()?;
    let top_k_values = tensor.contiguous()?.gather(&top_k_indices, dim)?;
    Ok((top_k_values, top_k_indices))
}
