//! Merged MoE layer: top-k routing over merged experts plus an always-active
//! shared expert.
//!
//! Tokens are grouped per selected expert, each group runs through its
//! merged expert as one batch, outputs are scaled by the routing weight and
//! scattered back with `index_add` into a zero-initialized buffer. The
//! shared expert processes every token and its output is gated by a learned
//! sigmoid scalar. The scatter-add combination is associative, so per-expert
//! execution order does not affect the result beyond float rounding.

use std::sync::Arc;

use candle_core::{DType, Tensor};
use candle_nn::{Activation, Linear, Module};

use crate::config::{InferenceStage, MoeMergeConfig};
use crate::error::MergeError;
use crate::merge::MergedLayerWeights;
use crate::moe::expert::{
    build_expert_deltas, ExpertForward, MeanWeights, MergedExpert, PruneSettings,
    SharedActivations,
};
use crate::moe::router::{RouterConfig, TopKRouter};
use crate::prune::ChannelScorer;
use crate::source::ExpertWeights;

/// Operating mode for one layer forward call.
#[derive(Clone, Copy)]
pub enum LayerForward<'a> {
    /// Exact computation on every expert.
    Full,
    /// Full path, used while collecting pruning statistics.
    Calibration,
    /// Probe-directed channel pruning inside each expert.
    Pruned(&'a dyn ChannelScorer),
    /// Compute backbone gate/up products once and reuse them across experts.
    SharedReuse,
}

/// The plain SwiGLU expert that processes every token.
#[derive(Debug)]
struct SharedExpert {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
    act: Activation,
}

impl SharedExpert {
    fn new(weights: &ExpertWeights, act: Activation) -> Self {
        Self {
            gate_proj: Linear::new(weights.gate.clone(), None),
            up_proj: Linear::new(weights.up.clone(), None),
            down_proj: Linear::new(weights.down.clone(), None),
            act,
        }
    }

    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let gate = self.gate_proj.forward(xs)?.apply(&self.act)?;
        let up = self.up_proj.forward(xs)?;
        self.down_proj.forward(&gate.mul(&up)?)
    }
}

/// MoE layer over merged experts.
pub struct MergedMoELayer {
    router: TopKRouter,
    experts: Vec<MergedExpert>,
    shared_expert: SharedExpert,
    shared_expert_gate: Linear,
    config: MoeMergeConfig,
}

impl MergedMoELayer {
    /// Build the layer from a completed merge bundle. The bundle is consumed
    /// whole; there is no way to observe a partially merged layer.
    pub fn new(
        config: MoeMergeConfig,
        layer_idx: usize,
        weights: MergedLayerWeights,
    ) -> Result<Self, MergeError> {
        config.validate()?;

        let router = TopKRouter::new(
            weights.router,
            RouterConfig {
                hidden_size: config.hidden_size,
                num_experts: config.num_experts,
                top_k: config.top_k,
                renormalize: config.norm_topk_prob,
            },
        )?;

        let mean = Arc::new(MeanWeights::new(&weights.mean));
        let deltas = build_expert_deltas(weights.deltas.as_ref(), config.num_experts)?;

        let prune = PruneSettings {
            prune_ratio: config.prune_ratio,
            probe_ratio: config.gate_probe_ratio,
            skip: config.skip_layers.contains(&layer_idx),
        };

        let experts = deltas
            .into_iter()
            .map(|d| MergedExpert::new(Arc::clone(&mean), d, config.hidden_act, prune.clone()))
            .collect();

        let shared_expert = SharedExpert::new(&weights.shared_expert, config.hidden_act);
        let shared_expert_gate = Linear::new(weights.shared_expert_gate, None);

        Ok(Self {
            router,
            experts,
            shared_expert,
            shared_expert_gate,
            config,
        })
    }

    /// The mode implied by the configured inference stage.
    pub fn stage_mode(&self) -> LayerForward<'static> {
        match self.config.stage {
            InferenceStage::Calibration => LayerForward::Calibration,
            InferenceStage::Test => LayerForward::Full,
        }
    }

    pub fn num_experts(&self) -> usize {
        self.experts.len()
    }

    pub fn top_k(&self) -> usize {
        self.router.top_k()
    }

    /// Forward pass.
    ///
    /// # Arguments
    /// * `hidden_states` - `[num_tokens, hidden]` or `[batch, seq, hidden]`
    ///
    /// # Returns
    /// * hidden states with the same shape as the input
    /// * router logits `[num_tokens, num_experts]`
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        mode: LayerForward<'_>,
    ) -> Result<(Tensor, Tensor), MergeError> {
        let orig_shape = hidden_states.dims().to_vec();
        let hidden_size = *orig_shape.last().ok_or_else(|| {
            MergeError::InvalidConfig("input tensor must have at least 1 dimension".to_string())
        })?;
        let num_tokens: usize = orig_shape.iter().take(orig_shape.len() - 1).product();
        let flat_hidden = hidden_states.reshape((num_tokens, hidden_size))?;

        let (routing_weights, expert_indices, router_logits) = self.router.route(&flat_hidden)?;

        let device = hidden_states.device();
        let dtype = hidden_states.dtype();
        let mut output = Tensor::zeros((num_tokens, hidden_size), dtype, device)?;

        // Backbone products for shared-inference reuse, computed once for the
        // whole token batch.
        let shared_acts = match mode {
            LayerForward::SharedReuse => Some(self.precompute_shared(&flat_hidden)?),
            _ => None,
        };

        // Group tokens by expert assignment.
        let expert_indices_vec: Vec<u32> = expert_indices.flatten_all()?.to_vec1()?;
        let routing_weights_vec: Vec<f32> = routing_weights
            .flatten_all()?
            .to_dtype(DType::F32)?
            .to_vec1()?;

        let mut expert_tokens: Vec<Vec<(usize, f32)>> =
            vec![Vec::new(); self.config.num_experts];
        for token_idx in 0..num_tokens {
            for k in 0..self.config.top_k {
                let flat_idx = token_idx * self.config.top_k + k;
                let expert_id = expert_indices_vec[flat_idx] as usize;
                if expert_id < self.config.num_experts {
                    expert_tokens[expert_id].push((token_idx, routing_weights_vec[flat_idx]));
                }
            }
        }

        // Each expert's tokens run as one batch; scatter-add is associative,
        // so the per-expert order is irrelevant.
        for (expert_id, tokens) in expert_tokens.iter().enumerate() {
            if tokens.is_empty() {
                continue;
            }

            let expert = &self.experts[expert_id];
            let batch_size = tokens.len();

            let indices: Vec<u32> = tokens.iter().map(|(idx, _)| *idx as u32).collect();
            let index_tensor = Tensor::from_vec(indices, batch_size, device)?;
            let batch_input = flat_hidden.index_select(&index_tensor, 0)?;

            let expert_output = match (&mode, &shared_acts) {
                (LayerForward::SharedReuse, Some(acts)) => {
                    let gathered = SharedActivations {
                        gate: acts.gate.index_select(&index_tensor, 0)?,
                        up: acts.up.index_select(&index_tensor, 0)?,
                        gate_v: match &acts.gate_v {
                            Some(t) => Some(t.index_select(&index_tensor, 0)?),
                            None => None,
                        },
                        up_v: match &acts.up_v {
                            Some(t) => Some(t.index_select(&index_tensor, 0)?),
                            None => None,
                        },
                    };
                    expert.forward(&batch_input, ExpertForward::SharedReuse(&gathered))?
                }
                (LayerForward::Pruned(scorer), _) => {
                    expert.forward(&batch_input, ExpertForward::Pruned(*scorer))?
                }
                (LayerForward::Calibration, _) => {
                    expert.forward(&batch_input, ExpertForward::Calibration)?
                }
                _ => expert.forward(&batch_input, ExpertForward::Full)?,
            };

            let weights_vec: Vec<f32> = tokens.iter().map(|(_, w)| *w).collect();
            let weights_tensor =
                Tensor::from_vec(weights_vec, batch_size, device)?.to_dtype(dtype)?;
            let weighted_output =
                expert_output.broadcast_mul(&weights_tensor.reshape((batch_size, 1))?)?;

            output = output.index_add(&index_tensor, &weighted_output, 0)?;
        }

        // Always-active shared expert, sigmoid-gated.
        let shared_output = self.shared_expert.forward(&flat_hidden)?;
        let gate_weight =
            candle_nn::ops::sigmoid(&self.shared_expert_gate.forward(&flat_hidden)?)?;
        let shared_output = shared_output.broadcast_mul(&gate_weight)?;
        output = output.add(&shared_output)?;

        Ok((output.reshape(orig_shape)?, router_logits))
    }

    /// Mean gate/up products (and shared `V·x` products) for the whole batch.
    fn precompute_shared(&self, flat_hidden: &Tensor) -> Result<SharedActivations, MergeError> {
        // Every expert holds the same Arc'd backbone; borrow it through the
        // first one.
        let expert = &self.experts[0];
        let mean = expert.mean_weights();
        let gate = mean.gate.forward(flat_hidden)?;
        let up = mean.up.forward(flat_hidden)?;

        let (gate_v, up_v) = if expert.deltas().has_shared_v() {
            (
                expert.shared_gate_v(flat_hidden)?,
                expert.shared_up_v(flat_hidden)?,
            )
        } else {
            (None, None)
        };

        Ok(SharedActivations {
            gate,
            up,
            gate_v,
            up_v,
        })
    }
}
