//! One-shot offline merge of an MoE layer's experts.
//!
//! Reads the original weights through [`ExpertWeightSource`], computes the
//! cross-expert mean per projection, factorizes the per-expert deltas under
//! the configured sharing policy, and emits a complete
//! [`MergedLayerWeights`] bundle. The bundle is built in full before anything
//! consumes it: a partially merged layer is never observable.

use candle_core::{DType, Tensor};

use crate::config::{MoeMergeConfig, ScalePolicy};
use crate::error::MergeError;
use crate::merge::basis::{aggregate_deltas, ProjectionDeltas};
use crate::merge::mean::mean_weight;
use crate::merge::svd::DeltaFactorizer;
use crate::source::{ExpertWeightSource, ExpertWeights, Projection};

/// Mean backbone weights, one per projection.
#[derive(Debug, Clone)]
pub struct MeanProjections {
    /// `[intermediate, hidden]`
    pub gate: Tensor,
    /// `[intermediate, hidden]`
    pub up: Tensor,
    /// `[hidden, intermediate]`
    pub down: Tensor,
}

/// Factorized deltas for all three projections.
#[derive(Debug, Clone)]
pub struct LayerDeltas {
    pub gate: ProjectionDeltas,
    pub up: ProjectionDeltas,
    pub down: ProjectionDeltas,
    /// Per-expert delta rank.
    pub rank: usize,
}

/// Everything a merged MoE layer needs, produced atomically by one merge.
#[derive(Debug, Clone)]
pub struct MergedLayerWeights {
    /// Router gate, `[num_experts, hidden]`.
    pub router: Tensor,
    /// Always-active shared expert.
    pub shared_expert: ExpertWeights,
    /// Sigmoid gate for the shared expert, `[1, hidden]`.
    pub shared_expert_gate: Tensor,
    pub mean: MeanProjections,
    /// `None` when the delta compression ratio is zero.
    pub deltas: Option<LayerDeltas>,
}

/// Drives the offline merge for one MoE layer.
pub struct ExpertMerger {
    config: MoeMergeConfig,
    factorizer: DeltaFactorizer,
}

impl ExpertMerger {
    pub fn new(config: MoeMergeConfig) -> Result<Self, MergeError> {
        config.validate()?;
        let factorizer = DeltaFactorizer::new(config.scale_policy, config.weight_dtype);
        Ok(Self { config, factorizer })
    }

    /// Replace the default SVD backend, keeping the configured policies.
    pub fn with_factorizer(
        config: MoeMergeConfig,
        factorizer: DeltaFactorizer,
    ) -> Result<Self, MergeError> {
        config.validate()?;
        Ok(Self { config, factorizer })
    }

    pub fn config(&self) -> &MoeMergeConfig {
        &self.config
    }

    /// Run the merge. Returns the complete weight bundle or the first error;
    /// no partial state escapes.
    pub fn merge(
        &self,
        source: &dyn ExpertWeightSource,
    ) -> Result<MergedLayerWeights, MergeError> {
        let cfg = &self.config;
        if source.num_experts() != cfg.num_experts {
            return Err(MergeError::InvalidConfig(format!(
                "source has {} experts, config expects {}",
                source.num_experts(),
                cfg.num_experts
            )));
        }

        tracing::info!(
            num_experts = cfg.num_experts,
            policy = ?cfg.merge_policy,
            sharing = ?cfg.delta_sharing,
            delta_ratio = cfg.delta_ratio,
            "merging MoE layer experts"
        );

        let mean = MeanProjections {
            gate: mean_weight(cfg.merge_policy, Projection::Gate, source, cfg.weight_dtype)?,
            up: mean_weight(cfg.merge_policy, Projection::Up, source, cfg.weight_dtype)?,
            down: mean_weight(cfg.merge_policy, Projection::Down, source, cfg.weight_dtype)?,
        };

        let deltas = if cfg.delta_ratio == 0.0 {
            None
        } else {
            let rank = cfg.delta_rank(cfg.intermediate_size, cfg.hidden_size);
            if rank == 0 {
                return Err(MergeError::InvalidConfig(format!(
                    "delta_ratio {} derives rank 0 for {}x{} projections",
                    cfg.delta_ratio, cfg.intermediate_size, cfg.hidden_size
                )));
            }
            Some(LayerDeltas {
                gate: self.factorize_projection(Projection::Gate, &mean.gate, rank, source)?,
                up: self.factorize_projection(Projection::Up, &mean.up, rank, source)?,
                down: self.factorize_projection(Projection::Down, &mean.down, rank, source)?,
                rank,
            })
        };

        let router = source.router_weight()?.to_dtype(cfg.weight_dtype)?;
        let shared_expert = ExpertWeights {
            gate: source
                .shared_expert_weight(Projection::Gate)?
                .to_dtype(cfg.weight_dtype)?,
            up: source
                .shared_expert_weight(Projection::Up)?
                .to_dtype(cfg.weight_dtype)?,
            down: source
                .shared_expert_weight(Projection::Down)?
                .to_dtype(cfg.weight_dtype)?,
        };
        let shared_expert_gate = source
            .shared_expert_gate_weight()?
            .to_dtype(cfg.weight_dtype)?;

        Ok(MergedLayerWeights {
            router,
            shared_expert,
            shared_expert_gate,
            mean,
            deltas,
        })
    }

    fn factorize_projection(
        &self,
        projection: Projection,
        mean: &Tensor,
        rank: usize,
        source: &dyn ExpertWeightSource,
    ) -> Result<ProjectionDeltas, MergeError> {
        let cfg = &self.config;
        let mean_f64 = mean.to_dtype(DType::F64)?;

        let mut deltas = Vec::with_capacity(cfg.num_experts);
        for i in 0..cfg.num_experts {
            let w = source.expert_weight(projection, i)?.to_dtype(DType::F64)?;
            deltas.push(w.sub(&mean_f64)?);
        }

        let scales = match cfg.scale_policy {
            ScalePolicy::None => None,
            _ => {
                let mut scales = Vec::with_capacity(cfg.num_experts);
                for i in 0..cfg.num_experts {
                    let s = source.scale(projection, i).ok_or_else(|| {
                        MergeError::InvalidConfig(format!(
                            "scale policy {:?} requires a scale statistic for {} expert {i}",
                            cfg.scale_policy,
                            projection.as_str()
                        ))
                    })?;
                    scales.push(s);
                }
                Some(scales)
            }
        };

        // Shared factorization sees one statistic: the frequency-weighted
        // average of the per-expert scales.
        let shared_scale = match &scales {
            Some(s) => Some(average_scales(s, source.expert_frequency())?),
            None => None,
        };

        aggregate_deltas(
            &self.factorizer,
            cfg.delta_sharing,
            &deltas,
            rank,
            scales.as_deref(),
            shared_scale.as_ref(),
            source.expert_frequency(),
        )
    }
}

/// Frequency-weighted average of per-expert scale statistics.
pub fn average_scales(scales: &[Tensor], freq: &[f64]) -> Result<Tensor, MergeError> {
    let total: f64 = freq.iter().sum();
    if total <= 0.0 {
        return Err(MergeError::ZeroTotalWeight);
    }
    let dtype = scales[0].dtype();
    let mut acc: Option<Tensor> = None;
    for (s, f) in scales.iter().zip(freq) {
        let term = s.to_dtype(DType::F64)?.affine(f / total, 0.0)?;
        acc = Some(match acc {
            None => term,
            Some(a) => a.add(&term)?,
        });
    }
    Ok(acc.expect("at least one scale").to_dtype(dtype)?)
}
