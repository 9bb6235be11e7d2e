//! Merged-expert module: shared mean backbone plus a low-rank delta.
//!
//! Each routed expert is replaced by this unit after the offline merge. The
//! backbone weights are shared across every expert of a layer through `Arc`
//! handles and are read-only after the merge; the delta factors are private
//! or shared per the configured sharing policy.
//!
//! The transformation for input `x`:
//!
//! ```text
//! gate = Wmean_gate(x) + Ug(Vg(x))
//! up   = Wmean_up(x)   + Uu(Vu(x))
//! h    = act(gate) ⊙ up
//! out  = Wmean_down(h) + Ud(Vd(h))
//! ```
//!
//! With a delta compression ratio of zero the delta terms are absent and the
//! expert is a pure mean-weight FFN.

use std::sync::Arc;

use candle_core::Tensor;
use candle_nn::{Activation, Linear, Module};

use crate::error::MergeError;
use crate::merge::{LayerDeltas, MeanProjections, ProjectionDeltas};
use crate::prune::{generate_probe, select_channels, validate_selection, ChannelScorer};

/// Shared backbone weights for one MoE layer. Read-only after merge.
#[derive(Debug)]
pub struct MeanWeights {
    pub gate: Linear,
    pub up: Linear,
    pub down: Linear,
}

impl MeanWeights {
    pub fn new(mean: &MeanProjections) -> Self {
        Self {
            gate: Linear::new(mean.gate.clone(), None),
            up: Linear::new(mean.up.clone(), None),
            down: Linear::new(mean.down.clone(), None),
        }
    }

    pub fn intermediate_size(&self) -> usize {
        self.gate.weight().dims()[0]
    }
}

/// One low-rank pair applied as `u(v(x))`.
#[derive(Debug, Clone)]
pub struct LowRank {
    pub u: Linear,
    pub v: Linear,
}

impl LowRank {
    pub fn new(u: Tensor, v: Tensor) -> Self {
        Self {
            u: Linear::new(u, None),
            v: Linear::new(v, None),
        }
    }

    pub fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        self.u.forward(&self.v.forward(x)?)
    }
}

/// Shared right factors for the three projections (share-V policy).
#[derive(Debug)]
pub struct SharedVBasis {
    pub gate_v: Linear,
    pub up_v: Linear,
    pub down_v: Linear,
}

/// Fully shared factors (share-VU policy).
#[derive(Debug)]
pub struct SharedUvBasis {
    pub gate: LowRank,
    pub up: LowRank,
    pub down: LowRank,
}

/// Delta factors held by one expert.
#[derive(Debug)]
pub enum DeltaFactors {
    /// Delta ratio 0: pure mean-weight expert.
    None,
    /// Private factors for every projection.
    Private {
        gate: LowRank,
        up: LowRank,
        down: LowRank,
    },
    /// Private U blocks over a shared V basis.
    SharedV {
        gate_u: Linear,
        up_u: Linear,
        down_u: Linear,
        basis: Arc<SharedVBasis>,
    },
    /// Everything shared.
    SharedVU { basis: Arc<SharedUvBasis> },
}

impl DeltaFactors {
    fn gate_uv(&self) -> Option<(&Linear, &Linear)> {
        match self {
            DeltaFactors::None => None,
            DeltaFactors::Private { gate, .. } => Some((&gate.u, &gate.v)),
            DeltaFactors::SharedV { gate_u, basis, .. } => Some((gate_u, &basis.gate_v)),
            DeltaFactors::SharedVU { basis } => Some((&basis.gate.u, &basis.gate.v)),
        }
    }

    fn up_uv(&self) -> Option<(&Linear, &Linear)> {
        match self {
            DeltaFactors::None => None,
            DeltaFactors::Private { up, .. } => Some((&up.u, &up.v)),
            DeltaFactors::SharedV { up_u, basis, .. } => Some((up_u, &basis.up_v)),
            DeltaFactors::SharedVU { basis } => Some((&basis.up.u, &basis.up.v)),
        }
    }

    fn down_uv(&self) -> Option<(&Linear, &Linear)> {
        match self {
            DeltaFactors::None => None,
            DeltaFactors::Private { down, .. } => Some((&down.u, &down.v)),
            DeltaFactors::SharedV { down_u, basis, .. } => Some((down_u, &basis.down_v)),
            DeltaFactors::SharedVU { basis } => Some((&basis.down.u, &basis.down.v)),
        }
    }

    /// Whether the V factors are shared (so `V·x` products can be reused
    /// across experts).
    pub fn has_shared_v(&self) -> bool {
        matches!(
            self,
            DeltaFactors::SharedV { .. } | DeltaFactors::SharedVU { .. }
        )
    }
}

/// Precomputed backbone activations for shared-inference reuse.
///
/// The mean gate/up products (and shared `V·x` products when V is shared)
/// are identical for every expert of a layer, so a caller dispatching the
/// same tokens to several experts computes them once.
#[derive(Debug, Clone)]
pub struct SharedActivations {
    /// `Wmean_gate(x)`, `[tokens, intermediate]`
    pub gate: Tensor,
    /// `Wmean_up(x)`, `[tokens, intermediate]`
    pub up: Tensor,
    /// `Vg(x)` when V is shared, `[tokens, rank]`
    pub gate_v: Option<Tensor>,
    /// `Vu(x)` when V is shared, `[tokens, rank]`
    pub up_v: Option<Tensor>,
}

/// Per-expert pruning settings, fixed at construction.
#[derive(Debug, Clone)]
pub struct PruneSettings {
    /// Fraction of intermediate channels dropped.
    pub prune_ratio: f64,
    /// Fraction of sequence positions probed.
    pub probe_ratio: f64,
    /// This layer is exempt from pruning.
    pub skip: bool,
}

/// Operating mode for one forward call. Modes are mutually exclusive and
/// dispatched by pattern matching.
#[derive(Clone, Copy)]
pub enum ExpertForward<'a> {
    /// Exact computation.
    Full,
    /// Statistics collection; always the full unpruned path.
    Calibration,
    /// Probe-directed channel pruning via the scoring oracle.
    Pruned(&'a dyn ChannelScorer),
    /// Add this expert's delta onto precomputed backbone activations.
    SharedReuse(&'a SharedActivations),
}

/// The runtime unit replacing a single expert after merging.
#[derive(Debug)]
pub struct MergedExpert {
    mean: Arc<MeanWeights>,
    deltas: DeltaFactors,
    act: Activation,
    prune: PruneSettings,
}

impl MergedExpert {
    pub fn new(
        mean: Arc<MeanWeights>,
        deltas: DeltaFactors,
        act: Activation,
        prune: PruneSettings,
    ) -> Self {
        Self {
            mean,
            deltas,
            act,
            prune,
        }
    }

    pub fn deltas(&self) -> &DeltaFactors {
        &self.deltas
    }

    /// Backbone weight handle, shared across the layer's experts.
    pub fn mean_weights(&self) -> &MeanWeights {
        &self.mean
    }

    /// `Vg(x)` when the V basis is shared across experts.
    pub fn shared_gate_v(&self, x: &Tensor) -> Result<Option<Tensor>, MergeError> {
        match &self.deltas {
            DeltaFactors::SharedV { basis, .. } => Ok(Some(basis.gate_v.forward(x)?)),
            DeltaFactors::SharedVU { basis } => Ok(Some(basis.gate.v.forward(x)?)),
            _ => Ok(None),
        }
    }

    /// `Vu(x)` when the V basis is shared across experts.
    pub fn shared_up_v(&self, x: &Tensor) -> Result<Option<Tensor>, MergeError> {
        match &self.deltas {
            DeltaFactors::SharedV { basis, .. } => Ok(Some(basis.up_v.forward(x)?)),
            DeltaFactors::SharedVU { basis } => Ok(Some(basis.up.v.forward(x)?)),
            _ => Ok(None),
        }
    }

    /// Forward one token batch `[tokens, hidden]` under `mode`.
    pub fn forward(&self, x: &Tensor, mode: ExpertForward<'_>) -> Result<Tensor, MergeError> {
        match mode {
            ExpertForward::Full | ExpertForward::Calibration => self.forward_full(x),
            ExpertForward::Pruned(scorer) => {
                if self.prune.skip {
                    self.forward_full(x)
                } else {
                    self.forward_pruned(x, scorer)
                }
            }
            ExpertForward::SharedReuse(acts) => self.forward_shared(x, acts),
        }
    }

    fn forward_full(&self, x: &Tensor) -> Result<Tensor, MergeError> {
        let gate = self.with_delta(self.mean.gate.forward(x)?, self.deltas.gate_uv(), x)?;
        let up = self.with_delta(self.mean.up.forward(x)?, self.deltas.up_uv(), x)?;
        let h = gate.apply(&self.act)?.mul(&up)?;
        Ok(self.with_delta(self.mean.down.forward(&h)?, self.deltas.down_uv(), &h)?)
    }

    fn with_delta(
        &self,
        base: Tensor,
        uv: Option<(&Linear, &Linear)>,
        x: &Tensor,
    ) -> candle_core::Result<Tensor> {
        match uv {
            None => Ok(base),
            Some((u, v)) => base.add(&u.forward(&v.forward(x)?)?),
        }
    }

    /// Pruned path: probe, score, and restrict the intermediate dimension to
    /// the selected channels. Output shape matches the full path.
    fn forward_pruned(
        &self,
        x: &Tensor,
        scorer: &dyn ChannelScorer,
    ) -> Result<Tensor, MergeError> {
        let intermediate = self.mean.intermediate_size();

        // Probe: subsampled tokens through the full gate/up transformation.
        let probe = generate_probe(x, self.prune.probe_ratio)?;
        let probe_gate =
            self.with_delta(self.mean.gate.forward(&probe)?, self.deltas.gate_uv(), &probe)?;
        let probe_up =
            self.with_delta(self.mean.up.forward(&probe)?, self.deltas.up_uv(), &probe)?;
        let probe_out = probe_gate.apply(&self.act)?.mul(&probe_up)?;

        // Score against the effective down projection (mean + delta).
        let down_eff = match self.deltas.down_uv() {
            None => self.mean.down.weight().clone(),
            Some((u, v)) => self
                .mean
                .down
                .weight()
                .add(&u.weight().matmul(v.weight())?)?,
        };
        let scores = scorer.score(&probe_out, &down_eff)?;
        let selected = select_channels(&scores, self.prune.prune_ratio)?;
        validate_selection(&selected, intermediate)?;

        let idx = Tensor::from_vec(
            selected.iter().map(|&i| i as u32).collect::<Vec<_>>(),
            selected.len(),
            x.device(),
        )?;

        // Gate/up restricted to the selected output channels.
        let gate_w = self.mean.gate.weight().index_select(&idx, 0)?;
        let up_w = self.mean.up.weight().index_select(&idx, 0)?;
        let mut gate = x.matmul(&gate_w.t()?)?;
        let mut up = x.matmul(&up_w.t()?)?;
        if let Some((u, v)) = self.deltas.gate_uv() {
            let u_sel = u.weight().index_select(&idx, 0)?;
            gate = gate.add(&v.forward(x)?.matmul(&u_sel.t()?)?)?;
        }
        if let Some((u, v)) = self.deltas.up_uv() {
            let u_sel = u.weight().index_select(&idx, 0)?;
            up = up.add(&v.forward(x)?.matmul(&u_sel.t()?)?)?;
        }
        let h = gate.apply(&self.act)?.mul(&up)?;

        // Down restricted to the selected input channels.
        let down_w = self.mean.down.weight().index_select(&idx, 1)?;
        let mut out = h.matmul(&down_w.t()?)?;
        if let Some((u, v)) = self.deltas.down_uv() {
            let v_sel = v.weight().index_select(&idx, 1)?;
            out = out.add(&h.matmul(&v_sel.t()?)?.matmul(&u.weight().t()?)?)?;
        }
        Ok(out)
    }

    /// Shared-inference path: backbone gate/up products arrive precomputed;
    /// only the delta contribution and the down projection run here.
    fn forward_shared(
        &self,
        x: &Tensor,
        acts: &SharedActivations,
    ) -> Result<Tensor, MergeError> {
        let gate = match self.deltas.gate_uv() {
            None => acts.gate.clone(),
            Some((u, v)) => match &acts.gate_v {
                Some(vx) => acts.gate.add(&u.forward(vx)?)?,
                None => acts.gate.add(&u.forward(&v.forward(x)?)?)?,
            },
        };
        let up = match self.deltas.up_uv() {
            None => acts.up.clone(),
            Some((u, v)) => match &acts.up_v {
                Some(vx) => acts.up.add(&u.forward(vx)?)?,
                None => acts.up.add(&u.forward(&v.forward(x)?)?)?,
            },
        };
        let h = gate.apply(&self.act)?.mul(&up)?;
        Ok(self.with_delta(self.mean.down.forward(&h)?, self.deltas.down_uv(), &h)?)
    }
}

/// Build the per-expert delta factors from a merged layer's delta bundle.
pub fn build_expert_deltas(
    deltas: Option<&LayerDeltas>,
    num_experts: usize,
) -> Result<Vec<DeltaFactors>, MergeError> {
    let Some(deltas) = deltas else {
        return Ok((0..num_experts).map(|_| DeltaFactors::None).collect());
    };

    match (&deltas.gate, &deltas.up, &deltas.down) {
        (
            ProjectionDeltas::Private(gate),
            ProjectionDeltas::Private(up),
            ProjectionDeltas::Private(down),
        ) => Ok((0..num_experts)
            .map(|i| DeltaFactors::Private {
                gate: LowRank::new(gate[i].u.clone(), gate[i].v.clone()),
                up: LowRank::new(up[i].u.clone(), up[i].v.clone()),
                down: LowRank::new(down[i].u.clone(), down[i].v.clone()),
            })
            .collect()),
        (
            ProjectionDeltas::SharedV {
                u_blocks: gate_u,
                v: gate_v,
            },
            ProjectionDeltas::SharedV {
                u_blocks: up_u,
                v: up_v,
            },
            ProjectionDeltas::SharedV {
                u_blocks: down_u,
                v: down_v,
            },
        ) => {
            let basis = Arc::new(SharedVBasis {
                gate_v: Linear::new(gate_v.clone(), None),
                up_v: Linear::new(up_v.clone(), None),
                down_v: Linear::new(down_v.clone(), None),
            });
            Ok((0..num_experts)
                .map(|i| DeltaFactors::SharedV {
                    gate_u: Linear::new(gate_u[i].clone(), None),
                    up_u: Linear::new(up_u[i].clone(), None),
                    down_u: Linear::new(down_u[i].clone(), None),
                    basis: Arc::clone(&basis),
                })
                .collect())
        }
        (
            ProjectionDeltas::SharedVU { u: gu, v: gv },
            ProjectionDeltas::SharedVU { u: uu, v: uv },
            ProjectionDeltas::SharedVU { u: du, v: dv },
        ) => {
            let basis = Arc::new(SharedUvBasis {
                gate: LowRank::new(gu.clone(), gv.clone()),
                up: LowRank::new(uu.clone(), uv.clone()),
                down: LowRank::new(du.clone(), dv.clone()),
            });
            Ok((0..num_experts)
                .map(|_| DeltaFactors::SharedVU {
                    basis: Arc::clone(&basis),
                })
                .collect())
        }
        _ => Err(MergeError::InvalidConfig(
            "mixed sharing policies across projections".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prune::NormProbeScorer;
    use candle_core::{DType, Device};

    fn mean_weights(intermediate: usize, hidden: usize) -> Arc<MeanWeights> {
        let device = Device::Cpu;
        let mk = |rows: usize, cols: usize, offset: usize| {
            let data: Vec<f32> = (0..rows * cols)
                .map(|i| ((i + offset) as f32 * 0.13).sin() * 0.4)
                .collect();
            Tensor::from_vec(data, (rows, cols), &device).unwrap()
        };
        Arc::new(MeanWeights::new(&MeanProjections {
            gate: mk(intermediate, hidden, 0),
            up: mk(intermediate, hidden, 100),
            down: mk(hidden, intermediate, 200),
        }))
    }

    fn private_deltas(intermediate: usize, hidden: usize, rank: usize) -> DeltaFactors {
        let device = Device::Cpu;
        let mk = |rows: usize, cols: usize, offset: usize| {
            let data: Vec<f32> = (0..rows * cols)
                .map(|i| ((i + offset) as f32 * 0.31).cos() * 0.1)
                .collect();
            Tensor::from_vec(data, (rows, cols), &device).unwrap()
        };
        DeltaFactors::Private {
            gate: LowRank::new(mk(intermediate, rank, 1), mk(rank, hidden, 2)),
            up: LowRank::new(mk(intermediate, rank, 3), mk(rank, hidden, 4)),
            down: LowRank::new(mk(hidden, rank, 5), mk(rank, intermediate, 6)),
        }
    }

    fn no_prune() -> PruneSettings {
        PruneSettings {
            prune_ratio: 0.0,
            probe_ratio: 1.0,
            skip: false,
        }
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        a.sub(b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()
            .into_iter()
            .fold(0.0, f32::max)
    }

    #[test]
    fn full_forward_shape() {
        let expert = MergedExpert::new(
            mean_weights(8, 6),
            private_deltas(8, 6, 2),
            Activation::Silu,
            no_prune(),
        );
        let x = Tensor::randn(0f32, 1.0, (5, 6), &Device::Cpu).unwrap();
        let out = expert.forward(&x, ExpertForward::Full).unwrap();
        assert_eq!(out.dims(), &[5, 6]);
    }

    #[test]
    fn zero_delta_equals_mean_only_bitwise() {
        let mean = mean_weights(8, 6);
        let expert = MergedExpert::new(
            Arc::clone(&mean),
            DeltaFactors::None,
            Activation::Silu,
            no_prune(),
        );
        let x = Tensor::randn(0f32, 1.0, (4, 6), &Device::Cpu).unwrap();
        let out = expert.forward(&x, ExpertForward::Full).unwrap();

        // Plain mean-weight FFN, computed directly.
        let gate = mean.gate.forward(&x).unwrap();
        let up = mean.up.forward(&x).unwrap();
        let h = gate.apply(&Activation::Silu).unwrap().mul(&up).unwrap();
        let expect = mean.down.forward(&h).unwrap();

        let a: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = expect.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b, "delta-free forward must be bit-identical");
    }

    #[test]
    fn calibration_equals_full() {
        let expert = MergedExpert::new(
            mean_weights(8, 6),
            private_deltas(8, 6, 2),
            Activation::Silu,
            no_prune(),
        );
        let x = Tensor::randn(0f32, 1.0, (4, 6), &Device::Cpu).unwrap();
        let full = expert.forward(&x, ExpertForward::Full).unwrap();
        let calib = expert.forward(&x, ExpertForward::Calibration).unwrap();
        assert_eq!(max_abs_diff(&full, &calib), 0.0);
    }

    #[test]
    fn pruned_keep_all_matches_full() {
        let expert = MergedExpert::new(
            mean_weights(8, 6),
            private_deltas(8, 6, 2),
            Activation::Silu,
            no_prune(), // prune_ratio 0: every channel kept
        );
        let x = Tensor::randn(0f32, 1.0, (6, 6), &Device::Cpu).unwrap();
        let full = expert.forward(&x, ExpertForward::Full).unwrap();
        let pruned = expert
            .forward(&x, ExpertForward::Pruned(&NormProbeScorer))
            .unwrap();
        assert!(max_abs_diff(&full, &pruned) < 1e-5);
    }

    #[test]
    fn pruned_output_keeps_final_shape() {
        let expert = MergedExpert::new(
            mean_weights(16, 6),
            private_deltas(16, 6, 2),
            Activation::Silu,
            PruneSettings {
                prune_ratio: 0.5,
                probe_ratio: 0.5,
                skip: false,
            },
        );
        let x = Tensor::randn(0f32, 1.0, (10, 6), &Device::Cpu).unwrap();
        let out = expert
            .forward(&x, ExpertForward::Pruned(&NormProbeScorer))
            .unwrap();
        assert_eq!(out.dims(), &[10, 6]);
    }

    #[test]
    fn pruned_skip_layer_falls_back_to_full() {
        let expert = MergedExpert::new(
            mean_weights(8, 6),
            private_deltas(8, 6, 2),
            Activation::Silu,
            PruneSettings {
                prune_ratio: 0.5,
                probe_ratio: 0.5,
                skip: true,
            },
        );
        let x = Tensor::randn(0f32, 1.0, (4, 6), &Device::Cpu).unwrap();
        let full = expert.forward(&x, ExpertForward::Full).unwrap();
        let pruned = expert
            .forward(&x, ExpertForward::Pruned(&NormProbeScorer))
            .unwrap();
        assert_eq!(max_abs_diff(&full, &pruned), 0.0);
    }

    #[test]
    fn pruned_empty_selection_fails_fast() {
        let expert = MergedExpert::new(
            mean_weights(4, 6),
            DeltaFactors::None,
            Activation::Silu,
            PruneSettings {
                prune_ratio: 0.9, // floor(4·0.1) = 0 channels kept
                probe_ratio: 1.0,
                skip: false,
            },
        );
        let x = Tensor::randn(0f32, 1.0, (4, 6), &Device::Cpu).unwrap();
        let err = expert
            .forward(&x, ExpertForward::Pruned(&NormProbeScorer))
            .unwrap_err();
        assert!(matches!(err, MergeError::EmptySelection));
    }

    #[test]
    fn shared_reuse_matches_full() {
        let mean = mean_weights(8, 6);
        let expert = MergedExpert::new(
            Arc::clone(&mean),
            private_deltas(8, 6, 2),
            Activation::Silu,
            no_prune(),
        );
        let x = Tensor::randn(0f32, 1.0, (5, 6), &Device::Cpu).unwrap();

        let acts = SharedActivations {
            gate: mean.gate.forward(&x).unwrap(),
            up: mean.up.forward(&x).unwrap(),
            gate_v: None,
            up_v: None,
        };

        let full = expert.forward(&x, ExpertForward::Full).unwrap();
        let shared = expert
            .forward(&x, ExpertForward::SharedReuse(&acts))
            .unwrap();
        assert!(max_abs_diff(&full, &shared) < 1e-6);
    }

    #[test]
    fn shared_reuse_with_precomputed_v_products() {
        let mean = mean_weights(8, 6);
        let deltas = private_deltas(8, 6, 2);
        let (gv, uv) = match &deltas {
            DeltaFactors::Private { gate, up, .. } => (gate.v.clone(), up.v.clone()),
            _ => unreachable!(),
        };
        let expert = MergedExpert::new(Arc::clone(&mean), deltas, Activation::Silu, no_prune());
        let x = Tensor::randn(0f32, 1.0, (5, 6), &Device::Cpu).unwrap();

        let acts = SharedActivations {
            gate: mean.gate.forward(&x).unwrap(),
            up: mean.up.forward(&x).unwrap(),
            gate_v: Some(gv.forward(&x).unwrap()),
            up_v: Some(uv.forward(&x).unwrap()),
        };

        let full = expert.forward(&x, ExpertForward::Full).unwrap();
        let shared = expert
            .forward(&x, ExpertForward::SharedReuse(&acts))
            .unwrap();
        assert!(max_abs_diff(&full, &shared) < 1e-6);
    }

    #[test]
    fn build_deltas_none_for_zero_ratio() {
        let out = build_expert_deltas(None, 3).unwrap();
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|d| matches!(d, DeltaFactors::None)));
    }

    #[test]
    fn shared_v_basis_is_shared_between_experts() {
        let device = Device::Cpu;
        let mk = |rows: usize, cols: usize| {
            Tensor::zeros((rows, cols), DType::F32, &device).unwrap()
        };
        let proj = |rows: usize, cols: usize, rank: usize| ProjectionDeltas::SharedV {
            u_blocks: vec![mk(rows, rank), mk(rows, rank)],
            v: mk(rank, cols),
        };
        let deltas = LayerDeltas {
            gate: proj(8, 6, 2),
            up: proj(8, 6, 2),
            down: proj(6, 8, 2),
            rank: 2,
        };
        let experts = build_expert_deltas(Some(&deltas), 2).unwrap();
        let bases: Vec<_> = experts
            .iter()
            .map(|d| match d {
                DeltaFactors::SharedV { basis, .. } => Arc::as_ptr(basis),
                _ => panic!("expected SharedV"),
            })
            .collect();
        assert_eq!(bases[0], bases[1], "experts must reference one shared basis");
        assert!(experts[0].has_shared_v());
    }
}
