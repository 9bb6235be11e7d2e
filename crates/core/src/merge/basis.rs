//! Sharing of low-rank delta factors across the expert population.
//!
//! Three policies: private pairs per expert, a shared right factor (V) with
//! per-expert U blocks sliced from one stacked factorization, and a fully
//! shared (U, V) pair obtained by frequency-averaging the U blocks.

use candle_core::{DType, Tensor};

use crate::config::DeltaSharing;
use crate::error::MergeError;
use crate::merge::svd::{DeltaFactorizer, DeltaFactorPair, RankSpec};

/// Factorized deltas for one projection across all experts.
#[derive(Debug, Clone)]
pub enum ProjectionDeltas {
    /// One private pair per expert.
    Private(Vec<DeltaFactorPair>),
    /// Shared V; per-expert U row blocks sliced from the stacked U.
    SharedV { u_blocks: Vec<Tensor>, v: Tensor },
    /// Fully shared factors.
    SharedVU { u: Tensor, v: Tensor },
}

impl ProjectionDeltas {
    /// The effective (U, V) pair for expert `i`.
    pub fn factors_for(&self, i: usize) -> (&Tensor, &Tensor) {
        match self {
            ProjectionDeltas::Private(pairs) => (&pairs[i].u, &pairs[i].v),
            ProjectionDeltas::SharedV { u_blocks, v } => (&u_blocks[i], v),
            ProjectionDeltas::SharedVU { u, v } => (u, v),
        }
    }
}

/// Factorize one projection's per-expert deltas under `sharing`.
///
/// `rank` is the per-expert rank (already derived from the compression
/// ratio). `scales` carries one scale statistic per expert for the private
/// policy; the shared policies expect the caller to have reduced the
/// statistics to a single `shared_scale`.
pub fn aggregate_deltas(
    factorizer: &DeltaFactorizer,
    sharing: DeltaSharing,
    deltas: &[Tensor],
    rank: usize,
    scales: Option<&[Tensor]>,
    shared_scale: Option<&Tensor>,
    freq: &[f64],
) -> Result<ProjectionDeltas, MergeError> {
    match sharing {
        DeltaSharing::NoShare => {
            let mut pairs = Vec::with_capacity(deltas.len());
            for (i, delta) in deltas.iter().enumerate() {
                let scale = scales.map(|s| &s[i]);
                pairs.push(factorizer.factorize(delta, RankSpec::Rank(rank), scale)?);
            }
            Ok(ProjectionDeltas::Private(pairs))
        }
        DeltaSharing::ShareV => {
            let (u_blocks, v) = factorize_stacked(factorizer, deltas, rank, shared_scale)?;
            Ok(ProjectionDeltas::SharedV { u_blocks, v })
        }
        DeltaSharing::ShareVU => {
            let (u_blocks, v) = factorize_stacked(factorizer, deltas, rank, shared_scale)?;
            let u = average_u_blocks(&u_blocks, freq)?;
            Ok(ProjectionDeltas::SharedVU { u, v })
        }
    }
}

/// Stack all experts' deltas row-wise, factorize once, and slice the stacked
/// U back into per-expert row blocks. Block `i` spans rows
/// `[i·rows, (i+1)·rows)`; concatenating the blocks reproduces the stacked U
/// exactly.
pub fn factorize_stacked(
    factorizer: &DeltaFactorizer,
    deltas: &[Tensor],
    rank: usize,
    scale: Option<&Tensor>,
) -> Result<(Vec<Tensor>, Tensor), MergeError> {
    let (rows, _cols) = deltas[0].dims2()?;
    let stacked = Tensor::cat(deltas, 0)?;

    let pair = factorizer.factorize(&stacked, RankSpec::Rank(rank), scale)?;

    let mut u_blocks = Vec::with_capacity(deltas.len());
    for i in 0..deltas.len() {
        u_blocks.push(pair.u.narrow(0, i * rows, rows)?);
    }
    Ok((u_blocks, pair.v))
}

/// Frequency-weighted average of per-expert U blocks into one shared U.
pub fn average_u_blocks(u_blocks: &[Tensor], freq: &[f64]) -> Result<Tensor, MergeError> {
    if u_blocks.len() != freq.len() {
        return Err(MergeError::InvalidConfig(format!(
            "{} U blocks for {} frequencies",
            u_blocks.len(),
            freq.len()
        )));
    }
    let total: f64 = freq.iter().sum();
    if total <= 0.0 {
        return Err(MergeError::ZeroTotalWeight);
    }

    let dtype = u_blocks[0].dtype();
    let mut acc: Option<Tensor> = None;
    for (block, f) in u_blocks.iter().zip(freq) {
        let term = block.to_dtype(DType::F64)?.affine(f / total, 0.0)?;
        acc = Some(match acc {
            None => term,
            Some(a) => a.add(&term)?,
        });
    }
    Ok(acc.expect("at least one U block").to_dtype(dtype)?)
}
