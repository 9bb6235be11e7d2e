//! Probe-based channel selection for pruned expert inference.
//!
//! A cheap probe (a subsample of the token batch) is pushed through the
//! gate/up projections; a scoring oracle then ranks intermediate channels so
//! the expensive computation can be restricted to the important ones. The
//! oracle is a trait seam: the merged expert treats it as opaque.

use candle_core::{DType, Tensor};

use crate::error::MergeError;

/// Opaque per-channel importance oracle.
pub trait ChannelScorer: Send + Sync {
    /// Score every intermediate channel.
    ///
    /// * `probe_out` - probe activation `[probe_tokens, intermediate]`
    /// * `down_weight` - effective down projection `[hidden, intermediate]`
    fn score(&self, probe_out: &Tensor, down_weight: &Tensor) -> Result<Vec<f64>, MergeError>;
}

/// Default scorer: per-channel `‖probe_out[:, c]‖₂ · ‖W_down[:, c]‖₂`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NormProbeScorer;

impl ChannelScorer for NormProbeScorer {
    fn score(&self, probe_out: &Tensor, down_weight: &Tensor) -> Result<Vec<f64>, MergeError> {
        let act_norm = probe_out
            .to_dtype(DType::F32)?
            .sqr()?
            .sum(0)?
            .sqrt()?
            .to_vec1::<f32>()?;
        let w_norm = down_weight
            .to_dtype(DType::F32)?
            .sqr()?
            .sum(0)?
            .sqrt()?
            .to_vec1::<f32>()?;
        if act_norm.len() != w_norm.len() {
            return Err(MergeError::InvalidConfig(format!(
                "probe has {} channels, down weight has {}",
                act_norm.len(),
                w_norm.len()
            )));
        }
        Ok(act_norm
            .iter()
            .zip(&w_norm)
            .map(|(a, w)| (*a as f64) * (*w as f64))
            .collect())
    }
}

/// Subsample token rows for the probe: evenly strided positions, at least
/// one. Deterministic so repeated forwards select the same channels.
pub fn generate_probe(x: &Tensor, probe_ratio: f64) -> Result<Tensor, MergeError> {
    let (tokens, _) = x.dims2()?;
    let keep = ((tokens as f64 * probe_ratio).ceil() as usize).clamp(1, tokens);
    if keep == tokens {
        return Ok(x.clone());
    }
    let indices: Vec<u32> = (0..keep)
        .map(|i| (i * tokens / keep) as u32)
        .collect();
    let idx = Tensor::from_vec(indices, keep, x.device())?;
    Ok(x.index_select(&idx, 0)?)
}

/// Keep the `floor((1-prune_ratio)·dim)` highest-scoring channels, returned
/// in ascending index order.
pub fn select_channels(scores: &[f64], prune_ratio: f64) -> Result<Vec<usize>, MergeError> {
    let dim = scores.len();
    let keep = (dim as f64 * (1.0 - prune_ratio)) as usize;
    if keep == 0 || dim == 0 {
        return Err(MergeError::EmptySelection);
    }

    let mut order: Vec<usize> = (0..dim).collect();
    order.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut selected = order[..keep].to_vec();
    selected.sort_unstable();
    Ok(selected)
}

/// Validate an index selection against the dimension it slices.
pub fn validate_selection(indices: &[usize], dim: usize) -> Result<(), MergeError> {
    if indices.is_empty() {
        return Err(MergeError::EmptySelection);
    }
    for &i in indices {
        if i >= dim {
            return Err(MergeError::SelectionOutOfRange { index: i, dim });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn norm_scorer_ranks_dominant_channel_highest() {
        let device = Device::Cpu;
        // Channel 1 carries all the activation energy.
        let probe = Tensor::from_vec(
            vec![0.1f32, 3.0, 0.2, 0.1, 4.0, 0.2],
            (2, 3),
            &device,
        )
        .unwrap();
        let down = Tensor::ones((4, 3), DType::F32, &device).unwrap();

        let scores = NormProbeScorer.score(&probe, &down).unwrap();
        assert_eq!(scores.len(), 3);
        assert!(scores[1] > scores[0]);
        assert!(scores[1] > scores[2]);
    }

    #[test]
    fn probe_subsamples_deterministically() {
        let device = Device::Cpu;
        let x = Tensor::arange(0f32, 40.0, &device)
            .unwrap()
            .reshape((10, 4))
            .unwrap();

        let probe = generate_probe(&x, 0.5).unwrap();
        assert_eq!(probe.dims(), &[5, 4]);
        let again = generate_probe(&x, 0.5).unwrap();
        let a: Vec<f32> = probe.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = again.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);

        // Full ratio passes the batch through untouched.
        let full = generate_probe(&x, 1.0).unwrap();
        assert_eq!(full.dims(), &[10, 4]);
    }

    #[test]
    fn select_channels_keeps_top_scores_in_order() {
        let scores = [0.3, 0.9, 0.1, 0.7, 0.5];
        // keep floor(5·0.6) = 3 → channels {1, 3, 4}, ascending.
        let sel = select_channels(&scores, 0.4).unwrap();
        assert_eq!(sel, vec![1, 3, 4]);
    }

    #[test]
    fn select_channels_empty_is_precondition_violation() {
        let scores = [0.5, 0.5];
        let err = select_channels(&scores, 0.99).unwrap_err();
        assert!(matches!(err, MergeError::EmptySelection));
    }

    #[test]
    fn validate_selection_bounds() {
        validate_selection(&[0, 2, 5], 6).unwrap();
        assert!(matches!(
            validate_selection(&[], 6).unwrap_err(),
            MergeError::EmptySelection
        ));
        assert!(matches!(
            validate_selection(&[6], 6).unwrap_err(),
            MergeError::SelectionOutOfRange { index: 6, dim: 6 }
        ));
    }
}
