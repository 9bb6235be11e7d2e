//! Cross-expert mean weights.
//!
//! Produces the shared backbone weight for each projection as a convex
//! combination of all experts' weights. Accumulation happens in f64; the
//! result is cast to the configured storage dtype by the caller.

use candle_core::{DType, Tensor};

use crate::config::MergePolicy;
use crate::error::MergeError;
use crate::source::{ExpertWeightSource, Projection};

/// Per-expert combination weights for one projection, normalized to sum 1.
pub fn merge_weights(
    policy: MergePolicy,
    projection: Projection,
    source: &dyn ExpertWeightSource,
) -> Result<Vec<f64>, MergeError> {
    let freq = source.expert_frequency();
    let n = source.num_experts();
    if freq.len() != n {
        return Err(MergeError::InvalidConfig(format!(
            "expert_frequency has {} entries for {} experts",
            freq.len(),
            n
        )));
    }

    let raw: Vec<f64> = match policy {
        MergePolicy::Mean => vec![1.0; n],
        MergePolicy::Freq => freq.to_vec(),
        MergePolicy::Fisher => (0..n)
            .map(|i| {
                source
                    .fisher(projection, i)
                    .ok_or_else(|| {
                        MergeError::InvalidConfig(format!(
                            "fisher merge requested but no fisher statistic for {} expert {i}",
                            projection.as_str()
                        ))
                    })
                    .map(|f| f * freq[i])
            })
            .collect::<Result<_, _>>()?,
    };

    let total: f64 = raw.iter().sum();
    if total <= 0.0 {
        return Err(MergeError::ZeroTotalWeight);
    }
    Ok(raw.into_iter().map(|w| w / total).collect())
}

/// Weighted mean of one projection's weights across all experts.
///
/// Returns the mean in the requested `dtype`; shape matches the per-expert
/// weight matrices.
pub fn mean_weight(
    policy: MergePolicy,
    projection: Projection,
    source: &dyn ExpertWeightSource,
    dtype: DType,
) -> Result<Tensor, MergeError> {
    let weights = merge_weights(policy, projection, source)?;

    let mut acc: Option<Tensor> = None;
    for (i, w) in weights.iter().enumerate() {
        let expert = source
            .expert_weight(projection, i)?
            .to_dtype(DType::F64)?
            .affine(*w, 0.0)?;
        acc = Some(match acc {
            None => expert,
            Some(a) => a.add(&expert)?,
        });
    }
    // num_experts >= 1 is enforced by config validation.
    let acc = acc.expect("at least one expert");
    Ok(acc.to_dtype(dtype)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryExpertSource;
    use candle_core::Device;

    fn source_with_freq(freq: Vec<f64>) -> InMemoryExpertSource {
        let mut src = InMemoryExpertSource::seeded(4, 8, 6, 10, &Device::Cpu);
        src.set_frequency(freq);
        src
    }

    #[test]
    fn mean_policy_is_arithmetic_average() {
        let src = source_with_freq(vec![1.0, 5.0, 2.0, 9.0]);
        let mean = mean_weight(MergePolicy::Mean, Projection::Gate, &src, DType::F32).unwrap();

        // Recompute the plain average by hand.
        let mut expect: Option<Tensor> = None;
        for i in 0..4 {
            let w = src.expert_weight(Projection::Gate, i).unwrap();
            expect = Some(match expect {
                None => w,
                Some(a) => a.add(&w).unwrap(),
            });
        }
        let expect = expect.unwrap().affine(0.25, 0.0).unwrap();

        let diff: f32 = mean
            .sub(&expect)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-4, "mean policy must ignore frequency, diff={diff}");
    }

    #[test]
    fn freq_weights_normalize_to_one() {
        let src = source_with_freq(vec![3.0, 1.0, 4.0, 2.0]);
        for projection in Projection::ALL {
            let w = merge_weights(MergePolicy::Freq, projection, &src).unwrap();
            let total: f64 = w.iter().sum();
            assert!((total - 1.0).abs() < 1e-12);
            assert!((w[2] - 0.4).abs() < 1e-12);
        }
    }

    #[test]
    fn fisher_weights_scale_by_frequency_then_normalize() {
        let mut src = source_with_freq(vec![1.0, 3.0, 1.0, 1.0]);
        src.set_fisher_uniform(2.0);
        // fisher·freq = [2, 6, 2, 2], total 12.
        let w = merge_weights(MergePolicy::Fisher, Projection::Up, &src).unwrap();
        assert!((w[1] - 0.5).abs() < 1e-12);
        let total: f64 = w.iter().sum();
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn fisher_without_statistic_is_invalid_config() {
        let src = source_with_freq(vec![1.0; 4]);
        let err = merge_weights(MergePolicy::Fisher, Projection::Down, &src).unwrap_err();
        assert!(matches!(err, MergeError::InvalidConfig(_)));
    }

    #[test]
    fn zero_frequency_sum_fails_fast() {
        let src = source_with_freq(vec![0.0; 4]);
        let err = merge_weights(MergePolicy::Freq, Projection::Gate, &src).unwrap_err();
        assert!(matches!(err, MergeError::ZeroTotalWeight));
    }

    #[test]
    fn mean_weight_shape_matches_projection() {
        let src = source_with_freq(vec![1.0; 4]);
        let gate = mean_weight(MergePolicy::Freq, Projection::Gate, &src, DType::F32).unwrap();
        let down = mean_weight(MergePolicy::Freq, Projection::Down, &src, DType::F32).unwrap();
        assert_eq!(gate.dims(), &[8, 6]);
        assert_eq!(down.dims(), &[6, 8]);
    }
}
