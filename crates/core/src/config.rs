//! Configuration for expert merging and merged-expert inference.
//!
//! All recognized options live in one typed struct validated at construction.
//! Policy names parse through `FromStr`; unrecognized names are rejected
//! immediately rather than silently defaulted.

use std::str::FromStr;

use candle_core::DType;
use candle_nn::Activation;
use serde::Deserialize;

use crate::error::MergeError;

/// How the cross-expert mean weight is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergePolicy {
    /// Unweighted average across experts.
    Mean,
    /// Average weighted by expert usage frequency.
    Freq,
    /// Average weighted by Fisher-information scalars scaled by frequency.
    Fisher,
}

impl FromStr for MergePolicy {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self, MergeError> {
        match s {
            "mean" => Ok(Self::Mean),
            "freq" => Ok(Self::Freq),
            "fisher" => Ok(Self::Fisher),
            other => Err(MergeError::InvalidConfig(format!(
                "unknown merge method `{other}`"
            ))),
        }
    }
}

/// How low-rank delta factors are shared across the expert population.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeltaSharing {
    /// Every expert owns a private (U, V) pair.
    #[default]
    NoShare,
    /// One V per projection shared by all experts; private U blocks.
    ShareV,
    /// Both U and V shared by all experts.
    ShareVU,
}

impl DeltaSharing {
    /// Build from the two boolean flags of the external configuration
    /// surface. Sharing U without sharing V is not a supported combination.
    pub fn from_flags(share_v: bool, share_u: bool) -> Result<Self, MergeError> {
        match (share_v, share_u) {
            (false, false) => Ok(Self::NoShare),
            (true, false) => Ok(Self::ShareV),
            (true, true) => Ok(Self::ShareVU),
            (false, true) => Err(MergeError::InvalidConfig(
                "share_u requires share_v".to_string(),
            )),
        }
    }
}

/// Scale-aware SVD correction applied before factorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalePolicy {
    /// Factorize the raw delta.
    #[default]
    None,
    /// Factorize `D·S`, then right-multiply the truncated V by `S⁻¹`.
    SvdLlm,
    /// Scale delta columns by a vector derived from S, then undo on V.
    Asvd,
}

impl FromStr for ScalePolicy {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self, MergeError> {
        match s {
            "none" => Ok(Self::None),
            "svdllm" => Ok(Self::SvdLlm),
            "asvd" => Ok(Self::Asvd),
            other => Err(MergeError::InvalidConfig(format!(
                "unknown scale policy `{other}`"
            ))),
        }
    }
}

/// Which inference stage the merged layer is serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceStage {
    /// Statistics collection; always the full unpruned path.
    Calibration,
    /// Evaluation; pruning and shared-inference reuse are permitted.
    #[default]
    Test,
}

/// Configuration for one merged MoE layer and its offline merge.
#[derive(Debug, Clone)]
pub struct MoeMergeConfig {
    /// Hidden (model) dimension.
    pub hidden_size: usize,
    /// Intermediate (FFN) dimension of each routed expert.
    pub intermediate_size: usize,
    /// Intermediate dimension of the always-active shared expert.
    pub shared_expert_intermediate_size: usize,
    /// Number of routed experts.
    pub num_experts: usize,
    /// Experts activated per token.
    pub top_k: usize,
    /// Renormalize top-k routing weights to sum to 1.
    pub norm_topk_prob: bool,
    /// Expert nonlinearity.
    pub hidden_act: Activation,

    /// Cross-expert mean policy.
    pub merge_policy: MergePolicy,
    /// Delta compression ratio in `[0, 1]`; 0 disables deltas entirely.
    pub delta_ratio: f64,
    /// Factor-sharing policy.
    pub delta_sharing: DeltaSharing,
    /// Scale correction applied during factorization.
    pub scale_policy: ScalePolicy,

    /// Fraction of intermediate channels dropped on the pruned path.
    pub prune_ratio: f64,
    /// Fraction of sequence positions used to build the probe, for the
    /// gate projection.
    pub gate_probe_ratio: f64,
    /// Probe ratio for the up projection; must equal `gate_probe_ratio`.
    pub up_probe_ratio: f64,
    /// Inference stage.
    pub stage: InferenceStage,
    /// Layer indices on which pruning is skipped.
    pub skip_layers: Vec<usize>,

    /// Storage dtype for merged weights and delta factors.
    pub weight_dtype: DType,
}

impl Default for MoeMergeConfig {
    fn default() -> Self {
        Self {
            hidden_size: 0,
            intermediate_size: 0,
            shared_expert_intermediate_size: 0,
            num_experts: 0,
            top_k: 2,
            norm_topk_prob: true,
            hidden_act: Activation::Silu,
            merge_policy: MergePolicy::Freq,
            delta_ratio: 0.0,
            delta_sharing: DeltaSharing::NoShare,
            scale_policy: ScalePolicy::None,
            prune_ratio: 0.0,
            gate_probe_ratio: 1.0,
            up_probe_ratio: 1.0,
            stage: InferenceStage::Test,
            skip_layers: Vec::new(),
            weight_dtype: DType::BF16,
        }
    }
}

impl MoeMergeConfig {
    /// Validate the full option surface. Every component constructor calls
    /// this so that invalid combinations never reach a forward pass.
    pub fn validate(&self) -> Result<(), MergeError> {
        if self.hidden_size == 0 || self.intermediate_size == 0 {
            return Err(MergeError::InvalidConfig(
                "hidden_size and intermediate_size must be non-zero".to_string(),
            ));
        }
        if self.num_experts == 0 {
            return Err(MergeError::InvalidConfig(
                "num_experts must be non-zero".to_string(),
            ));
        }
        if self.top_k == 0 || self.top_k > self.num_experts {
            return Err(MergeError::InvalidConfig(format!(
                "top_k ({}) must be in 1..={}",
                self.top_k, self.num_experts
            )));
        }
        if !(0.0..=1.0).contains(&self.delta_ratio) {
            return Err(MergeError::InvalidConfig(format!(
                "delta_ratio ({}) must be in [0, 1]",
                self.delta_ratio
            )));
        }
        if !(0.0..1.0).contains(&self.prune_ratio) {
            return Err(MergeError::InvalidConfig(format!(
                "prune_ratio ({}) must be in [0, 1)",
                self.prune_ratio
            )));
        }
        if self.gate_probe_ratio != self.up_probe_ratio {
            return Err(MergeError::InvalidConfig(format!(
                "gate probe ratio ({}) must equal up probe ratio ({})",
                self.gate_probe_ratio, self.up_probe_ratio
            )));
        }
        if !(0.0..=1.0).contains(&self.gate_probe_ratio) || self.gate_probe_ratio == 0.0 {
            return Err(MergeError::InvalidConfig(format!(
                "probe ratio ({}) must be in (0, 1]",
                self.gate_probe_ratio
            )));
        }
        Ok(())
    }

    /// Per-expert delta rank for a `rows × cols` projection:
    /// `floor(rows·cols·ratio / (rows+cols))`.
    pub fn delta_rank(&self, rows: usize, cols: usize) -> usize {
        (rows as f64 * cols as f64 * self.delta_ratio / (rows + cols) as f64) as usize
    }
}

fn default_probe_ratio() -> f64 {
    1.0
}

fn default_scale_type() -> String {
    "none".to_string()
}

/// Raw externally-supplied merge options, as they appear in experiment
/// configuration. Overlaid onto a shape-bearing [`MoeMergeConfig`] with full
/// name validation; unrecognized policy names fail here, never later.
#[derive(Debug, Clone, Deserialize)]
pub struct MergeOptions {
    pub merge_method: String,
    #[serde(default)]
    pub delta_ratio: f64,
    #[serde(default)]
    pub delta_share_v: bool,
    #[serde(default)]
    pub delta_share_u: bool,
    #[serde(default = "default_scale_type")]
    pub scale_type: String,
    #[serde(default)]
    pub prune_ratio: f64,
    #[serde(default = "default_probe_ratio")]
    pub gate_probe_ratio: f64,
    #[serde(default = "default_probe_ratio")]
    pub up_probe_ratio: f64,
    #[serde(default)]
    pub stage: Option<InferenceStage>,
    #[serde(default)]
    pub skip_layers: Vec<usize>,
}

impl MergeOptions {
    pub fn from_json(raw: &str) -> Result<Self, MergeError> {
        serde_json::from_str(raw).map_err(|e| MergeError::InvalidConfig(e.to_string()))
    }

    /// Overlay these options onto a config carrying the model shape.
    pub fn apply(&self, mut config: MoeMergeConfig) -> Result<MoeMergeConfig, MergeError> {
        config.merge_policy = self.merge_method.parse()?;
        config.delta_ratio = self.delta_ratio;
        config.delta_sharing = DeltaSharing::from_flags(self.delta_share_v, self.delta_share_u)?;
        config.scale_policy = self.scale_type.parse()?;
        config.prune_ratio = self.prune_ratio;
        config.gate_probe_ratio = self.gate_probe_ratio;
        config.up_probe_ratio = self.up_probe_ratio;
        if let Some(stage) = self.stage {
            config.stage = stage;
        }
        config.skip_layers = self.skip_layers.clone();
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> MoeMergeConfig {
        MoeMergeConfig {
            hidden_size: 16,
            intermediate_size: 32,
            shared_expert_intermediate_size: 64,
            num_experts: 4,
            ..Default::default()
        }
    }

    #[test]
    fn parse_merge_policy() {
        assert_eq!("mean".parse::<MergePolicy>().unwrap(), MergePolicy::Mean);
        assert_eq!("freq".parse::<MergePolicy>().unwrap(), MergePolicy::Freq);
        assert_eq!("fisher".parse::<MergePolicy>().unwrap(), MergePolicy::Fisher);
        assert!("median".parse::<MergePolicy>().is_err());
    }

    #[test]
    fn parse_scale_policy() {
        assert_eq!("svdllm".parse::<ScalePolicy>().unwrap(), ScalePolicy::SvdLlm);
        assert_eq!("asvd".parse::<ScalePolicy>().unwrap(), ScalePolicy::Asvd);
        assert!("whiten".parse::<ScalePolicy>().is_err());
    }

    #[test]
    fn sharing_from_flags() {
        assert_eq!(
            DeltaSharing::from_flags(false, false).unwrap(),
            DeltaSharing::NoShare
        );
        assert_eq!(
            DeltaSharing::from_flags(true, false).unwrap(),
            DeltaSharing::ShareV
        );
        assert_eq!(
            DeltaSharing::from_flags(true, true).unwrap(),
            DeltaSharing::ShareVU
        );
        assert!(DeltaSharing::from_flags(false, true).is_err());
    }

    #[test]
    fn validate_accepts_default_shape() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn validate_rejects_mismatched_probe_ratios() {
        let cfg = MoeMergeConfig {
            gate_probe_ratio: 0.5,
            up_probe_ratio: 0.25,
            ..valid_config()
        };
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, MergeError::InvalidConfig(_)));
    }

    #[test]
    fn validate_rejects_bad_topk() {
        let cfg = MoeMergeConfig {
            top_k: 5,
            ..valid_config()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn options_overlay_from_json() {
        let opts = MergeOptions::from_json(
            r#"{
                "merge_method": "freq",
                "delta_ratio": 0.5,
                "delta_share_v": true,
                "scale_type": "svdllm",
                "prune_ratio": 0.25,
                "gate_probe_ratio": 0.5,
                "up_probe_ratio": 0.5,
                "stage": "calibration",
                "skip_layers": [0, 3]
            }"#,
        )
        .unwrap();

        let cfg = opts.apply(valid_config()).unwrap();
        assert_eq!(cfg.merge_policy, MergePolicy::Freq);
        assert_eq!(cfg.delta_sharing, DeltaSharing::ShareV);
        assert_eq!(cfg.scale_policy, ScalePolicy::SvdLlm);
        assert_eq!(cfg.stage, InferenceStage::Calibration);
        assert_eq!(cfg.skip_layers, vec![0, 3]);
    }

    #[test]
    fn options_reject_unknown_method() {
        let opts = MergeOptions::from_json(r#"{"merge_method": "median"}"#).unwrap();
        let err = opts.apply(valid_config()).unwrap_err();
        assert!(matches!(err, MergeError::InvalidConfig(_)));
    }

    #[test]
    fn options_reject_mismatched_probe_ratios() {
        let opts = MergeOptions::from_json(
            r#"{"merge_method": "mean", "gate_probe_ratio": 0.5, "up_probe_ratio": 0.25}"#,
        )
        .unwrap();
        assert!(opts.apply(valid_config()).is_err());
    }

    #[test]
    fn delta_rank_formula() {
        let cfg = MoeMergeConfig {
            delta_ratio: 0.25,
            ..valid_config()
        };
        // floor(32·16·0.25 / 48) = floor(2.666…) = 2
        assert_eq!(cfg.delta_rank(32, 16), 2);
        let zero = MoeMergeConfig {
            delta_ratio: 0.0,
            ..valid_config()
        };
        assert_eq!(zero.delta_rank(32, 16), 0);
    }
}
