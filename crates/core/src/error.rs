use thiserror::Error;

/// Errors produced by the merge pipeline and merged-expert forward paths.
#[derive(Error, Debug)]
pub enum MergeError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("matrix decomposition failed after {attempts} attempts: {reason}")]
    DecompositionFailed { attempts: usize, reason: String },

    #[error("scale matrix inversion failed after {retries} regularized retries")]
    SingularScale { retries: usize },

    #[error("merge weights sum to zero; expert frequencies must sum to a positive value")]
    ZeroTotalWeight,

    #[error("channel selection is empty")]
    EmptySelection,

    #[error("channel index {index} out of range for dimension {dim}")]
    SelectionOutOfRange { index: usize, dim: usize },

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_invalid_config() {
        let e = MergeError::InvalidConfig("unknown merge method `median`".to_string());
        assert_eq!(
            e.to_string(),
            "invalid configuration: unknown merge method `median`"
        );
    }

    #[test]
    fn error_display_decomposition_failed() {
        let e = MergeError::DecompositionFailed {
            attempts: 4,
            reason: "non-finite input".to_string(),
        };
        assert_eq!(
            e.to_string(),
            "matrix decomposition failed after 4 attempts: non-finite input"
        );
    }

    #[test]
    fn error_display_selection_out_of_range() {
        let e = MergeError::SelectionOutOfRange { index: 9, dim: 8 };
        assert_eq!(e.to_string(), "channel index 9 out of range for dimension 8");
    }
}
