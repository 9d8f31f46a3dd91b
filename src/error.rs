// file: src/error.rs
// description: Error taxonomy shared by the RoPE and KV-cache operators.
// author: cipher-rc5

use crate::dtype::DType;
use crate::tensor::Shape;

pub type Result<T> = std::result::Result<T, OpError>;

#[derive(Debug, thiserror::Error)]
pub enum OpError {
    /// Unknown variant, malformed rotation fraction, bad table parameters.
    #[error("configuration error: {reason}")]
    Config { reason: String },

    #[error("expected a 4-axis tensor, got rank {rank}")]
    RankMismatch { rank: usize },

    #[error("shape mismatch in {context}: expected {expected}, got {got}")]
    ShapeMismatch {
        context: &'static str,
        expected: Shape,
        got: Shape,
    },

    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    #[error("kv cache capacity exhausted: need {required} positions, limit is {limit}")]
    CapacityExhausted { required: usize, limit: usize },

    #[error("position {position} is past the maximum of {max_positions} positions")]
    PositionOverflow {
        position: usize,
        max_positions: usize,
    },

    #[error("operator {name} was executed before reshape for shape {shape}")]
    NotPrepared { name: String, shape: Shape },

    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl OpError {
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }
}
