//! Error types for nano-infer.

use thiserror::Error;

/// Result type alias for nano-infer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for nano-infer.
#[derive(Error, Debug)]
pub enum Error {
    /// Kernel or tensor inputs disagree on their dimensions.
    #[error("shape mismatch in {op}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        op: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Corrupt or unrecognized quantized encoding.
    #[error("unsupported quantization: {0}")]
    UnsupportedQuantization(String),

    /// KV cache capacity or memory budget exceeded.
    #[error("kv cache overflow: {0}")]
    CacheOverflow(String),

    /// Prompt does not fit in the configured context window.
    #[error("prompt of {len} tokens exceeds max context {max_context}")]
    PromptTooLong { len: usize, max_context: usize },

    /// Non-finite values detected in logits or activations.
    #[error("numeric instability: {0}")]
    NumericInstability(String),

    /// Request was cancelled by its owner.
    #[error("request cancelled")]
    Cancelled,

    /// Request exceeded its wall-clock or step budget.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// Request parameters are unusable.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Request not found in scheduler.
    #[error("request {0} not found")]
    RequestNotFound(u64),

    /// Cache slot not allocated.
    #[error("kv cache slot {0} not allocated")]
    SlotNotFound(usize),

    /// Invalid request state transition.
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidStateTransition {
        from: &'static str,
        to: &'static str,
    },

    /// Requested kernel variant cannot run on this host.
    #[error("kernel variant {0} is not supported on this host")]
    UnsupportedKernel(&'static str),

    /// Model loading failed.
    #[error("failed to load model: {0}")]
    ModelLoad(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse classification of an [`Error`], reported on failed requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ShapeMismatch,
    UnsupportedQuantization,
    CacheOverflow,
    NumericInstability,
    Cancelled,
    Timeout,
    InvalidRequest,
    Internal,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ShapeMismatch { .. } => ErrorKind::ShapeMismatch,
            Self::UnsupportedQuantization(_) => ErrorKind::UnsupportedQuantization,
            Self::CacheOverflow(_) | Self::PromptTooLong { .. } => ErrorKind::CacheOverflow,
            Self::NumericInstability(_) => ErrorKind::NumericInstability,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            _ => ErrorKind::Internal,
        }
    }

    pub(crate) fn shape(op: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            op,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            Error::shape("matmul", &[4, 4], &[4, 3]).kind(),
            ErrorKind::ShapeMismatch
        );
        assert_eq!(
            Error::PromptTooLong {
                len: 10,
                max_context: 8
            }
            .kind(),
            ErrorKind::CacheOverflow
        );
        assert_eq!(Error::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(Error::RequestNotFound(3).kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_error_display() {
        let err = Error::shape("matmul", &[4, 4], &[3, 4]);
        assert_eq!(
            err.to_string(),
            "shape mismatch in matmul: expected [4, 4], got [3, 4]"
        );
    }
}
