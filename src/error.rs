//! Error types for nano-serve.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::page::SlotHandle;
use crate::core::sequence::RequestId;

/// Result type alias for nano-serve operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for nano-serve.
#[derive(Error, Debug)]
pub enum Error {
    /// Not enough free pages right now. Transient: retried on a later tick.
    #[error("KV cache capacity exhausted: requested {requested} pages, {free} free")]
    CapacityExhausted { requested: usize, free: usize },

    /// The request can never fit, even in an empty pool.
    #[error("request needs {required_pages} pages but at most {max_pages} can be chained")]
    OversizedRequest {
        required_pages: usize,
        max_pages: usize,
    },

    /// The forward-pass kernel reported a hard failure.
    #[error("kernel failure: {0}")]
    KernelFailure(String),

    /// A slot handle was freed twice.
    #[error("double free of slot {0}")]
    DoubleFree(SlotHandle),

    /// A slot handle that was never issued by this allocator.
    #[error("invalid slot handle {0}")]
    InvalidSlotHandle(SlotHandle),

    /// A write would push a chain's fill length past its reservation.
    #[error("slot {handle} overflow: fill {filled} + {additional} exceeds reserved {reserved}")]
    SlotOverflow {
        handle: SlotHandle,
        filled: usize,
        additional: usize,
        reserved: usize,
    },

    /// Pages were still in use when the pool was torn down.
    #[error("{0} KV cache pages still in use at teardown")]
    LeakedPages(usize),

    /// An in-flight sequence lost track of its slot chain.
    #[error("sequence {0} holds no slot chain")]
    MissingSlot(RequestId),

    /// Sequence not found in scheduler.
    #[error("sequence {0} not found")]
    SequenceNotFound(RequestId),

    /// Invalid sequence state transition.
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidStateTransition {
        from: &'static str,
        to: &'static str,
    },

    /// The request was malformed (empty prompt, bad sampling parameters).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The scheduling loop is no longer accepting commands.
    #[error("engine has shut down")]
    EngineShutdown,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse error classification carried by abort markers on token streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    CapacityExhausted,
    OversizedRequest,
    KernelFailure,
    InvariantViolation,
    EngineShutdown,
    InvalidRequest,
    Internal,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CapacityExhausted { .. } => ErrorKind::CapacityExhausted,
            Self::OversizedRequest { .. } => ErrorKind::OversizedRequest,
            Self::KernelFailure(_) | Self::Tensor(_) => ErrorKind::KernelFailure,
            Self::DoubleFree(_)
            | Self::InvalidSlotHandle(_)
            | Self::SlotOverflow { .. }
            | Self::LeakedPages(_)
            | Self::MissingSlot(_)
            | Self::InvalidStateTransition { .. } => ErrorKind::InvariantViolation,
            Self::EngineShutdown => ErrorKind::EngineShutdown,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::SequenceNotFound(_) | Self::Config(_) | Self::Io(_) | Self::Json(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Whether the error is worth retrying on a later tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::CapacityExhausted { .. })
    }

    /// Whether the error signals a broken core invariant.
    pub fn is_invariant_violation(&self) -> bool {
        self.kind() == ErrorKind::InvariantViolation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let err = Error::CapacityExhausted {
            requested: 4,
            free: 1,
        };
        assert_eq!(err.kind(), ErrorKind::CapacityExhausted);
        assert!(err.is_transient());

        let err = Error::DoubleFree(SlotHandle::new(3));
        assert!(err.is_invariant_violation());
        assert!(!err.is_transient());

        assert_eq!(
            Error::KernelFailure("xla".into()).kind(),
            ErrorKind::KernelFailure
        );
    }

    #[test]
    fn test_error_display() {
        let err = Error::OversizedRequest {
            required_pages: 5,
            max_pages: 4,
        };
        assert_eq!(
            err.to_string(),
            "request needs 5 pages but at most 4 can be chained"
        );
    }
}
