//! Error types and handling for laneforge.
//!
//! A single error enum covers every failure kind named in the spec's error
//! taxonomy (validation, capacity, closed, duplicate, connectivity, user
//! action, invalid transition, timeout, concurrency-limit) and maps onto a
//! small set of canonical RPC codes at the API boundary.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Canonical wire error code, independent of the concrete failure reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcCode {
    InvalidArgument,
    NotFound,
    FailedPrecondition,
    Unavailable,
    Canceled,
    Internal,
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("canceled: {0}")]
    Canceled(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("lane closed")]
    LaneClosed,

    #[error("task dropped")]
    TaskDropped,

    #[error("lane full")]
    LaneFull,

    #[error("duplicate task")]
    TaskDuplicate,

    #[error("invalid saga state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("storage error: {0}")]
    StorageError(String),

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("user action failed: {0}")]
    UserActionError(String),
}

impl EngineError {
    /// Maps a concrete error to the RPC surface's canonical code, per the
    /// error taxonomy table.
    pub fn code(&self) -> RpcCode {
        match self {
            EngineError::InvalidArgument(_) | EngineError::ConfigError(_) => {
                RpcCode::InvalidArgument
            }
            EngineError::NotFound(_) => RpcCode::NotFound,
            EngineError::FailedPrecondition(_) | EngineError::InvalidTransition { .. } => {
                RpcCode::FailedPrecondition
            }
            EngineError::Unavailable(_) | EngineError::StorageError(_) => RpcCode::Unavailable,
            EngineError::Canceled(_) => RpcCode::Canceled,
            EngineError::LaneClosed
            | EngineError::TaskDropped
            | EngineError::LaneFull
            | EngineError::TaskDuplicate => RpcCode::FailedPrecondition,
            EngineError::UserActionError(_) | EngineError::Internal(_) => RpcCode::Internal,
        }
    }

    /// Whether this failure looks like a backend-connectivity problem, the
    /// trigger condition the fallback lane catches (see `FallbackLane`).
    /// Defined by exclusion: everything except the lane-local/cancellation
    /// errors that aren't actually about reaching a backend.
    pub fn is_connectivity(&self) -> bool {
        !matches!(
            self,
            EngineError::LaneClosed
                | EngineError::TaskDropped
                | EngineError::LaneFull
                | EngineError::Canceled(_)
        )
    }
}
