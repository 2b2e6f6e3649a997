//! Engine error taxonomy with propagation classification.
//!
//! Every failure the core can produce is represented here. Callers query
//! `category()` / `is_retryable()` instead of matching on message text.
//!
//! ## Categories
//!
//! | Category    | Variants                         | Handling                         |
//! |-------------|----------------------------------|----------------------------------|
//! | Retryable   | BackendUnavailable               | capped exponential backoff       |
//! | Policy      | CapacityExceeded, ModelCoolingDown | returned to the caller           |
//! | Isolated    | StreamTimeout                    | stream removed, run continues    |
//! | Performance | FrameOverrun                     | degraded mode, never fatal       |
//! | Dropped     | InvalidTokenEvent                | event dropped, stream continues  |
//! | Fatal       | EnsembleFailed                   | run aborted                      |
//! | Terminal    | ModelLoadFailed, Cancelled, Configuration | needs operator / caller  |

use std::fmt;

use thiserror::Error;

use crate::types::{ModelId, StreamId};

/// How an error is expected to propagate through the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Transient backend trouble, safe to retry with backoff.
    Retryable,
    /// Expected policy outcome under load; not a bug.
    Policy,
    /// Confined to one stream; siblings keep running.
    Isolated,
    /// Timing signal; switches the composer to degraded mode.
    Performance,
    /// Malformed input; dropped with a warning.
    Dropped,
    /// Whole ensemble lost and backend unreachable.
    Fatal,
    /// Not retryable without operator or caller action.
    Terminal,
}

impl ErrorCategory {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Retryable)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retryable => write!(f, "retryable"),
            Self::Policy => write!(f, "policy"),
            Self::Isolated => write!(f, "isolated"),
            Self::Performance => write!(f, "performance"),
            Self::Dropped => write!(f, "dropped"),
            Self::Fatal => write!(f, "fatal"),
            Self::Terminal => write!(f, "terminal"),
        }
    }
}

/// Unified error type for the engine.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Backend could not be reached within the health-check timeout.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Backend is reachable but the model could not be materialized.
    #[error("Model load failed [{model_id}]: {reason}")]
    ModelLoadFailed { model_id: ModelId, reason: String },

    /// Pool cannot free a slot (every loaded handle is pinned).
    #[error("Capacity exceeded: {loaded} loaded, {pinned} pinned, limit {limit}")]
    CapacityExceeded {
        loaded: usize,
        pinned: usize,
        limit: usize,
    },

    /// Model was evicted moments ago and is still inside its reload cooldown.
    #[error("Model {model_id} cooling down for another {remaining_ms}ms")]
    ModelCoolingDown { model_id: ModelId, remaining_ms: u64 },

    /// No token arrived on a stream within the per-stream timeout.
    #[error("Stream {stream_id} timed out after {timeout_ms}ms without a token")]
    StreamTimeout { stream_id: StreamId, timeout_ms: u64 },

    /// Frame composition exceeded its time budget.
    #[error("Frame {frame_number} overran budget: {elapsed_us}us > {budget_us}us")]
    FrameOverrun {
        frame_number: u64,
        elapsed_us: u64,
        budget_us: u64,
    },

    /// Backend produced an event that violates the TokenEvent invariants.
    #[error("Invalid token event: {0}")]
    InvalidTokenEvent(String),

    /// Every stream of the run is gone and the backend health check fails.
    #[error("Ensemble failed: {0}")]
    EnsembleFailed(String),

    /// Operation cancelled by the caller or a global stop.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Configuration is invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// Classify this error for propagation and retry logic.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::BackendUnavailable(_) => ErrorCategory::Retryable,
            Self::ModelLoadFailed { .. } => ErrorCategory::Terminal,
            Self::CapacityExceeded { .. } => ErrorCategory::Policy,
            Self::ModelCoolingDown { .. } => ErrorCategory::Policy,
            Self::StreamTimeout { .. } => ErrorCategory::Isolated,
            Self::FrameOverrun { .. } => ErrorCategory::Performance,
            Self::InvalidTokenEvent(_) => ErrorCategory::Dropped,
            Self::EnsembleFailed(_) => ErrorCategory::Fatal,
            Self::Cancelled(_) => ErrorCategory::Terminal,
            Self::Configuration(_) => ErrorCategory::Terminal,
        }
    }

    /// Returns `true` if the operation may be retried after this error.
    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }

    /// Build an `InvalidTokenEvent` conveniently.
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidTokenEvent(reason.into())
    }

    pub fn load_failed(model_id: &ModelId, reason: impl Into<String>) -> Self {
        Self::ModelLoadFailed {
            model_id: model_id.clone(),
            reason: reason.into(),
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        Self::BackendUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_unavailable_is_retryable() {
        let err = EngineError::BackendUnavailable("connection refused".into());
        assert!(err.is_retryable());
        assert_eq!(err.category(), ErrorCategory::Retryable);
    }

    #[test]
    fn model_load_failed_is_terminal() {
        let err = EngineError::load_failed(&ModelId::new("qwen"), "no such model");
        assert!(!err.is_retryable());
        assert_eq!(err.category(), ErrorCategory::Terminal);
        assert!(err.to_string().contains("qwen"));
    }

    #[test]
    fn capacity_is_policy_not_fatal() {
        let err = EngineError::CapacityExceeded {
            loaded: 2,
            pinned: 2,
            limit: 2,
        };
        assert_eq!(err.category(), ErrorCategory::Policy);
        assert!(!err.is_retryable());
    }

    #[test]
    fn stream_timeout_is_isolated() {
        let err = EngineError::StreamTimeout {
            stream_id: StreamId(3),
            timeout_ms: 5000,
        };
        assert_eq!(err.category(), ErrorCategory::Isolated);
        assert!(err.to_string().contains("s3"));
    }

    #[test]
    fn overrun_is_performance_signal() {
        let err = EngineError::FrameOverrun {
            frame_number: 7,
            elapsed_us: 20_000,
            budget_us: 16_670,
        };
        assert_eq!(err.category(), ErrorCategory::Performance);
    }

    #[test]
    fn category_display() {
        assert_eq!(ErrorCategory::Dropped.to_string(), "dropped");
        assert_eq!(ErrorCategory::Fatal.to_string(), "fatal");
    }
}
