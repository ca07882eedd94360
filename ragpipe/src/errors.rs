//! Error types for the ragpipe engine.
//!
//! The failure taxonomy distinguishes kinds that drive retry and
//! circuit-breaker decisions from the structural errors raised while
//! building a pipeline graph.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Classification of a task failure.
///
/// The kind decides whether the scheduler retries the task and whether the
/// failure counts toward the stage's circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// Malformed payload or contract mismatch. Never retried.
    Validation,
    /// Network error, rate limit, or other transient fault. Retried per policy.
    Transient,
    /// The task's deadline elapsed. Treated as transient for retry purposes.
    Timeout,
    /// The stage's circuit breaker is open; the adapter was not invoked.
    CircuitOpen,
    /// Cancellation was propagated into the task. Never retried.
    Cancelled,
}

impl FailureKind {
    /// Returns true if the retry policy may re-enqueue a task that failed
    /// with this kind.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::Timeout)
    }

    /// Returns true if this failure increments the stage's breaker counter.
    ///
    /// Circuit rejections and propagated cancellations do not count: the
    /// adapter was never given a chance to fail.
    #[must_use]
    pub fn counts_toward_breaker(self) -> bool {
        matches!(self, Self::Validation | Self::Transient | Self::Timeout)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Transient => write!(f, "transient"),
            Self::Timeout => write!(f, "timeout"),
            Self::CircuitOpen => write!(f, "circuit-open"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A failure returned by a module adapter invocation.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct AdapterFailure {
    /// The failure classification.
    pub kind: FailureKind,
    /// Human-readable description.
    pub message: String,
}

impl AdapterFailure {
    /// Creates a failure of the given kind.
    #[must_use]
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Creates a `validation` failure.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Validation, message)
    }

    /// Creates a `transient` failure.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }

    /// Creates a `timeout` failure.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    /// Creates a `cancelled` failure.
    #[must_use]
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Cancelled, message)
    }
}

/// Terminal failure of one stage within an execution instance.
///
/// Carries everything needed for post-mortem from the trace alone: the
/// failing stage, the kind, and how many attempts were made.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("stage '{stage}' failed after {attempts} attempt(s) ({kind}): {message}")]
pub struct StageFailure {
    /// The failing stage name.
    pub stage: String,
    /// The failure classification of the final attempt.
    pub kind: FailureKind,
    /// Number of attempts made, including the first.
    pub attempts: u32,
    /// Human-readable description.
    pub message: String,
}

impl StageFailure {
    /// Creates a new stage failure.
    #[must_use]
    pub fn new(
        stage: impl Into<String>,
        kind: FailureKind,
        attempts: u32,
        message: impl Into<String>,
    ) -> Self {
        Self {
            stage: stage.into(),
            kind,
            attempts,
            message: message.into(),
        }
    }
}

/// Error raised when pipeline graph validation fails.
///
/// Always names the offending stages; a failed build constructs nothing.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct GraphValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
}

impl GraphValidationError {
    /// Creates a new graph validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }
}

/// Error raised when a cycle is detected in the pipeline graph.
#[derive(Debug, Clone, Error)]
#[error("cycle detected in pipeline: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The path of stages forming the cycle.
    pub cycle_path: Vec<String>,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        Self { cycle_path }
    }
}

impl From<CycleDetectedError> for GraphValidationError {
    fn from(err: CycleDetectedError) -> Self {
        let stages = err.cycle_path.clone();
        GraphValidationError::new(err.to_string()).with_stages(stages)
    }
}

impl From<CycleDetectedError> for EngineError {
    fn from(err: CycleDetectedError) -> Self {
        EngineError::Graph(GraphValidationError::from(err))
    }
}

/// Errors raised by external collaborator stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// IO error while persisting or loading.
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error while encoding or decoding a record.
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend-specific failure.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// The main error type for ragpipe operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Pipeline graph validation failed.
    #[error("{0}")]
    Graph(#[from] GraphValidationError),

    /// A stage failed terminally during execution.
    #[error("{0}")]
    Stage(#[from] StageFailure),

    /// An adapter could not be constructed or set up.
    #[error("adapter error: {0}")]
    Adapter(String),

    /// Configuration could not be loaded or resolved.
    #[error("configuration error: {0}")]
    Config(String),

    /// A collaborator store failed.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// The execution instance was cancelled.
    #[error("execution cancelled: {0}")]
    Cancelled(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(FailureKind::Transient.is_retryable());
        assert!(FailureKind::Timeout.is_retryable());
        assert!(!FailureKind::Validation.is_retryable());
        assert!(!FailureKind::CircuitOpen.is_retryable());
        assert!(!FailureKind::Cancelled.is_retryable());
    }

    #[test]
    fn breaker_accounting_kinds() {
        assert!(FailureKind::Timeout.counts_toward_breaker());
        assert!(FailureKind::Validation.counts_toward_breaker());
        assert!(!FailureKind::CircuitOpen.counts_toward_breaker());
        assert!(!FailureKind::Cancelled.counts_toward_breaker());
    }

    #[test]
    fn failure_kind_serializes_kebab_case() {
        let json = serde_json::to_string(&FailureKind::CircuitOpen).unwrap();
        assert_eq!(json, r#""circuit-open""#);

        let kind: FailureKind = serde_json::from_str(r#""timeout""#).unwrap();
        assert_eq!(kind, FailureKind::Timeout);
    }

    #[test]
    fn stage_failure_display() {
        let failure = StageFailure::new("embed", FailureKind::Transient, 3, "connection reset");
        let text = failure.to_string();
        assert!(text.contains("embed"));
        assert!(text.contains("3 attempt(s)"));
        assert!(text.contains("transient"));
    }

    #[test]
    fn cycle_error_names_path() {
        let err = CycleDetectedError::new(vec![
            "a".to_string(),
            "b".to_string(),
            "a".to_string(),
        ]);
        assert!(err.to_string().contains("a -> b -> a"));

        let validation: GraphValidationError = err.into();
        assert_eq!(validation.stages, vec!["a", "b", "a"]);
    }
}
