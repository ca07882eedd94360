//! Persisted run records.
//!
//! A [`RunRecord`] is the immutable summary of one completed execution
//! instance. Stage outcomes are always listed in the graph's topological
//! order so two runs of the same pipeline diff cleanly, regardless of the
//! order in which stages actually completed.

use crate::errors::FailureKind;
use crate::trace::TaskStatus;
use chrono::{DateTime, Utc};
use md5::{Digest as Md5Digest, Md5};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;

/// Outcome of a whole execution instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Every stage succeeded.
    Succeeded,
    /// The terminal stage succeeded but a non-critical stage failed.
    Degraded,
    /// The terminal stage did not succeed.
    Failed,
    /// The instance was cancelled before completion.
    Cancelled,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Degraded => write!(f, "degraded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// The failure attached to a stage outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeError {
    /// Failure classification.
    pub kind: FailureKind,
    /// Human-readable description.
    pub message: String,
}

/// Final outcome of one stage within an execution instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    /// The stage name.
    pub stage: String,
    /// The stage's terminal status.
    pub status: TaskStatus,
    /// Attempts made, including the first. Zero if never dispatched.
    pub attempts: u32,
    /// The terminal failure, if the stage did not succeed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OutcomeError>,
    /// Wall-clock time spent across all attempts, in milliseconds.
    pub duration_ms: f64,
}

/// Immutable summary of one completed execution instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Generated run id.
    pub run_id: String,
    /// When the instance started.
    pub created_at: DateTime<Utc>,
    /// Digest of the pipeline description and engine configuration that
    /// produced this run, for reproducibility.
    pub config_hash: String,
    /// Name of the executed pipeline.
    pub pipeline: String,
    /// The query, for `run`/`score` instances.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// The terminal stage's answer, when one was produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    /// Overall instance outcome.
    pub status: InstanceStatus,
    /// Stage outcomes in topological order.
    pub stage_outcomes: Vec<StageOutcome>,
    /// Aggregate metrics: latency breakdown, trace length, cost estimate.
    pub metrics: serde_json::Value,
    /// Evaluator metrics merged in by `score`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Generates a short run id from a seed and the current timestamp.
///
/// Twelve hex characters of an MD5 digest: short enough for filenames and
/// log lines, unique enough for a run directory.
#[must_use]
pub fn generate_run_id(seed: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(seed.as_bytes());
    hasher.update(Utc::now().to_rfc3339().as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)[..12].to_string()
}

/// Digest of a configuration value, for keying runs to the exact graph
/// description that produced them.
#[must_use]
pub fn config_digest(value: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)[..16].to_string()
}
