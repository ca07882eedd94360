//! Execution tracing.
//!
//! Every task attempt produces exactly one immutable [`TraceEvent`],
//! appended in completion order. The [`TraceRecorder`] owns the ordered
//! sequence for one execution instance and serves it both as a finite
//! snapshot and as a live subscription.

mod record;

pub use record::{
    InstanceStatus, OutcomeError, RunRecord, StageOutcome, config_digest, generate_run_id,
};

use crate::errors::FailureKind;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

/// Installs a global tracing subscriber honoring `RUST_LOG`.
///
/// Intended for binaries and test harnesses; quietly does nothing if a
/// subscriber is already installed.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Outcome of one task (or one task attempt, on a [`TraceEvent`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Not yet dispatched.
    Pending,
    /// Currently executing on a worker.
    Running,
    /// Completed successfully.
    Succeeded,
    /// Failed terminally.
    Failed,
    /// Not executed because an upstream dependency failed.
    Skipped,
    /// Dropped or stopped by instance cancellation.
    Cancelled,
}

impl TaskStatus {
    /// Returns true for states a task can never leave.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Immutable record of one task attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Id of the task this attempt belongs to.
    pub task_id: Uuid,
    /// The stage name.
    pub stage: String,
    /// Attempt number, starting at 1. Zero for skipped stages that never ran.
    pub attempt: u32,
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
    /// When the attempt ended.
    pub ended_at: DateTime<Utc>,
    /// How the attempt ended.
    pub outcome: TaskStatus,
    /// Failure classification, when the attempt did not succeed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<FailureKind>,
    /// Failure description, when the attempt did not succeed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Serialized byte size of the attempt's input payload.
    pub input_bytes: u64,
    /// Serialized byte size of the attempt's output payload, 0 on failure.
    pub output_bytes: u64,
}

impl TraceEvent {
    /// Duration of the attempt in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> f64 {
        (self.ended_at - self.started_at).num_microseconds().unwrap_or(0) as f64 / 1000.0
    }
}

#[derive(Debug, Default)]
struct TraceShared {
    events: RwLock<Vec<TraceEvent>>,
    closed: AtomicBool,
    notify: Notify,
}

/// Append-only recorder of one execution instance's trace.
///
/// Cloning is cheap: clones share the same sequence. The recorder is closed
/// exactly once, after the last event of the instance has been appended;
/// subscriptions then terminate after draining.
#[derive(Debug, Clone, Default)]
pub struct TraceRecorder {
    shared: Arc<TraceShared>,
}

impl TraceRecorder {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one event in completion order.
    pub fn append(&self, event: TraceEvent) {
        self.shared.events.write().push(event);
        self.shared.notify.notify_waiters();
    }

    /// Marks the sequence complete. Idempotent.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }

    /// Returns whether the sequence is complete.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Number of events appended so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.events.read().len()
    }

    /// Returns true if no events have been appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.events.read().is_empty()
    }

    /// A point-in-time copy of the sequence.
    #[must_use]
    pub fn snapshot(&self) -> Vec<TraceEvent> {
        self.shared.events.read().clone()
    }

    /// Attaches a subscription that replays the sequence from the start.
    ///
    /// A consumer attached before completion sees events as they are
    /// produced, in completion order, with none dropped or duplicated; a
    /// consumer attached afterwards sees the full finite sequence.
    #[must_use]
    pub fn subscribe(&self) -> TraceSubscription {
        TraceSubscription {
            shared: self.shared.clone(),
            cursor: 0,
        }
    }
}

/// A cursor over a [`TraceRecorder`]'s sequence.
#[derive(Debug)]
pub struct TraceSubscription {
    shared: Arc<TraceShared>,
    cursor: usize,
}

impl TraceSubscription {
    /// Returns the next event, waiting for one if the instance is still
    /// running. Returns `None` once the sequence is complete and drained.
    pub async fn next(&mut self) -> Option<TraceEvent> {
        loop {
            let notified = self.shared.notify.notified();

            {
                let events = self.shared.events.read();
                if self.cursor < events.len() {
                    let event = events[self.cursor].clone();
                    self.cursor += 1;
                    return Some(event);
                }
            }

            if self.shared.closed.load(Ordering::SeqCst) {
                return None;
            }

            notified.await;
        }
    }

    /// Restarts the subscription from the beginning of the sequence.
    pub fn restart(&mut self) {
        self.cursor = 0;
    }
}
