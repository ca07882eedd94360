//! Task scheduling and execution.
//!
//! A fixed-size worker pool pulls ready tasks from a queue; a stage's task
//! becomes ready the instant its upstream dependency has produced output,
//! so independent branches run in parallel while a linear chain runs
//! sequentially. The coordinator owns all task state: workers only invoke
//! adapters and report completions, and every trace event is appended by
//! the coordinator in completion order.

use crate::adapter::InvokeContext;
use crate::cancellation::CancellationToken;
use crate::errors::{AdapterFailure, FailureKind};
use crate::graph::PipelineGraph;
use crate::resilience::{Admission, BreakerRegistry};
use crate::trace::{
    InstanceStatus, OutcomeError, StageOutcome, TaskStatus, TraceEvent, TraceRecorder,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// One scheduled invocation of a stage for one execution instance.
///
/// Owned by the scheduler for its lifetime; destroyed when its outcome is
/// recorded.
#[derive(Debug)]
struct Task {
    id: Uuid,
    stage: usize,
    attempt: u32,
    payload: Value,
}

/// A worker's report of one finished task attempt.
#[derive(Debug)]
struct Completion {
    task_id: Uuid,
    stage: usize,
    attempt: u32,
    started_at: DateTime<Utc>,
    duration: Duration,
    input_bytes: u64,
    result: Result<Value, AdapterFailure>,
    /// The failure came from the open circuit, not the adapter.
    breaker_rejected: bool,
}

#[derive(Debug)]
enum CoordinatorMsg {
    Completed(Completion),
    RetryDue { stage: usize },
}

/// Result of executing one instance through the scheduler.
#[derive(Debug)]
pub struct ExecutionReport {
    /// Overall instance outcome.
    pub status: InstanceStatus,
    /// Output of the terminal stage, when it succeeded.
    pub final_output: Option<Value>,
    /// Per-stage outcomes, always in the graph's topological order.
    pub outcomes: Vec<StageOutcome>,
    /// Wall-clock duration of the instance.
    pub duration: Duration,
}

#[derive(Debug, Clone)]
struct StageState {
    status: TaskStatus,
    attempts: u32,
    error: Option<OutcomeError>,
    duration_ms: f64,
}

impl StageState {
    fn pending() -> Self {
        Self {
            status: TaskStatus::Pending,
            attempts: 0,
            error: None,
            duration_ms: 0.0,
        }
    }
}

fn payload_bytes(value: &Value) -> u64 {
    serde_json::to_vec(value).map(|bytes| bytes.len() as u64).unwrap_or(0)
}

/// Dispatches tasks from a validated graph onto a bounded worker pool.
#[derive(Debug, Clone)]
pub struct Scheduler {
    workers: usize,
}

impl Scheduler {
    /// Creates a scheduler with the given worker pool size.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    /// Executes one instance of `graph` against `input`.
    ///
    /// Trace events are appended to `recorder` in completion order; the
    /// recorder is left open so the caller can append instance-level
    /// events before closing it.
    pub async fn execute(
        &self,
        graph: Arc<PipelineGraph>,
        input: Value,
        run_id: &str,
        breakers: Arc<BreakerRegistry>,
        recorder: &TraceRecorder,
        cancel: Arc<CancellationToken>,
    ) -> ExecutionReport {
        let started = Instant::now();
        let stage_count = graph.stage_count();

        let (ready_tx, ready_rx) = mpsc::unbounded_channel::<Task>();
        let (msg_tx, mut msg_rx) = mpsc::unbounded_channel::<CoordinatorMsg>();
        let ready_rx = Arc::new(AsyncMutex::new(ready_rx));

        // Fixed-size worker pool; extra workers would only idle on a
        // smaller graph.
        let pool_size = self.workers.min(stage_count.max(1));
        for worker_id in 0..pool_size {
            tokio::spawn(worker_loop(
                worker_id,
                ready_rx.clone(),
                msg_tx.clone(),
                graph.clone(),
                breakers.clone(),
                cancel.clone(),
                run_id.to_string(),
            ));
        }

        let task_ids: Vec<Uuid> = (0..stage_count).map(|_| Uuid::new_v4()).collect();
        let mut states = vec![StageState::pending(); stage_count];
        let mut outputs: Vec<Option<Value>> = vec![None; stage_count];
        let mut remaining = stage_count;
        let mut inflight = 0usize;
        let mut pending_retries = 0usize;
        let mut cancel_observed = false;

        let dispatch = |stage: usize,
                        attempt: u32,
                        payload: Value,
                        states: &mut Vec<StageState>,
                        inflight: &mut usize| {
            states[stage].status = TaskStatus::Running;
            *inflight += 1;
            let task = Task {
                id: task_ids[stage],
                stage,
                attempt,
                payload,
            };
            // Workers outlive the send unless the instance already wound
            // down, in which case the task is intentionally dropped.
            let _ = ready_tx.send(task);
        };

        dispatch(
            graph.root(),
            1,
            input.clone(),
            &mut states,
            &mut inflight,
        );

        while remaining > 0 {
            let message = tokio::select! {
                message = msg_rx.recv() => message,
                () = cancel.cancelled(), if !cancel_observed => {
                    cancel_observed = true;
                    // Tasks not yet dispatched are dropped without running.
                    for stage in 0..stage_count {
                        if states[stage].status == TaskStatus::Pending {
                            states[stage].status = TaskStatus::Cancelled;
                            states[stage].error = Some(OutcomeError {
                                kind: FailureKind::Cancelled,
                                message: cancel
                                    .reason()
                                    .unwrap_or_else(|| "execution cancelled".to_string()),
                            });
                            remaining -= 1;
                            recorder.append(marker_event(
                                task_ids[stage],
                                &graph.stage(stage).name,
                                TaskStatus::Cancelled,
                                FailureKind::Cancelled,
                                "execution cancelled before dispatch",
                            ));
                        }
                    }
                    continue;
                }
            };

            let Some(message) = message else {
                break;
            };

            match message {
                CoordinatorMsg::RetryDue { stage } => {
                    pending_retries -= 1;
                    if cancel_observed {
                        if states[stage].status == TaskStatus::Running {
                            states[stage].status = TaskStatus::Cancelled;
                            states[stage].error = Some(OutcomeError {
                                kind: FailureKind::Cancelled,
                                message: "execution cancelled during retry backoff".to_string(),
                            });
                            remaining -= 1;
                            recorder.append(marker_event(
                                task_ids[stage],
                                &graph.stage(stage).name,
                                TaskStatus::Cancelled,
                                FailureKind::Cancelled,
                                "execution cancelled during retry backoff",
                            ));
                        }
                        continue;
                    }

                    let attempt = states[stage].attempts + 1;
                    let payload = graph.stage(stage).upstream.map_or_else(
                        || input.clone(),
                        |upstream| outputs[upstream].clone().unwrap_or(Value::Null),
                    );
                    debug!(
                        stage = %graph.stage(stage).name,
                        attempt,
                        "re-enqueueing task after backoff"
                    );
                    dispatch(stage, attempt, payload, &mut states, &mut inflight);
                }
                CoordinatorMsg::Completed(completion) => {
                    inflight -= 1;
                    let stage_index = completion.stage;
                    let stage = graph.stage(stage_index);
                    states[stage_index].attempts =
                        states[stage_index].attempts.max(completion.attempt);
                    states[stage_index].duration_ms +=
                        completion.duration.as_secs_f64() * 1000.0;

                    let (outcome, error_kind, error_message, output_bytes) =
                        match &completion.result {
                            Ok(output) => {
                                (TaskStatus::Succeeded, None, None, payload_bytes(output))
                            }
                            Err(failure) if failure.kind == FailureKind::Cancelled => (
                                TaskStatus::Cancelled,
                                Some(failure.kind),
                                Some(failure.message.clone()),
                                0,
                            ),
                            Err(failure) => (
                                TaskStatus::Failed,
                                Some(failure.kind),
                                Some(failure.message.clone()),
                                0,
                            ),
                        };

                    recorder.append(TraceEvent {
                        task_id: completion.task_id,
                        stage: stage.name.clone(),
                        attempt: completion.attempt,
                        started_at: completion.started_at,
                        ended_at: completion.started_at
                            + chrono::Duration::from_std(completion.duration)
                                .unwrap_or_else(|_| chrono::Duration::zero()),
                        outcome,
                        error_kind,
                        error: error_message,
                        input_bytes: completion.input_bytes,
                        output_bytes,
                    });

                    match completion.result {
                        Ok(output) => {
                            states[stage_index].status = TaskStatus::Succeeded;
                            remaining -= 1;
                            outputs[stage_index] = Some(output);

                            if !cancel_observed {
                                for &child in graph.children(stage_index) {
                                    if states[child].status == TaskStatus::Pending {
                                        let payload = outputs[stage_index]
                                            .clone()
                                            .unwrap_or(Value::Null);
                                        dispatch(
                                            child,
                                            1,
                                            payload,
                                            &mut states,
                                            &mut inflight,
                                        );
                                    }
                                }
                            }
                        }
                        Err(failure) => {
                            let kind = failure.kind;
                            let attempts_made = completion.attempt;
                            let may_retry = !completion.breaker_rejected
                                && !cancel_observed
                                && kind != FailureKind::Cancelled
                                && stage.retry.should_retry(kind, attempts_made);

                            if may_retry {
                                let delay = stage.retry.delay_for(attempts_made);
                                warn!(
                                    stage = %stage.name,
                                    attempt = attempts_made,
                                    kind = %kind,
                                    delay_ms = delay.as_millis() as u64,
                                    "task failed, retrying after backoff"
                                );
                                pending_retries += 1;
                                let msg_tx = msg_tx.clone();
                                tokio::spawn(async move {
                                    tokio::time::sleep(delay).await;
                                    let _ = msg_tx
                                        .send(CoordinatorMsg::RetryDue { stage: stage_index });
                                });
                            } else {
                                let status = if kind == FailureKind::Cancelled {
                                    TaskStatus::Cancelled
                                } else {
                                    TaskStatus::Failed
                                };
                                states[stage_index].status = status;
                                states[stage_index].error = Some(OutcomeError {
                                    kind,
                                    message: failure.message.clone(),
                                });
                                remaining -= 1;

                                if status == TaskStatus::Failed {
                                    warn!(
                                        stage = %stage.name,
                                        attempts = attempts_made,
                                        kind = %kind,
                                        "stage failed terminally"
                                    );
                                }

                                // Downstream dependents are marked skipped,
                                // carrying the upstream failure reason.
                                for descendant in graph.descendants(stage_index) {
                                    if states[descendant].status != TaskStatus::Pending {
                                        continue;
                                    }
                                    let reason = format!(
                                        "upstream stage '{}' failed ({kind}): {}",
                                        stage.name, failure.message
                                    );
                                    states[descendant].status = TaskStatus::Skipped;
                                    states[descendant].error = Some(OutcomeError {
                                        kind,
                                        message: reason.clone(),
                                    });
                                    remaining -= 1;
                                    recorder.append(marker_event(
                                        task_ids[descendant],
                                        &graph.stage(descendant).name,
                                        TaskStatus::Skipped,
                                        kind,
                                        &reason,
                                    ));
                                }
                            }
                        }
                    }
                }
            }

            if remaining > 0 && inflight == 0 && pending_retries == 0 && !cancel_observed {
                // A dependency bookkeeping bug would strand the instance;
                // fail loudly instead of hanging.
                error!(
                    pipeline = %graph.name(),
                    remaining,
                    "scheduler stalled with no tasks in flight"
                );
                for stage in 0..stage_count {
                    if !states[stage].status.is_terminal() {
                        states[stage].status = TaskStatus::Failed;
                        states[stage].error = Some(OutcomeError {
                            kind: FailureKind::Validation,
                            message: "scheduler stalled; stage never became ready".to_string(),
                        });
                        remaining -= 1;
                    }
                }
            }
        }

        let terminal_succeeded = states[graph.terminal()].status == TaskStatus::Succeeded;
        let status = if cancel_observed {
            InstanceStatus::Cancelled
        } else if !terminal_succeeded {
            InstanceStatus::Failed
        } else if states
            .iter()
            .zip(graph.stages())
            .any(|(state, node)| node.critical && state.status != TaskStatus::Succeeded)
        {
            InstanceStatus::Failed
        } else if states
            .iter()
            .any(|state| state.status != TaskStatus::Succeeded)
        {
            InstanceStatus::Degraded
        } else {
            InstanceStatus::Succeeded
        };

        // A cancelled instance discards its output even when the terminal
        // stage managed to finish.
        let final_output = if terminal_succeeded && !cancel_observed {
            outputs[graph.terminal()].clone()
        } else {
            None
        };

        let outcomes = graph
            .topo_order()
            .iter()
            .map(|&index| StageOutcome {
                stage: graph.stage(index).name.clone(),
                status: states[index].status,
                attempts: states[index].attempts,
                error: states[index].error.clone(),
                duration_ms: states[index].duration_ms,
            })
            .collect();

        ExecutionReport {
            status,
            final_output,
            outcomes,
            duration: started.elapsed(),
        }
    }
}

/// A marker event for a stage that was never invoked (skipped, or cancelled
/// before dispatch). Attempt 0 distinguishes it from real attempts.
fn marker_event(
    task_id: Uuid,
    stage: &str,
    outcome: TaskStatus,
    kind: FailureKind,
    message: &str,
) -> TraceEvent {
    let now = Utc::now();
    TraceEvent {
        task_id,
        stage: stage.to_string(),
        attempt: 0,
        started_at: now,
        ended_at: now,
        outcome,
        error_kind: Some(kind),
        error: Some(message.to_string()),
        input_bytes: 0,
        output_bytes: 0,
    }
}

async fn worker_loop(
    worker_id: usize,
    ready_rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<Task>>>,
    msg_tx: mpsc::UnboundedSender<CoordinatorMsg>,
    graph: Arc<PipelineGraph>,
    breakers: Arc<BreakerRegistry>,
    cancel: Arc<CancellationToken>,
    run_id: String,
) {
    loop {
        let task = {
            let mut rx = ready_rx.lock().await;
            rx.recv().await
        };
        let Some(task) = task else {
            break;
        };

        debug!(worker = worker_id, stage = task.stage, attempt = task.attempt, "task picked up");
        let completion = run_task(task, &graph, &breakers, &cancel, &run_id).await;
        if msg_tx.send(CoordinatorMsg::Completed(completion)).is_err() {
            break;
        }
    }
}

async fn run_task(
    task: Task,
    graph: &PipelineGraph,
    breakers: &BreakerRegistry,
    cancel: &Arc<CancellationToken>,
    run_id: &str,
) -> Completion {
    let stage = graph.stage(task.stage);
    let started_at = Utc::now();
    let started = Instant::now();
    let input_bytes = payload_bytes(&task.payload);

    // Queued tasks observed after cancellation are dropped without running.
    if cancel.is_cancelled() {
        return Completion {
            task_id: task.id,
            stage: task.stage,
            attempt: task.attempt,
            started_at,
            duration: started.elapsed(),
            input_bytes,
            result: Err(AdapterFailure::cancelled(
                cancel
                    .reason()
                    .unwrap_or_else(|| "execution cancelled".to_string()),
            )),
            breaker_rejected: false,
        };
    }

    // Circuit admission happens before the adapter is touched.
    let probe = match breakers.admit(&stage.name) {
        Admission::Allow => false,
        Admission::Probe => true,
        Admission::Reject => {
            return Completion {
                task_id: task.id,
                stage: task.stage,
                attempt: task.attempt,
                started_at,
                duration: started.elapsed(),
                input_bytes,
                result: Err(AdapterFailure::new(
                    FailureKind::CircuitOpen,
                    format!("circuit open for stage '{}'", stage.name),
                )),
                breaker_rejected: true,
            };
        }
    };

    let deadline = Instant::now() + stage.timeout;
    let ctx = InvokeContext::new(
        run_id,
        stage.name.clone(),
        task.attempt,
        deadline,
        cancel.clone(),
        stage.settings.clone(),
    );

    let result = tokio::select! {
        invoked = tokio::time::timeout(stage.timeout, stage.adapter.invoke(task.payload, &ctx)) => {
            match invoked {
                Ok(result) => result,
                Err(_elapsed) => Err(AdapterFailure::timeout(format!(
                    "stage '{}' exceeded its {}ms deadline",
                    stage.name,
                    stage.timeout.as_millis()
                ))),
            }
        }
        () = cancel.cancelled() => Err(AdapterFailure::cancelled(
            cancel.reason().unwrap_or_else(|| "execution cancelled".to_string()),
        )),
    };

    match &result {
        Ok(_) => breakers.record_success(&stage.name, probe),
        Err(failure) if failure.kind.counts_toward_breaker() => {
            breakers.record_failure(&stage.name, &stage.breaker, probe);
        }
        Err(_) => {
            // Cancellation is no verdict on the dependency's health; free
            // the probe slot so the next task can probe.
            if probe {
                breakers.release_probe(&stage.name);
            }
        }
    }

    Completion {
        task_id: task.id,
        stage: task.stage,
        attempt: task.attempt,
        started_at,
        duration: started.elapsed(),
        input_bytes,
        result,
        breaker_rejected: false,
    }
}
