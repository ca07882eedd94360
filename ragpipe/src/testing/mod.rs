//! Scripted adapters and fixtures for exercising the engine in tests.
//!
//! [`ScriptedAdapter`] plays back a per-attempt script (fail twice then
//! succeed, hang past a deadline, ...) and counts invocations, which is
//! what breaker and retry assertions need.

use crate::adapter::{AdapterDescriptor, Capability, InvokeContext, ModuleAdapter};
use crate::errors::{AdapterFailure, FailureKind};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// One step of a scripted adapter's playback.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Succeed with the given output.
    Succeed(Value),
    /// Succeed by echoing the input payload.
    Echo,
    /// Fail with the given kind and message.
    Fail(FailureKind, String),
    /// Sleep, then echo the input payload. Combined with a short stage
    /// timeout this produces deadline failures.
    Hang(Duration),
}

/// What the adapter does once its script is exhausted.
#[derive(Debug, Clone)]
enum Fallback {
    Echo,
    Fail(FailureKind, String),
}

/// An adapter that plays back a script, one step per invocation.
pub struct ScriptedAdapter {
    name: String,
    capability: Capability,
    steps: Mutex<VecDeque<ScriptStep>>,
    fallback: Fallback,
    invocations: AtomicUsize,
}

impl ScriptedAdapter {
    /// Creates an adapter that echoes its payload on every invocation.
    #[must_use]
    pub fn succeeding(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capability: Capability::Custom,
            steps: Mutex::new(VecDeque::new()),
            fallback: Fallback::Echo,
            invocations: AtomicUsize::new(0),
        }
    }

    /// Creates an adapter that fails every invocation with `kind`.
    #[must_use]
    pub fn failing(name: impl Into<String>, kind: FailureKind) -> Self {
        let name = name.into();
        let message = format!("scripted failure in '{name}'");
        Self {
            name,
            capability: Capability::Custom,
            steps: Mutex::new(VecDeque::new()),
            fallback: Fallback::Fail(kind, message),
            invocations: AtomicUsize::new(0),
        }
    }

    /// Sets the capability tag.
    #[must_use]
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capability = capability;
        self
    }

    /// Appends a step that succeeds with `output`.
    #[must_use]
    pub fn then_succeed(self, output: Value) -> Self {
        self.steps.lock().push_back(ScriptStep::Succeed(output));
        self
    }

    /// Appends a step that echoes the payload.
    #[must_use]
    pub fn then_echo(self) -> Self {
        self.steps.lock().push_back(ScriptStep::Echo);
        self
    }

    /// Appends a step that fails with `kind`.
    #[must_use]
    pub fn then_fail(self, kind: FailureKind, message: impl Into<String>) -> Self {
        self.steps
            .lock()
            .push_back(ScriptStep::Fail(kind, message.into()));
        self
    }

    /// Appends a step that sleeps for `duration`, then echoes.
    #[must_use]
    pub fn then_hang(self, duration: Duration) -> Self {
        self.steps.lock().push_back(ScriptStep::Hang(duration));
        self
    }

    /// Number of times `invoke` was called.
    #[must_use]
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for ScriptedAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedAdapter")
            .field("name", &self.name)
            .field("capability", &self.capability)
            .field("invocations", &self.invocations())
            .finish()
    }
}

#[async_trait::async_trait]
impl ModuleAdapter for ScriptedAdapter {
    fn descriptor(&self) -> AdapterDescriptor {
        AdapterDescriptor::new(self.name.clone(), "0.0.0-test", self.capability)
    }

    async fn invoke(&self, payload: Value, _ctx: &InvokeContext) -> Result<Value, AdapterFailure> {
        self.invocations.fetch_add(1, Ordering::SeqCst);

        let step = self.steps.lock().pop_front();
        match step {
            Some(ScriptStep::Succeed(output)) => Ok(output),
            Some(ScriptStep::Echo) => Ok(payload),
            Some(ScriptStep::Fail(kind, message)) => Err(AdapterFailure::new(kind, message)),
            Some(ScriptStep::Hang(duration)) => {
                tokio::time::sleep(duration).await;
                Ok(payload)
            }
            None => match &self.fallback {
                Fallback::Echo => Ok(payload),
                Fallback::Fail(kind, message) => Err(AdapterFailure::new(*kind, message.clone())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::CancellationToken;
    use std::sync::Arc;
    use std::time::Instant;

    fn ctx() -> InvokeContext {
        InvokeContext::new(
            "run",
            "stage",
            1,
            Instant::now() + Duration::from_secs(1),
            Arc::new(CancellationToken::new()),
            Arc::new(crate::adapter::StageSettings::new()),
        )
    }

    #[tokio::test]
    async fn script_plays_back_in_order() {
        let adapter = ScriptedAdapter::succeeding("flaky")
            .then_fail(FailureKind::Transient, "first")
            .then_succeed(serde_json::json!("done"));

        let ctx = ctx();
        let first = adapter.invoke(serde_json::json!(null), &ctx).await;
        assert_eq!(first.unwrap_err().message, "first");

        let second = adapter.invoke(serde_json::json!(null), &ctx).await;
        assert_eq!(second.unwrap(), serde_json::json!("done"));

        // Script exhausted; fallback echoes.
        let third = adapter.invoke(serde_json::json!(7), &ctx).await;
        assert_eq!(third.unwrap(), serde_json::json!(7));

        assert_eq!(adapter.invocations(), 3);
    }

    #[tokio::test]
    async fn failing_adapter_always_fails() {
        let adapter = ScriptedAdapter::failing("broken", FailureKind::Transient);
        let ctx = ctx();

        for _ in 0..4 {
            let result = adapter.invoke(serde_json::json!(null), &ctx).await;
            assert_eq!(result.unwrap_err().kind, FailureKind::Transient);
        }
        assert_eq!(adapter.invocations(), 4);
    }
}
