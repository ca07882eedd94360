//! Module adapter contract.
//!
//! An adapter wraps one pluggable unit of work (embedder, retriever,
//! generator, evaluator, ...) behind a uniform async contract. The engine
//! never knows concrete module types: payloads cross the boundary as
//! serializable JSON value trees and failures carry a [`FailureKind`].
//!
//! Adapters are stateless between invocations except for scoped resources
//! acquired in [`ModuleAdapter::setup`] and released in
//! [`ModuleAdapter::teardown`], which the owning engine calls on all paths.

mod builtin;
mod registry;

pub use builtin::{
    ChunkAdapter, ExtractiveGenerator, HashEmbedder, IndexAdapter, LexicalEvaluator,
    PassthroughLoader, VectorRetriever, hash_embedding,
};
pub use registry::{AdapterConstructor, AdapterRegistry};

use crate::cancellation::CancellationToken;
use crate::errors::{AdapterFailure, EngineError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-stage configuration map handed to adapters, read-only.
pub type StageSettings = serde_json::Map<String, serde_json::Value>;

/// What kind of work an adapter performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Loads or normalizes raw input.
    Loader,
    /// Turns text into embedding vectors.
    Embedder,
    /// Finds relevant documents for an embedded query.
    Retriever,
    /// Produces an answer from query and contexts.
    Generator,
    /// Scores an answer against contexts and ground truth.
    Evaluator,
    /// Anything else; distinguished by name.
    Custom,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Loader => write!(f, "loader"),
            Self::Embedder => write!(f, "embedder"),
            Self::Retriever => write!(f, "retriever"),
            Self::Generator => write!(f, "generator"),
            Self::Evaluator => write!(f, "evaluator"),
            Self::Custom => write!(f, "custom"),
        }
    }
}

/// The adapter contract version, checked at graph-build time.
///
/// A stage refuses to bind an adapter whose major version does not match
/// the pipeline's required major version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContractVersion {
    /// Breaking-change component.
    pub major: u64,
    /// Additive-change component.
    pub minor: u64,
    /// Fix component.
    pub patch: u64,
}

impl ContractVersion {
    /// The contract version this crate implements.
    pub const CURRENT: Self = Self {
        major: 1,
        minor: 0,
        patch: 0,
    };

    /// Creates a version from its components.
    #[must_use]
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for ContractVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Identity of an adapter: name, its own semantic version, and capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterDescriptor {
    /// The adapter name, unique within its capability.
    pub name: String,
    /// The adapter implementation's own version.
    pub version: String,
    /// What kind of work this adapter performs.
    pub capability: Capability,
}

impl AdapterDescriptor {
    /// Creates a new descriptor.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        capability: Capability,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            capability,
        }
    }
}

/// Structural description of a payload crossing a stage boundary.
///
/// Checked at graph-build time: a consumer's declared input shape must
/// accept its producer's declared output shape. The check is structural,
/// nothing is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueShape {
    /// Any value tree; always compatible.
    Any,
    /// A plain string.
    Text,
    /// A JSON object guaranteed to carry the named top-level keys.
    Object(&'static [&'static str]),
}

impl ValueShape {
    /// Returns true if a payload of shape `produced` satisfies this shape.
    #[must_use]
    pub fn accepts(&self, produced: &Self) -> bool {
        match (self, produced) {
            (Self::Any, _) | (_, Self::Any) => true,
            (Self::Text, Self::Text) => true,
            (Self::Object(required), Self::Object(provided)) => {
                required.iter().all(|key| provided.contains(key))
            }
            _ => false,
        }
    }
}

impl fmt::Display for ValueShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "any"),
            Self::Text => write!(f, "text"),
            Self::Object(keys) => write!(f, "object{{{}}}", keys.join(", ")),
        }
    }
}

/// Execution context passed to every adapter invocation.
///
/// Carries the task's deadline, the instance's cancellation signal, and the
/// stage's read-only settings.
#[derive(Debug, Clone)]
pub struct InvokeContext {
    run_id: String,
    stage: String,
    attempt: u32,
    deadline: Instant,
    cancel: Arc<CancellationToken>,
    settings: Arc<StageSettings>,
}

impl InvokeContext {
    /// Creates a new invocation context.
    #[must_use]
    pub fn new(
        run_id: impl Into<String>,
        stage: impl Into<String>,
        attempt: u32,
        deadline: Instant,
        cancel: Arc<CancellationToken>,
        settings: Arc<StageSettings>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            stage: stage.into(),
            attempt,
            deadline,
            cancel,
            settings,
        }
    }

    /// The execution instance's run id.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// The stage being invoked.
    #[must_use]
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// The attempt number, starting at 1.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Time remaining until the task's deadline.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Returns whether the instance has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancellation checkpoint for cooperative adapters.
    ///
    /// # Errors
    ///
    /// Returns a `cancelled` failure once the instance's signal is set.
    pub fn checkpoint(&self) -> Result<(), AdapterFailure> {
        if self.is_cancelled() {
            Err(AdapterFailure::cancelled(
                self.cancel
                    .reason()
                    .unwrap_or_else(|| "execution cancelled".to_string()),
            ))
        } else {
            Ok(())
        }
    }

    /// Looks up a raw stage setting.
    #[must_use]
    pub fn setting(&self, key: &str) -> Option<&serde_json::Value> {
        self.settings.get(key)
    }

    /// Looks up an integer stage setting.
    #[must_use]
    pub fn setting_usize(&self, key: &str) -> Option<usize> {
        self.setting(key)
            .and_then(serde_json::Value::as_u64)
            .and_then(|v| usize::try_from(v).ok())
    }

    /// Looks up a float stage setting.
    #[must_use]
    pub fn setting_f64(&self, key: &str) -> Option<f64> {
        self.setting(key).and_then(serde_json::Value::as_f64)
    }

    /// Looks up a string stage setting.
    #[must_use]
    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.setting(key).and_then(serde_json::Value::as_str)
    }
}

/// Uniform contract for a pluggable unit of work.
#[async_trait]
pub trait ModuleAdapter: Send + Sync + fmt::Debug {
    /// The adapter's identity.
    fn descriptor(&self) -> AdapterDescriptor;

    /// The contract version this adapter implements.
    fn contract_version(&self) -> ContractVersion {
        ContractVersion::CURRENT
    }

    /// Declared shape of the payload this adapter consumes.
    fn input_shape(&self) -> ValueShape {
        ValueShape::Any
    }

    /// Declared shape of the payload this adapter produces.
    fn output_shape(&self) -> ValueShape {
        ValueShape::Any
    }

    /// Acquires scoped resources before the first invocation.
    async fn setup(&self) -> Result<(), EngineError> {
        Ok(())
    }

    /// Executes one unit of work.
    ///
    /// # Errors
    ///
    /// Returns an [`AdapterFailure`] whose kind drives retry and breaker
    /// decisions.
    async fn invoke(
        &self,
        payload: serde_json::Value,
        ctx: &InvokeContext,
    ) -> Result<serde_json::Value, AdapterFailure>;

    /// Releases scoped resources. Called on all paths at engine teardown.
    async fn teardown(&self) -> Result<(), EngineError> {
        Ok(())
    }

    /// Estimated cost in dollars accumulated by this adapter so far.
    fn cost_estimate(&self) -> f64 {
        0.0
    }
}

/// A function-based adapter, mainly useful for custom stages and tests.
pub struct FnAdapter<F>
where
    F: Fn(serde_json::Value, &InvokeContext) -> Result<serde_json::Value, AdapterFailure>
        + Send
        + Sync,
{
    descriptor: AdapterDescriptor,
    func: F,
}

impl<F> FnAdapter<F>
where
    F: Fn(serde_json::Value, &InvokeContext) -> Result<serde_json::Value, AdapterFailure>
        + Send
        + Sync,
{
    /// Creates a function-based adapter with the given identity.
    pub fn new(name: impl Into<String>, capability: Capability, func: F) -> Self {
        Self {
            descriptor: AdapterDescriptor::new(name, "0.1.0", capability),
            func,
        }
    }
}

impl<F> fmt::Debug for FnAdapter<F>
where
    F: Fn(serde_json::Value, &InvokeContext) -> Result<serde_json::Value, AdapterFailure>
        + Send
        + Sync,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnAdapter")
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

#[async_trait]
impl<F> ModuleAdapter for FnAdapter<F>
where
    F: Fn(serde_json::Value, &InvokeContext) -> Result<serde_json::Value, AdapterFailure>
        + Send
        + Sync,
{
    fn descriptor(&self) -> AdapterDescriptor {
        self.descriptor.clone()
    }

    async fn invoke(
        &self,
        payload: serde_json::Value,
        ctx: &InvokeContext,
    ) -> Result<serde_json::Value, AdapterFailure> {
        (self.func)(payload, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ctx() -> InvokeContext {
        InvokeContext::new(
            "run-1",
            "stage-1",
            1,
            Instant::now() + Duration::from_secs(5),
            Arc::new(CancellationToken::new()),
            Arc::new(StageSettings::new()),
        )
    }

    #[test]
    fn shape_compatibility() {
        let any = ValueShape::Any;
        let text = ValueShape::Text;
        let query = ValueShape::Object(&["query"]);
        let query_embedding = ValueShape::Object(&["query", "embedding"]);

        assert!(any.accepts(&text));
        assert!(text.accepts(&any));
        assert!(text.accepts(&text));
        assert!(!text.accepts(&query));

        // A consumer needing {query} accepts a producer guaranteeing more.
        assert!(query.accepts(&query_embedding));
        // The reverse is a mismatch.
        assert!(!query_embedding.accepts(&query));
    }

    #[test]
    fn contract_version_display() {
        assert_eq!(ContractVersion::CURRENT.to_string(), "1.0.0");
        assert_eq!(ContractVersion::new(2, 1, 3).to_string(), "2.1.3");
    }

    #[test]
    fn checkpoint_reports_cancellation() {
        let cancel = Arc::new(CancellationToken::new());
        let ctx = InvokeContext::new(
            "run-1",
            "stage-1",
            1,
            Instant::now() + Duration::from_secs(5),
            cancel.clone(),
            Arc::new(StageSettings::new()),
        );

        assert!(ctx.checkpoint().is_ok());
        cancel.cancel("user abort");

        let failure = ctx.checkpoint().unwrap_err();
        assert_eq!(failure.kind, crate::errors::FailureKind::Cancelled);
        assert!(failure.message.contains("user abort"));
    }

    #[test]
    fn settings_lookup() {
        let mut settings = StageSettings::new();
        settings.insert("top_k".to_string(), serde_json::json!(5));
        settings.insert("threshold".to_string(), serde_json::json!(0.7));
        settings.insert("model".to_string(), serde_json::json!("small"));

        let ctx = InvokeContext::new(
            "run-1",
            "stage-1",
            1,
            Instant::now(),
            Arc::new(CancellationToken::new()),
            Arc::new(settings),
        );

        assert_eq!(ctx.setting_usize("top_k"), Some(5));
        assert_eq!(ctx.setting_f64("threshold"), Some(0.7));
        assert_eq!(ctx.setting_str("model"), Some("small"));
        assert_eq!(ctx.setting_usize("missing"), None);
    }

    #[tokio::test]
    async fn fn_adapter_invokes() {
        let adapter = FnAdapter::new("double", Capability::Custom, |payload, _ctx| {
            let n = payload.as_u64().unwrap_or(0);
            Ok(serde_json::json!(n * 2))
        });

        let ctx = test_ctx();
        let out = adapter.invoke(serde_json::json!(21), &ctx).await.unwrap();
        assert_eq!(out, serde_json::json!(42));
        assert_eq!(adapter.descriptor().capability, Capability::Custom);
    }
}
