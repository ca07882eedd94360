//! End-to-end engine tests over the default and customized pipelines.

use super::*;
use crate::adapter::{AdapterDescriptor, HashEmbedder, InvokeContext, ValueShape};
use crate::errors::{AdapterFailure, FailureKind};
use crate::resilience::{BreakerConfig, RetryPolicy};
use crate::stores::InMemoryRunHistory;
use crate::testing::ScriptedAdapter;
use crate::trace::TaskStatus;
use async_trait::async_trait;
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy::new()
        .with_max_retries(max_retries)
        .with_base_delay_ms(1)
        .without_jitter()
}

fn test_config() -> EngineConfig {
    EngineConfig::default()
        .with_workers(4)
        .with_retry(fast_retry(2))
}

fn corpus() -> Vec<Document> {
    vec![
        Document::from_text("Rust is a systems programming language focused on safety and speed.")
            .with_metadata("source", json!("langs")),
        Document::from_text("Python is a scripting language known for readability."),
        Document::from_text("The weather in the mountains is cold and windy."),
    ]
}

fn engine_with(history: Arc<InMemoryRunHistory>) -> RunEngine {
    RunEngine::builder()
        .config(test_config())
        .history(history)
        .build()
        .unwrap()
}

#[tokio::test]
async fn ingest_then_run_end_to_end() -> anyhow::Result<()> {
    let history = Arc::new(InMemoryRunHistory::new());
    let engine = engine_with(history);

    let ingest = engine.ingest(corpus()).await?;
    assert_eq!(ingest.documents_processed, 3);
    assert!(ingest.failures.is_empty());
    assert!(ingest.chunks_indexed >= 3);
    assert!(ingest.chunks_per_second > 0.0);

    let result = engine.run("rust systems programming safety").await?;
    assert_eq!(result.status, InstanceStatus::Succeeded);
    let answer = result.answer.unwrap();
    assert!(answer.contains("Rust"), "answer: {answer}");
    assert_eq!(result.trace.len(), 4);

    let stages: Vec<&str> = result
        .record
        .stage_outcomes
        .iter()
        .map(|outcome| outcome.stage.as_str())
        .collect();
    assert_eq!(stages, vec!["load", "embed", "retrieve", "generate"]);

    // Session history holds the ingest record and the run record.
    assert_eq!(engine.run_history().len(), 2);
    Ok(())
}

#[tokio::test]
async fn ingest_from_source_fetches_and_indexes() {
    let engine = engine_with(Arc::new(InMemoryRunHistory::new()));
    let source = crate::stores::StaticDocumentSource::new(corpus());

    let result = engine.ingest_from(&source).await.unwrap();
    assert_eq!(result.documents_processed, 3);
    assert!(result.failures.is_empty());
}

#[tokio::test]
async fn ingest_reports_individual_document_failures() {
    let engine = engine_with(Arc::new(InMemoryRunHistory::new()));

    let documents = vec![
        Document::from_text("A perfectly fine document."),
        Document::from_text("   "),
        Document::from_text("Another fine document."),
    ];
    let result = engine.ingest(documents).await.unwrap();

    assert_eq!(result.documents_processed, 3);
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].index, 1);
    assert!(result.chunks_indexed >= 2);
}

#[tokio::test]
async fn empty_query_fails_validation_without_retry() {
    let engine = engine_with(Arc::new(InMemoryRunHistory::new()));

    let result = engine.run("").await.unwrap();
    assert_eq!(result.status, InstanceStatus::Failed);
    assert!(result.answer.is_none());

    let load = &result.record.stage_outcomes[0];
    assert_eq!(load.stage, "load");
    assert_eq!(load.status, TaskStatus::Failed);
    assert_eq!(load.attempts, 1);
    assert_eq!(load.error.as_ref().unwrap().kind, FailureKind::Validation);

    // One failed attempt plus three skip markers.
    assert_eq!(result.trace.len(), 4);
    assert!(result
        .record
        .stage_outcomes
        .iter()
        .skip(1)
        .all(|outcome| outcome.status == TaskStatus::Skipped));
}

/// An embedder that fails transiently a fixed number of times before
/// delegating to the deterministic hashing embedder.
#[derive(Debug)]
struct FlakyEmbedder {
    inner: HashEmbedder,
    failures_left: AtomicU32,
    invocations: AtomicUsize,
}

impl FlakyEmbedder {
    fn new(failures: u32) -> Self {
        Self {
            inner: HashEmbedder::new(),
            failures_left: AtomicU32::new(failures),
            invocations: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ModuleAdapter for FlakyEmbedder {
    fn descriptor(&self) -> AdapterDescriptor {
        AdapterDescriptor::new("flaky", "0.1.0", Capability::Embedder)
    }

    fn input_shape(&self) -> ValueShape {
        self.inner.input_shape()
    }

    fn output_shape(&self) -> ValueShape {
        self.inner.output_shape()
    }

    async fn invoke(&self, payload: Value, ctx: &InvokeContext) -> Result<Value, AdapterFailure> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let should_fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(AdapterFailure::transient("embedding backend unavailable"));
        }
        self.inner.invoke(payload, ctx).await
    }
}

fn query_spec_with(
    config: &EngineConfig,
    embedder: (Capability, &str),
    generator: (Capability, &str),
) -> PipelineSpec {
    PipelineSpec::new("query")
        .with_stage(StageSpec::new("load", Capability::Loader, "passthrough"))
        .with_stage(
            StageSpec::new("embed", embedder.0, embedder.1)
                .with_input("load")
                .with_setting("embedding_dim", json!(config.embedding_dim)),
        )
        .with_stage(
            StageSpec::new("retrieve", Capability::Retriever, "vector")
                .with_input("embed")
                .with_setting("top_k", json!(config.top_k)),
        )
        .with_stage(StageSpec::new("generate", generator.0, generator.1).with_input("retrieve"))
}

#[tokio::test]
async fn transient_embedder_failure_retries_and_succeeds() {
    // loader -> embedder -> retriever -> generator, with the embedder
    // failing once: the run succeeds and the trace carries five events.
    let config = test_config();
    let flaky = Arc::new(FlakyEmbedder::new(1));
    let vector_store: Arc<dyn crate::stores::VectorStore> =
        Arc::new(crate::stores::InMemoryVectorStore::new());

    let mut registry = AdapterRegistry::with_builtins(vector_store.clone());
    let registered = flaky.clone();
    registry.register(Capability::Embedder, "flaky", move |_settings| {
        Ok(registered.clone() as Arc<dyn ModuleAdapter>)
    });

    let engine = RunEngine::builder()
        .config(config.clone())
        .registry(registry)
        .vector_store(vector_store)
        .history(Arc::new(InMemoryRunHistory::new()))
        .query_pipeline(query_spec_with(
            &config,
            (Capability::Embedder, "flaky"),
            (Capability::Generator, "extractive"),
        ))
        .build()
        .unwrap();

    engine.ingest(corpus()).await.unwrap();

    let result = engine.run("rust safety").await.unwrap();
    assert_eq!(result.status, InstanceStatus::Succeeded);
    assert!(result.answer.is_some());
    // Ingest does not touch the embedder stage; both invocations belong to
    // the run (one failure, one success).
    assert_eq!(flaky.invocations.load(Ordering::SeqCst), 2);
    assert_eq!(result.trace.len(), 5);

    let embed = result
        .record
        .stage_outcomes
        .iter()
        .find(|outcome| outcome.stage == "embed")
        .unwrap();
    assert_eq!(embed.status, TaskStatus::Succeeded);
    assert_eq!(embed.attempts, 2);
}

#[tokio::test]
async fn generator_validation_failure_is_terminal() {
    let config = test_config();
    let strict = Arc::new(
        ScriptedAdapter::failing("strict", FailureKind::Validation)
            .with_capability(Capability::Generator),
    );
    let vector_store: Arc<dyn crate::stores::VectorStore> =
        Arc::new(crate::stores::InMemoryVectorStore::new());

    let mut registry = AdapterRegistry::with_builtins(vector_store.clone());
    let registered = strict.clone();
    registry.register(Capability::Generator, "strict", move |_settings| {
        Ok(registered.clone() as Arc<dyn ModuleAdapter>)
    });

    let engine = RunEngine::builder()
        .config(config.clone())
        .registry(registry)
        .vector_store(vector_store)
        .history(Arc::new(InMemoryRunHistory::new()))
        .query_pipeline(query_spec_with(
            &config,
            (Capability::Embedder, "hash"),
            (Capability::Generator, "strict"),
        ))
        .build()
        .unwrap();

    engine.ingest(corpus()).await.unwrap();

    let result = engine.run("anything at all").await.unwrap();
    assert_eq!(result.status, InstanceStatus::Failed);
    assert_eq!(strict.invocations(), 1);

    let generate = result
        .record
        .stage_outcomes
        .iter()
        .find(|outcome| outcome.stage == "generate")
        .unwrap();
    assert_eq!(generate.status, TaskStatus::Failed);
    assert_eq!(generate.attempts, 1);
    assert_eq!(
        generate.error.as_ref().unwrap().kind,
        FailureKind::Validation
    );

    // Three successful stages plus exactly one generator attempt.
    assert_eq!(result.trace.len(), 4);
}

#[tokio::test]
async fn score_merges_evaluation_into_record() {
    let engine = engine_with(Arc::new(InMemoryRunHistory::new()));
    engine.ingest(corpus()).await.unwrap();

    let truth = "Rust is a systems programming language focused on safety and speed.";
    let result = engine
        .score("rust systems programming safety", truth)
        .await
        .unwrap();

    assert_eq!(result.status, InstanceStatus::Succeeded);
    let evaluation = result.evaluation.unwrap();
    assert_eq!(evaluation["exact_match"], json!(1.0));
    assert_eq!(evaluation["passed"], json!(true));

    assert!(result.record.evaluation.is_some());
    // The trace covers the four query stages plus the evaluator attempt.
    assert_eq!(result.trace.len(), 5);
}

#[tokio::test]
async fn failing_evaluator_degrades_score_but_keeps_answer() {
    let config = test_config();
    let broken = Arc::new(
        ScriptedAdapter::failing("broken-eval", FailureKind::Validation)
            .with_capability(Capability::Evaluator),
    );
    let vector_store: Arc<dyn crate::stores::VectorStore> =
        Arc::new(crate::stores::InMemoryVectorStore::new());

    let mut registry = AdapterRegistry::with_builtins(vector_store.clone());
    let registered = broken.clone();
    registry.register(Capability::Evaluator, "broken", move |_settings| {
        Ok(registered.clone() as Arc<dyn ModuleAdapter>)
    });

    let eval_spec = PipelineSpec::new("evaluate").with_stage(
        StageSpec::new("evaluate", Capability::Evaluator, "broken").non_critical(),
    );

    let engine = RunEngine::builder()
        .config(config)
        .registry(registry)
        .vector_store(vector_store)
        .history(Arc::new(InMemoryRunHistory::new()))
        .eval_pipeline(eval_spec)
        .build()
        .unwrap();

    engine.ingest(corpus()).await.unwrap();

    let result = engine.score("rust safety", "whatever").await.unwrap();
    assert_eq!(result.status, InstanceStatus::Degraded);
    assert!(result.answer.is_some());
    assert!(result.evaluation.is_none());
}

#[tokio::test]
async fn run_records_persist_and_reload_by_id() -> anyhow::Result<()> {
    let history = Arc::new(InMemoryRunHistory::new());
    let engine = engine_with(history.clone());
    engine.ingest(corpus()).await?;

    let result = engine.run("rust").await?;

    let loaded = history.get(&result.run_id).await?.unwrap();
    assert_eq!(loaded.status, result.status);
    assert_eq!(loaded.config_hash, engine.config_hash());
    assert_eq!(loaded.query.as_deref(), Some("rust"));

    let recent = history
        .list_between(Utc::now() - chrono::Duration::minutes(5), Utc::now())
        .await?;
    assert!(recent.iter().any(|record| record.run_id == result.run_id));
    Ok(())
}

#[tokio::test]
async fn breaker_state_survives_runs_until_admin_reset() {
    let config = test_config()
        .with_retry(fast_retry(0))
        .with_breaker(
            BreakerConfig::new()
                .with_failure_threshold(1)
                .with_cooldown_ms(60_000),
        );
    let flaky_gen = Arc::new(
        ScriptedAdapter::failing("flaky-gen", FailureKind::Transient)
            .with_capability(Capability::Generator),
    );
    let vector_store: Arc<dyn crate::stores::VectorStore> =
        Arc::new(crate::stores::InMemoryVectorStore::new());

    let mut registry = AdapterRegistry::with_builtins(vector_store.clone());
    let registered = flaky_gen.clone();
    registry.register(Capability::Generator, "flaky-gen", move |_settings| {
        Ok(registered.clone() as Arc<dyn ModuleAdapter>)
    });

    let engine = RunEngine::builder()
        .config(config.clone())
        .registry(registry)
        .vector_store(vector_store)
        .history(Arc::new(InMemoryRunHistory::new()))
        .query_pipeline(query_spec_with(
            &config,
            (Capability::Embedder, "hash"),
            (Capability::Generator, "flaky-gen"),
        ))
        .build()
        .unwrap();

    engine.ingest(corpus()).await.unwrap();

    // First run trips the generator's breaker.
    let first = engine.run("q").await.unwrap();
    assert_eq!(first.status, InstanceStatus::Failed);
    assert_eq!(flaky_gen.invocations(), 1);

    // Second run is shed without touching the adapter.
    let second = engine.run("q").await.unwrap();
    assert_eq!(second.status, InstanceStatus::Failed);
    assert_eq!(flaky_gen.invocations(), 1);
    let generate = second
        .record
        .stage_outcomes
        .iter()
        .find(|outcome| outcome.stage == "generate")
        .unwrap();
    assert_eq!(
        generate.error.as_ref().unwrap().kind,
        FailureKind::CircuitOpen
    );

    // Administrative reset re-admits traffic.
    engine.reset_breakers();
    let third = engine.run("q").await.unwrap();
    assert_eq!(third.status, InstanceStatus::Failed);
    assert_eq!(flaky_gen.invocations(), 2);
}

/// A loader that counts setup and teardown calls.
#[derive(Debug, Default)]
struct LifecycleLoader {
    setups: AtomicUsize,
    teardowns: AtomicUsize,
}

#[async_trait]
impl ModuleAdapter for LifecycleLoader {
    fn descriptor(&self) -> AdapterDescriptor {
        AdapterDescriptor::new("lifecycle", "0.1.0", Capability::Loader)
    }

    fn input_shape(&self) -> ValueShape {
        ValueShape::Text
    }

    fn output_shape(&self) -> ValueShape {
        ValueShape::Object(&["query"])
    }

    async fn setup(&self) -> Result<(), EngineError> {
        self.setups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn invoke(&self, payload: Value, _ctx: &InvokeContext) -> Result<Value, AdapterFailure> {
        let query = payload
            .as_str()
            .ok_or_else(|| AdapterFailure::validation("query must be a string"))?;
        Ok(json!({ "query": query }))
    }

    async fn teardown(&self) -> Result<(), EngineError> {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn adapter_setup_runs_once_and_teardown_releases() {
    let config = test_config();
    let loader = Arc::new(LifecycleLoader::default());
    let vector_store: Arc<dyn crate::stores::VectorStore> =
        Arc::new(crate::stores::InMemoryVectorStore::new());

    let mut registry = AdapterRegistry::with_builtins(vector_store.clone());
    let registered = loader.clone();
    registry.register(Capability::Loader, "lifecycle", move |_settings| {
        Ok(registered.clone() as Arc<dyn ModuleAdapter>)
    });

    let spec = PipelineSpec::new("query")
        .with_stage(StageSpec::new("load", Capability::Loader, "lifecycle"))
        .with_stage(
            StageSpec::new("embed", Capability::Embedder, "hash")
                .with_input("load")
                .with_setting("embedding_dim", json!(config.embedding_dim)),
        )
        .with_stage(
            StageSpec::new("retrieve", Capability::Retriever, "vector")
                .with_input("embed")
                .with_setting("top_k", json!(config.top_k)),
        )
        .with_stage(
            StageSpec::new("generate", Capability::Generator, "extractive")
                .with_input("retrieve"),
        );

    let engine = RunEngine::builder()
        .config(config)
        .registry(registry)
        .vector_store(vector_store)
        .history(Arc::new(InMemoryRunHistory::new()))
        .query_pipeline(spec)
        .build()
        .unwrap();

    engine.run("first").await.unwrap();
    engine.run("second").await.unwrap();
    assert_eq!(loader.setups.load(Ordering::SeqCst), 1);

    engine.teardown().await.unwrap();
    assert_eq!(loader.teardowns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancelled_token_cancels_run() {
    let engine = engine_with(Arc::new(InMemoryRunHistory::new()));

    let cancel = Arc::new(CancellationToken::new());
    cancel.cancel("shutting down");

    let result = engine.run_with("rust", cancel).await.unwrap();
    assert_eq!(result.status, InstanceStatus::Cancelled);
    assert!(result
        .record
        .stage_outcomes
        .iter()
        .all(|outcome| outcome.status == TaskStatus::Cancelled));
}
