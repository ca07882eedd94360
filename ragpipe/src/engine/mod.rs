//! The run engine facade.
//!
//! [`RunEngine`] composes the graph, scheduler, resilience and trace layers
//! into three operations: `ingest` (chunk and index documents), `run`
//! (answer one query), and `score` (run, then evaluate the answer). The
//! engine owns the process-wide breaker registry, the adapter lifecycles,
//! and run-record persistence; pipeline graphs are built once at
//! construction and shared read-only by every execution instance.

use crate::adapter::{AdapterRegistry, Capability, ModuleAdapter};
use crate::cancellation::CancellationToken;
use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::graph::{GraphBuilder, PipelineGraph, PipelineSpec, StageSpec};
use crate::resilience::BreakerRegistry;
use crate::scheduler::{ExecutionReport, Scheduler};
use crate::stores::{
    Document, DocumentSource, InMemoryVectorStore, JsonDirRunHistory, RunHistoryStore,
    ScoredDocument, VectorStore,
};
use crate::trace::{
    InstanceStatus, RunRecord, TraceEvent, TraceRecorder, config_digest, generate_run_id,
};
use chrono::Utc;
use futures::future;
use parking_lot::RwLock;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};

/// Result of one `run` operation.
#[derive(Debug, Clone)]
pub struct RunResult {
    /// The generated run id.
    pub run_id: String,
    /// Overall instance outcome.
    pub status: InstanceStatus,
    /// The terminal stage's answer, when produced.
    pub answer: Option<String>,
    /// The contexts the answer was generated from.
    pub contexts: Vec<ScoredDocument>,
    /// The persisted run record.
    pub record: RunRecord,
    /// The full trace, in completion order.
    pub trace: Vec<TraceEvent>,
}

/// Outcome of one document within an `ingest` batch.
#[derive(Debug, Clone)]
pub struct DocumentFailure {
    /// Index of the document in the submitted batch.
    pub index: usize,
    /// Why it failed.
    pub error: String,
}

/// Result of one `ingest` operation.
#[derive(Debug, Clone)]
pub struct IngestResult {
    /// Documents submitted.
    pub documents_processed: usize,
    /// Chunks successfully indexed across the batch.
    pub chunks_indexed: usize,
    /// Per-document failures; an empty list means a clean batch.
    pub failures: Vec<DocumentFailure>,
    /// Batch wall-clock duration in seconds.
    pub duration_seconds: f64,
    /// Indexing throughput.
    pub chunks_per_second: f64,
    /// The batch trace, in completion order.
    pub trace: Vec<TraceEvent>,
}

/// Result of one `score` operation.
#[derive(Debug, Clone)]
pub struct ScoreResult {
    /// The generated run id.
    pub run_id: String,
    /// Overall outcome including the evaluation stage.
    pub status: InstanceStatus,
    /// The answer under evaluation.
    pub answer: Option<String>,
    /// Evaluator metric scores, when the evaluator ran.
    pub evaluation: Option<serde_json::Map<String, Value>>,
    /// The persisted run record with evaluation merged in.
    pub record: RunRecord,
    /// The full trace, including evaluator attempts.
    pub trace: Vec<TraceEvent>,
}

/// Builder for [`RunEngine`].
pub struct EngineBuilder {
    config: EngineConfig,
    registry: Option<AdapterRegistry>,
    vector_store: Option<Arc<dyn VectorStore>>,
    history: Option<Arc<dyn RunHistoryStore>>,
    query_spec: Option<PipelineSpec>,
    ingest_spec: Option<PipelineSpec>,
    eval_spec: Option<PipelineSpec>,
}

impl EngineBuilder {
    /// Creates a builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            registry: None,
            vector_store: None,
            history: None,
            query_spec: None,
            ingest_spec: None,
            eval_spec: None,
        }
    }

    /// Sets the engine configuration.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the adapter registry. Defaults to the built-ins.
    #[must_use]
    pub fn registry(mut self, registry: AdapterRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Sets the vector store collaborator. Defaults to in-memory.
    #[must_use]
    pub fn vector_store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.vector_store = Some(store);
        self
    }

    /// Sets the run-history collaborator. Defaults to a JSON directory
    /// under the configured run directory.
    #[must_use]
    pub fn history(mut self, history: Arc<dyn RunHistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    /// Replaces the default query pipeline description.
    #[must_use]
    pub fn query_pipeline(mut self, spec: PipelineSpec) -> Self {
        self.query_spec = Some(spec);
        self
    }

    /// Replaces the default ingest pipeline description.
    #[must_use]
    pub fn ingest_pipeline(mut self, spec: PipelineSpec) -> Self {
        self.ingest_spec = Some(spec);
        self
    }

    /// Replaces the default evaluation pipeline description.
    #[must_use]
    pub fn eval_pipeline(mut self, spec: PipelineSpec) -> Self {
        self.eval_spec = Some(spec);
        self
    }

    /// Validates the pipeline descriptions and constructs the engine.
    ///
    /// All three graphs are built here, so configuration mistakes fail
    /// fast instead of at invocation time.
    pub fn build(self) -> Result<RunEngine, EngineError> {
        let config = self.config;
        let vector_store = self
            .vector_store
            .unwrap_or_else(|| Arc::new(InMemoryVectorStore::new()));
        let registry = self
            .registry
            .unwrap_or_else(|| AdapterRegistry::with_builtins(vector_store.clone()));
        let history: Arc<dyn RunHistoryStore> = match self.history {
            Some(history) => history,
            None => Arc::new(JsonDirRunHistory::new(&config.run_dir)?),
        };

        let query_spec = self.query_spec.unwrap_or_else(|| default_query_spec(&config));
        let ingest_spec = self
            .ingest_spec
            .unwrap_or_else(|| default_ingest_spec(&config));
        let eval_spec = self.eval_spec.unwrap_or_else(|| default_eval_spec(&config));

        let query_graph = Arc::new(GraphBuilder::from_spec(&query_spec, &registry, &config)?);
        let ingest_graph = Arc::new(GraphBuilder::from_spec(&ingest_spec, &registry, &config)?);
        let eval_graph = Arc::new(GraphBuilder::from_spec(&eval_spec, &registry, &config)?);

        let config_hash = config_digest(&json!({
            "config": serde_json::to_value(&config)?,
            "query": query_spec.to_value()?,
            "ingest": ingest_spec.to_value()?,
            "eval": eval_spec.to_value()?,
        }));

        let mut adapters: Vec<Arc<dyn ModuleAdapter>> = Vec::new();
        for graph in [&query_graph, &ingest_graph, &eval_graph] {
            for stage in graph.stages() {
                if !adapters
                    .iter()
                    .any(|known| Arc::ptr_eq(known, &stage.adapter))
                {
                    adapters.push(stage.adapter.clone());
                }
            }
        }

        info!(
            config_hash = %config_hash,
            workers = config.workers,
            "engine constructed"
        );

        Ok(RunEngine {
            scheduler: Scheduler::new(config.workers),
            breakers: Arc::new(BreakerRegistry::new()),
            history,
            query_graph,
            ingest_graph,
            eval_graph,
            adapters,
            config_hash,
            setup: OnceCell::new(),
            session_history: RwLock::new(Vec::new()),
            config,
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The default query pipeline: load → embed → retrieve → generate.
fn default_query_spec(config: &EngineConfig) -> PipelineSpec {
    PipelineSpec::new("query")
        .with_stage(StageSpec::new("load", Capability::Loader, "passthrough"))
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
        )
}

/// The default ingest pipeline: chunk → embed-and-store.
fn default_ingest_spec(config: &EngineConfig) -> PipelineSpec {
    PipelineSpec::new("ingest")
        .with_stage(
            StageSpec::new("chunk", Capability::Custom, "chunk")
                .with_setting("chunk_size", json!(config.chunk_size))
                .with_setting("chunk_overlap", json!(config.chunk_overlap)),
        )
        .with_stage(
            StageSpec::new("index", Capability::Custom, "index")
                .with_input("chunk")
                .with_setting("embedding_dim", json!(config.embedding_dim)),
        )
}

/// The default evaluation pipeline: a single non-critical evaluator stage.
fn default_eval_spec(config: &EngineConfig) -> PipelineSpec {
    PipelineSpec::new("evaluate").with_stage(
        StageSpec::new("evaluate", Capability::Evaluator, "lexical")
            .with_setting("threshold", json!(config.eval_threshold))
            .non_critical(),
    )
}

/// The pipeline execution engine.
pub struct RunEngine {
    config: EngineConfig,
    scheduler: Scheduler,
    breakers: Arc<BreakerRegistry>,
    history: Arc<dyn RunHistoryStore>,
    query_graph: Arc<PipelineGraph>,
    ingest_graph: Arc<PipelineGraph>,
    eval_graph: Arc<PipelineGraph>,
    adapters: Vec<Arc<dyn ModuleAdapter>>,
    config_hash: String,
    setup: OnceCell<()>,
    session_history: RwLock<Vec<RunRecord>>,
}

impl RunEngine {
    /// Starts building an engine.
    #[must_use]
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// The resolved configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The digest of the configuration and pipeline descriptions.
    #[must_use]
    pub fn config_hash(&self) -> &str {
        &self.config_hash
    }

    /// Run records produced by this engine instance, oldest first.
    #[must_use]
    pub fn run_history(&self) -> Vec<RunRecord> {
        self.session_history.read().clone()
    }

    /// Administrative reset of every stage's circuit breaker.
    pub fn reset_breakers(&self) {
        self.breakers.reset_all();
        info!("circuit breakers reset");
    }

    /// Sets up every adapter exactly once, before the first operation.
    async fn ensure_setup(&self) -> Result<(), EngineError> {
        self.setup
            .get_or_try_init(|| async {
                for adapter in &self.adapters {
                    adapter.setup().await?;
                }
                Ok(())
            })
            .await
            .map(|_| ())
    }

    /// Releases every adapter's scoped resources.
    ///
    /// Teardown runs on all adapters even if some fail; the first error is
    /// returned.
    pub async fn teardown(&self) -> Result<(), EngineError> {
        let results =
            future::join_all(self.adapters.iter().map(|adapter| adapter.teardown())).await;

        let mut first_error = None;
        for (adapter, result) in self.adapters.iter().zip(results) {
            if let Err(error) = result {
                warn!(adapter = %adapter.descriptor().name, %error, "adapter teardown failed");
                first_error.get_or_insert(error);
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Chunks, embeds and indexes a batch of documents.
    ///
    /// One document's failure does not abort the batch; each document's
    /// outcome is reported individually.
    pub async fn ingest(&self, documents: Vec<Document>) -> Result<IngestResult, EngineError> {
        self.ingest_with(documents, Arc::new(CancellationToken::new()))
            .await
    }

    /// Fetches every document from a source and ingests them as one batch.
    pub async fn ingest_from(
        &self,
        source: &dyn DocumentSource,
    ) -> Result<IngestResult, EngineError> {
        let documents = source.fetch().await?;
        self.ingest(documents).await
    }

    /// [`RunEngine::ingest`] with an externally owned cancellation token.
    pub async fn ingest_with(
        &self,
        documents: Vec<Document>,
        cancel: Arc<CancellationToken>,
    ) -> Result<IngestResult, EngineError> {
        self.ensure_setup().await?;

        let started = std::time::Instant::now();
        let created_at = Utc::now();
        let run_id = generate_run_id("ingest");
        let recorder = TraceRecorder::new();
        let total = documents.len();
        let mut chunks_indexed = 0usize;
        let mut failures = Vec::new();
        let mut outcomes = Vec::new();

        info!(run_id = %run_id, documents = total, "ingest started");

        for (index, document) in documents.into_iter().enumerate() {
            if cancel.is_cancelled() {
                failures.push(DocumentFailure {
                    index,
                    error: "ingest cancelled".to_string(),
                });
                continue;
            }

            let payload = json!({
                "text": document.text,
                "metadata": document.metadata,
            });
            let report = self
                .scheduler
                .execute(
                    self.ingest_graph.clone(),
                    payload,
                    &run_id,
                    self.breakers.clone(),
                    &recorder,
                    cancel.clone(),
                )
                .await;

            match report.status {
                InstanceStatus::Succeeded | InstanceStatus::Degraded => {
                    let indexed = report
                        .final_output
                        .as_ref()
                        .and_then(|output| output.get("indexed"))
                        .and_then(Value::as_u64)
                        .unwrap_or(0) as usize;
                    chunks_indexed += indexed;
                }
                InstanceStatus::Failed | InstanceStatus::Cancelled => {
                    let error = report
                        .outcomes
                        .iter()
                        .find_map(|outcome| outcome.error.as_ref())
                        .map_or_else(
                            || "ingest failed".to_string(),
                            |error| error.message.clone(),
                        );
                    failures.push(DocumentFailure { index, error });
                }
            }
            outcomes.push(report);
        }

        recorder.close();
        let duration_seconds = started.elapsed().as_secs_f64();
        let chunks_per_second = if duration_seconds > 0.0 {
            chunks_indexed as f64 / duration_seconds
        } else {
            0.0
        };

        let status = if cancel.is_cancelled() {
            InstanceStatus::Cancelled
        } else if failures.len() == total && total > 0 {
            InstanceStatus::Failed
        } else if failures.is_empty() {
            InstanceStatus::Succeeded
        } else {
            InstanceStatus::Degraded
        };

        let record = RunRecord {
            run_id: run_id.clone(),
            created_at,
            config_hash: self.config_hash.clone(),
            pipeline: self.ingest_graph.name().to_string(),
            query: None,
            answer: None,
            status,
            stage_outcomes: outcomes
                .last()
                .map(|report| report.outcomes.clone())
                .unwrap_or_default(),
            metrics: json!({
                "documents_processed": total,
                "documents_failed": failures.len(),
                "chunks_indexed": chunks_indexed,
                "duration_seconds": duration_seconds,
                "chunks_per_second": chunks_per_second,
                "trace_events": recorder.len(),
            }),
            evaluation: None,
        };
        self.persist(record).await?;

        info!(
            run_id = %run_id,
            chunks_indexed,
            failed = failures.len(),
            "ingest complete"
        );

        Ok(IngestResult {
            documents_processed: total,
            chunks_indexed,
            failures,
            duration_seconds,
            chunks_per_second,
            trace: recorder.snapshot(),
        })
    }

    /// Executes the query pipeline for one query.
    pub async fn run(&self, query: &str) -> Result<RunResult, EngineError> {
        self.run_with(query, Arc::new(CancellationToken::new()))
            .await
    }

    /// [`RunEngine::run`] with an externally owned cancellation token.
    pub async fn run_with(
        &self,
        query: &str,
        cancel: Arc<CancellationToken>,
    ) -> Result<RunResult, EngineError> {
        self.ensure_setup().await?;

        let run_id = generate_run_id(query);
        let created_at = Utc::now();
        let recorder = TraceRecorder::new();

        info!(run_id = %run_id, query, "run started");
        let report = self
            .scheduler
            .execute(
                self.query_graph.clone(),
                json!(query),
                &run_id,
                self.breakers.clone(),
                &recorder,
                cancel,
            )
            .await;
        recorder.close();

        let (answer, contexts) = extract_answer(report.final_output.as_ref());
        let record = self.query_record(&run_id, created_at, query, &report, &answer, &recorder);
        self.persist(record.clone()).await?;

        info!(
            run_id = %run_id,
            status = %report.status,
            duration_ms = report.duration.as_millis() as u64,
            "run complete"
        );

        Ok(RunResult {
            run_id,
            status: report.status,
            answer,
            contexts,
            record,
            trace: recorder.snapshot(),
        })
    }

    /// Runs the query pipeline, then evaluates the answer against the
    /// ground truth, merging evaluator metrics into the run record.
    pub async fn score(
        &self,
        query: &str,
        ground_truth: &str,
    ) -> Result<ScoreResult, EngineError> {
        self.ensure_setup().await?;

        let run_id = generate_run_id(query);
        let created_at = Utc::now();
        let recorder = TraceRecorder::new();
        let cancel = Arc::new(CancellationToken::new());

        info!(run_id = %run_id, query, "score started");
        let report = self
            .scheduler
            .execute(
                self.query_graph.clone(),
                json!(query),
                &run_id,
                self.breakers.clone(),
                &recorder,
                cancel.clone(),
            )
            .await;

        let (answer, _contexts) = extract_answer(report.final_output.as_ref());

        let mut evaluation = None;
        let mut status = report.status;
        if let Some(answer_text) = &answer {
            let contexts = report
                .final_output
                .as_ref()
                .and_then(|output| output.get("contexts"))
                .cloned()
                .unwrap_or(Value::Array(Vec::new()));
            let eval_payload = json!({
                "query": query,
                "answer": answer_text,
                "contexts": contexts,
                "ground_truth": ground_truth,
            });

            let eval_report = self
                .scheduler
                .execute(
                    self.eval_graph.clone(),
                    eval_payload,
                    &run_id,
                    self.breakers.clone(),
                    &recorder,
                    cancel,
                )
                .await;

            match eval_report.status {
                InstanceStatus::Succeeded => {
                    evaluation = eval_report
                        .final_output
                        .as_ref()
                        .and_then(|output| output.get("evaluation"))
                        .and_then(Value::as_object)
                        .cloned();
                }
                _ => {
                    // The evaluator is optional: its failure degrades the
                    // instance but the answer stands.
                    warn!(run_id = %run_id, "evaluator failed; scoring degraded");
                    if status == InstanceStatus::Succeeded {
                        status = InstanceStatus::Degraded;
                    }
                }
            }
        }
        recorder.close();

        let mut record =
            self.query_record(&run_id, created_at, query, &report, &answer, &recorder);
        record.status = status;
        record.evaluation = evaluation.clone();
        self.persist(record.clone()).await?;

        info!(run_id = %run_id, status = %status, "score complete");

        Ok(ScoreResult {
            run_id,
            status,
            answer,
            evaluation,
            record,
            trace: recorder.snapshot(),
        })
    }

    fn query_record(
        &self,
        run_id: &str,
        created_at: chrono::DateTime<Utc>,
        query: &str,
        report: &ExecutionReport,
        answer: &Option<String>,
        recorder: &TraceRecorder,
    ) -> RunRecord {
        let stage_latency: serde_json::Map<String, Value> = report
            .outcomes
            .iter()
            .map(|outcome| (outcome.stage.clone(), json!(outcome.duration_ms)))
            .collect();
        let estimated_cost: f64 = self
            .query_graph
            .stages()
            .iter()
            .map(|stage| stage.adapter.cost_estimate())
            .sum();

        RunRecord {
            run_id: run_id.to_string(),
            created_at,
            config_hash: self.config_hash.clone(),
            pipeline: self.query_graph.name().to_string(),
            query: Some(query.to_string()),
            answer: answer.clone(),
            status: report.status,
            stage_outcomes: report.outcomes.clone(),
            metrics: json!({
                "latency": {
                    "total_ms": report.duration.as_secs_f64() * 1000.0,
                    "stages": stage_latency,
                },
                "trace_events": recorder.len(),
                "estimated_cost": estimated_cost,
            }),
            evaluation: None,
        }
    }

    async fn persist(&self, record: RunRecord) -> Result<(), EngineError> {
        if self.config.save_runs {
            self.history.append(&record).await?;
        }
        self.session_history.write().push(record);
        Ok(())
    }
}

impl std::fmt::Debug for RunEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunEngine")
            .field("config_hash", &self.config_hash)
            .field("workers", &self.config.workers)
            .field("pipelines", &[
                self.query_graph.name(),
                self.ingest_graph.name(),
                self.eval_graph.name(),
            ])
            .finish()
    }
}

fn extract_answer(output: Option<&Value>) -> (Option<String>, Vec<ScoredDocument>) {
    let answer = output
        .and_then(|value| value.get("answer"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let contexts = output
        .and_then(|value| value.get("contexts"))
        .cloned()
        .and_then(|value| serde_json::from_value(value).ok())
        .unwrap_or_default();
    (answer, contexts)
}

#[cfg(test)]
mod integration_tests;
