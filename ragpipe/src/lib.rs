//! # Ragpipe
//!
//! A pipeline execution engine for retrieval-augmented generation
//! workloads. Ragpipe resolves a declared sequence of processing modules
//! (loader → embedder → retriever → generator → evaluator) into a
//! validated task graph and runs it with:
//!
//! - **Bounded concurrency**: a fixed-size worker pool over a ready queue,
//!   with the graph's dependency structure as the only ordering constraint
//! - **Failure isolation**: per-task retry with exponential backoff and a
//!   per-stage circuit breaker that sheds load from degraded dependencies
//! - **Structured tracing**: one immutable event per task attempt, served
//!   live to subscribers and flattened into a persisted run record
//! - **Swappable modules**: every unit of work sits behind one uniform
//!   adapter contract resolved through a registry at graph-build time
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ragpipe::prelude::*;
//!
//! let engine = RunEngine::builder()
//!     .config(EngineConfig::default().with_workers(4))
//!     .build()?;
//!
//! engine.ingest(vec![Document::from_text("...")]).await?;
//! let result = engine.run("what does the corpus say?").await?;
//! println!("{}", result.answer.unwrap_or_default());
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]

pub mod adapter;
pub mod cancellation;
pub mod config;
pub mod engine;
pub mod errors;
pub mod graph;
pub mod resilience;
pub mod scheduler;
pub mod stores;
pub mod testing;
pub mod trace;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::adapter::{
        AdapterDescriptor, AdapterRegistry, Capability, ContractVersion, InvokeContext,
        ModuleAdapter, StageSettings, ValueShape,
    };
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::EngineConfig;
    pub use crate::engine::{
        EngineBuilder, IngestResult, RunEngine, RunResult, ScoreResult,
    };
    pub use crate::errors::{
        AdapterFailure, EngineError, FailureKind, GraphValidationError, StageFailure,
    };
    pub use crate::graph::{
        GraphBuilder, ModuleBinding, PipelineGraph, PipelineSpec, StageOptions, StageSpec,
    };
    pub use crate::resilience::{BreakerConfig, BreakerRegistry, RetryPolicy};
    pub use crate::scheduler::{ExecutionReport, Scheduler};
    pub use crate::stores::{
        Document, DocumentSource, InMemoryRunHistory, InMemoryVectorStore, JsonDirRunHistory,
        RunHistoryStore, ScoredDocument, VectorRecord, VectorStore,
    };
    pub use crate::trace::{
        InstanceStatus, RunRecord, StageOutcome, TaskStatus, TraceEvent, TraceRecorder,
        TraceSubscription, init_tracing,
    };
}
