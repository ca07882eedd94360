//! Validated, immutable pipeline graphs.
//!
//! A graph is built once from a description (or assembled programmatically)
//! and never mutated; execution instances share it read-only behind an
//! `Arc`. All structural validation happens here, at build time: cycles,
//! unreachable stages, duplicate names, payload shape mismatches, and
//! adapter contract versions. A failed build constructs nothing.

mod builder;
mod spec;

pub use builder::{GraphBuilder, StageOptions};
pub use spec::{ModuleBinding, PipelineSpec, StageSpec};

use crate::adapter::{ModuleAdapter, StageSettings};
use crate::resilience::{BreakerConfig, RetryPolicy};
use std::sync::Arc;
use std::time::Duration;

/// One stage of a validated graph, bound to its adapter and resolved
/// policies.
#[derive(Debug, Clone)]
pub struct StageNode {
    /// Unique stage name.
    pub name: String,
    /// The bound adapter.
    pub adapter: Arc<dyn ModuleAdapter>,
    /// Index of the upstream stage; `None` for the root.
    pub upstream: Option<usize>,
    /// Per-attempt timeout.
    pub timeout: Duration,
    /// Retry policy.
    pub retry: RetryPolicy,
    /// Circuit breaker thresholds.
    pub breaker: BreakerConfig,
    /// Whether failure of this stage fails the instance.
    pub critical: bool,
    /// Read-only adapter settings.
    pub settings: Arc<StageSettings>,
}

/// An immutable, validated DAG of stages.
#[derive(Debug, Clone)]
pub struct PipelineGraph {
    name: String,
    stages: Vec<StageNode>,
    topo_order: Vec<usize>,
    children: Vec<Vec<usize>>,
    root: usize,
    terminal: usize,
}

impl PipelineGraph {
    pub(crate) fn from_parts(
        name: String,
        stages: Vec<StageNode>,
        topo_order: Vec<usize>,
        children: Vec<Vec<usize>>,
        root: usize,
        terminal: usize,
    ) -> Self {
        Self {
            name,
            stages,
            topo_order,
            children,
            root,
            terminal,
        }
    }

    /// The pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// The stage at `index`.
    #[must_use]
    pub fn stage(&self, index: usize) -> &StageNode {
        &self.stages[index]
    }

    /// All stages, in declaration order.
    #[must_use]
    pub fn stages(&self) -> &[StageNode] {
        &self.stages
    }

    /// Stage indices in topological order.
    #[must_use]
    pub fn topo_order(&self) -> &[usize] {
        &self.topo_order
    }

    /// The downstream consumers of the stage at `index`.
    #[must_use]
    pub fn children(&self, index: usize) -> &[usize] {
        &self.children[index]
    }

    /// Index of the root stage.
    #[must_use]
    pub fn root(&self) -> usize {
        self.root
    }

    /// Index of the terminal stage whose output is the instance's result.
    #[must_use]
    pub fn terminal(&self) -> usize {
        self.terminal
    }

    /// Looks up a stage index by name.
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|stage| stage.name == name)
    }

    /// All transitive descendants of the stage at `index`.
    #[must_use]
    pub fn descendants(&self, index: usize) -> Vec<usize> {
        let mut seen = vec![false; self.stages.len()];
        let mut queue = vec![index];
        let mut result = Vec::new();

        while let Some(current) = queue.pop() {
            for &child in &self.children[current] {
                if !seen[child] {
                    seen[child] = true;
                    result.push(child);
                    queue.push(child);
                }
            }
        }

        result.sort_unstable();
        result
    }
}
