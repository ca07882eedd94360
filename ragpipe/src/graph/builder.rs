//! Graph construction and validation.
//!
//! Two entry points produce the same validated [`PipelineGraph`]: building
//! from a [`PipelineSpec`] resolved through the adapter registry, or
//! assembling stages programmatically with [`GraphBuilder`].

use super::spec::PipelineSpec;
use super::{PipelineGraph, StageNode};
use crate::adapter::{AdapterRegistry, ModuleAdapter, StageSettings};
use crate::config::EngineConfig;
use crate::errors::{CycleDetectedError, EngineError, GraphValidationError};
use crate::resilience::{BreakerConfig, RetryPolicy};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Optional per-stage overrides for programmatic graph assembly.
#[derive(Debug, Clone, Default)]
pub struct StageOptions {
    /// Timeout override, in milliseconds.
    pub timeout_ms: Option<u64>,
    /// Retry override.
    pub retry: Option<RetryPolicy>,
    /// Breaker override.
    pub breaker: Option<BreakerConfig>,
    /// Whether the stage is critical. Defaults to true.
    pub critical: Option<bool>,
    /// Adapter settings.
    pub settings: StageSettings,
}

impl StageOptions {
    /// Creates empty options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the timeout override.
    #[must_use]
    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Sets the retry override.
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Sets the breaker override.
    #[must_use]
    pub fn breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Marks the stage non-critical.
    #[must_use]
    pub fn non_critical(mut self) -> Self {
        self.critical = Some(false);
        self
    }

    /// Adds one adapter setting.
    #[must_use]
    pub fn setting(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.settings.insert(key.into(), value);
        self
    }
}

struct PendingStage {
    name: String,
    adapter: Arc<dyn ModuleAdapter>,
    upstream: Option<String>,
    options: StageOptions,
}

/// Assembles and validates a [`PipelineGraph`].
pub struct GraphBuilder {
    name: String,
    required_contract_major: u64,
    pending: Vec<PendingStage>,
}

impl GraphBuilder {
    /// Creates a builder for a pipeline with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required_contract_major: 1,
            pending: Vec::new(),
        }
    }

    /// Sets the required adapter contract major version.
    #[must_use]
    pub fn require_contract_major(mut self, major: u64) -> Self {
        self.required_contract_major = major;
        self
    }

    /// Adds a stage. `upstream` is `None` for the root stage.
    #[must_use]
    pub fn stage(
        self,
        name: impl Into<String>,
        adapter: Arc<dyn ModuleAdapter>,
        upstream: Option<&str>,
    ) -> Self {
        self.stage_with(name, adapter, upstream, StageOptions::new())
    }

    /// Adds a stage with overrides.
    #[must_use]
    pub fn stage_with(
        mut self,
        name: impl Into<String>,
        adapter: Arc<dyn ModuleAdapter>,
        upstream: Option<&str>,
        options: StageOptions,
    ) -> Self {
        self.pending.push(PendingStage {
            name: name.into(),
            adapter,
            upstream: upstream.map(str::to_string),
            options,
        });
        self
    }

    /// Builds a graph from a pipeline description, resolving module
    /// bindings through the registry.
    pub fn from_spec(
        spec: &PipelineSpec,
        registry: &AdapterRegistry,
        config: &EngineConfig,
    ) -> Result<PipelineGraph, EngineError> {
        let mut builder =
            Self::new(spec.name.clone()).require_contract_major(spec.required_contract_major);

        for stage in &spec.stages {
            let adapter =
                registry.construct(stage.module.capability, &stage.module.name, &stage.settings)?;
            let options = StageOptions {
                timeout_ms: stage.timeout_ms,
                retry: stage.retry,
                breaker: stage.breaker,
                critical: Some(stage.critical),
                settings: stage.settings.clone(),
            };
            builder = builder.stage_with(
                stage.name.clone(),
                adapter,
                stage.input.as_deref(),
                options,
            );
        }

        builder.build(config)
    }

    /// Validates the assembled stages and produces the immutable graph.
    ///
    /// # Errors
    ///
    /// Returns a [`GraphValidationError`] naming the offending stages for
    /// any structural defect; nothing is partially constructed.
    pub fn build(self, config: &EngineConfig) -> Result<PipelineGraph, EngineError> {
        if self.pending.is_empty() {
            return Err(GraphValidationError::new("pipeline has no stages").into());
        }

        // Duplicate names.
        let mut index_by_name: HashMap<String, usize> = HashMap::new();
        for (index, stage) in self.pending.iter().enumerate() {
            if index_by_name.insert(stage.name.clone(), index).is_some() {
                return Err(GraphValidationError::new(format!(
                    "duplicate stage name '{}'",
                    stage.name
                ))
                .with_stages(vec![stage.name.clone()])
                .into());
            }
        }

        // Unknown upstream references.
        for stage in &self.pending {
            if let Some(upstream) = &stage.upstream {
                if !index_by_name.contains_key(upstream.as_str()) {
                    return Err(GraphValidationError::new(format!(
                        "stage '{}' references unknown input stage '{upstream}'",
                        stage.name
                    ))
                    .with_stages(vec![stage.name.clone(), upstream.clone()])
                    .into());
                }
                if upstream == &stage.name {
                    return Err(CycleDetectedError::new(vec![
                        stage.name.clone(),
                        stage.name.clone(),
                    ])
                    .into());
                }
            }
        }

        // Exactly one root.
        let roots: Vec<&PendingStage> = self
            .pending
            .iter()
            .filter(|stage| stage.upstream.is_none())
            .collect();
        if roots.is_empty() {
            // Every stage names an input, so some input chain must loop.
            return Err(self.find_cycle(&index_by_name).into());
        }
        if roots.len() > 1 {
            return Err(GraphValidationError::new(
                "pipeline must have exactly one root stage (stage without an input)",
            )
            .with_stages(roots.iter().map(|stage| stage.name.clone()).collect())
            .into());
        }
        let root = index_by_name[roots[0].name.as_str()];

        // Cycle detection along input chains.
        let mut cleared = vec![false; self.pending.len()];
        for start in 0..self.pending.len() {
            if cleared[start] {
                continue;
            }
            let mut path: Vec<usize> = Vec::new();
            let mut on_path = vec![false; self.pending.len()];
            let mut current = start;
            loop {
                if cleared[current] {
                    break;
                }
                if on_path[current] {
                    let cycle_start = path
                        .iter()
                        .position(|&index| index == current)
                        .unwrap_or(0);
                    let mut cycle: Vec<String> = path[cycle_start..]
                        .iter()
                        .map(|&index| self.pending[index].name.clone())
                        .collect();
                    cycle.push(self.pending[current].name.clone());
                    return Err(CycleDetectedError::new(cycle).into());
                }
                on_path[current] = true;
                path.push(current);
                match &self.pending[current].upstream {
                    Some(upstream) => current = index_by_name[upstream.as_str()],
                    None => break,
                }
            }
            for index in path {
                cleared[index] = true;
            }
        }

        // Children index.
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); self.pending.len()];
        for (index, stage) in self.pending.iter().enumerate() {
            if let Some(upstream) = &stage.upstream {
                children[index_by_name[upstream.as_str()]].push(index);
            }
        }

        // Reachability from the root.
        let mut reachable = vec![false; self.pending.len()];
        let mut queue = VecDeque::from([root]);
        reachable[root] = true;
        let mut topo_order = Vec::with_capacity(self.pending.len());
        while let Some(current) = queue.pop_front() {
            topo_order.push(current);
            for &child in &children[current] {
                if !reachable[child] {
                    reachable[child] = true;
                    queue.push_back(child);
                }
            }
        }
        let unreachable: Vec<String> = self
            .pending
            .iter()
            .enumerate()
            .filter(|(index, _)| !reachable[*index])
            .map(|(_, stage)| stage.name.clone())
            .collect();
        if !unreachable.is_empty() {
            return Err(GraphValidationError::new(format!(
                "stages not reachable from root '{}': {}",
                self.pending[root].name,
                unreachable.join(", ")
            ))
            .with_stages(unreachable)
            .into());
        }

        // Contract version compatibility.
        for stage in &self.pending {
            let contract = stage.adapter.contract_version();
            if contract.major != self.required_contract_major {
                let descriptor = stage.adapter.descriptor();
                return Err(GraphValidationError::new(format!(
                    "stage '{}' binds adapter '{}' with contract {contract}, \
                     but the pipeline requires major version {}",
                    stage.name, descriptor.name, self.required_contract_major
                ))
                .with_stages(vec![stage.name.clone()])
                .into());
            }
        }

        // Structural payload shape compatibility along each edge.
        for stage in &self.pending {
            if let Some(upstream) = &stage.upstream {
                let producer = &self.pending[index_by_name[upstream.as_str()]];
                let produced = producer.adapter.output_shape();
                let required = stage.adapter.input_shape();
                if !required.accepts(&produced) {
                    return Err(GraphValidationError::new(format!(
                        "stage '{}' expects input shape {required} but upstream \
                         stage '{upstream}' produces {produced}",
                        stage.name
                    ))
                    .with_stages(vec![stage.name.clone(), upstream.clone()])
                    .into());
                }
            }
        }

        // The terminal stage: the unique sink, or the last sink in
        // topological order when the graph fans out.
        let terminal = topo_order
            .iter()
            .rev()
            .copied()
            .find(|&index| children[index].is_empty())
            .unwrap_or(root);

        let name = self.name;
        let required_major = self.required_contract_major;
        let stages: Vec<StageNode> = self
            .pending
            .into_iter()
            .map(|stage| {
                let critical = stage.options.critical.unwrap_or(true);
                StageNode {
                    name: stage.name,
                    adapter: stage.adapter,
                    upstream: stage.upstream.map(|u| index_by_name[u.as_str()]),
                    timeout: stage
                        .options
                        .timeout_ms
                        .map_or(config.default_timeout(), Duration::from_millis),
                    retry: stage.options.retry.unwrap_or(config.retry),
                    breaker: stage.options.breaker.unwrap_or(config.breaker),
                    critical,
                    settings: Arc::new(stage.options.settings),
                }
            })
            .collect();

        debug!(
            pipeline = %name,
            stages = stages.len(),
            contract_major = required_major,
            "validated pipeline graph"
        );

        Ok(PipelineGraph::from_parts(
            name, stages, topo_order, children, root, terminal,
        ))
    }

    /// Locates a cycle when no root exists (every stage names an input).
    fn find_cycle(&self, index_by_name: &HashMap<String, usize>) -> CycleDetectedError {
        // Walk any input chain; with no roots it must revisit a stage.
        let mut on_path = vec![false; self.pending.len()];
        let mut path: Vec<usize> = Vec::new();
        let mut current: usize = 0;
        loop {
            if on_path[current] {
                let cycle_start = path
                    .iter()
                    .position(|&index| index == current)
                    .unwrap_or(0);
                let mut cycle: Vec<String> = path[cycle_start..]
                    .iter()
                    .map(|&index| self.pending[index].name.clone())
                    .collect();
                cycle.push(self.pending[current].name.clone());
                return CycleDetectedError::new(cycle);
            }
            on_path[current] = true;
            path.push(current);
            match &self.pending[current].upstream {
                Some(upstream) => current = index_by_name[upstream.as_str()],
                None => {
                    // Unreachable given the no-roots precondition.
                    return CycleDetectedError::new(vec![self.pending[current].name.clone()]);
                }
            }
        }
    }
}
