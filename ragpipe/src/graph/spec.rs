//! Pipeline description documents.
//!
//! A [`PipelineSpec`] is the serializable configuration a graph is built
//! from: the stage list, module bindings, data-flow edges, and per-stage
//! overrides. Specs load from YAML and hash into the run record's config
//! digest.

use crate::adapter::{Capability, StageSettings};
use crate::errors::EngineError;
use crate::resilience::{BreakerConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_true() -> bool {
    true
}

fn default_contract_major() -> u64 {
    1
}

/// Which registered adapter a stage binds to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleBinding {
    /// The adapter's capability tag.
    pub capability: Capability,
    /// The adapter's registered name.
    pub name: String,
}

impl ModuleBinding {
    /// Creates a binding.
    #[must_use]
    pub fn new(capability: Capability, name: impl Into<String>) -> Self {
        Self {
            capability,
            name: name.into(),
        }
    }
}

/// Declaration of one stage in a pipeline description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    /// Unique stage name.
    pub name: String,
    /// The module binding resolved through the adapter registry.
    pub module: ModuleBinding,
    /// The upstream stage whose output feeds this stage. `None` marks the
    /// root stage fed by the instance's initial payload.
    #[serde(default)]
    pub input: Option<String>,
    /// Per-stage timeout override, in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Per-stage retry override.
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Per-stage breaker override.
    #[serde(default)]
    pub breaker: Option<BreakerConfig>,
    /// Whether a failure of this stage fails the whole instance. Optional
    /// stages (e.g. an evaluator) set this to false and only degrade it.
    #[serde(default = "default_true")]
    pub critical: bool,
    /// Read-only settings handed to the adapter.
    #[serde(default)]
    pub settings: StageSettings,
}

impl StageSpec {
    /// Creates a stage bound to `(capability, module)`, with defaults for
    /// everything else.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        capability: Capability,
        module: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            module: ModuleBinding::new(capability, module),
            input: None,
            timeout_ms: None,
            retry: None,
            breaker: None,
            critical: true,
            settings: StageSettings::new(),
        }
    }

    /// Sets the upstream stage.
    #[must_use]
    pub fn with_input(mut self, upstream: impl Into<String>) -> Self {
        self.input = Some(upstream.into());
        self
    }

    /// Sets the timeout override.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Sets the retry override.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Sets the breaker override.
    #[must_use]
    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Marks the stage as non-critical.
    #[must_use]
    pub fn non_critical(mut self) -> Self {
        self.critical = false;
        self
    }

    /// Adds one adapter setting.
    #[must_use]
    pub fn with_setting(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.settings.insert(key.into(), value);
        self
    }
}

/// A complete pipeline description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSpec {
    /// The pipeline name.
    pub name: String,
    /// Required adapter contract major version; binding an adapter with a
    /// different major fails at graph build.
    #[serde(default = "default_contract_major")]
    pub required_contract_major: u64,
    /// The stage declarations.
    pub stages: Vec<StageSpec>,
}

impl PipelineSpec {
    /// Creates an empty description.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required_contract_major: default_contract_major(),
            stages: Vec::new(),
        }
    }

    /// Appends a stage declaration.
    #[must_use]
    pub fn with_stage(mut self, stage: StageSpec) -> Self {
        self.stages.push(stage);
        self
    }

    /// Parses a description from YAML.
    pub fn from_yaml(raw: &str) -> Result<Self, EngineError> {
        serde_yaml::from_str(raw)
            .map_err(|e| EngineError::Config(format!("invalid pipeline spec: {e}")))
    }

    /// Loads a description from a YAML file.
    pub fn from_yaml_file(path: &Path) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml(&raw)
    }

    /// The description as a JSON value, for config hashing.
    pub fn to_value(&self) -> Result<serde_json::Value, EngineError> {
        Ok(serde_json::to_value(self)?)
    }
}
