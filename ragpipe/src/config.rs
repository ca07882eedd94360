//! Layered engine configuration.
//!
//! Resolution happens once, before graph build, with documented precedence:
//! explicit builder override > environment variable > config file > built-in
//! default. The resolved [`EngineConfig`] is never mutated during execution.

use crate::errors::EngineError;
use crate::resilience::{BreakerConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Prefix for environment variable overrides (e.g. `RAGPIPE_WORKERS`).
const ENV_PREFIX: &str = "RAGPIPE_";

/// Resolved configuration for one engine instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Size of the scheduler's worker pool.
    pub workers: usize,
    /// Default per-stage timeout, in milliseconds.
    pub default_timeout_ms: u64,
    /// Default retry policy; stages may override.
    pub retry: RetryPolicy,
    /// Default circuit breaker thresholds; stages may override.
    pub breaker: BreakerConfig,
    /// Character length of ingest chunks.
    pub chunk_size: usize,
    /// Character overlap between consecutive chunks.
    pub chunk_overlap: usize,
    /// Number of contexts retrieved per query.
    pub top_k: usize,
    /// Dimensionality of the built-in hashing embedder.
    pub embedding_dim: usize,
    /// Pass threshold for the built-in evaluator's overall score.
    pub eval_threshold: f64,
    /// Directory where run records are persisted.
    pub run_dir: PathBuf,
    /// Whether completed runs are handed to the run-history store.
    pub save_runs: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            default_timeout_ms: 30_000,
            retry: RetryPolicy::default(),
            breaker: BreakerConfig::default(),
            chunk_size: 400,
            chunk_overlap: 50,
            top_k: 5,
            embedding_dim: 64,
            eval_threshold: 0.7,
            run_dir: PathBuf::from(".ragpipe/runs"),
            save_runs: true,
        }
    }
}

impl EngineConfig {
    /// Creates the built-in default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a YAML file layered over the defaults,
    /// then applies environment overrides.
    ///
    /// A missing file is not an error; the defaults simply remain.
    pub fn resolve(path: Option<&Path>) -> Result<Self, EngineError> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path)?;
                let config: Self = serde_yaml::from_str(&raw)
                    .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
                debug!(path = %path.display(), "loaded engine config");
                config
            }
            _ => Self::default(),
        };

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Applies `RAGPIPE_*` environment variable overrides.
    fn apply_env(&mut self) {
        if let Some(workers) = env_parse::<usize>("WORKERS") {
            self.workers = workers;
        }
        if let Some(timeout) = env_parse::<u64>("TIMEOUT_MS") {
            self.default_timeout_ms = timeout;
        }
        if let Some(retries) = env_parse::<u32>("MAX_RETRIES") {
            self.retry.max_retries = retries;
        }
        if let Some(top_k) = env_parse::<usize>("TOP_K") {
            self.top_k = top_k;
        }
        if let Some(dir) = std::env::var(format!("{ENV_PREFIX}RUN_DIR")).ok().filter(|v| !v.is_empty()) {
            self.run_dir = PathBuf::from(dir);
        }
        if let Some(save) = env_parse::<bool>("SAVE_RUNS") {
            self.save_runs = save;
        }
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.workers == 0 {
            return Err(EngineError::Config("workers must be at least 1".into()));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(EngineError::Config(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        Ok(())
    }

    /// Explicit override: worker pool size.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Explicit override: default stage timeout.
    #[must_use]
    pub fn with_default_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.default_timeout_ms = timeout_ms;
        self
    }

    /// Explicit override: default retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Explicit override: default breaker thresholds.
    #[must_use]
    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    /// Explicit override: retrieval depth.
    #[must_use]
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    /// Explicit override: run record directory.
    #[must_use]
    pub fn with_run_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.run_dir = dir.into();
        self
    }

    /// Explicit override: disable run persistence.
    #[must_use]
    pub fn without_saving_runs(mut self) -> Self {
        self.save_runs = false;
        self
    }

    /// The default stage timeout as a [`Duration`].
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(format!("{ENV_PREFIX}{key}"))
        .ok()
        .and_then(|raw| raw.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_spec() {
        let config = EngineConfig::default();
        assert_eq!(config.workers, 8);
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker.cooldown_ms, 60_000);
        assert_eq!(config.chunk_size, 400);
        assert_eq!(config.chunk_overlap, 50);
        assert_eq!(config.top_k, 5);
        assert!(config.save_runs);
    }

    #[test]
    fn resolve_without_file_uses_defaults() {
        let config = EngineConfig::resolve(None).unwrap();
        assert_eq!(config.workers, EngineConfig::default().workers);
    }

    #[test]
    fn resolve_layers_file_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        std::fs::write(&path, "workers: 2\ntop_k: 3\n").unwrap();

        let config = EngineConfig::resolve(Some(&path)).unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.top_k, 3);
        // Untouched fields keep their defaults.
        assert_eq!(config.chunk_size, 400);
    }

    #[test]
    fn builder_overrides_win() {
        let config = EngineConfig::resolve(None)
            .unwrap()
            .with_workers(1)
            .with_top_k(2)
            .without_saving_runs();

        assert_eq!(config.workers, 1);
        assert_eq!(config.top_k, 2);
        assert!(!config.save_runs);
    }

    #[test]
    fn zero_workers_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        std::fs::write(&path, "workers: 0\n").unwrap();

        assert!(EngineConfig::resolve(Some(&path)).is_err());
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        std::fs::write(&path, "chunk_size: 100\nchunk_overlap: 100\n").unwrap();

        assert!(EngineConfig::resolve(Some(&path)).is_err());
    }

    #[test]
    fn config_round_trips_through_yaml() {
        let config = EngineConfig::default().with_workers(4);
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: EngineConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config, parsed);
    }
}
