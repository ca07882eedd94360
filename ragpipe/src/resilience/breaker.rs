//! Per-stage circuit breaker.
//!
//! Each stage has one `CircuitState` shared by every execution instance of
//! the owning engine. All mutation flows through [`BreakerRegistry`] methods;
//! adapters never touch breaker state.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Circuit breaker thresholds for one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Failures within the rolling window that open the circuit.
    pub failure_threshold: u32,
    /// How long an open circuit sheds load before probing, in milliseconds.
    pub cooldown_ms: u64,
    /// Length of the rolling failure window, in milliseconds.
    pub window_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_ms: 60_000,
            window_ms: 60_000,
        }
    }
}

impl BreakerConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the failure threshold.
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Sets the cooldown.
    #[must_use]
    pub fn with_cooldown_ms(mut self, cooldown: u64) -> Self {
        self.cooldown_ms = cooldown;
        self
    }

    /// Sets the rolling window length.
    #[must_use]
    pub fn with_window_ms(mut self, window: u64) -> Self {
        self.window_ms = window;
        self
    }

    fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// The phase of a stage's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitPhase {
    /// Normal operation; failures are counted.
    Closed,
    /// Shedding load; tasks fail immediately without invoking the adapter.
    Open,
    /// Cooldown elapsed; exactly one probe task is admitted.
    HalfOpen,
}

/// Verdict for a task asking to run against a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The circuit is closed; run normally.
    Allow,
    /// The circuit is half-open and this task is the single probe.
    Probe,
    /// The circuit is open; fail the task with `circuit-open`.
    Reject,
}

#[derive(Debug)]
struct CircuitState {
    phase: CircuitPhase,
    failures: u32,
    window_start: Instant,
    open_until: Instant,
    probe_in_flight: bool,
}

impl CircuitState {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            phase: CircuitPhase::Closed,
            failures: 0,
            window_start: now,
            open_until: now,
            probe_in_flight: false,
        }
    }
}

/// Read-only view of one stage's circuit, for introspection and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitSnapshot {
    /// Current phase.
    pub phase: CircuitPhase,
    /// Failures accumulated in the current window.
    pub failures: u32,
}

/// Owns every stage's circuit state for one engine instance.
///
/// This registry is the single update path for breaker state: workers ask
/// for admission before invoking an adapter and report the outcome
/// afterwards. State persists across execution instances until the engine
/// is dropped or [`BreakerRegistry::reset_all`] is called.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    circuits: DashMap<String, CircuitState>,
}

impl BreakerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decides whether a task for `stage` may invoke its adapter.
    pub fn admit(&self, stage: &str) -> Admission {
        let mut entry = self
            .circuits
            .entry(stage.to_string())
            .or_insert_with(CircuitState::new);
        let state = entry.value_mut();
        let now = Instant::now();

        match state.phase {
            CircuitPhase::Closed => Admission::Allow,
            CircuitPhase::Open => {
                if now >= state.open_until {
                    state.phase = CircuitPhase::HalfOpen;
                    state.probe_in_flight = true;
                    debug!(stage, "circuit half-open, admitting probe");
                    Admission::Probe
                } else {
                    Admission::Reject
                }
            }
            CircuitPhase::HalfOpen => {
                if state.probe_in_flight {
                    Admission::Reject
                } else {
                    state.probe_in_flight = true;
                    Admission::Probe
                }
            }
        }
    }

    /// Records a successful invocation for `stage`.
    ///
    /// A probe success closes the circuit; a normal success clears the
    /// rolling failure counter.
    pub fn record_success(&self, stage: &str, probe: bool) {
        let mut entry = self
            .circuits
            .entry(stage.to_string())
            .or_insert_with(CircuitState::new);
        let state = entry.value_mut();

        if probe {
            debug!(stage, "probe succeeded, closing circuit");
        }
        state.phase = CircuitPhase::Closed;
        state.failures = 0;
        state.probe_in_flight = false;
        state.window_start = Instant::now();
    }

    /// Records a failed invocation for `stage`.
    ///
    /// The caller has already filtered out kinds that do not count toward
    /// the breaker. A probe failure reopens the circuit and restarts the
    /// cooldown; in the closed phase the rolling counter is advanced and
    /// the circuit opens once it crosses the threshold.
    pub fn record_failure(&self, stage: &str, config: &BreakerConfig, probe: bool) {
        let mut entry = self
            .circuits
            .entry(stage.to_string())
            .or_insert_with(CircuitState::new);
        let state = entry.value_mut();
        let now = Instant::now();

        if probe {
            state.phase = CircuitPhase::Open;
            state.open_until = now + config.cooldown();
            state.probe_in_flight = false;
            state.failures = 0;
            warn!(stage, "probe failed, reopening circuit");
            return;
        }

        if state.phase != CircuitPhase::Closed {
            return;
        }

        if now.duration_since(state.window_start) > config.window() {
            state.failures = 0;
            state.window_start = now;
        }

        state.failures += 1;
        if state.failures >= config.failure_threshold {
            state.phase = CircuitPhase::Open;
            state.open_until = now + config.cooldown();
            warn!(
                stage,
                failures = state.failures,
                cooldown_ms = config.cooldown_ms,
                "failure threshold crossed, opening circuit"
            );
        }
    }

    /// Frees the half-open probe slot without recording a verdict.
    ///
    /// Used when a probe task is cancelled: cancellation says nothing about
    /// the dependency's health, so the next task is allowed to probe.
    pub fn release_probe(&self, stage: &str) {
        if let Some(mut entry) = self.circuits.get_mut(stage) {
            if entry.phase == CircuitPhase::HalfOpen {
                entry.probe_in_flight = false;
            }
        }
    }

    /// Returns a snapshot of one stage's circuit, if it has been touched.
    #[must_use]
    pub fn snapshot(&self, stage: &str) -> Option<CircuitSnapshot> {
        self.circuits.get(stage).map(|state| CircuitSnapshot {
            phase: state.phase,
            failures: state.failures,
        })
    }

    /// Administrative reset of one stage's circuit.
    pub fn reset(&self, stage: &str) {
        self.circuits.remove(stage);
    }

    /// Administrative reset of every circuit in the engine.
    pub fn reset_all(&self) {
        self.circuits.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> BreakerConfig {
        BreakerConfig::new()
            .with_failure_threshold(3)
            .with_cooldown_ms(50)
            .with_window_ms(10_000)
    }

    #[test]
    fn closed_circuit_allows() {
        let registry = BreakerRegistry::new();
        assert_eq!(registry.admit("s"), Admission::Allow);
    }

    #[test]
    fn opens_after_threshold() {
        let registry = BreakerRegistry::new();
        let config = fast_config();

        for _ in 0..3 {
            assert_eq!(registry.admit("s"), Admission::Allow);
            registry.record_failure("s", &config, false);
        }

        assert_eq!(registry.admit("s"), Admission::Reject);
        let snap = registry.snapshot("s").unwrap();
        assert_eq!(snap.phase, CircuitPhase::Open);
    }

    #[test]
    fn success_resets_counter() {
        let registry = BreakerRegistry::new();
        let config = fast_config();

        registry.record_failure("s", &config, false);
        registry.record_failure("s", &config, false);
        registry.record_success("s", false);
        registry.record_failure("s", &config, false);

        assert_eq!(registry.snapshot("s").unwrap().failures, 1);
        assert_eq!(registry.admit("s"), Admission::Allow);
    }

    #[test]
    fn half_open_admits_single_probe() {
        let registry = BreakerRegistry::new();
        let config = fast_config();

        for _ in 0..3 {
            registry.record_failure("s", &config, false);
        }
        assert_eq!(registry.admit("s"), Admission::Reject);

        std::thread::sleep(Duration::from_millis(60));

        assert_eq!(registry.admit("s"), Admission::Probe);
        // Second arrival while the probe is outstanding is shed.
        assert_eq!(registry.admit("s"), Admission::Reject);
    }

    #[test]
    fn probe_success_closes() {
        let registry = BreakerRegistry::new();
        let config = fast_config();

        for _ in 0..3 {
            registry.record_failure("s", &config, false);
        }
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(registry.admit("s"), Admission::Probe);

        registry.record_success("s", true);
        assert_eq!(registry.snapshot("s").unwrap().phase, CircuitPhase::Closed);
        assert_eq!(registry.admit("s"), Admission::Allow);
    }

    #[test]
    fn probe_failure_reopens() {
        let registry = BreakerRegistry::new();
        let config = fast_config();

        for _ in 0..3 {
            registry.record_failure("s", &config, false);
        }
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(registry.admit("s"), Admission::Probe);

        registry.record_failure("s", &config, true);
        assert_eq!(registry.snapshot("s").unwrap().phase, CircuitPhase::Open);
        assert_eq!(registry.admit("s"), Admission::Reject);
    }

    #[test]
    fn reset_all_clears_state() {
        let registry = BreakerRegistry::new();
        let config = fast_config();

        for _ in 0..3 {
            registry.record_failure("s", &config, false);
        }
        assert_eq!(registry.admit("s"), Admission::Reject);

        registry.reset_all();
        assert_eq!(registry.admit("s"), Admission::Allow);
    }

    #[test]
    fn stages_are_independent() {
        let registry = BreakerRegistry::new();
        let config = fast_config();

        for _ in 0..3 {
            registry.record_failure("a", &config, false);
        }
        assert_eq!(registry.admit("a"), Admission::Reject);
        assert_eq!(registry.admit("b"), Admission::Allow);
    }
}
