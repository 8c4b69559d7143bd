//! Per-dependency circuit breaking.
//!
//! Tracks dependency health and defers dispatch against a failing
//! dependency for a cooldown period instead of burning job retry budget on
//! an outage.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

/// State of one dependency's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Configuration for the health registry.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures within the rolling window that trip the circuit.
    pub failure_threshold: usize,
    /// Rolling window over which failures are counted.
    pub window: Duration,
    /// How long an open circuit stays open before admitting a trial.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Snapshot of one dependency's health for monitoring.
#[derive(Debug, Clone)]
pub struct DependencyHealth {
    pub state: CircuitState,
    pub failures_in_window: usize,
}

#[derive(Debug)]
struct Entry {
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl Entry {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            opened_at: None,
            trial_in_flight: false,
        }
    }

    fn prune_window(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.failures.front() {
            if now.duration_since(*front) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Health registry with one circuit per dependency key.
///
/// Dispatchers call [`try_acquire`](HealthRegistry::try_acquire) before
/// assigning work; workers report outcomes with `record_success` /
/// `record_failure`. While open, acquisition is denied with the remaining
/// cooldown so callers can defer rather than fail.
pub struct HealthRegistry {
    entries: Mutex<HashMap<String, Entry>>,
    config: BreakerConfig,
}

impl HealthRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(BreakerConfig::default())
    }

    /// Ask to dispatch against a dependency.
    ///
    /// Returns Ok(()) when dispatch may proceed, Err(wait) with the
    /// remaining cooldown when it must be deferred. A half-open circuit
    /// admits exactly one trial dispatch at a time.
    pub async fn try_acquire(&self, dependency: &str) -> Result<(), Duration> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .entry(dependency.to_string())
            .or_insert_with(Entry::new);
        let now = Instant::now();

        match entry.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let opened_at = entry.opened_at.unwrap_or(now);
                let elapsed = now.duration_since(opened_at);
                if elapsed >= self.config.cooldown {
                    info!("Circuit for {} half-open, admitting trial", dependency);
                    entry.state = CircuitState::HalfOpen;
                    entry.trial_in_flight = true;
                    Ok(())
                } else {
                    Err(self.config.cooldown - elapsed)
                }
            }
            CircuitState::HalfOpen => {
                if entry.trial_in_flight {
                    // One probe at a time
                    Err(self.config.cooldown)
                } else {
                    entry.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Report a successful interaction: closes the circuit and clears the
    /// failure history.
    pub async fn record_success(&self, dependency: &str) {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .entry(dependency.to_string())
            .or_insert_with(Entry::new);
        if entry.state != CircuitState::Closed {
            info!("Circuit for {} closed after successful dispatch", dependency);
        }
        entry.state = CircuitState::Closed;
        entry.failures.clear();
        entry.opened_at = None;
        entry.trial_in_flight = false;
    }

    /// Report a failed interaction. Trips the circuit when failures cross
    /// the threshold within the window; a failed half-open trial reopens
    /// the circuit and restarts the cooldown.
    pub async fn record_failure(&self, dependency: &str) {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .entry(dependency.to_string())
            .or_insert_with(Entry::new);
        let now = Instant::now();

        entry.failures.push_back(now);
        entry.prune_window(now, self.config.window);

        match entry.state {
            CircuitState::HalfOpen => {
                warn!("Circuit for {} reopened: trial dispatch failed", dependency);
                entry.state = CircuitState::Open;
                entry.opened_at = Some(now);
                entry.trial_in_flight = false;
            }
            CircuitState::Closed => {
                if entry.failures.len() >= self.config.failure_threshold {
                    warn!(
                        "Circuit for {} opened after {} failures in window",
                        dependency,
                        entry.failures.len()
                    );
                    entry.state = CircuitState::Open;
                    entry.opened_at = Some(now);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Current state of a dependency's circuit.
    pub async fn state(&self, dependency: &str) -> CircuitState {
        let entries = self.entries.lock().await;
        entries
            .get(dependency)
            .map(|e| e.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Health snapshot for every known dependency.
    pub async fn health(&self) -> HashMap<String, DependencyHealth> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let window = self.config.window;
        entries
            .iter_mut()
            .map(|(key, entry)| {
                entry.prune_window(now, window);
                (
                    key.clone(),
                    DependencyHealth {
                        state: entry.state,
                        failures_in_window: entry.failures.len(),
                    },
                )
            })
            .collect()
    }
}
