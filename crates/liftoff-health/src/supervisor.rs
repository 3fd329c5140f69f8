//! HealthSupervisor — runs registered probes under circuit breakers.
//!
//! On each tick every enabled probe runs with its timeout; the result
//! is threaded through the probe's breaker. While a breaker is open the
//! probe is not invoked and reports `unknown` with the remaining
//! cooldown. Probes execute without holding the registry lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, watch};
use tracing::{debug, info, warn};

use crate::breaker::{BreakerConfig, BreakerState, CircuitBreaker};
use crate::probe::{ProbeFn, ProbeOutcome, ProbeStatus};

/// Per-probe settings.
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    /// Wall-clock budget per invocation; a timeout counts as unhealthy.
    pub timeout: Duration,
    /// Critical probes gate readiness (database, metrics).
    pub critical: bool,
    pub enabled: bool,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            critical: false,
            enabled: true,
        }
    }
}

/// Supervisor tuning knobs.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub interval: Duration,
    pub breaker: BreakerConfig,
    /// In development mode `mocked` outcomes count as healthy.
    pub dev_mode: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            breaker: BreakerConfig::default(),
            dev_mode: false,
        }
    }
}

struct ProbeSlot {
    probe: ProbeFn,
    settings: ProbeSettings,
    breaker: CircuitBreaker,
    last: ProbeOutcome,
}

/// Per-probe view inside a health report.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProbeReport {
    pub name: String,
    pub outcome: ProbeOutcome,
    pub breaker_state: BreakerState,
    pub consecutive_failures: u32,
    pub critical: bool,
}

/// Snapshot of overall health.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthReport {
    pub overall: ProbeStatus,
    pub probes: Vec<ProbeReport>,
}

/// A registry of named probes, each behind its own circuit breaker.
#[derive(Clone)]
pub struct HealthSupervisor {
    probes: Arc<RwLock<HashMap<String, ProbeSlot>>>,
    config: SupervisorConfig,
}

impl HealthSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            probes: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Register a probe under a unique name.
    pub async fn register(&self, name: &str, probe: ProbeFn, settings: ProbeSettings) {
        let mut probes = self.probes.write().await;
        probes.insert(
            name.to_string(),
            ProbeSlot {
                probe,
                settings,
                breaker: CircuitBreaker::new(self.config.breaker.clone()),
                last: ProbeOutcome::unknown(serde_json::json!({"pending": true})),
            },
        );
        debug!(probe = %name, "health probe registered");
    }

    /// Enable or disable a probe without unregistering it.
    pub async fn set_enabled(&self, name: &str, enabled: bool) {
        let mut probes = self.probes.write().await;
        if let Some(slot) = probes.get_mut(name) {
            slot.settings.enabled = enabled;
        }
    }

    /// Run every enabled probe once.
    pub async fn tick(&self) {
        let names: Vec<String> = {
            let probes = self.probes.read().await;
            probes.keys().cloned().collect()
        };

        for name in names {
            // Decide under the lock, run without it.
            let to_run = {
                let mut probes = self.probes.write().await;
                let slot = match probes.get_mut(&name) {
                    Some(s) => s,
                    None => continue,
                };
                if !slot.settings.enabled {
                    continue;
                }
                if !slot.breaker.allow() {
                    let remaining = slot
                        .breaker
                        .cooldown_remaining()
                        .unwrap_or(Duration::ZERO);
                    slot.last = ProbeOutcome::unknown(serde_json::json!({
                        "circuit": "open",
                        "cooldown_remaining_ms": remaining.as_millis() as u64,
                    }));
                    debug!(probe = %name, "breaker open, probe skipped");
                    continue;
                }
                Some((Arc::clone(&slot.probe), slot.settings.timeout))
            };

            let Some((probe, timeout)) = to_run else {
                continue;
            };

            let outcome = match tokio::time::timeout(timeout, probe()).await {
                Ok(outcome) => outcome,
                Err(_) => ProbeOutcome::unhealthy(
                    timeout.as_millis() as u64,
                    &format!("probe timed out after {timeout:?}"),
                ),
            };

            let mut probes = self.probes.write().await;
            if let Some(slot) = probes.get_mut(&name) {
                if outcome.status == ProbeStatus::Unhealthy {
                    slot.breaker.on_failure();
                    warn!(
                        probe = %name,
                        error = outcome.error.as_deref().unwrap_or("unknown"),
                        failures = slot.breaker.failures(),
                        "probe unhealthy"
                    );
                } else {
                    slot.breaker.on_success();
                }
                slot.last = outcome;
            }
        }
    }

    /// Current report with the collapsed overall status.
    pub async fn report(&self) -> HealthReport {
        let probes = self.probes.read().await;
        let mut reports = Vec::new();
        for (name, slot) in probes.iter() {
            if !slot.settings.enabled {
                continue;
            }
            reports.push(ProbeReport {
                name: name.clone(),
                outcome: slot.last.clone(),
                breaker_state: slot.breaker.state(),
                consecutive_failures: slot.breaker.failures(),
                critical: slot.settings.critical,
            });
        }
        reports.sort_by(|a, b| a.name.cmp(&b.name));
        let overall = collapse(&reports, self.config.dev_mode);
        HealthReport {
            overall,
            probes: reports,
        }
    }

    /// Readiness: ready iff no critical probe is unhealthy or sitting
    /// behind an open breaker.
    pub async fn readiness(&self) -> bool {
        let probes = self.probes.read().await;
        !probes.values().any(|slot| {
            slot.settings.enabled
                && slot.settings.critical
                && (slot.last.status == ProbeStatus::Unhealthy
                    || slot.breaker.state() == BreakerState::Open)
        })
    }

    /// Liveness: always alive, guarding the process from restart storms.
    pub fn liveness(&self) -> bool {
        true
    }

    /// Run the probe loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "health supervisor started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    info!("health supervisor shutting down");
                    break;
                }
            }
        }
    }
}

/// Collapse per-probe results into one status.
///
/// More than half unhealthy (unknown counts) → unhealthy; any
/// unhealthy/unknown or any degraded → degraded; otherwise healthy.
fn collapse(reports: &[ProbeReport], dev_mode: bool) -> ProbeStatus {
    if reports.is_empty() {
        return ProbeStatus::Healthy;
    }
    let mut unhealthy = 0usize;
    let mut degraded = 0usize;
    for report in reports {
        match report.outcome.status {
            ProbeStatus::Unhealthy | ProbeStatus::Unknown => unhealthy += 1,
            ProbeStatus::Degraded => degraded += 1,
            ProbeStatus::Mocked if !dev_mode => degraded += 1,
            ProbeStatus::Mocked | ProbeStatus::Healthy => {}
        }
    }
    if unhealthy * 2 > reports.len() {
        ProbeStatus::Unhealthy
    } else if unhealthy > 0 || degraded > 0 {
        ProbeStatus::Degraded
    } else {
        ProbeStatus::Healthy
    }
}
