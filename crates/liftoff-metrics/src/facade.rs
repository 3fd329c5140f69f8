//! Metrics facade — process counters, per-deployment request tracking,
//! and a system snapshot.
//!
//! Counters use atomics; per-deployment request events are kept in a
//! mutex-protected rolling window so `reading()` can be computed on
//! demand. The facade is `Clone` and shared across every component.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use sysinfo::System;
use tracing::debug;

use liftoff_state::MetricReading;

/// Rolling window over which rates and averages are computed.
const READING_WINDOW: Duration = Duration::from_secs(60);

/// Process-wide event counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    ApiRequests,
    DeploymentsStarted,
    DeploymentsFailed,
    WsConnections,
    WsMessages,
    Errors,
}

impl Counter {
    pub const ALL: [Counter; 6] = [
        Counter::ApiRequests,
        Counter::DeploymentsStarted,
        Counter::DeploymentsFailed,
        Counter::WsConnections,
        Counter::WsMessages,
        Counter::Errors,
    ];

    /// Metric name in Prometheus exposition.
    pub fn name(self) -> &'static str {
        match self {
            Counter::ApiRequests => "liftoff_api_requests_total",
            Counter::DeploymentsStarted => "liftoff_deployments_started_total",
            Counter::DeploymentsFailed => "liftoff_deployments_failed_total",
            Counter::WsConnections => "liftoff_ws_connections_total",
            Counter::WsMessages => "liftoff_ws_messages_total",
            Counter::Errors => "liftoff_errors_total",
        }
    }
}

/// One recorded request event.
struct RequestEvent {
    at: Instant,
    latency_ms: f64,
    is_error: bool,
}

/// Per-deployment metrics bucket.
#[derive(Default)]
struct DeploymentMetrics {
    /// Request events inside the rolling window.
    requests: Mutex<Vec<RequestEvent>>,
    /// Latest cpu percentage (0–100), fed by the usage sampler.
    cpu_pct: Mutex<f64>,
    /// Latest memory percentage (0–100), fed by the usage sampler.
    memory_pct: Mutex<f64>,
}

/// Point-in-time view of host-level resources.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemSnapshot {
    pub cpu_usage_pct: f64,
    pub memory_usage_pct: f64,
    pub load_average: f64,
    pub uptime_secs: u64,
}

struct Inner {
    counters: [AtomicU64; 6],
    deployments: RwLock<HashMap<String, Arc<DeploymentMetrics>>>,
    system: Mutex<System>,
}

/// Shared metrics facade.
#[derive(Clone)]
pub struct MetricsFacade {
    inner: Arc<Inner>,
}

impl Default for MetricsFacade {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsFacade {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                counters: std::array::from_fn(|_| AtomicU64::new(0)),
                deployments: RwLock::new(HashMap::new()),
                system: Mutex::new(System::new()),
            }),
        }
    }

    // ── Counters ───────────────────────────────────────────────────

    /// Increment a process counter.
    pub fn incr(&self, counter: Counter) {
        self.inner.counters[counter as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Current value of a process counter.
    pub fn counter(&self, counter: Counter) -> u64 {
        self.inner.counters[counter as usize].load(Ordering::Relaxed)
    }

    // ── Per-deployment tracking ────────────────────────────────────

    /// Register a deployment for request tracking.
    pub fn register(&self, deployment_id: &str) {
        let mut deployments = self.inner.deployments.write().unwrap();
        deployments
            .entry(deployment_id.to_string())
            .or_insert_with(|| Arc::new(DeploymentMetrics::default()));
        debug!(%deployment_id, "registered for metrics collection");
    }

    /// Unregister a deployment.
    pub fn unregister(&self, deployment_id: &str) {
        let mut deployments = self.inner.deployments.write().unwrap();
        deployments.remove(deployment_id);
        debug!(%deployment_id, "unregistered from metrics collection");
    }

    /// Deployment IDs currently tracked.
    pub fn tracked(&self) -> Vec<String> {
        let deployments = self.inner.deployments.read().unwrap();
        deployments.keys().cloned().collect()
    }

    /// Record one request against a deployment.
    pub fn record_request(&self, deployment_id: &str, latency_ms: f64, is_error: bool) {
        let bucket = {
            let deployments = self.inner.deployments.read().unwrap();
            match deployments.get(deployment_id) {
                Some(b) => Arc::clone(b),
                None => return,
            }
        };
        let mut requests = bucket.requests.lock().unwrap();
        let now = Instant::now();
        requests.retain(|e| now.duration_since(e.at) < READING_WINDOW);
        requests.push(RequestEvent {
            at: now,
            latency_ms,
            is_error,
        });
    }

    /// Update cpu/memory percentages for a deployment (fed externally).
    pub fn set_resource_usage(&self, deployment_id: &str, cpu_pct: f64, memory_pct: f64) {
        let deployments = self.inner.deployments.read().unwrap();
        if let Some(bucket) = deployments.get(deployment_id) {
            *bucket.cpu_pct.lock().unwrap() = cpu_pct;
            *bucket.memory_pct.lock().unwrap() = memory_pct;
        }
    }

    /// Current raw reading for a deployment, computed over the rolling
    /// window. Unknown deployments read as all zeros.
    pub fn reading(&self, deployment_id: &str) -> MetricReading {
        let bucket = {
            let deployments = self.inner.deployments.read().unwrap();
            match deployments.get(deployment_id) {
                Some(b) => Arc::clone(b),
                None => return MetricReading::default(),
            }
        };

        let mut requests = bucket.requests.lock().unwrap();
        let now = Instant::now();
        requests.retain(|e| now.duration_since(e.at) < READING_WINDOW);

        let count = requests.len();
        let errors = requests.iter().filter(|e| e.is_error).count();
        let requests_per_sec = count as f64 / READING_WINDOW.as_secs_f64();
        let response_time_ms = if count > 0 {
            requests.iter().map(|e| e.latency_ms).sum::<f64>() / count as f64
        } else {
            0.0
        };
        let error_rate_pct = if count > 0 {
            errors as f64 / count as f64 * 100.0
        } else {
            0.0
        };

        MetricReading {
            cpu_pct: *bucket.cpu_pct.lock().unwrap(),
            memory_pct: *bucket.memory_pct.lock().unwrap(),
            requests_per_sec,
            response_time_ms,
            error_rate_pct,
        }
    }

    // ── System snapshot ────────────────────────────────────────────

    /// Sample host-level cpu, memory, load, and uptime.
    pub fn system_snapshot(&self) -> SystemSnapshot {
        let mut system = self.inner.system.lock().unwrap();
        system.refresh_cpu();
        system.refresh_memory();

        let memory_usage_pct = if system.total_memory() > 0 {
            system.used_memory() as f64 / system.total_memory() as f64 * 100.0
        } else {
            0.0
        };

        SystemSnapshot {
            cpu_usage_pct: system.global_cpu_info().cpu_usage() as f64,
            memory_usage_pct,
            load_average: System::load_average().one,
            uptime_secs: System::uptime(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_increment() {
        let facade = MetricsFacade::new();
        for c in Counter::ALL {
            assert_eq!(facade.counter(c), 0);
        }

        facade.incr(Counter::ApiRequests);
        facade.incr(Counter::ApiRequests);
        facade.incr(Counter::Errors);

        assert_eq!(facade.counter(Counter::ApiRequests), 2);
        assert_eq!(facade.counter(Counter::Errors), 1);
        assert_eq!(facade.counter(Counter::WsConnections), 0);
    }

    #[test]
    fn unknown_deployment_reads_zero() {
        let facade = MetricsFacade::new();
        assert_eq!(facade.reading("nope"), MetricReading::default());
    }

    #[test]
    fn reading_reflects_recorded_requests() {
        let facade = MetricsFacade::new();
        facade.register("d1");

        for _ in 0..30 {
            facade.record_request("d1", 100.0, false);
        }
        for _ in 0..30 {
            facade.record_request("d1", 300.0, true);
        }

        let reading = facade.reading("d1");
        assert_eq!(reading.requests_per_sec, 1.0); // 60 requests over 60s.
        assert_eq!(reading.response_time_ms, 200.0);
        assert_eq!(reading.error_rate_pct, 50.0);
    }

    #[test]
    fn resource_usage_flows_into_reading() {
        let facade = MetricsFacade::new();
        facade.register("d1");
        facade.set_resource_usage("d1", 85.0, 60.0);

        let reading = facade.reading("d1");
        assert_eq!(reading.cpu_pct, 85.0);
        assert_eq!(reading.memory_pct, 60.0);
    }

    #[test]
    fn unregister_drops_tracking() {
        let facade = MetricsFacade::new();
        facade.register("d1");
        assert_eq!(facade.tracked(), vec!["d1".to_string()]);

        facade.unregister("d1");
        assert!(facade.tracked().is_empty());
        facade.record_request("d1", 10.0, false); // Silently ignored.
        assert_eq!(facade.reading("d1"), MetricReading::default());
    }

    #[test]
    fn system_snapshot_is_sane() {
        let facade = MetricsFacade::new();
        let snap = facade.system_snapshot();
        assert!(snap.memory_usage_pct >= 0.0 && snap.memory_usage_pct <= 100.0);
        assert!(snap.load_average >= 0.0);
    }
}
