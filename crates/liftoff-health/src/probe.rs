//! Probe outcomes and the built-in probe set.
//!
//! Probes are boxed async closures so the supervisor can hold a
//! heterogeneous registry. Built-ins cover the datastore, the metrics
//! facade, the host system, outbound network reachability, and
//! configured external dependencies.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;
use tracing::debug;

use liftoff_metrics::MetricsFacade;
use liftoff_state::StateStore;

/// Status reported by a single probe run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
    /// Stand-in result in development mode; counts as healthy there.
    Mocked,
}

/// Result of one probe invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeOutcome {
    pub status: ProbeStatus,
    pub response_time_ms: u64,
    pub details: serde_json::Value,
    pub error: Option<String>,
}

impl ProbeOutcome {
    pub fn healthy(response_time_ms: u64, details: serde_json::Value) -> Self {
        Self {
            status: ProbeStatus::Healthy,
            response_time_ms,
            details,
            error: None,
        }
    }

    pub fn degraded(response_time_ms: u64, details: serde_json::Value) -> Self {
        Self {
            status: ProbeStatus::Degraded,
            response_time_ms,
            details,
            error: None,
        }
    }

    pub fn unhealthy(response_time_ms: u64, error: &str) -> Self {
        Self {
            status: ProbeStatus::Unhealthy,
            response_time_ms,
            details: json!({}),
            error: Some(error.to_string()),
        }
    }

    pub fn unknown(details: serde_json::Value) -> Self {
        Self {
            status: ProbeStatus::Unknown,
            response_time_ms: 0,
            details,
            error: None,
        }
    }

    pub fn mocked() -> Self {
        Self {
            status: ProbeStatus::Mocked,
            response_time_ms: 0,
            details: json!({"mocked": true}),
            error: None,
        }
    }
}

type BoxFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ProbeOutcome> + Send>>;

/// A probe is an async closure producing one outcome per invocation.
pub type ProbeFn = Arc<dyn Fn() -> BoxFuture + Send + Sync>;

/// Wrap a plain async closure as a `ProbeFn`.
pub fn from_fn<F, Fut>(f: F) -> ProbeFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ProbeOutcome> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

/// Datastore probe: a cheap read proves the store answers.
pub fn database(state: StateStore) -> ProbeFn {
    from_fn(move || {
        let state = state.clone();
        async move {
            let started = Instant::now();
            match state.list_policies() {
                Ok(policies) => ProbeOutcome::healthy(
                    started.elapsed().as_millis() as u64,
                    json!({"policies": policies.len()}),
                ),
                Err(e) => ProbeOutcome::unhealthy(
                    started.elapsed().as_millis() as u64,
                    &format!("datastore read failed: {e}"),
                ),
            }
        }
    })
}

/// Metrics facade probe: the snapshot call itself must answer.
pub fn metrics(facade: MetricsFacade) -> ProbeFn {
    from_fn(move || {
        let facade = facade.clone();
        async move {
            let started = Instant::now();
            let snapshot = facade.system_snapshot();
            ProbeOutcome::healthy(
                started.elapsed().as_millis() as u64,
                json!({
                    "tracked_deployments": facade.tracked().len(),
                    "uptime_secs": snapshot.uptime_secs,
                }),
            )
        }
    })
}

/// Host system probe: cpu/memory/load bands.
pub fn system(facade: MetricsFacade) -> ProbeFn {
    from_fn(move || {
        let facade = facade.clone();
        async move {
            let started = Instant::now();
            let snap = facade.system_snapshot();
            let elapsed = started.elapsed().as_millis() as u64;
            let details = json!({
                "cpu_pct": snap.cpu_usage_pct,
                "memory_pct": snap.memory_usage_pct,
                "load": snap.load_average,
            });
            if snap.cpu_usage_pct > 98.0 || snap.memory_usage_pct > 98.0 {
                ProbeOutcome {
                    status: ProbeStatus::Unhealthy,
                    response_time_ms: elapsed,
                    details,
                    error: Some("host resources exhausted".to_string()),
                }
            } else if snap.cpu_usage_pct > 90.0 || snap.memory_usage_pct > 90.0 {
                ProbeOutcome::degraded(elapsed, details)
            } else {
                ProbeOutcome::healthy(elapsed, details)
            }
        }
    })
}

/// Outbound network probe: DNS resolution plus a TCP-level HTTP GET.
pub fn network(target_host: String, target_url: String, timeout: Duration) -> ProbeFn {
    from_fn(move || {
        let host = target_host.clone();
        let url = target_url.clone();
        async move {
            let started = Instant::now();
            if let Err(e) = tokio::net::lookup_host((host.as_str(), 443)).await {
                return ProbeOutcome::unhealthy(
                    started.elapsed().as_millis() as u64,
                    &format!("dns resolution failed: {e}"),
                );
            }
            http_get_outcome(&url, timeout, started).await
        }
    })
}

/// External dependency probe: GET the configured URL.
pub fn http_dependency(url: String, timeout: Duration) -> ProbeFn {
    from_fn(move || {
        let url = url.clone();
        async move {
            let started = Instant::now();
            http_get_outcome(&url, timeout, started).await
        }
    })
}

/// Stand-in probe for development mode.
pub fn mocked() -> ProbeFn {
    from_fn(|| async { ProbeOutcome::mocked() })
}

/// Perform an HTTP GET and map the response into an outcome.
///
/// 2xx is healthy, other statuses are degraded (the endpoint answers),
/// connection errors and timeouts are unhealthy.
async fn http_get_outcome(url: &str, timeout: Duration, started: Instant) -> ProbeOutcome {
    let address = match authority_of(url) {
        Some(a) => a,
        None => {
            return ProbeOutcome::unhealthy(0, &format!("unparseable probe url: {url}"));
        }
    };

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(&address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %url, "probe connection failed");
                return ProbeOutcome::unhealthy(
                    started.elapsed().as_millis() as u64,
                    &format!("connect failed: {e}"),
                );
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                return ProbeOutcome::unhealthy(
                    started.elapsed().as_millis() as u64,
                    &format!("handshake failed: {e}"),
                );
            }
        };
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(url)
            .header("host", address.split(':').next().unwrap_or(&address))
            .header("user-agent", "liftoff-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(r) => r,
            Err(e) => {
                return ProbeOutcome::unhealthy(
                    started.elapsed().as_millis() as u64,
                    &format!("bad request: {e}"),
                );
            }
        };

        match sender.send_request(req).await {
            Ok(resp) => {
                let elapsed = started.elapsed().as_millis() as u64;
                let details = json!({"status": resp.status().as_u16()});
                if resp.status().is_success() {
                    ProbeOutcome::healthy(elapsed, details)
                } else {
                    ProbeOutcome::degraded(elapsed, details)
                }
            }
            Err(e) => ProbeOutcome::unhealthy(
                started.elapsed().as_millis() as u64,
                &format!("request failed: {e}"),
            ),
        }
    })
    .await;

    match result {
        Ok(outcome) => outcome,
        Err(_) => ProbeOutcome::unhealthy(
            started.elapsed().as_millis() as u64,
            &format!("probe timed out after {timeout:?}"),
        ),
    }
}

/// Extract `host:port` from an http(s) URL.
fn authority_of(url: &str) -> Option<String> {
    let rest = url
        .strip_prefix("http://")
        .map(|r| (r, 80u16))
        .or_else(|| url.strip_prefix("https://").map(|r| (r, 443u16)))?;
    let (rest, default_port) = rest;
    let authority = rest.split('/').next()?;
    if authority.is_empty() {
        return None;
    }
    if authority.contains(':') {
        Some(authority.to_string())
    } else {
        Some(format!("{authority}:{default_port}"))
    }
}
