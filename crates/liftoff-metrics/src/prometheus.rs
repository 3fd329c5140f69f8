//! Prometheus text exposition format.
//!
//! Renders process counters and per-deployment readings into the
//! Prometheus text exposition format for scraping.

use crate::facade::{Counter, MetricsFacade};

/// Render the facade's current state into Prometheus text format.
pub fn render_prometheus(facade: &MetricsFacade) -> String {
    let mut out = String::new();

    for counter in Counter::ALL {
        out.push_str(&format!("# TYPE {} counter\n", counter.name()));
        out.push_str(&format!("{} {}\n", counter.name(), facade.counter(counter)));
    }

    let mut deployments = facade.tracked();
    deployments.sort();

    out.push_str("# TYPE liftoff_requests_per_second gauge\n");
    for id in &deployments {
        let reading = facade.reading(id);
        out.push_str(&format!(
            "liftoff_requests_per_second{{deployment=\"{id}\"}} {:.2}\n",
            reading.requests_per_sec
        ));
    }

    out.push_str("# TYPE liftoff_response_time_ms gauge\n");
    for id in &deployments {
        let reading = facade.reading(id);
        out.push_str(&format!(
            "liftoff_response_time_ms{{deployment=\"{id}\"}} {:.2}\n",
            reading.response_time_ms
        ));
    }

    out.push_str("# TYPE liftoff_error_rate_pct gauge\n");
    for id in &deployments {
        let reading = facade.reading(id);
        out.push_str(&format!(
            "liftoff_error_rate_pct{{deployment=\"{id}\"}} {:.2}\n",
            reading.error_rate_pct
        ));
    }

    out.push_str("# TYPE liftoff_cpu_pct gauge\n");
    for id in &deployments {
        let reading = facade.reading(id);
        out.push_str(&format!(
            "liftoff_cpu_pct{{deployment=\"{id}\"}} {:.2}\n",
            reading.cpu_pct
        ));
    }

    out.push_str("# TYPE liftoff_memory_pct gauge\n");
    for id in &deployments {
        let reading = facade.reading(id);
        out.push_str(&format!(
            "liftoff_memory_pct{{deployment=\"{id}\"}} {:.2}\n",
            reading.memory_pct
        ));
    }

    out
}
