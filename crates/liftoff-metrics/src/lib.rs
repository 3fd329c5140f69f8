//! liftoff-metrics — the metrics facade.
//!
//! Every component records events through process counters and
//! per-deployment request tracking; the autoscaler and optimizer read
//! `MetricReading`s back out. Host-level cpu/memory/load come from
//! [sysinfo](https://docs.rs/sysinfo). The `/metrics` endpoint renders
//! the facade in Prometheus text exposition format.

pub mod facade;
pub mod prometheus;

pub use facade::{Counter, MetricsFacade, SystemSnapshot};
pub use prometheus::render_prometheus;
