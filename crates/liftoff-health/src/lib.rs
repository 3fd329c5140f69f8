//! liftoff-health — subsystem health supervision.
//!
//! A registry of named probes (database, metrics facade, gateway, host
//! system, outbound network, configured dependencies) runs on a fixed
//! tick, each behind its own circuit breaker. The supervisor collapses
//! per-probe results into one overall status and serves the readiness
//! and liveness summaries.

pub mod breaker;
pub mod probe;
pub mod supervisor;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use probe::{ProbeFn, ProbeOutcome, ProbeStatus, from_fn};
pub use supervisor::{
    HealthReport, HealthSupervisor, ProbeReport, ProbeSettings, SupervisorConfig,
};
