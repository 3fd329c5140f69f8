//! liftoff-autoscale — metrics-driven instance scaling.
//!
//! Each deployment may carry one `ScalingPolicy`: a set of weighted
//! metric thresholds plus scale-up/down score cutoffs, a cooldown, and
//! instance bounds. On a fixed tick every enabled policy is evaluated
//! against the metrics facade.
//!
//! # Scoring
//!
//! ```text
//! normalized = clamp(raw / divisor, 0, 1)        // cpu,mem /100; err /10;
//!                                                 // rps /1000; latency /5000
//! triggered  = comparison(normalized, threshold)
//! term       = triggered ? (normalized + |normalized-threshold|*0.5) * weight
//!                        : normalized * weight * 0.5
//! score      = Σ term / Σ weight
//! ```
//!
//! `score > scale_up_threshold` steps instances up by one (capped at
//! max); `score < scale_down_threshold` steps down by one (floored at
//! min). After a successful scale, decisions inside the cooldown window
//! are forced to no-change with reason "cooldown"; manual overrides
//! bypass and clear the cooldown.

pub mod evaluator;
pub mod policy;
pub mod scaler;

pub use evaluator::{Decision, ScaleAction, decide, normalize, score};
pub use policy::{PolicyError, PolicyWarning, validate};
pub use scaler::{Autoscaler, AutoscaleError, AutoscaleResult, PolicyDraft, ScaleExecutor};
