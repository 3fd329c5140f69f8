//! liftoff-optimizer — usage aggregation, cost analytics, and budgets.
//!
//! Samples each running deployment on a fixed interval into a bounded
//! 24-hour ring (persisted alongside), computes cost with a fixed
//! category breakdown, scores utilization efficiency against the 75%
//! ideal band, emits monthly budget alerts (idempotent per threshold
//! per month), and generates deterministic right-sizing
//! recommendations.

pub mod analytics;
pub mod budget;
pub mod optimizer;
pub mod recommend;

pub use analytics::{Analytics, CostBreakdown, analyze, efficiency_score};
pub use budget::{BudgetAlert, BudgetConfig, BudgetLevel, BudgetTracker};
pub use optimizer::{OptimizerConfig, OptimizerError, OptimizerResult, ResourceOptimizer};
pub use recommend::recommendations;
