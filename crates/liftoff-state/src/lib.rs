//! liftoff-state — embedded state store for the Liftoff control plane.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state management for users, projects, deployments, scaling policies,
//! scaling events, resource usage samples, and optimization recommendations.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{deployment_id}:{timestamp}`) enable efficient prefix
//! scans for a deployment's time-ordered records.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks. Deployment status transitions are
//! validated inside the write transaction, so the persisted history never
//! contains an illegal edge.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
