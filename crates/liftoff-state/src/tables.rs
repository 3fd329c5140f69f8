//! redb table definitions for the Liftoff state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Composite keys follow the pattern `{parent_id}:{sort_key}` so
//! prefix scans return one deployment's records in order.

use redb::TableDefinition;

/// User records keyed by `{user_id}`.
pub const USERS: TableDefinition<&str, &[u8]> = TableDefinition::new("users");

/// Project records keyed by `{project_id}`.
pub const PROJECTS: TableDefinition<&str, &[u8]> = TableDefinition::new("projects");

/// Deployment records keyed by `{deployment_id}`.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Scaling policies keyed by `{deployment_id}` (one policy per deployment).
pub const SCALING_POLICIES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("scaling_policies");

/// Append-only scaling events keyed by `{deployment_id}:{created_at}:{event_id}`.
pub const SCALING_EVENTS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("scaling_events");

/// Resource usage samples keyed by `{deployment_id}:{timestamp}`.
pub const RESOURCE_USAGE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("resource_usage");

/// Latest optimization recommendations keyed by `{deployment_id}`.
pub const RECOMMENDATIONS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("optimization_recommendations");
