//! StateStore — redb-backed persistence for the Liftoff control plane.
//!
//! Provides typed CRUD over users, projects, deployments, scaling
//! policies, scaling events, resource usage, and recommendations. All
//! values are JSON-serialized into redb's `&[u8]` value columns. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing).
//!
//! Referential integrity (`project.user_id → user.id`,
//! `deployment.project_id → project.id`) and cascading deletes are
//! enforced here. Status transitions are validated inside the write
//! transaction, so an illegal transition is never persisted.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(USERS).map_err(map_err!(Table))?;
        txn.open_table(PROJECTS).map_err(map_err!(Table))?;
        txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        txn.open_table(SCALING_POLICIES).map_err(map_err!(Table))?;
        txn.open_table(SCALING_EVENTS).map_err(map_err!(Table))?;
        txn.open_table(RESOURCE_USAGE).map_err(map_err!(Table))?;
        txn.open_table(RECOMMENDATIONS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Users ──────────────────────────────────────────────────────

    /// Insert or update a user.
    pub fn put_user(&self, user: &UserRecord) -> StateResult<()> {
        let value = serde_json::to_vec(user).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(USERS).map_err(map_err!(Table))?;
            table
                .insert(user.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a user by ID.
    pub fn get_user(&self, user_id: &str) -> StateResult<Option<UserRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(USERS).map_err(map_err!(Table))?;
        match table.get(user_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let user: UserRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(user))
            }
            None => Ok(None),
        }
    }

    /// Delete a user, cascading to their projects and deployments.
    pub fn delete_user(&self, user_id: &str) -> StateResult<bool> {
        let projects = self.list_projects_for_user(user_id)?;
        for project in &projects {
            self.delete_project(&project.id)?;
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(USERS).map_err(map_err!(Table))?;
            existed = table.remove(user_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%user_id, existed, cascaded_projects = projects.len(), "user deleted");
        Ok(existed)
    }

    // ── Projects ───────────────────────────────────────────────────

    /// Insert or update a project. The owning user must exist.
    pub fn put_project(&self, project: &ProjectRecord) -> StateResult<()> {
        if self.get_user(&project.user_id)?.is_none() {
            return Err(StateError::ForeignKey(format!(
                "project {} references missing user {}",
                project.id, project.user_id
            )));
        }
        let value = serde_json::to_vec(project).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(PROJECTS).map_err(map_err!(Table))?;
            table
                .insert(project.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a project by ID.
    pub fn get_project(&self, project_id: &str) -> StateResult<Option<ProjectRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PROJECTS).map_err(map_err!(Table))?;
        match table.get(project_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let project: ProjectRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(project))
            }
            None => Ok(None),
        }
    }

    /// List all projects owned by a user.
    pub fn list_projects_for_user(&self, user_id: &str) -> StateResult<Vec<ProjectRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PROJECTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let project: ProjectRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if project.user_id == user_id {
                results.push(project);
            }
        }
        Ok(results)
    }

    /// Delete a project, cascading to its deployments.
    pub fn delete_project(&self, project_id: &str) -> StateResult<bool> {
        let deployments = self.list_deployments()?;
        for d in deployments.iter().filter(|d| d.project_id == project_id) {
            self.delete_deployment(&d.id)?;
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(PROJECTS).map_err(map_err!(Table))?;
            existed = table.remove(project_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Insert or update a deployment. The owning project must exist.
    pub fn put_deployment(&self, record: &DeploymentRecord) -> StateResult<()> {
        if self.get_project(&record.project_id)?.is_none() {
            return Err(StateError::ForeignKey(format!(
                "deployment {} references missing project {}",
                record.id, record.project_id
            )));
        }
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            table
                .insert(record.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(deployment_id = %record.id, status = %record.status.as_str(), "deployment stored");
        Ok(())
    }

    /// Get a deployment by ID.
    pub fn get_deployment(&self, deployment_id: &str) -> StateResult<Option<DeploymentRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        match table.get(deployment_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: DeploymentRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// List all deployments.
    pub fn list_deployments(&self) -> StateResult<Vec<DeploymentRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: DeploymentRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    /// List all deployments owned by a user.
    pub fn list_deployments_for_user(&self, user_id: &str) -> StateResult<Vec<DeploymentRecord>> {
        Ok(self
            .list_deployments()?
            .into_iter()
            .filter(|d| d.user_id == user_id)
            .collect())
    }

    /// Apply an optional-field update to a deployment inside one write
    /// transaction. A status change is validated against the state
    /// machine before anything is written.
    pub fn update_deployment(
        &self,
        deployment_id: &str,
        update: &UpdateDeployment,
        now: u64,
    ) -> StateResult<DeploymentRecord> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let record;
        {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            let mut current: DeploymentRecord = match table
                .get(deployment_id)
                .map_err(map_err!(Read))?
            {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(StateError::NotFound(deployment_id.to_string())),
            };

            if let Some(next) = update.status {
                if !current.status.can_transition_to(next) {
                    return Err(StateError::IllegalTransition(format!(
                        "{} -> {} for deployment {}",
                        current.status.as_str(),
                        next.as_str(),
                        deployment_id
                    )));
                }
                current.status = next;
                current.updated_at = now;
                if next == DeploymentStatus::Destroyed {
                    current.sandbox_id = None;
                }
            }
            if let Some(ref sandbox_id) = update.sandbox_id {
                current.sandbox_id = sandbox_id.clone();
            }
            if let Some(ref url) = update.public_url {
                // public_url is immutable after first set.
                if current.public_url.is_none() {
                    current.public_url = Some(url.clone());
                }
            }
            if let Some(instances) = update.instances {
                current.instances = instances;
            }
            if let Some(at) = update.last_activity_at {
                current.last_activity_at = at;
            }

            let value = serde_json::to_vec(&current).map_err(map_err!(Serialize))?;
            table
                .insert(deployment_id, value.as_slice())
                .map_err(map_err!(Write))?;
            record = current;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(record)
    }

    /// Persist a status transition. Fails with `IllegalTransition` if
    /// the state machine forbids it.
    pub fn transition_deployment(
        &self,
        deployment_id: &str,
        next: DeploymentStatus,
        now: u64,
    ) -> StateResult<DeploymentRecord> {
        self.update_deployment(
            deployment_id,
            &UpdateDeployment {
                status: Some(next),
                ..Default::default()
            },
            now,
        )
    }

    /// Delete a deployment and its dependent records (policy, events,
    /// usage, recommendations). Returns true if it existed.
    pub fn delete_deployment(&self, deployment_id: &str) -> StateResult<bool> {
        self.delete_policy(deployment_id)?;
        self.delete_by_prefix(SCALING_EVENTS, &format!("{deployment_id}:"))?;
        self.delete_by_prefix(RESOURCE_USAGE, &format!("{deployment_id}:"))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut recs = txn.open_table(RECOMMENDATIONS).map_err(map_err!(Table))?;
            recs.remove(deployment_id).map_err(map_err!(Write))?;
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            existed = table
                .remove(deployment_id)
                .map_err(map_err!(Write))?
                .is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%deployment_id, existed, "deployment deleted");
        Ok(existed)
    }

    // ── Scaling policies ───────────────────────────────────────────

    /// Insert or update the scaling policy bound to a deployment.
    pub fn put_policy(&self, policy: &ScalingPolicy) -> StateResult<()> {
        let value = serde_json::to_vec(policy).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SCALING_POLICIES).map_err(map_err!(Table))?;
            table
                .insert(policy.deployment_id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get the scaling policy for a deployment.
    pub fn get_policy(&self, deployment_id: &str) -> StateResult<Option<ScalingPolicy>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SCALING_POLICIES).map_err(map_err!(Table))?;
        match table.get(deployment_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let policy: ScalingPolicy =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(policy))
            }
            None => Ok(None),
        }
    }

    /// List all scaling policies.
    pub fn list_policies(&self) -> StateResult<Vec<ScalingPolicy>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SCALING_POLICIES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let policy: ScalingPolicy =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(policy);
        }
        Ok(results)
    }

    /// Delete the policy for a deployment. Returns true if one existed.
    pub fn delete_policy(&self, deployment_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(SCALING_POLICIES).map_err(map_err!(Table))?;
            existed = table
                .remove(deployment_id)
                .map_err(map_err!(Write))?
                .is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Scaling events ─────────────────────────────────────────────

    /// Append a scaling event (append-only audit).
    pub fn append_scaling_event(&self, event: &ScalingEvent) -> StateResult<()> {
        let key = event.table_key();
        let value = serde_json::to_vec(event).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SCALING_EVENTS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// List scaling events for a deployment, ordered by `created_at`
    /// ascending, with limit/offset paging.
    pub fn list_scaling_events(
        &self,
        deployment_id: &str,
        limit: usize,
        offset: usize,
    ) -> StateResult<Vec<ScalingEvent>> {
        let prefix = format!("{deployment_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SCALING_EVENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        let mut skipped = 0usize;
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(&prefix) {
                continue;
            }
            if skipped < offset {
                skipped += 1;
                continue;
            }
            let event: ScalingEvent =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(event);
            if results.len() >= limit {
                break;
            }
        }
        Ok(results)
    }

    // ── Resource usage ─────────────────────────────────────────────

    /// Insert a resource usage sample.
    pub fn put_sample(&self, sample: &ResourceSample) -> StateResult<()> {
        let key = sample.table_key();
        let value = serde_json::to_vec(sample).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(RESOURCE_USAGE).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// List samples for a deployment in `[start, end]` (millis), ordered
    /// by timestamp ascending.
    pub fn list_samples(
        &self,
        deployment_id: &str,
        start: u64,
        end: u64,
    ) -> StateResult<Vec<ResourceSample>> {
        let prefix = format!("{deployment_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RESOURCE_USAGE).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(&prefix) {
                continue;
            }
            let sample: ResourceSample =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if sample.timestamp >= start && sample.timestamp <= end {
                results.push(sample);
            }
        }
        Ok(results)
    }

    /// Delete samples older than `cutoff` for a deployment. Returns the
    /// number deleted.
    pub fn prune_samples_before(&self, deployment_id: &str, cutoff: u64) -> StateResult<u32> {
        let prefix = format!("{deployment_id}:");
        let keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(RESOURCE_USAGE).map_err(map_err!(Table))?;
            let mut keys = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                if !key.value().starts_with(&prefix) {
                    continue;
                }
                let sample: ResourceSample =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if sample.timestamp < cutoff {
                    keys.push(key.value().to_string());
                }
            }
            keys
        };
        let count = keys.len() as u32;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(RESOURCE_USAGE).map_err(map_err!(Table))?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(count)
    }

    // ── Recommendations ────────────────────────────────────────────

    /// Replace the current recommendations for a deployment.
    pub fn put_recommendations(
        &self,
        deployment_id: &str,
        recs: &[Recommendation],
    ) -> StateResult<()> {
        let value = serde_json::to_vec(recs).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(RECOMMENDATIONS).map_err(map_err!(Table))?;
            table
                .insert(deployment_id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get the current recommendations for a deployment.
    pub fn get_recommendations(&self, deployment_id: &str) -> StateResult<Vec<Recommendation>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RECOMMENDATIONS).map_err(map_err!(Table))?;
        match table.get(deployment_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let recs: Vec<Recommendation> =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(recs)
            }
            None => Ok(Vec::new()),
        }
    }

    // ── Internal ───────────────────────────────────────────────────

    /// Remove every key under `prefix` from `table_def`.
    fn delete_by_prefix(
        &self,
        table_def: redb::TableDefinition<&str, &[u8]>,
        prefix: &str,
    ) -> StateResult<u32> {
        let keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(table_def).map_err(map_err!(Table))?;
            table
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    let k = key.value().to_string();
                    k.starts_with(prefix).then_some(k)
                })
                .collect()
        };
        let count = keys.len() as u32;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table_def).map_err(map_err!(Table))?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn store() -> StateStore {
        StateStore::open_in_memory().unwrap()
    }

    fn seed_user(store: &StateStore, id: &str) {
        store
            .put_user(&UserRecord {
                id: id.to_string(),
                email: format!("{id}@example.com"),
                plan_type: "pro".to_string(),
                created_at: 1_000,
            })
            .unwrap();
    }

    fn seed_project(store: &StateStore, id: &str, user_id: &str) {
        store
            .put_project(&ProjectRecord {
                id: id.to_string(),
                user_id: user_id.to_string(),
                name: format!("project-{id}"),
                created_at: 1_000,
            })
            .unwrap();
    }

    fn deployment(id: &str, project_id: &str, user_id: &str) -> DeploymentRecord {
        DeploymentRecord {
            id: id.to_string(),
            project_id: project_id.to_string(),
            user_id: user_id.to_string(),
            status: DeploymentStatus::Pending,
            runtime_kind: RuntimeKind::GenericNode,
            sandbox_id: None,
            public_url: None,
            instances: 1,
            created_at: 1_000,
            updated_at: 1_000,
            last_activity_at: 1_000,
            env: HashMap::new(),
        }
    }

    #[test]
    fn deployment_round_trip() {
        let store = store();
        seed_user(&store, "u1");
        seed_project(&store, "p1", "u1");

        let d = deployment("d1", "p1", "u1");
        store.put_deployment(&d).unwrap();

        let loaded = store.get_deployment("d1").unwrap().unwrap();
        assert_eq!(loaded, d);
    }

    #[test]
    fn deployment_requires_existing_project() {
        let store = store();
        let err = store
            .put_deployment(&deployment("d1", "missing", "u1"))
            .unwrap_err();
        assert!(matches!(err, StateError::ForeignKey(_)));
    }

    #[test]
    fn project_requires_existing_user() {
        let store = store();
        let err = store
            .put_project(&ProjectRecord {
                id: "p1".to_string(),
                user_id: "ghost".to_string(),
                name: "p".to_string(),
                created_at: 0,
            })
            .unwrap_err();
        assert!(matches!(err, StateError::ForeignKey(_)));
    }

    #[test]
    fn delete_user_cascades() {
        let store = store();
        seed_user(&store, "u1");
        seed_project(&store, "p1", "u1");
        store.put_deployment(&deployment("d1", "p1", "u1")).unwrap();

        assert!(store.delete_user("u1").unwrap());
        assert!(store.get_project("p1").unwrap().is_none());
        assert!(store.get_deployment("d1").unwrap().is_none());
    }

    #[test]
    fn legal_transition_is_persisted() {
        let store = store();
        seed_user(&store, "u1");
        seed_project(&store, "p1", "u1");
        store.put_deployment(&deployment("d1", "p1", "u1")).unwrap();

        let updated = store
            .transition_deployment("d1", DeploymentStatus::Provisioning, 2_000)
            .unwrap();
        assert_eq!(updated.status, DeploymentStatus::Provisioning);
        assert_eq!(updated.updated_at, 2_000);
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let store = store();
        seed_user(&store, "u1");
        seed_project(&store, "p1", "u1");
        store.put_deployment(&deployment("d1", "p1", "u1")).unwrap();

        let err = store
            .transition_deployment("d1", DeploymentStatus::Running, 2_000)
            .unwrap_err();
        assert!(matches!(err, StateError::IllegalTransition(_)));

        // Nothing was written.
        let loaded = store.get_deployment("d1").unwrap().unwrap();
        assert_eq!(loaded.status, DeploymentStatus::Pending);
    }

    #[test]
    fn terminal_state_rejects_further_transitions() {
        let store = store();
        seed_user(&store, "u1");
        seed_project(&store, "p1", "u1");
        store.put_deployment(&deployment("d1", "p1", "u1")).unwrap();

        store
            .transition_deployment("d1", DeploymentStatus::Failed, 2_000)
            .unwrap();
        let err = store
            .transition_deployment("d1", DeploymentStatus::Provisioning, 3_000)
            .unwrap_err();
        assert!(matches!(err, StateError::IllegalTransition(_)));
    }

    #[test]
    fn destroy_clears_sandbox_id() {
        let store = store();
        seed_user(&store, "u1");
        seed_project(&store, "p1", "u1");
        let mut d = deployment("d1", "p1", "u1");
        d.sandbox_id = Some("sb1".to_string());
        store.put_deployment(&d).unwrap();

        let updated = store
            .transition_deployment("d1", DeploymentStatus::Destroyed, 2_000)
            .unwrap();
        assert_eq!(updated.sandbox_id, None);
    }

    #[test]
    fn public_url_is_immutable_after_first_set() {
        let store = store();
        seed_user(&store, "u1");
        seed_project(&store, "p1", "u1");
        store.put_deployment(&deployment("d1", "p1", "u1")).unwrap();

        let update = UpdateDeployment {
            public_url: Some("https://sb1.host:3000".to_string()),
            ..Default::default()
        };
        store.update_deployment("d1", &update, 2_000).unwrap();

        let update = UpdateDeployment {
            public_url: Some("https://other.host:3000".to_string()),
            ..Default::default()
        };
        let record = store.update_deployment("d1", &update, 3_000).unwrap();
        assert_eq!(record.public_url.as_deref(), Some("https://sb1.host:3000"));
    }

    #[test]
    fn scaling_events_are_ordered_and_paged() {
        let store = store();
        seed_user(&store, "u1");
        seed_project(&store, "p1", "u1");
        store.put_deployment(&deployment("d1", "p1", "u1")).unwrap();

        for i in 0..5u64 {
            store
                .append_scaling_event(&ScalingEvent {
                    id: format!("e{i}"),
                    deployment_id: "d1".to_string(),
                    policy_id: None,
                    kind: ScalingEventKind::ScaleUp,
                    from_instances: i as u32,
                    to_instances: i as u32 + 1,
                    reason: "load".to_string(),
                    metrics_snapshot: MetricReading::default(),
                    created_at: 1_000 + i,
                })
                .unwrap();
        }

        let events = store.list_scaling_events("d1", 10, 0).unwrap();
        assert_eq!(events.len(), 5);
        assert!(events.windows(2).all(|w| w[0].created_at <= w[1].created_at));

        let page = store.list_scaling_events("d1", 2, 2).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].created_at, 1_002);
    }

    #[test]
    fn samples_filtered_by_window_and_pruned() {
        let store = store();
        seed_user(&store, "u1");
        seed_project(&store, "p1", "u1");
        store.put_deployment(&deployment("d1", "p1", "u1")).unwrap();

        for ts in [100u64, 200, 300, 400] {
            store
                .put_sample(&ResourceSample {
                    deployment_id: "d1".to_string(),
                    timestamp: ts,
                    cpu_pct: 50.0,
                    memory_pct: 40.0,
                    network_io: 0,
                    disk_io: 0,
                    cost_per_hour: 0.05,
                })
                .unwrap();
        }

        let window = store.list_samples("d1", 150, 350).unwrap();
        assert_eq!(window.len(), 2);

        let pruned = store.prune_samples_before("d1", 300).unwrap();
        assert_eq!(pruned, 2);
        assert_eq!(store.list_samples("d1", 0, u64::MAX).unwrap().len(), 2);
    }

    #[test]
    fn delete_deployment_removes_dependents() {
        let store = store();
        seed_user(&store, "u1");
        seed_project(&store, "p1", "u1");
        store.put_deployment(&deployment("d1", "p1", "u1")).unwrap();
        store
            .put_policy(&ScalingPolicy {
                id: "pol1".to_string(),
                deployment_id: "d1".to_string(),
                thresholds: vec![],
                scale_up_threshold: 0.7,
                scale_down_threshold: 0.3,
                cooldown_secs: 300,
                min_instances: 1,
                max_instances: 5,
                enabled: true,
                created_at: 1_000,
                updated_at: 1_000,
            })
            .unwrap();

        assert!(store.delete_deployment("d1").unwrap());
        assert!(store.get_policy("d1").unwrap().is_none());
        assert!(store.get_deployment("d1").unwrap().is_none());
    }

    #[test]
    fn on_disk_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("liftoff.redb");
        {
            let store = StateStore::open(&path).unwrap();
            seed_user(&store, "u1");
        }
        let store = StateStore::open(&path).unwrap();
        assert!(store.get_user("u1").unwrap().is_some());
    }
}
