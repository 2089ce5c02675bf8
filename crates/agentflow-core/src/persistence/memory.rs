//! In-memory implementation of the persistence contract
//!
//! Used by tests and single-process runs. All collections live behind one
//! `parking_lot::RwLock`, which makes `commit` and `claim_task` trivially
//! atomic: a writer holds the lock for the whole batch or the whole
//! scan-and-flip.

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::RwLock;

use super::{IterationChanges, RuntimeStore, StoreError};
use crate::entities::{
    current_time_ms, FlowRecord, LockMeta, LockRecord, LogRecord, RunnerRecord, ServerRecord,
    TaskRecord, TaskState, WorkflowRecord,
};
use crate::states::StepState;
use crate::step::{ObjectType, StepDefinition};

#[derive(Default)]
struct Collections {
    steps: IndexMap<String, StepDefinition>,
    tasks: IndexMap<String, TaskRecord>,
    locks: IndexMap<String, LockRecord>,
    runners: IndexMap<String, RunnerRecord>,
    servers: IndexMap<String, ServerRecord>,
    flows: IndexMap<String, FlowRecord>,
    workflows: IndexMap<String, WorkflowRecord>,
    logs: Vec<LogRecord>,
}

/// In-memory store satisfying [`RuntimeStore`].
pub struct InMemoryRuntimeStore {
    inner: RwLock<Collections>,
}

impl InMemoryRuntimeStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Collections::default()),
        }
    }

    /// Number of stored steps (for tests).
    pub fn step_count(&self) -> usize {
        self.inner.read().steps.len()
    }

    /// Number of pending tasks (for tests).
    pub fn pending_task_count(&self) -> usize {
        self.inner
            .read()
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Pending)
            .count()
    }

    /// Clear all collections (for tests).
    pub fn clear(&self) {
        *self.inner.write() = Collections::default();
    }
}

impl Default for InMemoryRuntimeStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Steps are stored with the dirty flag cleared; it only tracks pending
/// writes inside an iteration.
fn normalized(step: &StepDefinition) -> StepDefinition {
    let mut step = step.clone();
    step.transition.changed = false;
    step
}

#[async_trait]
impl RuntimeStore for InMemoryRuntimeStore {
    async fn get_step(&self, step_id: &str) -> Result<Option<StepDefinition>, StoreError> {
        Ok(self.inner.read().steps.get(step_id).cloned())
    }

    async fn get_workflow_root(
        &self,
        workflow_id: &str,
    ) -> Result<Option<StepDefinition>, StoreError> {
        Ok(self
            .inner
            .read()
            .steps
            .values()
            .find(|s| {
                s.workflow_id == workflow_id
                    && s.object_type == ObjectType::Workflow
                    && s.container_id.is_none()
            })
            .cloned())
    }

    async fn get_steps_by_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<StepDefinition>, StoreError> {
        Ok(self
            .inner
            .read()
            .steps
            .values()
            .filter(|s| s.workflow_id == workflow_id)
            .cloned()
            .collect())
    }

    async fn get_steps_by_block(
        &self,
        block_id: &str,
    ) -> Result<Vec<StepDefinition>, StoreError> {
        Ok(self
            .inner
            .read()
            .steps
            .values()
            .filter(|s| s.block_id.as_deref() == Some(block_id))
            .cloned()
            .collect())
    }

    async fn get_steps_by_state(
        &self,
        state: StepState,
    ) -> Result<Vec<StepDefinition>, StoreError> {
        Ok(self
            .inner
            .read()
            .steps
            .values()
            .filter(|s| s.state == state)
            .cloned()
            .collect())
    }

    async fn get_actionable_steps_by_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<StepDefinition>, StoreError> {
        Ok(self
            .inner
            .read()
            .steps
            .values()
            .filter(|s| s.workflow_id == workflow_id && s.is_actionable())
            .cloned()
            .collect())
    }

    async fn save_step(&self, step: &StepDefinition) -> Result<(), StoreError> {
        self.inner
            .write()
            .steps
            .insert(step.id.clone(), normalized(step));
        Ok(())
    }

    async fn commit(&self, changes: &IterationChanges) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        for step in &changes.created_steps {
            inner.steps.insert(step.id.clone(), normalized(step));
        }
        for step in &changes.updated_steps {
            inner.steps.insert(step.id.clone(), normalized(step));
        }
        for task in &changes.created_tasks {
            inner.tasks.insert(task.uuid.clone(), task.clone());
        }
        for task in &changes.updated_tasks {
            inner.tasks.insert(task.uuid.clone(), task.clone());
        }
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.inner.read().tasks.get(task_id).cloned())
    }

    async fn get_task_for_step(&self, step_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self
            .inner
            .read()
            .tasks
            .values()
            .find(|t| t.step_id == step_id)
            .cloned())
    }

    async fn get_pending_tasks(&self, task_list: &str) -> Result<Vec<TaskRecord>, StoreError> {
        Ok(self
            .inner
            .read()
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Pending && t.task_list == task_list)
            .cloned()
            .collect())
    }

    async fn claim_task(
        &self,
        task_names: &[String],
        task_list: &str,
    ) -> Result<Option<TaskRecord>, StoreError> {
        let mut inner = self.inner.write();
        let claimed = inner.tasks.values_mut().find(|t| {
            t.state == TaskState::Pending
                && t.task_list == task_list
                && task_names.iter().any(|n| n == &t.name)
        });

        match claimed {
            Some(task) => {
                task.state = TaskState::Running;
                task.updated = current_time_ms();
                Ok(Some(task.clone()))
            }
            None => Ok(None),
        }
    }

    async fn save_task(&self, task: &TaskRecord) -> Result<(), StoreError> {
        self.inner
            .write()
            .tasks
            .insert(task.uuid.clone(), task.clone());
        Ok(())
    }

    async fn acquire_lock(
        &self,
        key: &str,
        ttl_ms: i64,
        meta: LockMeta,
    ) -> Result<bool, StoreError> {
        let now = current_time_ms();
        let mut inner = self.inner.write();

        if let Some(existing) = inner.locks.get(key) {
            if !existing.is_expired(now) {
                return Ok(false);
            }
        }

        inner.locks.insert(
            key.to_string(),
            LockRecord {
                key: key.to_string(),
                acquired_at: now,
                expires_at: now + ttl_ms,
                meta,
            },
        );
        Ok(true)
    }

    async fn extend_lock(&self, key: &str, ttl_ms: i64) -> Result<bool, StoreError> {
        let now = current_time_ms();
        let mut inner = self.inner.write();

        match inner.locks.get_mut(key) {
            Some(lock) if !lock.is_expired(now) => {
                lock.expires_at = now + ttl_ms;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lock(&self, key: &str) -> Result<(), StoreError> {
        self.inner.write().locks.shift_remove(key);
        Ok(())
    }

    async fn get_all_locks(&self) -> Result<Vec<LockRecord>, StoreError> {
        Ok(self.inner.read().locks.values().cloned().collect())
    }

    async fn get_runner(&self, runner_id: &str) -> Result<Option<RunnerRecord>, StoreError> {
        Ok(self.inner.read().runners.get(runner_id).cloned())
    }

    async fn save_runner(&self, runner: &RunnerRecord) -> Result<(), StoreError> {
        self.inner
            .write()
            .runners
            .insert(runner.uuid.clone(), runner.clone());
        Ok(())
    }

    async fn get_server(&self, server_id: &str) -> Result<Option<ServerRecord>, StoreError> {
        Ok(self.inner.read().servers.get(server_id).cloned())
    }

    async fn save_server(&self, server: &ServerRecord) -> Result<(), StoreError> {
        self.inner
            .write()
            .servers
            .insert(server.uuid.clone(), server.clone());
        Ok(())
    }

    async fn update_server_ping(&self, server_id: &str, now: i64) -> Result<(), StoreError> {
        if let Some(server) = self.inner.write().servers.get_mut(server_id) {
            server.ping_time = now;
        }
        Ok(())
    }

    async fn get_flow(&self, flow_id: &str) -> Result<Option<FlowRecord>, StoreError> {
        Ok(self.inner.read().flows.get(flow_id).cloned())
    }

    async fn save_flow(&self, flow: &FlowRecord) -> Result<(), StoreError> {
        self.inner
            .write()
            .flows
            .insert(flow.uuid.clone(), flow.clone());
        Ok(())
    }

    async fn get_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowRecord>, StoreError> {
        Ok(self.inner.read().workflows.get(workflow_id).cloned())
    }

    async fn save_workflow(&self, workflow: &WorkflowRecord) -> Result<(), StoreError> {
        self.inner
            .write()
            .workflows
            .insert(workflow.uuid.clone(), workflow.clone());
        Ok(())
    }

    async fn save_log(&self, log: &LogRecord) -> Result<(), StoreError> {
        self.inner.write().logs.push(log.clone());
        Ok(())
    }

    async fn get_logs_by_runner(&self, runner_id: &str) -> Result<Vec<LogRecord>, StoreError> {
        Ok(self
            .inner
            .read()
            .logs
            .iter()
            .filter(|l| l.runner_id == runner_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::value::Value;

    #[tokio::test]
    async fn test_save_and_get_step() {
        let store = InMemoryRuntimeStore::new();
        let mut step = StepDefinition::create("wf-1", ObjectType::Workflow, "Main");
        step.set_param("x", Value::Int(1));

        store.save_step(&step).await.unwrap();

        let loaded = store.get_step(&step.id).await.unwrap().unwrap();
        assert_eq!(loaded.param_values()["x"], Value::Int(1));
        // Dirty flag is reset at the persistence boundary.
        assert!(!loaded.transition.changed);
    }

    #[tokio::test]
    async fn test_workflow_root_lookup() {
        let store = InMemoryRuntimeStore::new();
        let root = StepDefinition::create("wf-1", ObjectType::Workflow, "Main");
        let child = StepDefinition::create("wf-1", ObjectType::Block, "")
            .with_container(root.id.clone());

        store.save_step(&child).await.unwrap();
        store.save_step(&root).await.unwrap();

        let found = store.get_workflow_root("wf-1").await.unwrap().unwrap();
        assert_eq!(found.id, root.id);
        assert!(store.get_workflow_root("wf-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_actionable_excludes_parked_and_terminal() {
        let store = InMemoryRuntimeStore::new();

        let created = StepDefinition::create("wf-1", ObjectType::Statement, "A");
        let mut parked = StepDefinition::create("wf-1", ObjectType::EventFacet, "Fetch");
        parked.set_state(StepState::EventTransmit);
        let mut requested = StepDefinition::create("wf-1", ObjectType::EventFacet, "Fetch");
        requested.set_state(StepState::EventTransmit);
        requested.request_state_change(true);
        let mut done = StepDefinition::create("wf-1", ObjectType::Facet, "Add");
        done.set_state(StepState::FacetComplete);

        for step in [&created, &parked, &requested, &done] {
            store.save_step(step).await.unwrap();
        }

        let actionable = store
            .get_actionable_steps_by_workflow("wf-1")
            .await
            .unwrap();
        let ids: Vec<_> = actionable.iter().map(|s| s.id.clone()).collect();
        assert!(ids.contains(&created.id));
        assert!(ids.contains(&requested.id));
        assert!(!ids.contains(&parked.id));
        assert!(!ids.contains(&done.id));
    }

    #[tokio::test]
    async fn test_commit_applies_whole_batch() {
        let store = InMemoryRuntimeStore::new();

        let mut existing = StepDefinition::create("wf-1", ObjectType::Statement, "A");
        store.save_step(&existing).await.unwrap();

        let mut prior_task = TaskRecord::new("ns.Other", "default");
        store.save_task(&prior_task).await.unwrap();

        let created = StepDefinition::create("wf-1", ObjectType::Facet, "Add");
        existing.set_state(StepState::StatementComplete);
        let task = TaskRecord::new("ns.Fetch", "default");
        prior_task.state = TaskState::Completed;

        let mut changes = IterationChanges::new();
        changes.add_created_step(created.clone());
        changes.add_updated_step(existing.clone());
        changes.add_created_task(task.clone());
        changes.add_updated_task(prior_task.clone());
        store.commit(&changes).await.unwrap();

        assert!(store.get_step(&created.id).await.unwrap().is_some());
        let reloaded = store.get_step(&existing.id).await.unwrap().unwrap();
        assert_eq!(reloaded.state, StepState::StatementComplete);
        assert!(store.get_task(&task.uuid).await.unwrap().is_some());
        let reloaded_task = store.get_task(&prior_task.uuid).await.unwrap().unwrap();
        assert_eq!(reloaded_task.state, TaskState::Completed);
    }

    #[tokio::test]
    async fn test_claim_task_matches_names_and_list() {
        let store = InMemoryRuntimeStore::new();
        let mut task = TaskRecord::new("ns.Fetch", "default");
        task.step_id = "step-1".to_string();
        store.save_task(&task).await.unwrap();

        // Wrong list, wrong names: nothing claimed.
        assert!(store
            .claim_task(&["ns.Fetch".to_string()], "other")
            .await
            .unwrap()
            .is_none());
        assert!(store
            .claim_task(&["ns.Other".to_string()], "default")
            .await
            .unwrap()
            .is_none());

        let claimed = store
            .claim_task(&["ns.Fetch".to_string()], "default")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.uuid, task.uuid);
        assert_eq!(claimed.state, TaskState::Running);

        // Already running: no second claim.
        assert!(store
            .claim_task(&["ns.Fetch".to_string()], "default")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_concurrent_claim_has_one_winner() {
        let store = Arc::new(InMemoryRuntimeStore::new());
        let task = TaskRecord::new("ns.Fetch", "default");
        store.save_task(&task).await.unwrap();

        let names = vec!["ns.Fetch".to_string()];
        let a = {
            let store = Arc::clone(&store);
            let names = names.clone();
            tokio::spawn(async move { store.claim_task(&names, "default").await.unwrap() })
        };
        let b = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.claim_task(&names, "default").await.unwrap() })
        };

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert!(a.is_some() != b.is_some(), "exactly one claim must win");
    }

    #[tokio::test]
    async fn test_lock_lifecycle() {
        let store = InMemoryRuntimeStore::new();

        assert!(store
            .acquire_lock("runner:task:t1", 60_000, LockMeta::default())
            .await
            .unwrap());
        // Second acquire fails while held.
        assert!(!store
            .acquire_lock("runner:task:t1", 60_000, LockMeta::default())
            .await
            .unwrap());
        assert!(store.extend_lock("runner:task:t1", 60_000).await.unwrap());

        store.release_lock("runner:task:t1").await.unwrap();
        assert!(!store.extend_lock("runner:task:t1", 60_000).await.unwrap());
        assert!(store
            .acquire_lock("runner:task:t1", 60_000, LockMeta::default())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_expired_lock_is_reclaimable() {
        let store = InMemoryRuntimeStore::new();

        // TTL of zero expires immediately.
        assert!(store
            .acquire_lock("runner:step:s1", 0, LockMeta::default())
            .await
            .unwrap());
        assert!(store
            .acquire_lock("runner:step:s1", 60_000, LockMeta::default())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_task_for_step() {
        let store = InMemoryRuntimeStore::new();
        let mut task = TaskRecord::new("ns.Fetch", "default");
        task.step_id = "step-7".to_string();
        store.save_task(&task).await.unwrap();

        let found = store.get_task_for_step("step-7").await.unwrap().unwrap();
        assert_eq!(found.uuid, task.uuid);
        assert!(store.get_task_for_step("step-8").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_server_ping_update() {
        let store = InMemoryRuntimeStore::new();
        let server = ServerRecord {
            uuid: "srv-1".to_string(),
            server_group: "default".to_string(),
            service_name: "afl-runner".to_string(),
            server_name: "host".to_string(),
            server_ips: vec![],
            state: crate::entities::ServerState::Running,
            start_time: 1,
            ping_time: 1,
            topics: vec![],
            handlers: vec![],
            handled: vec![],
        };
        store.save_server(&server).await.unwrap();
        store.update_server_ping("srv-1", 99).await.unwrap();

        assert_eq!(store.get_server("srv-1").await.unwrap().unwrap().ping_time, 99);
    }
}
