//! Persistence contract
//!
//! A single typed interface over steps, tasks, locks, runners, servers,
//! logs, flows and submitted workflows, satisfied by the in-memory store
//! here and by the document-store backend in `agentflow-storage`. The
//! evaluator and the worker never touch storage except through this trait.

mod memory;

pub use memory::InMemoryRuntimeStore;

use async_trait::async_trait;

use crate::entities::{
    FlowRecord, LockMeta, LockRecord, LogRecord, RunnerRecord, ServerRecord, TaskRecord,
    WorkflowRecord,
};
use crate::states::StepState;
use crate::step::StepDefinition;

/// Error type for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database or I/O error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// The set of changes produced by one evaluator iteration, applied
/// atomically by [`RuntimeStore::commit`].
#[derive(Debug, Clone, Default)]
pub struct IterationChanges {
    pub created_steps: Vec<StepDefinition>,
    pub updated_steps: Vec<StepDefinition>,
    pub created_tasks: Vec<TaskRecord>,
    pub updated_tasks: Vec<TaskRecord>,
}

impl IterationChanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_changes(&self) -> bool {
        !self.created_steps.is_empty()
            || !self.updated_steps.is_empty()
            || !self.created_tasks.is_empty()
            || !self.updated_tasks.is_empty()
    }

    pub fn add_created_step(&mut self, step: StepDefinition) {
        self.created_steps.push(step);
    }

    /// Add or replace an updated step by id.
    pub fn add_updated_step(&mut self, step: StepDefinition) {
        if let Some(existing) = self.updated_steps.iter_mut().find(|s| s.id == step.id) {
            *existing = step;
        } else {
            self.updated_steps.push(step);
        }
    }

    pub fn add_created_task(&mut self, task: TaskRecord) {
        self.created_tasks.push(task);
    }

    pub fn add_updated_task(&mut self, task: TaskRecord) {
        if let Some(existing) = self.updated_tasks.iter_mut().find(|t| t.uuid == task.uuid) {
            *existing = task;
        } else {
            self.updated_tasks.push(task);
        }
    }

    /// Find a pending step by id, preferring the most recent write.
    pub fn find_step(&self, step_id: &str) -> Option<&StepDefinition> {
        self.updated_steps
            .iter()
            .find(|s| s.id == step_id)
            .or_else(|| self.created_steps.iter().find(|s| s.id == step_id))
    }

    pub fn clear(&mut self) {
        self.created_steps.clear();
        self.updated_steps.clear();
        self.created_tasks.clear();
        self.updated_tasks.clear();
    }
}

/// Typed store of steps, tasks, locks, servers, runners, flows and logs.
///
/// Implementations must be thread-safe. Collection reads return records in
/// creation order. The step `transition.changed` dirty flag is reset at the
/// persistence boundary: saved and committed steps are stored clean.
#[async_trait]
pub trait RuntimeStore: Send + Sync {
    // =========================================================================
    // Steps
    // =========================================================================

    async fn get_step(&self, step_id: &str) -> Result<Option<StepDefinition>, StoreError>;

    /// The distinguished root step of a workflow (no container,
    /// `object_type = workflow`).
    async fn get_workflow_root(
        &self,
        workflow_id: &str,
    ) -> Result<Option<StepDefinition>, StoreError>;

    async fn get_steps_by_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<StepDefinition>, StoreError>;

    async fn get_steps_by_block(&self, block_id: &str)
        -> Result<Vec<StepDefinition>, StoreError>;

    async fn get_steps_by_state(&self, state: StepState)
        -> Result<Vec<StepDefinition>, StoreError>;

    /// Every non-terminal step except event-parked ones without a pending
    /// transition request.
    async fn get_actionable_steps_by_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<StepDefinition>, StoreError>;

    async fn save_step(&self, step: &StepDefinition) -> Result<(), StoreError>;

    /// Apply one iteration's changes atomically: readers after the commit
    /// see every change in the batch or none of them.
    async fn commit(&self, changes: &IterationChanges) -> Result<(), StoreError>;

    // =========================================================================
    // Task queue
    // =========================================================================

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError>;

    async fn get_task_for_step(&self, step_id: &str) -> Result<Option<TaskRecord>, StoreError>;

    async fn get_pending_tasks(&self, task_list: &str) -> Result<Vec<TaskRecord>, StoreError>;

    /// Atomically select one pending task matching the task list and name
    /// set, flip it to running, and return it. Returns `None` when nothing
    /// matches; concurrent callers never claim the same task.
    async fn claim_task(
        &self,
        task_names: &[String],
        task_list: &str,
    ) -> Result<Option<TaskRecord>, StoreError>;

    async fn save_task(&self, task: &TaskRecord) -> Result<(), StoreError>;

    // =========================================================================
    // Locks
    // =========================================================================

    /// Succeeds iff no lock exists for `key` or the existing one has
    /// expired; on success records `expires_at = now + ttl_ms`.
    async fn acquire_lock(
        &self,
        key: &str,
        ttl_ms: i64,
        meta: LockMeta,
    ) -> Result<bool, StoreError>;

    /// Succeeds only while a non-expired lock for `key` still exists.
    async fn extend_lock(&self, key: &str, ttl_ms: i64) -> Result<bool, StoreError>;

    /// Removes the lock unconditionally (idempotent).
    async fn release_lock(&self, key: &str) -> Result<(), StoreError>;

    async fn get_all_locks(&self) -> Result<Vec<LockRecord>, StoreError>;

    // =========================================================================
    // Runners, servers, flows, workflows, logs
    // =========================================================================

    async fn get_runner(&self, runner_id: &str) -> Result<Option<RunnerRecord>, StoreError>;

    async fn save_runner(&self, runner: &RunnerRecord) -> Result<(), StoreError>;

    async fn get_server(&self, server_id: &str) -> Result<Option<ServerRecord>, StoreError>;

    async fn save_server(&self, server: &ServerRecord) -> Result<(), StoreError>;

    async fn update_server_ping(&self, server_id: &str, now: i64) -> Result<(), StoreError>;

    async fn get_flow(&self, flow_id: &str) -> Result<Option<FlowRecord>, StoreError>;

    async fn save_flow(&self, flow: &FlowRecord) -> Result<(), StoreError>;

    async fn get_workflow(&self, workflow_id: &str)
        -> Result<Option<WorkflowRecord>, StoreError>;

    async fn save_workflow(&self, workflow: &WorkflowRecord) -> Result<(), StoreError>;

    async fn save_log(&self, log: &LogRecord) -> Result<(), StoreError>;

    async fn get_logs_by_runner(&self, runner_id: &str) -> Result<Vec<LogRecord>, StoreError>;
}
