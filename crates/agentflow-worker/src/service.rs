//! Worker service
//!
//! The poll/lock/dispatch/resume loop. Each cycle claims event tasks,
//! `afl:resume` tasks, and pending built-in tasks (capacity permitting),
//! takes a distributed lock per work item, dispatches to the handler
//! registry, and resumes the paused workflow through the evaluator.
//! Multiple worker processes coordinate solely through the persistence
//! store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use agentflow_core::ast::{Program, WorkflowDecl};
use agentflow_core::entities::{
    current_time_ms, HandledCount, LockMeta, ServerRecord, ServerState, TaskRecord, TaskState,
    EXECUTE_TASK_NAME, RESUME_TASK_NAME,
};
use agentflow_core::evaluator::{Evaluator, ExecutionStatus};
use agentflow_core::persistence::{RuntimeStore, StoreError};
use agentflow_core::registry::HandlerRegistry;
use agentflow_core::states::StepState;
use agentflow_core::step::{generate_id, StepDefinition};
use agentflow_core::value::{Value, ValueMap};
use agentflow_core::RunnerState;

use crate::config::WorkerConfig;
use crate::http;

/// Worker service errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// I/O error
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// No free port for the status server
    #[error("could not bind status port in range {start}..{end}")]
    PortScan { start: u16, end: u16 },

    /// Worker already running
    #[error("worker is already running")]
    AlreadyRunning,
}

/// A workflow AST cached for resume, keyed by workflow id.
#[derive(Clone)]
struct CachedWorkflow {
    workflow: WorkflowDecl,
    program: Program,
}

enum TaskKind {
    Event,
    Resume,
    Builtin,
}

/// Distributed worker service.
///
/// # Example
///
/// ```ignore
/// let service = Arc::new(WorkerService::new(store, evaluator, registry, config));
/// service.start().await?;   // blocks until service.stop()
/// ```
pub struct WorkerService {
    store: Arc<dyn RuntimeStore>,
    evaluator: Arc<Evaluator>,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
    server_id: String,
    running: AtomicBool,
    start_time_ms: AtomicI64,
    handled_counts: Mutex<HashMap<String, HandledCount>>,
    ast_cache: Mutex<HashMap<String, CachedWorkflow>>,
    pool: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    http_port: Mutex<Option<u16>>,
}

impl WorkerService {
    pub fn new(
        store: Arc<dyn RuntimeStore>,
        evaluator: Arc<Evaluator>,
        registry: Arc<HandlerRegistry>,
        config: WorkerConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            store,
            evaluator,
            registry,
            pool: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
            server_id: generate_id(),
            running: AtomicBool::new(false),
            start_time_ms: AtomicI64::new(0),
            handled_counts: Mutex::new(HashMap::new()),
            ast_cache: Mutex::new(HashMap::new()),
            shutdown_tx,
            shutdown_rx,
            http_port: Mutex::new(None),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Port the HTTP status server bound to, once running.
    pub fn http_port(&self) -> Option<u16> {
        *self.http_port.lock()
    }

    /// Work items currently in flight.
    pub fn active_count(&self) -> usize {
        self.config.max_concurrent - self.pool.available_permits()
    }

    /// Pre-cache a workflow AST for use during processing.
    pub fn cache_workflow_ast(&self, workflow_id: &str, workflow: WorkflowDecl, program: Program) {
        self.ast_cache
            .lock()
            .insert(workflow_id.to_string(), CachedWorkflow { workflow, program });
    }

    /// Status payload served on `GET /status`.
    pub fn status_snapshot(&self) -> serde_json::Value {
        let uptime_ms = match self.start_time_ms.load(Ordering::SeqCst) {
            0 => 0,
            start => current_time_ms() - start,
        };
        let handled: serde_json::Map<String, serde_json::Value> = self
            .handled_counts
            .lock()
            .values()
            .map(|count| {
                (
                    count.handler.clone(),
                    serde_json::json!({
                        "handled": count.handled,
                        "not_handled": count.not_handled,
                    }),
                )
            })
            .collect();

        serde_json::json!({
            "server_id": self.server_id,
            "running": self.is_running(),
            "uptime_ms": uptime_ms,
            "handled": handled,
            "active_work_items": self.active_count(),
            "config": {
                "server_group": self.config.server_group,
                "service_name": self.config.service_name,
                "server_name": self.config.server_name,
                "topics": self.config.topics,
                "max_concurrent": self.config.max_concurrent,
                "poll_interval_ms": self.config.poll_interval_ms,
            },
        })
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start the service: status port, server registration, heartbeat,
    /// then the poll loop. Blocks until [`stop`](Self::stop).
    pub async fn start(self: &Arc<Self>) -> Result<(), WorkerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(WorkerError::AlreadyRunning);
        }
        self.start_time_ms.store(current_time_ms(), Ordering::SeqCst);

        let (http_handle, port) = http::start_status_server(
            Arc::clone(self),
            self.config.http_port,
            self.config.http_max_port_attempts,
        )
        .await?;
        *self.http_port.lock() = Some(port);

        self.register_server().await?;
        info!(
            server_id = %self.server_id,
            server_name = %self.config.server_name,
            server_group = %self.config.server_group,
            http_port = port,
            "worker started"
        );

        self.spawn_heartbeat();

        // Main poll loop.
        let mut shutdown_rx = self.shutdown_rx.clone();
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            if let Err(e) = self.poll_cycle(true).await {
                error!(error = %e, "poll cycle error");
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown_rx.changed() => break,
            }
        }

        // Shutdown: stop HTTP, drain the pool, deregister.
        http_handle.abort();
        self.drain_pool().await;
        if let Err(e) = self.deregister_server().await {
            error!(error = %e, "error deregistering server");
        }
        self.running.store(false, Ordering::SeqCst);
        info!(server_id = %self.server_id, "worker stopped");
        Ok(())
    }

    /// Signal the service to stop gracefully; in-flight work runs to
    /// completion but no new work is claimed.
    pub fn stop(&self) {
        info!(server_id = %self.server_id, "worker stopping");
        let _ = self.shutdown_tx.send(true);
    }

    /// Run a single poll cycle inline (for tests and embedders). Returns
    /// the number of work items dispatched.
    pub async fn run_once(self: &Arc<Self>) -> Result<usize, WorkerError> {
        self.poll_cycle(false).await
    }

    async fn drain_pool(&self) {
        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(self.config.shutdown_timeout_ms);
        loop {
            if self.pool.available_permits() == self.config.max_concurrent {
                debug!("all work items completed");
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining = self.active_count(),
                    "shutdown drain timeout reached"
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    // =========================================================================
    // Server registration and heartbeat
    // =========================================================================

    async fn register_server(&self) -> Result<(), WorkerError> {
        let now = current_time_ms();
        let mut handlers = self.registry.handler_names();
        handlers.push(EXECUTE_TASK_NAME.to_string());
        handlers.sort();

        let server = ServerRecord {
            uuid: self.server_id.clone(),
            server_group: self.config.server_group.clone(),
            service_name: self.config.service_name.clone(),
            server_name: self.config.server_name.clone(),
            server_ips: self.server_ips().await,
            state: ServerState::Running,
            start_time: now,
            ping_time: now,
            topics: self.config.topics.clone(),
            handlers,
            handled: Vec::new(),
        };
        self.store.save_server(&server).await?;
        Ok(())
    }

    async fn deregister_server(&self) -> Result<(), WorkerError> {
        if let Some(mut server) = self.store.get_server(&self.server_id).await? {
            server.state = ServerState::Shutdown;
            server.ping_time = current_time_ms();
            self.store.save_server(&server).await?;
        }
        Ok(())
    }

    async fn server_ips(&self) -> Vec<String> {
        let host = format!("{}:0", self.config.server_name);
        match tokio::net::lookup_host(host).await {
            Ok(addrs) => {
                let mut ips: Vec<String> = addrs.map(|a| a.ip().to_string()).collect();
                ips.sort();
                ips.dedup();
                ips
            }
            Err(_) => Vec::new(),
        }
    }

    fn spawn_heartbeat(&self) {
        let store = Arc::clone(&self.store);
        let server_id = self.server_id.clone();
        let interval = Duration::from_millis(self.config.heartbeat_interval_ms);
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = store.update_server_ping(&server_id, current_time_ms()).await {
                            error!(error = %e, "heartbeat failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("heartbeat loop: shutdown requested");
                        break;
                    }
                }
            }
        });
    }

    // =========================================================================
    // Poll cycle
    // =========================================================================

    /// Event names this worker claims: the configured topics, or every
    /// registered handler.
    fn event_names(&self) -> Vec<String> {
        if !self.config.topics.is_empty() {
            return self.config.topics.clone();
        }
        self.registry
            .handler_names()
            .into_iter()
            .filter(|name| name != EXECUTE_TASK_NAME && name != RESUME_TASK_NAME)
            .collect()
    }

    async fn poll_cycle(self: &Arc<Self>, spawn: bool) -> Result<usize, WorkerError> {
        let mut dispatched = 0usize;
        let mut capacity = self.pool.available_permits();
        if capacity == 0 {
            return Ok(0);
        }

        // Event tasks claimed from the queue.
        let event_names = self.event_names();
        if !event_names.is_empty() {
            while capacity > 0 {
                let Some(task) = self
                    .store
                    .claim_task(&event_names, &self.config.task_list)
                    .await?
                else {
                    break;
                };
                if self.submit_task(task, TaskKind::Event, spawn).await? {
                    capacity -= 1;
                    dispatched += 1;
                }
            }
        }

        // Resume tasks inserted by external agents.
        let resume_names = vec![RESUME_TASK_NAME.to_string()];
        while capacity > 0 {
            let Some(task) = self
                .store
                .claim_task(&resume_names, &self.config.task_list)
                .await?
            else {
                break;
            };
            if self.submit_task(task, TaskKind::Resume, spawn).await? {
                capacity -= 1;
                dispatched += 1;
            }
        }

        // Pending built-in tasks (afl:execute). These are not claimed
        // atomically; the per-task lock provides the exclusion and the
        // processor flips them to running.
        let pending = self
            .store
            .get_pending_tasks(&self.config.task_list)
            .await?;
        for task in pending {
            if capacity == 0 {
                break;
            }
            if task.name != EXECUTE_TASK_NAME {
                continue;
            }
            if !self.try_lock_task(&task).await? {
                continue;
            }
            if self
                .submit_locked_task(task, TaskKind::Builtin, spawn)
                .await
            {
                capacity -= 1;
                dispatched += 1;
            }
        }

        Ok(dispatched)
    }

    /// Lock and submit a task claimed from the queue. A task whose lock is
    /// unexpectedly held elsewhere is returned to pending for another
    /// worker.
    async fn submit_task(
        self: &Arc<Self>,
        task: TaskRecord,
        kind: TaskKind,
        spawn: bool,
    ) -> Result<bool, WorkerError> {
        if !self.try_lock_task(&task).await? {
            warn!(task = %task.uuid, "claimed task is locked elsewhere, requeueing");
            let mut task = task;
            task.state = TaskState::Pending;
            task.updated = current_time_ms();
            self.store.save_task(&task).await?;
            return Ok(false);
        }
        Ok(self.submit_locked_task(task, kind, spawn).await)
    }

    /// Submit a task whose lock is already held.
    async fn submit_locked_task(
        self: &Arc<Self>,
        task: TaskRecord,
        kind: TaskKind,
        spawn: bool,
    ) -> bool {
        let Ok(permit) = Arc::clone(&self.pool).try_acquire_owned() else {
            debug!("no pool permits available");
            let key = task_lock_key(&task);
            if let Err(e) = self.store.release_lock(&key).await {
                warn!(error = %e, "failed to release task lock");
            }
            return false;
        };

        let service = Arc::clone(self);
        if spawn {
            tokio::spawn(async move { service.run_task_unit(task, kind, permit).await });
        } else {
            service.run_task_unit(task, kind, permit).await;
        }
        true
    }

    /// Run one task under its lock, extending it until the work finishes
    /// and always releasing on exit.
    async fn run_task_unit(
        self: Arc<Self>,
        task: TaskRecord,
        kind: TaskKind,
        permit: OwnedSemaphorePermit,
    ) {
        let lock_key = task_lock_key(&task);
        let extender = self.spawn_lock_extender(lock_key.clone());

        match kind {
            TaskKind::Event => self.process_event_task(task).await,
            TaskKind::Resume => self.process_resume_task(task).await,
            TaskKind::Builtin => self.process_builtin_task(task).await,
        }

        extender.finish().await;
        if let Err(e) = self.store.release_lock(&lock_key).await {
            warn!(error = %e, "failed to release task lock");
        }
        drop(permit);
    }

    // =========================================================================
    // Locking
    // =========================================================================

    async fn try_lock_task(&self, task: &TaskRecord) -> Result<bool, WorkerError> {
        let meta = LockMeta {
            topic: task.name.clone(),
            handler: task.name.clone(),
            step_name: task.name.clone(),
            step_id: task.step_id.clone(),
        };
        Ok(self
            .store
            .acquire_lock(&task_lock_key(task), self.config.lock_duration_ms, meta)
            .await?)
    }

    async fn try_lock_step(&self, step: &StepDefinition) -> Result<bool, WorkerError> {
        let meta = LockMeta {
            topic: step.facet_name.clone(),
            handler: step.facet_name.clone(),
            step_name: step.facet_name.clone(),
            step_id: step.id.clone(),
        };
        Ok(self
            .store
            .acquire_lock(&step_lock_key(step), self.config.lock_duration_ms, meta)
            .await?)
    }

    fn spawn_lock_extender(&self, lock_key: String) -> LockExtender {
        let store = Arc::clone(&self.store);
        let interval = Duration::from_millis(self.config.lock_extend_interval_ms);
        let duration = self.config.lock_duration_ms;
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match store.extend_lock(&lock_key, duration).await {
                            Ok(true) => {}
                            Ok(false) => {
                                warn!(lock_key = %lock_key, "failed to extend lock");
                                break;
                            }
                            Err(e) => {
                                error!(lock_key = %lock_key, error = %e, "error extending lock");
                                break;
                            }
                        }
                    }
                    _ = stop_rx.changed() => break,
                }
            }
        });

        LockExtender { stop_tx, handle }
    }

    // =========================================================================
    // Event task processing
    // =========================================================================

    /// Dispatch a claimed event task: handler, `continue_step`, resume,
    /// then the task's terminal state.
    async fn process_event_task(&self, mut task: TaskRecord) {
        let payload = task.data.clone().unwrap_or_default();

        match self.registry.handle(&task.name, payload).await {
            Ok(Some(result)) => {
                if let Err(e) = self.evaluator.continue_step(&task.step_id, &result).await {
                    self.fail_event_task(&mut task, e.to_string()).await;
                    return;
                }
                if let Err(e) = self
                    .resume_workflow(&task.workflow_id, Some(&task.step_id))
                    .await
                {
                    warn!(task = %task.uuid, error = %e, "resume after event task failed");
                }
                task.state = TaskState::Completed;
                task.updated = current_time_ms();
                self.save_task_logged(&task).await;
                self.update_handled_stats(&task.name, true).await;
                info!(
                    task = %task.uuid,
                    name = %task.name,
                    step_id = %task.step_id,
                    "processed event task"
                );
            }
            Ok(None) => {
                let message = format!("no handler for event task '{}'", task.name);
                self.fail_event_task(&mut task, message).await;
            }
            Err(message) => {
                self.fail_event_task(&mut task, message).await;
            }
        }
    }

    /// A claimed event task must be resolved: fail the parked step to
    /// unblock the workflow, then fail the task.
    async fn fail_event_task(&self, task: &mut TaskRecord, message: String) {
        if let Err(e) = self.evaluator.fail_step(&task.step_id, &message).await {
            debug!(step_id = %task.step_id, error = %e, "could not fail step");
        }
        task.state = TaskState::Failed;
        task.set_error_message(message.clone());
        task.updated = current_time_ms();
        self.save_task_logged(task).await;
        self.update_handled_stats(&task.name, false).await;
        warn!(task = %task.uuid, name = %task.name, error = %message, "event task failed");
    }

    // =========================================================================
    // Resume task processing
    // =========================================================================

    /// An `afl:resume` task: an external agent already wrote the step's
    /// return attributes; validate and advance through `continue_step`
    /// with an empty result, then resume.
    async fn process_resume_task(&self, mut task: TaskRecord) {
        let data = task.data.clone().unwrap_or_default();
        let step_id = string_field(&data, "step_id")
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| task.step_id.clone());
        let workflow_id = string_field(&data, "workflow_id")
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| task.workflow_id.clone());

        if step_id.is_empty() {
            task.state = TaskState::Failed;
            task.set_error_message("resume task missing step_id");
            task.updated = current_time_ms();
            self.save_task_logged(&task).await;
            self.update_handled_stats(RESUME_TASK_NAME, false).await;
            return;
        }

        if let Err(e) = self.evaluator.continue_step(&step_id, &ValueMap::new()).await {
            task.state = TaskState::Failed;
            task.set_error_message(e.to_string());
            task.updated = current_time_ms();
            self.save_task_logged(&task).await;
            self.update_handled_stats(RESUME_TASK_NAME, false).await;
            warn!(task = %task.uuid, step_id = %step_id, error = %e, "resume task failed");
            return;
        }

        if let Err(e) = self.resume_workflow(&workflow_id, Some(&step_id)).await {
            warn!(task = %task.uuid, error = %e, "resume after external continue failed");
        }

        task.state = TaskState::Completed;
        task.updated = current_time_ms();
        self.save_task_logged(&task).await;
        self.update_handled_stats(RESUME_TASK_NAME, true).await;
        info!(
            task = %task.uuid,
            step_id = %step_id,
            workflow_id = %workflow_id,
            "processed resume task"
        );
    }

    // =========================================================================
    // Built-in task processing
    // =========================================================================

    async fn process_builtin_task(&self, mut task: TaskRecord) {
        task.state = TaskState::Running;
        task.updated = current_time_ms();
        self.save_task_logged(&task).await;

        let payload = task.data.clone().unwrap_or_default();

        let outcome = if task.name == EXECUTE_TASK_NAME {
            self.handle_execute(payload).await
        } else {
            Err(format!("no handler for task '{}'", task.name))
        };

        match outcome {
            Ok(result) => {
                task.state = TaskState::Completed;
                task.data = Some(result);
            }
            Err(message) => {
                task.state = TaskState::Failed;
                task.set_error_message(message);
            }
        }
        task.updated = current_time_ms();
        self.save_task_logged(&task).await;
        info!(task = %task.uuid, name = %task.name, state = ?task.state, "processed task");
    }

    /// Built-in `afl:execute`: load the flow from persistence, locate the
    /// workflow AST, and execute with the submitted runner and workflow
    /// ids so external records line up.
    async fn handle_execute(&self, payload: ValueMap) -> Result<ValueMap, String> {
        let runner_id = string_field(&payload, "runner_id").unwrap_or_default();

        let mut runner = if runner_id.is_empty() {
            None
        } else {
            self.store
                .get_runner(&runner_id)
                .await
                .map_err(|e| e.to_string())?
        };

        if let Some(runner) = runner.as_mut() {
            runner.state = RunnerState::Running;
            runner.start_time = current_time_ms();
            self.store
                .save_runner(runner)
                .await
                .map_err(|e| e.to_string())?;
        }

        match self.execute_flow(&payload, &runner_id).await {
            Ok(result) => {
                if let Some(runner) = runner.as_mut() {
                    runner.workflow_id = result.workflow_id.clone();
                    match result.status {
                        ExecutionStatus::Completed => {
                            runner.state = RunnerState::Completed;
                            runner.end_time = current_time_ms();
                            runner.duration = runner.end_time - runner.start_time;
                        }
                        ExecutionStatus::Paused => {
                            runner.state = RunnerState::Running;
                        }
                        ExecutionStatus::Error | ExecutionStatus::Timeout => {
                            runner.state = RunnerState::Failed;
                            runner.end_time = current_time_ms();
                            runner.duration = runner.end_time - runner.start_time;
                        }
                    }
                    self.store
                        .save_runner(runner)
                        .await
                        .map_err(|e| e.to_string())?;
                }

                let mut out = ValueMap::new();
                out.insert("status".to_string(), Value::from(result.status.to_string()));
                out.insert(
                    "workflow_id".to_string(),
                    Value::from(result.workflow_id),
                );
                Ok(out)
            }
            Err(message) => {
                if let Some(runner) = runner.as_mut() {
                    runner.state = RunnerState::Failed;
                    runner.end_time = current_time_ms();
                    runner.duration = runner.end_time - runner.start_time;
                    if let Err(e) = self.store.save_runner(runner).await {
                        warn!(error = %e, "failed to record runner failure");
                    }
                }
                Err(message)
            }
        }
    }

    async fn execute_flow(
        &self,
        payload: &ValueMap,
        runner_id: &str,
    ) -> Result<agentflow_core::ExecutionResult, String> {
        let flow_id = string_field(payload, "flow_id").unwrap_or_default();
        let submitted_workflow_id = string_field(payload, "workflow_id").unwrap_or_default();
        let workflow_name = string_field(payload, "workflow_name").unwrap_or_default();
        let inputs = payload
            .get("inputs")
            .and_then(|v| v.as_map())
            .cloned()
            .unwrap_or_default();

        let flow = self
            .store
            .get_flow(&flow_id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("flow '{flow_id}' not found"))?;

        let program = Program::from_source(&flow.source)
            .map_err(|e| format!("flow '{flow_id}' source is not a valid program: {e}"))?;
        let workflow = program
            .find_workflow(&workflow_name)
            .ok_or_else(|| format!("workflow '{workflow_name}' not found in flow '{flow_id}'"))?
            .clone();

        let result = self
            .evaluator
            .execute(
                &workflow,
                &inputs,
                Some(&program),
                runner_id,
                &submitted_workflow_id,
            )
            .await
            .map_err(|e| e.to_string())?;

        self.cache_workflow_ast(&result.workflow_id, workflow, program);
        Ok(result)
    }

    // =========================================================================
    // Event step processing
    // =========================================================================

    /// Process one event-parked step directly: lock it, dispatch the
    /// registry with the step's params, continue and resume. Returns
    /// whether the step was handled. Steps without a handler stay parked
    /// for another server.
    pub async fn process_event_step(&self, step: &StepDefinition) -> Result<bool, WorkerError> {
        if !self.try_lock_step(step).await? {
            debug!(step_id = %step.id, "step is locked elsewhere");
            return Ok(false);
        }

        let lock_key = step_lock_key(step);
        let extender = self.spawn_lock_extender(lock_key.clone());

        let payload = step.param_values();
        let handled = match self.registry.handle(&step.facet_name, payload).await {
            Ok(Some(result)) => match self.evaluator.continue_step(&step.id, &result).await {
                Ok(()) => {
                    if let Err(e) = self
                        .resume_workflow(&step.workflow_id, Some(&step.id))
                        .await
                    {
                        warn!(step_id = %step.id, error = %e, "resume after event step failed");
                    }
                    self.update_handled_stats(&step.facet_name, true).await;
                    info!(step_id = %step.id, facet = %step.facet_name, "processed step");
                    true
                }
                Err(e) => {
                    self.update_handled_stats(&step.facet_name, false).await;
                    warn!(step_id = %step.id, error = %e, "continue_step failed");
                    false
                }
            },
            Ok(None) => {
                // No handler here: the step stays parked; another server
                // may claim it after the lock expires.
                self.update_handled_stats(&step.facet_name, false).await;
                warn!(
                    step_id = %step.id,
                    facet = %step.facet_name,
                    "no handler for facet"
                );
                false
            }
            Err(message) => {
                self.update_handled_stats(&step.facet_name, false).await;
                warn!(step_id = %step.id, error = %message, "error processing step");
                false
            }
        };

        extender.finish().await;
        if let Err(e) = self.store.release_lock(&lock_key).await {
            warn!(error = %e, "failed to release step lock");
        }
        Ok(handled)
    }

    /// Find event-parked steps this worker can serve (by topic and handler
    /// availability) and process them inline. Returns the number handled.
    pub async fn run_event_steps_once(&self) -> Result<usize, WorkerError> {
        let mut steps = self
            .store
            .get_steps_by_state(StepState::EventTransmit)
            .await?;

        if !self.config.topics.is_empty() {
            steps.retain(|s| {
                self.config.topics.iter().any(|t| {
                    t == &s.facet_name || t == short_name(&s.facet_name)
                })
            });
        }
        steps.retain(|s| self.registry.has_handler(&s.facet_name));

        let mut handled = 0;
        for step in steps {
            if self.process_event_step(&step).await? {
                handled += 1;
            }
        }
        Ok(handled)
    }

    // =========================================================================
    // Workflow resume
    // =========================================================================

    /// Resume a paused workflow after a continuation, preferring the
    /// scoped `resume_step` walk. Loads and caches the AST from the flow
    /// record when this worker did not run the original execute.
    async fn resume_workflow(
        &self,
        workflow_id: &str,
        continued_step: Option<&str>,
    ) -> Result<(), WorkerError> {
        let cached = self.ast_cache.lock().get(workflow_id).cloned();
        let cached = match cached {
            Some(cached) => Some(cached),
            None => self.load_workflow_ast(workflow_id).await,
        };

        let Some(cached) = cached else {
            warn!(workflow_id = %workflow_id, "no AST available, skipping resume");
            return Ok(());
        };

        match continued_step {
            Some(step_id) => {
                self.evaluator
                    .resume_step(
                        workflow_id,
                        step_id,
                        &cached.workflow,
                        Some(&cached.program),
                        "",
                    )
                    .await?;
            }
            None => {
                self.evaluator
                    .resume(
                        workflow_id,
                        &cached.workflow,
                        Some(&cached.program),
                        &ValueMap::new(),
                        "",
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Re-derive the workflow AST from the submitted workflow record and
    /// its flow source. Required because the worker handling a
    /// continuation may not be the worker that ran `execute`.
    async fn load_workflow_ast(&self, workflow_id: &str) -> Option<CachedWorkflow> {
        let record = match self.store.get_workflow(workflow_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                debug!(workflow_id = %workflow_id, error = %e, "workflow lookup failed");
                return None;
            }
        };
        let flow = match self.store.get_flow(&record.flow_id).await {
            Ok(Some(flow)) => flow,
            _ => return None,
        };
        let program = Program::from_source(&flow.source).ok()?;
        let workflow = program.find_workflow(&record.name)?.clone();

        let cached = CachedWorkflow { workflow, program };
        self.ast_cache
            .lock()
            .insert(workflow_id.to_string(), cached.clone());
        Some(cached)
    }

    // =========================================================================
    // Stats
    // =========================================================================

    async fn update_handled_stats(&self, handler_name: &str, handled: bool) {
        let counts: Vec<HandledCount> = {
            let mut map = self.handled_counts.lock();
            let entry = map
                .entry(handler_name.to_string())
                .or_insert_with(|| HandledCount {
                    handler: handler_name.to_string(),
                    handled: 0,
                    not_handled: 0,
                });
            if handled {
                entry.handled += 1;
            } else {
                entry.not_handled += 1;
            }
            map.values().cloned().collect()
        };

        if let Ok(Some(mut server)) = self.store.get_server(&self.server_id).await {
            server.handled = counts;
            if let Err(e) = self.store.save_server(&server).await {
                debug!(error = %e, "failed to update handled stats");
            }
        }
    }

    async fn save_task_logged(&self, task: &TaskRecord) {
        if let Err(e) = self.store.save_task(task).await {
            error!(task = %task.uuid, error = %e, "failed to save task");
        }
    }
}

/// Background lock-extension tick tied to one work item.
struct LockExtender {
    stop_tx: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

impl LockExtender {
    async fn finish(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.handle.await;
    }
}

fn task_lock_key(task: &TaskRecord) -> String {
    format!("runner:task:{}", task.uuid)
}

fn step_lock_key(step: &StepDefinition) -> String {
    format!("runner:step:{}", step.id)
}

fn short_name(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

fn string_field(map: &ValueMap, key: &str) -> Option<String> {
    map.get(key).and_then(|v| v.as_str()).map(str::to_string)
}
