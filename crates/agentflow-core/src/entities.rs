//! Persisted records beyond steps: tasks, locks, runners, servers, logs,
//! flows and submitted workflows.

use serde::{Deserialize, Serialize};

use crate::step::generate_id;
use crate::value::ValueMap;

/// Task name for the built-in workflow-execution handler.
pub const EXECUTE_TASK_NAME: &str = "afl:execute";

/// Task name inserted by external agents after writing step returns directly.
pub const RESUME_TASK_NAME: &str = "afl:resume";

/// Current time in epoch milliseconds.
pub fn current_time_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Task queue states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
}

/// A queued unit of external work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub uuid: String,
    /// `afl:execute`, `afl:resume`, or a qualified event-facet name.
    pub name: String,
    pub state: TaskState,
    #[serde(default)]
    pub runner_id: String,
    #[serde(default)]
    pub workflow_id: String,
    #[serde(default)]
    pub flow_id: String,
    #[serde(default)]
    pub step_id: String,
    /// Queue partition; serialized as `task_list_name` on the wire.
    #[serde(rename = "task_list_name")]
    pub task_list: String,
    /// Payload shape tag, e.g. `event` or `execute`.
    #[serde(default)]
    pub data_type: String,
    pub created: i64,
    pub updated: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ValueMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ValueMap>,
}

impl TaskRecord {
    pub fn new(name: impl Into<String>, task_list: impl Into<String>) -> Self {
        let now = current_time_ms();
        Self {
            uuid: generate_id(),
            name: name.into(),
            state: TaskState::Pending,
            runner_id: String::new(),
            workflow_id: String::new(),
            flow_id: String::new(),
            step_id: String::new(),
            task_list: task_list.into(),
            data_type: String::new(),
            created: now,
            updated: now,
            data: None,
            error: None,
        }
    }

    /// Record a failure message in the task's error map.
    pub fn set_error_message(&mut self, message: impl Into<String>) {
        let mut error = ValueMap::new();
        error.insert("message".to_string(), message.into().into());
        self.error = Some(error);
    }
}

/// Metadata attached to a lock for observability.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LockMeta {
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub handler: String,
    #[serde(default)]
    pub step_name: String,
    #[serde(default)]
    pub step_id: String,
}

/// A TTL-bounded mutual-exclusion record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub key: String,
    pub acquired_at: i64,
    pub expires_at: i64,
    #[serde(default)]
    pub meta: LockMeta,
}

impl LockRecord {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }
}

/// Runner (one submitted execution) states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

/// One submitted execution of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerRecord {
    pub uuid: String,
    /// Rewritten by the evaluator once execution begins.
    #[serde(default)]
    pub workflow_id: String,
    pub state: RunnerState,
    #[serde(default)]
    pub start_time: i64,
    #[serde(default)]
    pub end_time: i64,
    #[serde(default)]
    pub duration: i64,
    #[serde(default)]
    pub parameters: ValueMap,
}

impl RunnerRecord {
    pub fn new() -> Self {
        Self {
            uuid: generate_id(),
            workflow_id: String::new(),
            state: RunnerState::Pending,
            start_time: 0,
            end_time: 0,
            duration: 0,
            parameters: ValueMap::new(),
        }
    }
}

impl Default for RunnerRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// Worker server states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Running,
    Shutdown,
}

/// Per-handler dispatch statistics on a server record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandledCount {
    pub handler: String,
    #[serde(default)]
    pub handled: u64,
    #[serde(default)]
    pub not_handled: u64,
}

/// A worker's self-registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub uuid: String,
    pub server_group: String,
    pub service_name: String,
    pub server_name: String,
    #[serde(default)]
    pub server_ips: Vec<String>,
    pub state: ServerState,
    pub start_time: i64,
    pub ping_time: i64,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub handlers: Vec<String>,
    #[serde(default)]
    pub handled: Vec<HandledCount>,
}

/// An ordered event note addressed to a runner and optionally a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub uuid: String,
    pub runner_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub message: String,
    pub created: i64,
}

impl LogRecord {
    pub fn new(runner_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            uuid: generate_id(),
            runner_id: runner_id.into(),
            step_id: None,
            message: message.into(),
            created: current_time_ms(),
        }
    }

    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }
}

/// A compiled program: the JSON-emitted AST of one source flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRecord {
    pub uuid: String,
    pub name: String,
    /// JSON program AST, deserializable into [`crate::ast::Program`].
    pub source: String,
}

/// A submitted workflow identity, linking a workflow id back to its flow
/// so a resuming worker can reload the AST.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub uuid: String,
    pub flow_id: String,
    pub name: String,
}
