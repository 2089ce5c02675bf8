//! # AgentFlow execution core
//!
//! A deterministic, persistent workflow evaluator and its collaborators.
//! Flows are declarative workflows composed of nested blocks of named
//! statements invoking *facets* (pure computations) and *event facets*
//! (external effects carried out by registered handlers).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Evaluator                            │
//! │   (iterative fixed-point loop over actionable steps,        │
//! │    atomic commit per iteration, pause on event steps)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       RuntimeStore                          │
//! │   (steps, tasks, locks, runners, servers, flows, logs —     │
//! │    in-memory here, Postgres in agentflow-storage)           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Worker service                          │
//! │   (agentflow-worker: claims tasks, dispatches handlers,     │
//! │    continues steps, resumes the evaluator)                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! A workflow run: `execute` commits iterations until it completes,
//! errors, or pauses on event steps; each paused event step emits a task;
//! a worker claims the task, runs the handler, calls `continue_step`, then
//! resumes the evaluator; repeat until completion.

pub mod ast;
pub mod changers;
pub mod dependency;
pub mod entities;
pub mod evaluator;
pub mod expr;
pub mod persistence;
pub mod registry;
pub mod states;
pub mod step;
pub mod value;

pub use ast::{BlockAst, Declaration, FacetDecl, Program, StatementAst, WorkflowDecl};
pub use entities::{
    FlowRecord, HandledCount, LockMeta, LockRecord, LogRecord, RunnerRecord, RunnerState,
    ServerRecord, ServerState, TaskRecord, TaskState, WorkflowRecord, EXECUTE_TASK_NAME,
    RESUME_TASK_NAME,
};
pub use evaluator::{
    Evaluator, EvaluatorError, ExecutionResult, ExecutionStatus, ExecutionContext,
};
pub use persistence::{InMemoryRuntimeStore, IterationChanges, RuntimeStore, StoreError};
pub use registry::{HandlerRegistry, HandlerResult};
pub use states::StepState;
pub use step::{generate_id, ObjectType, StepDefinition, StepId, WorkflowId};
pub use value::{Value, ValueMap};
