//! # AgentFlow worker service
//!
//! A long-lived process that polls the persistence store for pending
//! tasks, acquires distributed locks, dispatches events to registered
//! handlers, and resumes workflows via the evaluator. Multiple instances
//! can run concurrently on different machines, coordinated through store
//! locks and server registration.

pub mod config;
pub mod http;
pub mod service;

pub use config::{FileConfig, WorkerConfig};
pub use service::{WorkerError, WorkerService};
