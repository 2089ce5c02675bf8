//! PostgreSQL document-store backend for the AgentFlow persistence
//! contract.
//!
//! Records are stored as one JSONB document per row, with the columns the
//! runtime queries on (workflow id, block id, state, task list) lifted out
//! and indexed. Iteration commits run in a transaction; task claiming uses
//! `FOR UPDATE SKIP LOCKED` so concurrent workers never claim the same
//! task.

mod postgres;

pub use postgres::PostgresRuntimeStore;
