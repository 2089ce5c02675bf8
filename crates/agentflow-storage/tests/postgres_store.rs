//! Postgres store integration tests.
//!
//! These run only when `DATABASE_URL` points at a reachable PostgreSQL
//! instance; otherwise each test is a no-op, mirroring how CI opts in.

use std::sync::Arc;

use agentflow_core::entities::{LockMeta, TaskRecord, TaskState};
use agentflow_core::persistence::{IterationChanges, RuntimeStore};
use agentflow_core::step::{ObjectType, StepDefinition};
use agentflow_storage::PostgresRuntimeStore;

async fn connect() -> Option<PostgresRuntimeStore> {
    let url = std::env::var("DATABASE_URL").ok()?;
    PostgresRuntimeStore::connect(&url).await.ok()
}

#[tokio::test]
async fn test_step_round_trip() {
    let Some(store) = connect().await else { return };

    let mut step = StepDefinition::create("wf-pg-1", ObjectType::Statement, "ns.Fetch");
    step.set_param("url", "x".into());
    store.save_step(&step).await.unwrap();

    let loaded = store.get_step(&step.id).await.unwrap().unwrap();
    assert_eq!(loaded.facet_name, "ns.Fetch");
    assert!(!loaded.transition.changed);

    let by_workflow = store.get_steps_by_workflow("wf-pg-1").await.unwrap();
    assert!(by_workflow.iter().any(|s| s.id == step.id));
}

#[tokio::test]
async fn test_commit_is_transactional() {
    let Some(store) = connect().await else { return };

    let step = StepDefinition::create("wf-pg-2", ObjectType::Statement, "A");
    let mut task = TaskRecord::new("ns.Fetch", "pg-test");
    task.workflow_id = "wf-pg-2".to_string();

    let mut changes = IterationChanges::new();
    changes.add_created_step(step.clone());
    changes.add_created_task(task.clone());
    store.commit(&changes).await.unwrap();

    assert!(store.get_step(&step.id).await.unwrap().is_some());
    assert!(store.get_task(&task.uuid).await.unwrap().is_some());
}

#[tokio::test]
async fn test_claim_task_single_winner() {
    let Some(store) = connect().await else { return };
    let store = Arc::new(store);

    let list = format!("race-{}", agentflow_core::generate_id());
    let task = TaskRecord::new("ns.Race", &list);
    store.save_task(&task).await.unwrap();

    let names = vec!["ns.Race".to_string()];
    let a = {
        let store = Arc::clone(&store);
        let names = names.clone();
        let list = list.clone();
        tokio::spawn(async move { store.claim_task(&names, &list).await.unwrap() })
    };
    let b = {
        let store = Arc::clone(&store);
        let list = list.clone();
        tokio::spawn(async move { store.claim_task(&names, &list).await.unwrap() })
    };

    let (a, b) = (a.await.unwrap(), b.await.unwrap());
    assert!(a.is_some() != b.is_some());

    let winner = a.or(b).unwrap();
    assert_eq!(winner.state, TaskState::Running);
}

#[tokio::test]
async fn test_lock_expiry_and_extension() {
    let Some(store) = connect().await else { return };

    let key = format!("runner:task:{}", agentflow_core::generate_id());
    assert!(store
        .acquire_lock(&key, 60_000, LockMeta::default())
        .await
        .unwrap());
    assert!(!store
        .acquire_lock(&key, 60_000, LockMeta::default())
        .await
        .unwrap());
    assert!(store.extend_lock(&key, 60_000).await.unwrap());

    store.release_lock(&key).await.unwrap();
    assert!(!store.extend_lock(&key, 60_000).await.unwrap());

    // Expired locks are reclaimable by a new caller.
    assert!(store
        .acquire_lock(&key, 0, LockMeta::default())
        .await
        .unwrap());
    assert!(store
        .acquire_lock(&key, 60_000, LockMeta::default())
        .await
        .unwrap());
    store.release_lock(&key).await.unwrap();
}
