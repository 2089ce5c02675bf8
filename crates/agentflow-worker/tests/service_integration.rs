//! Worker service integration tests over the in-memory store: the
//! execute/pause/claim/continue/resume cycle, the external-resume path,
//! missing-handler behavior, and lock discipline.

use std::sync::Arc;

use agentflow_core::entities::{
    RunnerRecord, RunnerState, TaskRecord, TaskState, EXECUTE_TASK_NAME, RESUME_TASK_NAME,
};
use agentflow_core::evaluator::Evaluator;
use agentflow_core::persistence::{InMemoryRuntimeStore, RuntimeStore};
use agentflow_core::registry::HandlerRegistry;
use agentflow_core::states::StepState;
use agentflow_core::step::ObjectType;
use agentflow_core::value::{Value, ValueMap};
use agentflow_core::{FlowRecord, WorkflowRecord};
use agentflow_worker::{WorkerConfig, WorkerService};

fn fetch_flow_source() -> String {
    serde_json::json!({
        "declarations": [
            {
                "type": "EventFacetDecl",
                "name": "Fetch",
                "params": [{"name": "url", "type": "String"}],
                "returns": [{"name": "body", "type": "String"}]
            },
            {
                "type": "WorkflowDecl",
                "name": "FetchFlow",
                "params": [{"name": "url", "type": "String"}],
                "body": {
                    "steps": [
                        {
                            "id": "s1",
                            "name": "fetch",
                            "call": {
                                "target": "Fetch",
                                "args": [{"name": "url", "value": {"type": "Ref", "path": "url"}}]
                            }
                        }
                    ],
                    "yield": {"body": {"type": "Ref", "path": "fetch.body"}}
                }
            }
        ]
    })
    .to_string()
}

fn add_flow_source() -> String {
    serde_json::json!({
        "declarations": [
            {
                "type": "FacetDecl",
                "name": "Add",
                "params": [{"name": "x", "type": "Int"}, {"name": "y", "type": "Int"}],
                "returns": [{"name": "r", "type": "Int"}],
                "body": {
                    "type": "ComputeBlock",
                    "exprs": {
                        "r": {
                            "type": "Binary",
                            "op": "add",
                            "left": {"type": "Ref", "path": "x"},
                            "right": {"type": "Ref", "path": "y"}
                        }
                    }
                }
            },
            {
                "type": "WorkflowDecl",
                "name": "AddFlow",
                "params": [{"name": "x", "type": "Int"}, {"name": "y", "type": "Int"}],
                "body": {
                    "steps": [
                        {
                            "id": "s1",
                            "name": "sum",
                            "call": {
                                "target": "Add",
                                "args": [
                                    {"name": "x", "value": {"type": "Ref", "path": "x"}},
                                    {"name": "y", "value": {"type": "Ref", "path": "y"}}
                                ]
                            }
                        }
                    ],
                    "yield": {"r": {"type": "Ref", "path": "sum.r"}}
                }
            }
        ]
    })
    .to_string()
}

struct Harness {
    store: Arc<InMemoryRuntimeStore>,
    service: Arc<WorkerService>,
    registry: Arc<HandlerRegistry>,
}

fn harness() -> Harness {
    harness_with_store(Arc::new(InMemoryRuntimeStore::new()))
}

fn harness_with_store(store: Arc<InMemoryRuntimeStore>) -> Harness {
    let runtime_store: Arc<dyn RuntimeStore> = store.clone();
    let evaluator = Arc::new(Evaluator::new(runtime_store.clone()));
    let registry = Arc::new(HandlerRegistry::new());
    let service = Arc::new(WorkerService::new(
        runtime_store,
        evaluator,
        Arc::clone(&registry),
        WorkerConfig::default(),
    ));
    Harness {
        store,
        service,
        registry,
    }
}

/// Submit a flow: flow record, workflow identity, runner, and the
/// `afl:execute` task.
async fn submit(
    store: &InMemoryRuntimeStore,
    source: String,
    flow_name: &str,
    workflow_name: &str,
    inputs: ValueMap,
) -> (String, String, String) {
    let flow = FlowRecord {
        uuid: agentflow_core::generate_id(),
        name: flow_name.to_string(),
        source,
    };
    store.save_flow(&flow).await.unwrap();

    let workflow_id = agentflow_core::generate_id();
    store
        .save_workflow(&WorkflowRecord {
            uuid: workflow_id.clone(),
            flow_id: flow.uuid.clone(),
            name: workflow_name.to_string(),
        })
        .await
        .unwrap();

    let runner = RunnerRecord::new();
    store.save_runner(&runner).await.unwrap();

    let mut task = TaskRecord::new(EXECUTE_TASK_NAME, "default");
    task.runner_id = runner.uuid.clone();
    task.workflow_id = workflow_id.clone();
    task.flow_id = flow.uuid.clone();
    let mut data = ValueMap::new();
    data.insert("flow_id".to_string(), Value::from(flow.uuid.clone()));
    data.insert("workflow_id".to_string(), Value::from(workflow_id.clone()));
    data.insert(
        "workflow_name".to_string(),
        Value::from(workflow_name.to_string()),
    );
    data.insert("inputs".to_string(), Value::Map(inputs));
    data.insert("runner_id".to_string(), Value::from(runner.uuid.clone()));
    task.data = Some(data);
    store.save_task(&task).await.unwrap();

    (flow.uuid.clone(), workflow_id, runner.uuid.clone())
}

fn url_inputs(url: &str) -> ValueMap {
    let mut map = ValueMap::new();
    map.insert("url".to_string(), Value::from(url));
    map
}

async fn event_step_id(store: &InMemoryRuntimeStore, workflow_id: &str) -> String {
    store
        .get_steps_by_workflow(workflow_id)
        .await
        .unwrap()
        .into_iter()
        .find(|s| s.object_type == ObjectType::EventFacet)
        .expect("event step")
        .id
}

#[tokio::test]
async fn test_execute_task_completes_pure_workflow() {
    let h = harness();
    let mut inputs = ValueMap::new();
    inputs.insert("x".to_string(), Value::Int(2));
    inputs.insert("y".to_string(), Value::Int(3));
    let (_, workflow_id, runner_id) =
        submit(&h.store, add_flow_source(), "math", "AddFlow", inputs).await;

    let dispatched = h.service.run_once().await.unwrap();
    assert_eq!(dispatched, 1);

    let runner = h.store.get_runner(&runner_id).await.unwrap().unwrap();
    assert_eq!(runner.state, RunnerState::Completed);
    assert_eq!(runner.workflow_id, workflow_id);
    assert!(runner.duration >= 0);

    let root = h
        .store
        .get_workflow_root(&workflow_id)
        .await
        .unwrap()
        .unwrap();
    assert!(root.is_complete());
    assert_eq!(root.return_values()["r"], Value::Int(5));

    // Every lock was released on exit.
    assert!(h.store.get_all_locks().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_event_task_cycle() {
    let h = harness();
    h.registry.register("Fetch", |payload: ValueMap| async move {
        let url = payload
            .get("url")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let mut result = ValueMap::new();
        result.insert("body".to_string(), Value::from(format!("<{url}>")));
        Ok(Some(result))
    });

    let (_, workflow_id, runner_id) = submit(
        &h.store,
        fetch_flow_source(),
        "fetch",
        "FetchFlow",
        url_inputs("x"),
    )
    .await;

    // First cycle: afl:execute runs and pauses on the event step.
    h.service.run_once().await.unwrap();
    let runner = h.store.get_runner(&runner_id).await.unwrap().unwrap();
    assert_eq!(runner.state, RunnerState::Running);
    assert_eq!(h.store.get_pending_tasks("default").await.unwrap().len(), 1);

    // Second cycle: the event task is claimed, dispatched, and the
    // workflow resumed to completion.
    let dispatched = h.service.run_once().await.unwrap();
    assert_eq!(dispatched, 1);

    let root = h
        .store
        .get_workflow_root(&workflow_id)
        .await
        .unwrap()
        .unwrap();
    assert!(root.is_complete());
    assert_eq!(root.return_values()["body"], Value::from("<x>"));

    // The event task reached its terminal state.
    let step_id = event_step_id(&h.store, &workflow_id).await;
    let task = h.store.get_task_for_step(&step_id).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Completed);

    // Dispatch statistics surfaced on the status payload.
    let status = h.service.status_snapshot();
    assert_eq!(status["handled"]["Fetch"]["handled"], 1);

    assert!(h.store.get_all_locks().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_event_task_without_handler_fails_step() {
    let h = harness();
    // A topic makes the worker claim the task even with no handler.
    let runtime_store: Arc<dyn RuntimeStore> = h.store.clone();
    let evaluator = Arc::new(Evaluator::new(runtime_store.clone()));
    let service = Arc::new(WorkerService::new(
        runtime_store,
        evaluator,
        Arc::new(HandlerRegistry::new()),
        WorkerConfig::default().with_topics(vec!["Fetch".to_string()]),
    ));

    let (_, workflow_id, _) = submit(
        &h.store,
        fetch_flow_source(),
        "fetch",
        "FetchFlow",
        url_inputs("x"),
    )
    .await;

    service.run_once().await.unwrap();
    let step_id = event_step_id(&h.store, &workflow_id).await;

    service.run_once().await.unwrap();

    // The claimed task had to be resolved: failed, and the parked step
    // failed with it.
    let task = h.store.get_task_for_step(&step_id).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Failed);
    let error = task.error.unwrap();
    assert!(error["message"]
        .as_str()
        .unwrap()
        .contains("no handler"));

    let step = h.store.get_step(&step_id).await.unwrap().unwrap();
    assert_eq!(step.state, StepState::StatementError);
}

#[tokio::test]
async fn test_external_resume_task_on_foreign_worker() {
    let h = harness();
    let (_, workflow_id, _) = submit(
        &h.store,
        fetch_flow_source(),
        "fetch",
        "FetchFlow",
        url_inputs("x"),
    )
    .await;

    // Worker one executes and pauses.
    h.service.run_once().await.unwrap();
    let step_id = event_step_id(&h.store, &workflow_id).await;

    // An external agent writes the returns directly...
    let mut step = h.store.get_step(&step_id).await.unwrap().unwrap();
    step.set_return("body", Value::from("<ext>"));
    h.store.save_step(&step).await.unwrap();

    // ...and inserts an afl:resume task.
    let mut resume = TaskRecord::new(RESUME_TASK_NAME, "default");
    let mut data = ValueMap::new();
    data.insert("step_id".to_string(), Value::from(step_id.clone()));
    data.insert("workflow_id".to_string(), Value::from(workflow_id.clone()));
    resume.data = Some(data);
    h.store.save_task(&resume).await.unwrap();

    // A different worker with no cached AST picks it up; the AST reloads
    // from the workflow and flow records.
    let foreign = harness_with_store(h.store.clone());
    let dispatched = foreign.service.run_once().await.unwrap();
    assert_eq!(dispatched, 1);

    let root = h
        .store
        .get_workflow_root(&workflow_id)
        .await
        .unwrap()
        .unwrap();
    assert!(root.is_complete());
    assert_eq!(root.return_values()["body"], Value::from("<ext>"));

    let task = h.store.get_task(&resume.uuid).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Completed);
}

#[tokio::test]
async fn test_resume_task_without_step_id_fails() {
    let h = harness();

    let resume = TaskRecord::new(RESUME_TASK_NAME, "default");
    h.store.save_task(&resume).await.unwrap();

    h.service.run_once().await.unwrap();

    let task = h.store.get_task(&resume.uuid).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Failed);
    let error = task.error.unwrap();
    assert!(error["message"].as_str().unwrap().contains("step_id"));
}

#[tokio::test]
async fn test_event_step_path() {
    // The step-level dispatch path: the worker polls parked steps and
    // serves them under step locks, without touching the task queue.
    let h = harness();
    h.registry.register("Fetch", |payload: ValueMap| async move {
        let url = payload
            .get("url")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let mut result = ValueMap::new();
        result.insert("body".to_string(), Value::from(format!("<{url}>")));
        Ok(Some(result))
    });

    let (_, workflow_id, _) = submit(
        &h.store,
        fetch_flow_source(),
        "fetch",
        "FetchFlow",
        url_inputs("y"),
    )
    .await;
    h.service.run_once().await.unwrap();

    let handled = h.service.run_event_steps_once().await.unwrap();
    assert_eq!(handled, 1);

    let root = h
        .store
        .get_workflow_root(&workflow_id)
        .await
        .unwrap()
        .unwrap();
    assert!(root.is_complete());
    assert_eq!(root.return_values()["body"], Value::from("<y>"));
    assert!(h.store.get_all_locks().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_event_step_skipped_when_locked() {
    let h = harness();
    h.registry
        .register("Fetch", |_payload: ValueMap| async move { Ok(Some(ValueMap::new())) });

    let (_, workflow_id, _) = submit(
        &h.store,
        fetch_flow_source(),
        "fetch",
        "FetchFlow",
        url_inputs("z"),
    )
    .await;
    h.service.run_once().await.unwrap();
    let step_id = event_step_id(&h.store, &workflow_id).await;

    // Another worker holds the step lock.
    assert!(h
        .store
        .acquire_lock(
            &format!("runner:step:{step_id}"),
            60_000,
            agentflow_core::LockMeta::default()
        )
        .await
        .unwrap());

    let handled = h.service.run_event_steps_once().await.unwrap();
    assert_eq!(handled, 0);

    let step = h.store.get_step(&step_id).await.unwrap().unwrap();
    assert_eq!(step.state, StepState::EventTransmit);
}

#[tokio::test]
async fn test_status_snapshot_shape() {
    let h = harness();
    let status = h.service.status_snapshot();

    assert_eq!(status["running"], false);
    assert!(status["server_id"].is_string());
    assert!(status["handled"].is_object());
    assert_eq!(status["active_work_items"], 0);
    assert_eq!(status["config"]["server_group"], "default");
    assert_eq!(status["config"]["max_concurrent"], 5);
    assert_eq!(status["config"]["poll_interval_ms"], 2000);
}

#[tokio::test]
async fn test_execute_task_with_missing_flow_fails() {
    let h = harness();

    let mut task = TaskRecord::new(EXECUTE_TASK_NAME, "default");
    let mut data = ValueMap::new();
    data.insert("flow_id".to_string(), Value::from("ghost"));
    data.insert("workflow_name".to_string(), Value::from("Missing"));
    task.data = Some(data);
    h.store.save_task(&task).await.unwrap();

    h.service.run_once().await.unwrap();

    let task = h.store.get_task(&task.uuid).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Failed);
    let error = task.error.unwrap();
    assert!(error["message"].as_str().unwrap().contains("not found"));
    assert!(h.store.get_all_locks().await.unwrap().is_empty());
}
