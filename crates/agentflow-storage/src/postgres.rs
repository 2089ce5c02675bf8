//! PostgreSQL implementation of the runtime store

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};

use agentflow_core::entities::{
    current_time_ms, FlowRecord, LockMeta, LockRecord, LogRecord, RunnerRecord, ServerRecord,
    TaskRecord, TaskState, WorkflowRecord,
};
use agentflow_core::persistence::{IterationChanges, RuntimeStore, StoreError};
use agentflow_core::states::StepState;
use agentflow_core::step::StepDefinition;

/// PostgreSQL document store satisfying the persistence contract.
///
/// # Example
///
/// ```ignore
/// let store = PostgresRuntimeStore::connect("postgres://localhost/agentflow").await?;
/// let evaluator = Evaluator::new(Arc::new(store));
/// ```
#[derive(Clone)]
pub struct PostgresRuntimeStore {
    pool: PgPool,
}

impl PostgresRuntimeStore {
    /// Connect to the database and run pending migrations.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Wrap an existing pool without running migrations.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    error!("database error: {}", e);
    StoreError::Database(e.to_string())
}

fn to_doc<T: serde::Serialize>(record: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(record).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn from_doc<T: serde::de::DeserializeOwned>(doc: serde_json::Value) -> Result<T, StoreError> {
    serde_json::from_value(doc).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn rows_to_records<T: serde::de::DeserializeOwned>(
    rows: Vec<sqlx::postgres::PgRow>,
) -> Result<Vec<T>, StoreError> {
    rows.into_iter()
        .map(|row| from_doc(row.get::<serde_json::Value, _>("doc")))
        .collect()
}

/// Steps are stored clean: the dirty flag only tracks writes within an
/// iteration.
fn normalized(step: &StepDefinition) -> StepDefinition {
    let mut step = step.clone();
    step.transition.changed = false;
    step
}

async fn upsert_step<'e, E>(executor: E, step: &StepDefinition) -> Result<(), StoreError>
where
    E: sqlx::PgExecutor<'e>,
{
    let step = normalized(step);
    let doc = to_doc(&step)?;
    sqlx::query(
        r#"
        INSERT INTO afl_steps (id, workflow_id, block_id, state, actionable, doc)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (id) DO UPDATE
            SET workflow_id = EXCLUDED.workflow_id,
                block_id = EXCLUDED.block_id,
                state = EXCLUDED.state,
                actionable = EXCLUDED.actionable,
                doc = EXCLUDED.doc
        "#,
    )
    .bind(&step.id)
    .bind(&step.workflow_id)
    .bind(&step.block_id)
    .bind(step.state.to_string())
    .bind(step.is_actionable())
    .bind(&doc)
    .execute(executor)
    .await
    .map_err(db_err)?;
    Ok(())
}

async fn upsert_task<'e, E>(executor: E, task: &TaskRecord) -> Result<(), StoreError>
where
    E: sqlx::PgExecutor<'e>,
{
    let doc = to_doc(task)?;
    let state = serde_json::to_value(task.state)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    sqlx::query(
        r#"
        INSERT INTO afl_tasks (uuid, name, state, task_list, step_id, created, doc)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (uuid) DO UPDATE
            SET name = EXCLUDED.name,
                state = EXCLUDED.state,
                task_list = EXCLUDED.task_list,
                step_id = EXCLUDED.step_id,
                doc = EXCLUDED.doc
        "#,
    )
    .bind(&task.uuid)
    .bind(&task.name)
    .bind(state)
    .bind(&task.task_list)
    .bind(&task.step_id)
    .bind(task.created)
    .bind(&doc)
    .execute(executor)
    .await
    .map_err(db_err)?;
    Ok(())
}

async fn upsert_doc<'e, E>(
    executor: E,
    table: &str,
    id: &str,
    doc: serde_json::Value,
) -> Result<(), StoreError>
where
    E: sqlx::PgExecutor<'e>,
{
    let sql = format!(
        "INSERT INTO {table} (uuid, doc) VALUES ($1, $2) \
         ON CONFLICT (uuid) DO UPDATE SET doc = EXCLUDED.doc"
    );
    sqlx::query(&sql)
        .bind(id)
        .bind(&doc)
        .execute(executor)
        .await
        .map_err(db_err)?;
    Ok(())
}

async fn fetch_doc<'e, E, T>(executor: E, table: &str, id: &str) -> Result<Option<T>, StoreError>
where
    E: sqlx::PgExecutor<'e>,
    T: serde::de::DeserializeOwned,
{
    let sql = format!("SELECT doc FROM {table} WHERE uuid = $1");
    let row = sqlx::query(&sql)
        .bind(id)
        .fetch_optional(executor)
        .await
        .map_err(db_err)?;
    row.map(|r| from_doc(r.get::<serde_json::Value, _>("doc")))
        .transpose()
}

#[async_trait]
impl RuntimeStore for PostgresRuntimeStore {
    async fn get_step(&self, step_id: &str) -> Result<Option<StepDefinition>, StoreError> {
        let row = sqlx::query("SELECT doc FROM afl_steps WHERE id = $1")
            .bind(step_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| from_doc(r.get::<serde_json::Value, _>("doc")))
            .transpose()
    }

    async fn get_workflow_root(
        &self,
        workflow_id: &str,
    ) -> Result<Option<StepDefinition>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT doc FROM afl_steps
            WHERE workflow_id = $1
              AND doc->>'object_type' = 'workflow'
              AND doc->'container_id' IS NULL
            ORDER BY id
            LIMIT 1
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| from_doc(r.get::<serde_json::Value, _>("doc")))
            .transpose()
    }

    async fn get_steps_by_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<StepDefinition>, StoreError> {
        let rows = sqlx::query(
            "SELECT doc FROM afl_steps WHERE workflow_id = $1 ORDER BY id",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows_to_records(rows)
    }

    async fn get_steps_by_block(
        &self,
        block_id: &str,
    ) -> Result<Vec<StepDefinition>, StoreError> {
        let rows = sqlx::query("SELECT doc FROM afl_steps WHERE block_id = $1 ORDER BY id")
            .bind(block_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows_to_records(rows)
    }

    async fn get_steps_by_state(
        &self,
        state: StepState,
    ) -> Result<Vec<StepDefinition>, StoreError> {
        let rows = sqlx::query("SELECT doc FROM afl_steps WHERE state = $1 ORDER BY id")
            .bind(state.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows_to_records(rows)
    }

    async fn get_actionable_steps_by_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<StepDefinition>, StoreError> {
        let rows = sqlx::query(
            "SELECT doc FROM afl_steps WHERE workflow_id = $1 AND actionable ORDER BY id",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows_to_records(rows)
    }

    async fn save_step(&self, step: &StepDefinition) -> Result<(), StoreError> {
        upsert_step(&self.pool, step).await
    }

    #[instrument(skip(self, changes))]
    async fn commit(&self, changes: &IterationChanges) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        for step in &changes.created_steps {
            upsert_step(&mut *tx, step).await?;
        }
        for step in &changes.updated_steps {
            upsert_step(&mut *tx, step).await?;
        }
        for task in &changes.created_tasks {
            upsert_task(&mut *tx, task).await?;
        }
        for task in &changes.updated_tasks {
            upsert_task(&mut *tx, task).await?;
        }

        tx.commit().await.map_err(db_err)?;
        debug!(
            created_steps = changes.created_steps.len(),
            updated_steps = changes.updated_steps.len(),
            created_tasks = changes.created_tasks.len(),
            "iteration committed"
        );
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        fetch_doc(&self.pool, "afl_tasks", task_id).await
    }

    async fn get_task_for_step(&self, step_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT doc FROM afl_tasks WHERE step_id = $1 ORDER BY created LIMIT 1",
        )
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| from_doc(r.get::<serde_json::Value, _>("doc")))
            .transpose()
    }

    async fn get_pending_tasks(&self, task_list: &str) -> Result<Vec<TaskRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT doc FROM afl_tasks WHERE task_list = $1 AND state = 'pending' ORDER BY created",
        )
        .bind(task_list)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows_to_records(rows)
    }

    async fn claim_task(
        &self,
        task_names: &[String],
        task_list: &str,
    ) -> Result<Option<TaskRecord>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query(
            r#"
            SELECT doc FROM afl_tasks
            WHERE task_list = $1 AND state = 'pending' AND name = ANY($2)
            ORDER BY created
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(task_list)
        .bind(task_names)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            tx.commit().await.map_err(db_err)?;
            return Ok(None);
        };

        let mut task: TaskRecord = from_doc(row.get::<serde_json::Value, _>("doc"))?;
        task.state = TaskState::Running;
        task.updated = current_time_ms();
        upsert_task(&mut *tx, &task).await?;

        tx.commit().await.map_err(db_err)?;
        Ok(Some(task))
    }

    async fn save_task(&self, task: &TaskRecord) -> Result<(), StoreError> {
        upsert_task(&self.pool, task).await
    }

    async fn acquire_lock(
        &self,
        key: &str,
        ttl_ms: i64,
        meta: LockMeta,
    ) -> Result<bool, StoreError> {
        let now = current_time_ms();
        let lock = LockRecord {
            key: key.to_string(),
            acquired_at: now,
            expires_at: now + ttl_ms,
            meta,
        };
        let doc = to_doc(&lock)?;

        let result = sqlx::query(
            r#"
            INSERT INTO afl_locks (key, acquired_at, expires_at, doc)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (key) DO UPDATE
                SET acquired_at = EXCLUDED.acquired_at,
                    expires_at = EXCLUDED.expires_at,
                    doc = EXCLUDED.doc
                WHERE afl_locks.expires_at <= $2
            "#,
        )
        .bind(key)
        .bind(now)
        .bind(lock.expires_at)
        .bind(&doc)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn extend_lock(&self, key: &str, ttl_ms: i64) -> Result<bool, StoreError> {
        let now = current_time_ms();
        let expires_at = now + ttl_ms;
        let result = sqlx::query(
            r#"
            UPDATE afl_locks
            SET expires_at = $3,
                doc = jsonb_set(doc, '{expires_at}', to_jsonb($3::bigint))
            WHERE key = $1 AND expires_at > $2
            "#,
        )
        .bind(key)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_lock(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM afl_locks WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn get_all_locks(&self) -> Result<Vec<LockRecord>, StoreError> {
        let rows = sqlx::query("SELECT doc FROM afl_locks ORDER BY key")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows_to_records(rows)
    }

    async fn get_runner(&self, runner_id: &str) -> Result<Option<RunnerRecord>, StoreError> {
        fetch_doc(&self.pool, "afl_runners", runner_id).await
    }

    async fn save_runner(&self, runner: &RunnerRecord) -> Result<(), StoreError> {
        upsert_doc(&self.pool, "afl_runners", &runner.uuid, to_doc(runner)?).await
    }

    async fn get_server(&self, server_id: &str) -> Result<Option<ServerRecord>, StoreError> {
        fetch_doc(&self.pool, "afl_servers", server_id).await
    }

    async fn save_server(&self, server: &ServerRecord) -> Result<(), StoreError> {
        upsert_doc(&self.pool, "afl_servers", &server.uuid, to_doc(server)?).await
    }

    async fn update_server_ping(&self, server_id: &str, now: i64) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE afl_servers SET doc = jsonb_set(doc, '{ping_time}', to_jsonb($2::bigint)) \
             WHERE uuid = $1",
        )
        .bind(server_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_flow(&self, flow_id: &str) -> Result<Option<FlowRecord>, StoreError> {
        fetch_doc(&self.pool, "afl_flows", flow_id).await
    }

    async fn save_flow(&self, flow: &FlowRecord) -> Result<(), StoreError> {
        upsert_doc(&self.pool, "afl_flows", &flow.uuid, to_doc(flow)?).await
    }

    async fn get_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowRecord>, StoreError> {
        fetch_doc(&self.pool, "afl_workflows", workflow_id).await
    }

    async fn save_workflow(&self, workflow: &WorkflowRecord) -> Result<(), StoreError> {
        upsert_doc(&self.pool, "afl_workflows", &workflow.uuid, to_doc(workflow)?).await
    }

    async fn save_log(&self, log: &LogRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO afl_logs (uuid, runner_id, created, doc)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (uuid) DO NOTHING
            "#,
        )
        .bind(&log.uuid)
        .bind(&log.runner_id)
        .bind(log.created)
        .bind(to_doc(log)?)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_logs_by_runner(&self, runner_id: &str) -> Result<Vec<LogRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT doc FROM afl_logs WHERE runner_id = $1 ORDER BY created, uuid",
        )
        .bind(runner_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows_to_records(rows)
    }
}
