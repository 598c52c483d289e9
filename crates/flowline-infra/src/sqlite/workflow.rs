//! SQLite workflow repository implementation.
//!
//! Implements `WorkflowRepository` from `flowline-core` using sqlx with split
//! read/write pools. JSON-valued columns (inputs, outputs, mappings, retry
//! policies) are stored as text. Creation order is `created_at` then `rowid`.

use chrono::Utc;
use flowline_core::repository::workflow::WorkflowRepository;
use flowline_types::error::RepositoryError;
use flowline_types::run::{RunPatch, RunStatus, StepRun, StepRunPatch, WorkflowRun};
use flowline_types::workflow::{RetryPolicy, Step, Workflow, WorkflowStatus};
use serde_json::Value;
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_uuid, query_err};

/// SQLite-backed implementation of `WorkflowRepository`.
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct WorkflowRow {
    id: String,
    name: String,
    description: Option<String>,
    version: i64,
    status: String,
    created_at: String,
    updated_at: String,
}

impl WorkflowRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            version: row.try_get("version")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_workflow(self) -> Result<Workflow, RepositoryError> {
        let status: WorkflowStatus = self.status.parse().map_err(RepositoryError::Query)?;
        Ok(Workflow {
            id: parse_uuid(&self.id)?,
            name: self.name,
            description: self.description,
            version: self.version as u32,
            status,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct StepRow {
    id: String,
    workflow_id: String,
    name: String,
    description: Option<String>,
    tool_name: String,
    config: String,
    input_mapping: String,
    retry_policy: Option<String>,
    timeout_ms: Option<i64>,
    step_order: i64,
    created_at: String,
}

impl StepRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            tool_name: row.try_get("tool_name")?,
            config: row.try_get("config")?,
            input_mapping: row.try_get("input_mapping")?,
            retry_policy: row.try_get("retry_policy")?,
            timeout_ms: row.try_get("timeout_ms")?,
            step_order: row.try_get("step_order")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_step(self) -> Result<Step, RepositoryError> {
        let retry: Option<RetryPolicy> = self
            .retry_policy
            .as_deref()
            .map(|s| {
                serde_json::from_str(s)
                    .map_err(|e| RepositoryError::Query(format!("invalid retry policy: {e}")))
            })
            .transpose()?;

        Ok(Step {
            id: parse_uuid(&self.id)?,
            workflow_id: parse_uuid(&self.workflow_id)?,
            name: self.name,
            description: self.description,
            tool_name: self.tool_name,
            config: parse_json(&self.config, "config")?,
            input_mapping: parse_json(&self.input_mapping, "input mapping")?,
            retry,
            timeout_ms: self.timeout_ms.map(|ms| ms as u64),
            order: self.step_order as i32,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

struct RunRow {
    id: String,
    workflow_id: String,
    status: String,
    input: Option<String>,
    output: Option<String>,
    error: Option<String>,
    started_at: Option<String>,
    completed_at: Option<String>,
    created_at: String,
}

impl RunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            status: row.try_get("status")?,
            input: row.try_get("input")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_run(self) -> Result<WorkflowRun, RepositoryError> {
        Ok(WorkflowRun {
            id: parse_uuid(&self.id)?,
            workflow_id: parse_uuid(&self.workflow_id)?,
            status: parse_status(&self.status)?,
            input: parse_optional_json(self.input.as_deref(), "run input")?,
            output: parse_optional_json(self.output.as_deref(), "run output")?,
            error: self.error,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

struct StepRunRow {
    id: String,
    workflow_run_id: String,
    step_id: String,
    status: String,
    input: Option<String>,
    output: Option<String>,
    error: Option<String>,
    attempts_made: i64,
    max_attempts: i64,
    started_at: Option<String>,
    completed_at: Option<String>,
    created_at: String,
}

impl StepRunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_run_id: row.try_get("workflow_run_id")?,
            step_id: row.try_get("step_id")?,
            status: row.try_get("status")?,
            input: row.try_get("input")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            attempts_made: row.try_get("attempts_made")?,
            max_attempts: row.try_get("max_attempts")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_step_run(self) -> Result<StepRun, RepositoryError> {
        Ok(StepRun {
            id: parse_uuid(&self.id)?,
            workflow_run_id: parse_uuid(&self.workflow_run_id)?,
            step_id: parse_uuid(&self.step_id)?,
            status: parse_status(&self.status)?,
            input: parse_optional_json(self.input.as_deref(), "step input")?,
            output: parse_optional_json(self.output.as_deref(), "step output")?,
            error: self.error,
            attempts_made: self.attempts_made as u32,
            max_attempts: self.max_attempts as u32,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_status(s: &str) -> Result<RunStatus, RepositoryError> {
    s.parse().map_err(RepositoryError::Query)
}

fn parse_json(s: &str, what: &str) -> Result<Value, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {what}: {e}")))
}

fn parse_optional_json(s: Option<&str>, what: &str) -> Result<Option<Value>, RepositoryError> {
    s.map(|s| parse_json(s, what)).transpose()
}

fn to_json(value: &Value) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(e.to_string()))
}

fn to_optional_json(value: Option<&Value>) -> Result<Option<String>, RepositoryError> {
    value.map(to_json).transpose()
}

fn insert_err(e: sqlx::Error, what: &str) -> RepositoryError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            RepositoryError::Conflict(format!("{what} already exists"))
        }
        _ => query_err(e),
    }
}

fn rows_into<T, R>(
    rows: &[sqlx::sqlite::SqliteRow],
    from_row: fn(&sqlx::sqlite::SqliteRow) -> Result<R, sqlx::Error>,
    convert: fn(R) -> Result<T, RepositoryError>,
) -> Result<Vec<T>, RepositoryError> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(convert(from_row(row).map_err(query_err)?)?);
    }
    Ok(out)
}

const RUN_COLUMNS: &str =
    "id, workflow_id, status, input, output, error, started_at, completed_at, created_at";

const STEP_RUN_COLUMNS: &str = "id, workflow_run_id, step_id, status, input, output, error, \
     attempts_made, max_attempts, started_at, completed_at, created_at";

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn create_workflow(&self, workflow: &Workflow) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO workflows (id, name, description, version, status, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(workflow.id.to_string())
        .bind(&workflow.name)
        .bind(&workflow.description)
        .bind(workflow.version as i64)
        .bind(workflow.status.to_string())
        .bind(format_datetime(&workflow.created_at))
        .bind(format_datetime(&workflow.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| insert_err(e, "workflow"))?;

        Ok(())
    }

    async fn get_workflow(&self, id: &Uuid) -> Result<Option<Workflow>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflows WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        row.map(|row| {
            WorkflowRow::from_row(&row)
                .map_err(query_err)
                .and_then(WorkflowRow::into_workflow)
        })
        .transpose()
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM workflows ORDER BY created_at DESC, rowid DESC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;

        rows_into(&rows, WorkflowRow::from_row, WorkflowRow::into_workflow)
    }

    async fn update_workflow_status(
        &self,
        id: &Uuid,
        status: WorkflowStatus,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE workflows SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(format_datetime(&Utc::now()))
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn increment_workflow_version(&self, id: &Uuid) -> Result<u32, RepositoryError> {
        let row = sqlx::query(
            "UPDATE workflows SET version = version + 1, updated_at = ? WHERE id = ? RETURNING version",
        )
        .bind(format_datetime(&Utc::now()))
        .bind(id.to_string())
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(query_err)?
        .ok_or(RepositoryError::NotFound)?;

        let version: i64 = row.try_get("version").map_err(query_err)?;
        Ok(version as u32)
    }

    async fn create_step(&self, step: &Step) -> Result<(), RepositoryError> {
        let retry = step
            .retry
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        sqlx::query(
            r#"INSERT INTO steps
               (id, workflow_id, name, description, tool_name, config, input_mapping,
                retry_policy, timeout_ms, step_order, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(step.id.to_string())
        .bind(step.workflow_id.to_string())
        .bind(&step.name)
        .bind(&step.description)
        .bind(&step.tool_name)
        .bind(to_json(&step.config)?)
        .bind(to_json(&step.input_mapping)?)
        .bind(&retry)
        .bind(step.timeout_ms.map(|ms| ms as i64))
        .bind(step.order)
        .bind(format_datetime(&step.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| {
            insert_err(e, &format!("step '{}' (order {})", step.name, step.order))
        })?;

        Ok(())
    }

    async fn get_step(&self, id: &Uuid) -> Result<Option<Step>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM steps WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        row.map(|row| StepRow::from_row(&row).map_err(query_err).and_then(StepRow::into_step))
            .transpose()
    }

    async fn list_steps(&self, workflow_id: &Uuid) -> Result<Vec<Step>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM steps WHERE workflow_id = ? ORDER BY step_order ASC")
            .bind(workflow_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;

        rows_into(&rows, StepRow::from_row, StepRow::into_step)
    }

    async fn create_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO workflow_runs
               (id, workflow_id, status, input, output, error, started_at, completed_at, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(run.id.to_string())
        .bind(run.workflow_id.to_string())
        .bind(run.status.as_str())
        .bind(to_optional_json(run.input.as_ref())?)
        .bind(to_optional_json(run.output.as_ref())?)
        .bind(&run.error)
        .bind(run.started_at.as_ref().map(format_datetime))
        .bind(run.completed_at.as_ref().map(format_datetime))
        .bind(format_datetime(&run.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| insert_err(e, "workflow run"))?;

        Ok(())
    }

    async fn get_run(&self, id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM workflow_runs WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        row.map(|row| RunRow::from_row(&row).map_err(query_err).and_then(RunRow::into_run))
            .transpose()
    }

    async fn update_run(&self, id: &Uuid, patch: &RunPatch) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE workflow_runs SET
                 status = COALESCE(?, status),
                 output = COALESCE(?, output),
                 error = COALESCE(?, error),
                 started_at = COALESCE(?, started_at),
                 completed_at = COALESCE(?, completed_at)
               WHERE id = ?"#,
        )
        .bind(patch.status.map(|s| s.as_str()))
        .bind(to_optional_json(patch.output.as_ref())?)
        .bind(&patch.error)
        .bind(patch.started_at.as_ref().map(format_datetime))
        .bind(patch.completed_at.as_ref().map(format_datetime))
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn transition_run(
        &self,
        id: &Uuid,
        from: &[RunStatus],
        patch: &RunPatch,
    ) -> Result<bool, RepositoryError> {
        if from.is_empty() {
            return Ok(false);
        }
        let placeholders = vec!["?"; from.len()].join(", ");
        let sql = format!(
            r#"UPDATE workflow_runs SET
                 status = COALESCE(?, status),
                 output = COALESCE(?, output),
                 error = COALESCE(?, error),
                 started_at = COALESCE(?, started_at),
                 completed_at = COALESCE(?, completed_at)
               WHERE id = ? AND status IN ({placeholders})"#
        );

        let mut query = sqlx::query(&sql)
            .bind(patch.status.map(|s| s.as_str()))
            .bind(to_optional_json(patch.output.as_ref())?)
            .bind(&patch.error)
            .bind(patch.started_at.as_ref().map(format_datetime))
            .bind(patch.completed_at.as_ref().map(format_datetime))
            .bind(id.to_string());
        for status in from {
            query = query.bind(status.as_str());
        }

        let result = query.execute(&self.pool.writer).await.map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_runs(
        &self,
        workflow_id: &Uuid,
        limit: u32,
    ) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM workflow_runs WHERE workflow_id = ? \
             ORDER BY created_at DESC, rowid DESC LIMIT ?"
        ))
        .bind(workflow_id.to_string())
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        rows_into(&rows, RunRow::from_row, RunRow::into_run)
    }

    async fn create_step_run(&self, step_run: &StepRun) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO step_runs
               (id, workflow_run_id, step_id, status, input, output, error,
                attempts_made, max_attempts, started_at, completed_at, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(step_run.id.to_string())
        .bind(step_run.workflow_run_id.to_string())
        .bind(step_run.step_id.to_string())
        .bind(step_run.status.as_str())
        .bind(to_optional_json(step_run.input.as_ref())?)
        .bind(to_optional_json(step_run.output.as_ref())?)
        .bind(&step_run.error)
        .bind(step_run.attempts_made as i64)
        .bind(step_run.max_attempts as i64)
        .bind(step_run.started_at.as_ref().map(format_datetime))
        .bind(step_run.completed_at.as_ref().map(format_datetime))
        .bind(format_datetime(&step_run.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| insert_err(e, "step run"))?;

        Ok(())
    }

    async fn get_step_run(&self, id: &Uuid) -> Result<Option<StepRun>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {STEP_RUN_COLUMNS} FROM step_runs WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        row.map(|row| {
            StepRunRow::from_row(&row)
                .map_err(query_err)
                .and_then(StepRunRow::into_step_run)
        })
        .transpose()
    }

    async fn update_step_run(
        &self,
        id: &Uuid,
        patch: &StepRunPatch,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE step_runs SET
                 status = COALESCE(?, status),
                 output = COALESCE(?, output),
                 error = COALESCE(?, error),
                 attempts_made = COALESCE(?, attempts_made),
                 started_at = COALESCE(?, started_at),
                 completed_at = COALESCE(?, completed_at)
               WHERE id = ?"#,
        )
        .bind(patch.status.map(|s| s.as_str()))
        .bind(to_optional_json(patch.output.as_ref())?)
        .bind(&patch.error)
        .bind(patch.attempts_made.map(|n| n as i64))
        .bind(patch.started_at.as_ref().map(format_datetime))
        .bind(patch.completed_at.as_ref().map(format_datetime))
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn list_step_runs(&self, run_id: &Uuid) -> Result<Vec<StepRun>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_RUN_COLUMNS} FROM step_runs WHERE workflow_run_id = ? \
             ORDER BY created_at ASC, rowid ASC"
        ))
        .bind(run_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        rows_into(&rows, StepRunRow::from_row, StepRunRow::into_step_run)
    }

    async fn list_step_runs_by_status(
        &self,
        run_id: &Uuid,
        status: RunStatus,
    ) -> Result<Vec<StepRun>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_RUN_COLUMNS} FROM step_runs WHERE workflow_run_id = ? AND status = ? \
             ORDER BY created_at ASC, rowid ASC"
        ))
        .bind(run_id.to_string())
        .bind(status.as_str())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        rows_into(&rows, StepRunRow::from_row, StepRunRow::into_step_run)
    }

    async fn latest_step_run(&self, run_id: &Uuid) -> Result<Option<StepRun>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {STEP_RUN_COLUMNS} FROM step_runs WHERE workflow_run_id = ? \
             ORDER BY created_at DESC, rowid DESC LIMIT 1"
        ))
        .bind(run_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;

        row.map(|row| {
            StepRunRow::from_row(&row)
                .map_err(query_err)
                .and_then(StepRunRow::into_step_run)
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::pool::test_pool;
    use serde_json::json;

    async fn repo() -> (SqliteWorkflowRepository, tempfile::TempDir) {
        let (pool, dir) = test_pool().await;
        (SqliteWorkflowRepository::new(pool), dir)
    }

    fn workflow(name: &str) -> Workflow {
        let now = Utc::now();
        Workflow {
            id: Uuid::now_v7(),
            name: name.to_string(),
            description: Some("desc".to_string()),
            version: 1,
            status: WorkflowStatus::Draft,
            created_at: now,
            updated_at: now,
        }
    }

    fn step(workflow_id: Uuid, name: &str, order: i32) -> Step {
        Step {
            id: Uuid::now_v7(),
            workflow_id,
            name: name.to_string(),
            description: None,
            tool_name: "http-fetch".to_string(),
            config: json!({}),
            input_mapping: json!({"url": "{{input.url}}"}),
            retry: Some(RetryPolicy::default()),
            timeout_ms: Some(5000),
            order,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn workflow_roundtrip_and_status_version() {
        let (repo, _dir) = repo().await;
        let wf = workflow("enrich");
        repo.create_workflow(&wf).await.unwrap();

        let loaded = repo.get_workflow(&wf.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "enrich");
        assert_eq!(loaded.status, WorkflowStatus::Draft);

        repo.update_workflow_status(&wf.id, WorkflowStatus::Active)
            .await
            .unwrap();
        assert_eq!(repo.increment_workflow_version(&wf.id).await.unwrap(), 2);
        assert_eq!(repo.increment_workflow_version(&wf.id).await.unwrap(), 3);

        let loaded = repo.get_workflow(&wf.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, WorkflowStatus::Active);
        assert_eq!(loaded.version, 3);

        let missing = Uuid::now_v7();
        assert!(matches!(
            repo.update_workflow_status(&missing, WorkflowStatus::Archived).await,
            Err(RepositoryError::NotFound)
        ));
        assert!(matches!(
            repo.increment_workflow_version(&missing).await,
            Err(RepositoryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn steps_are_ordered_and_unique() {
        let (repo, _dir) = repo().await;
        let wf = workflow("wf");
        repo.create_workflow(&wf).await.unwrap();

        repo.create_step(&step(wf.id, "b", 20)).await.unwrap();
        repo.create_step(&step(wf.id, "a", 10)).await.unwrap();

        let steps = repo.list_steps(&wf.id).await.unwrap();
        let names: Vec<_> = steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
        assert_eq!(steps[0].timeout_ms, Some(5000));
        assert_eq!(steps[0].retry, Some(RetryPolicy::default()));
        assert_eq!(steps[0].input_mapping, json!({"url": "{{input.url}}"}));

        let dup_name = repo.create_step(&step(wf.id, "a", 30)).await;
        assert!(matches!(dup_name, Err(RepositoryError::Conflict(_))));
        let dup_order = repo.create_step(&step(wf.id, "c", 10)).await;
        assert!(matches!(dup_order, Err(RepositoryError::Conflict(_))));
    }

    #[tokio::test]
    async fn run_patch_only_touches_given_fields() {
        let (repo, _dir) = repo().await;
        let wf = workflow("wf");
        repo.create_workflow(&wf).await.unwrap();
        let run = WorkflowRun::pending(wf.id, Some(json!({"userId": 7})));
        repo.create_run(&run).await.unwrap();

        repo.update_run(&run.id, &RunPatch::status(RunStatus::Running).started_now())
            .await
            .unwrap();
        repo.update_run(
            &run.id,
            &RunPatch::status(RunStatus::Completed)
                .with_output(json!({"ok": true}))
                .completed_now(),
        )
        .await
        .unwrap();

        let loaded = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Completed);
        assert_eq!(loaded.input, Some(json!({"userId": 7})));
        assert_eq!(loaded.output, Some(json!({"ok": true})));
        assert!(loaded.started_at.is_some());
        assert!(loaded.completed_at.is_some());
        assert!(loaded.error.is_none());

        assert!(matches!(
            repo.update_run(&Uuid::now_v7(), &RunPatch::status(RunStatus::Failed)).await,
            Err(RepositoryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn transition_run_only_moves_from_allowed_statuses() {
        let (repo, _dir) = repo().await;
        let wf = workflow("wf");
        repo.create_workflow(&wf).await.unwrap();
        let run = WorkflowRun::pending(wf.id, None);
        repo.create_run(&run).await.unwrap();
        let live = [RunStatus::Pending, RunStatus::Running];

        let moved = repo
            .transition_run(&run.id, &live, &RunPatch::status(RunStatus::Running).started_now())
            .await
            .unwrap();
        assert!(moved);

        repo.update_run(&run.id, &RunPatch::status(RunStatus::Cancelled).completed_now())
            .await
            .unwrap();

        let moved = repo
            .transition_run(
                &run.id,
                &live,
                &RunPatch::status(RunStatus::Completed).with_output(json!({"late": true})),
            )
            .await
            .unwrap();
        assert!(!moved);

        let loaded = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Cancelled);
        assert!(loaded.output.is_none());

        let missing = repo
            .transition_run(&Uuid::now_v7(), &live, &RunPatch::status(RunStatus::Failed))
            .await
            .unwrap();
        assert!(!missing);
        assert!(!repo.transition_run(&run.id, &[], &RunPatch::status(RunStatus::Failed)).await.unwrap());
    }

    #[tokio::test]
    async fn list_runs_newest_first_with_limit() {
        let (repo, _dir) = repo().await;
        let wf = workflow("wf");
        repo.create_workflow(&wf).await.unwrap();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let run = WorkflowRun::pending(wf.id, None);
            repo.create_run(&run).await.unwrap();
            ids.push(run.id);
        }

        let runs = repo.list_runs(&wf.id, 2).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, ids[2]);
        assert_eq!(runs[1].id, ids[1]);
    }

    #[tokio::test]
    async fn step_runs_by_status_and_latest() {
        let (repo, _dir) = repo().await;
        let wf = workflow("wf");
        repo.create_workflow(&wf).await.unwrap();
        let s1 = step(wf.id, "first", 1);
        let s2 = step(wf.id, "second", 2);
        repo.create_step(&s1).await.unwrap();
        repo.create_step(&s2).await.unwrap();
        let run = WorkflowRun::pending(wf.id, None);
        repo.create_run(&run).await.unwrap();

        let sr1 = StepRun::pending(run.id, s1.id, json!({"n": 1}), 3);
        repo.create_step_run(&sr1).await.unwrap();
        repo.update_step_run(
            &sr1.id,
            &StepRunPatch::status(RunStatus::Running).with_attempts(1).started_now(),
        )
        .await
        .unwrap();
        repo.update_step_run(&sr1.id, &StepRunPatch::error("HTTP 503"))
            .await
            .unwrap();
        repo.update_step_run(
            &sr1.id,
            &StepRunPatch::status(RunStatus::Completed)
                .with_output(json!({"v": 1}))
                .completed_now(),
        )
        .await
        .unwrap();

        let sr2 = StepRun::pending(run.id, s2.id, json!({}), 3);
        repo.create_step_run(&sr2).await.unwrap();

        let loaded = repo.get_step_run(&sr1.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Completed);
        assert_eq!(loaded.attempts_made, 1);
        assert_eq!(loaded.error.as_deref(), Some("HTTP 503"));
        assert_eq!(loaded.input, Some(json!({"n": 1})));

        let all = repo.list_step_runs(&run.id).await.unwrap();
        assert_eq!(all.iter().map(|s| s.id).collect::<Vec<_>>(), [sr1.id, sr2.id]);

        let completed = repo
            .list_step_runs_by_status(&run.id, RunStatus::Completed)
            .await
            .unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].id, sr1.id);

        let latest = repo.latest_step_run(&run.id).await.unwrap().unwrap();
        assert_eq!(latest.id, sr2.id);
        assert!(repo.latest_step_run(&Uuid::now_v7()).await.unwrap().is_none());
    }
}
