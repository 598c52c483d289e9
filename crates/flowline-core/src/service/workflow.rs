//! Workflow definition management.
//!
//! Creates workflows, appends steps, moves workflows through
//! DRAFT/ACTIVE/ARCHIVED, and imports whole definitions from a
//! [`WorkflowSpec`] document. Every step added bumps the workflow version.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use flowline_types::error::{EngineError, RepositoryError};
use flowline_types::workflow::{NewStep, Step, Workflow, WorkflowSpec, WorkflowStatus};
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::repository::workflow::WorkflowRepository;

/// A workflow together with its steps in execution order.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowDetail {
    #[serde(flatten)]
    pub workflow: Workflow,
    pub steps: Vec<Step>,
}

pub struct WorkflowService<R: WorkflowRepository> {
    repo: Arc<R>,
}

impl<R: WorkflowRepository> WorkflowService<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self { repo }
    }

    /// Create a DRAFT workflow at version 1.
    pub async fn create_workflow(
        &self,
        name: &str,
        description: Option<String>,
    ) -> Result<Workflow, EngineError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::Validation(
                "Workflow name cannot be empty".to_string(),
            ));
        }

        let now = Utc::now();
        let workflow = Workflow {
            id: Uuid::now_v7(),
            name: name.to_string(),
            description,
            version: 1,
            status: WorkflowStatus::Draft,
            created_at: now,
            updated_at: now,
        };
        self.repo.create_workflow(&workflow).await?;
        tracing::info!(workflow_id = %workflow.id, name = %workflow.name, "workflow created");
        Ok(workflow)
    }

    pub async fn get_workflow(&self, id: &Uuid) -> Result<Workflow, EngineError> {
        self.repo
            .get_workflow(id)
            .await?
            .ok_or_else(|| EngineError::not_found("Workflow", id))
    }

    pub async fn list_workflows(&self) -> Result<Vec<Workflow>, EngineError> {
        Ok(self.repo.list_workflows().await?)
    }

    pub async fn get_workflow_with_steps(&self, id: &Uuid) -> Result<WorkflowDetail, EngineError> {
        let workflow = self.get_workflow(id).await?;
        let steps = self.repo.list_steps(id).await?;
        Ok(WorkflowDetail { workflow, steps })
    }

    /// Append a step. Names and orders are unique within a workflow.
    pub async fn add_step(&self, workflow_id: &Uuid, new: NewStep) -> Result<Step, EngineError> {
        validate_step(&new)?;
        self.get_workflow(workflow_id).await?;

        let existing = self.repo.list_steps(workflow_id).await?;
        if let Some(clash) = existing
            .iter()
            .find(|s| s.name == new.name.trim() || s.order == new.order)
        {
            return Err(EngineError::Validation(format!(
                "Step '{}' conflicts with existing step '{}' (order {})",
                new.name, clash.name, clash.order
            )));
        }

        let step = Step {
            id: Uuid::now_v7(),
            workflow_id: *workflow_id,
            name: new.name.trim().to_string(),
            description: new.description,
            tool_name: new.tool_name.trim().to_string(),
            config: or_empty_object(new.config),
            input_mapping: or_empty_object(new.input_mapping),
            retry: new.retry,
            timeout_ms: new.timeout_ms,
            order: new.order,
            created_at: Utc::now(),
        };
        self.repo.create_step(&step).await.map_err(|e| match e {
            RepositoryError::Conflict(msg) => EngineError::Validation(msg),
            other => other.into(),
        })?;
        let version = self.repo.increment_workflow_version(workflow_id).await?;

        tracing::info!(
            workflow_id = %workflow_id,
            step = %step.name,
            order = step.order,
            version,
            "step added"
        );
        Ok(step)
    }

    pub async fn set_status(
        &self,
        workflow_id: &Uuid,
        status: WorkflowStatus,
    ) -> Result<Workflow, EngineError> {
        self.repo
            .update_workflow_status(workflow_id, status)
            .await
            .map_err(|e| match e {
                RepositoryError::NotFound => EngineError::not_found("Workflow", workflow_id),
                other => other.into(),
            })?;
        tracing::info!(workflow_id = %workflow_id, status = %status, "workflow status changed");
        self.get_workflow(workflow_id).await
    }

    /// Create a workflow and all its steps from a definition document.
    ///
    /// The whole document is validated before anything is written.
    pub async fn import_definition(&self, spec: WorkflowSpec) -> Result<WorkflowDetail, EngineError> {
        let mut names = HashSet::new();
        let mut orders = HashSet::new();
        for step in &spec.steps {
            validate_step(step)?;
            if !names.insert(step.name.trim().to_string()) {
                return Err(EngineError::Validation(format!(
                    "Duplicate step name '{}'",
                    step.name
                )));
            }
            if !orders.insert(step.order) {
                return Err(EngineError::Validation(format!(
                    "Duplicate step order {}",
                    step.order
                )));
            }
        }

        let workflow = self
            .create_workflow(&spec.name, spec.description.clone())
            .await?;
        for step in spec.steps {
            self.add_step(&workflow.id, step).await?;
        }
        if spec.activate {
            self.set_status(&workflow.id, WorkflowStatus::Active).await?;
        }
        self.get_workflow_with_steps(&workflow.id).await
    }
}

fn or_empty_object(value: Value) -> Value {
    if value.is_null() {
        Value::Object(Map::new())
    } else {
        value
    }
}

fn validate_step(step: &NewStep) -> Result<(), EngineError> {
    if step.name.trim().is_empty() {
        return Err(EngineError::Validation("Step name cannot be empty".to_string()));
    }
    if step.tool_name.trim().is_empty() {
        return Err(EngineError::Validation(format!(
            "Step '{}' must name a tool",
            step.name
        )));
    }
    if let Some(retry) = &step.retry {
        if retry.max_attempts < 1 {
            return Err(EngineError::Validation(format!(
                "Step '{}' must allow at least one attempt",
                step.name
            )));
        }
    }
    Ok(())
}
