//! Workflow repository trait definition.
//!
//! Defines the storage interface for workflow definitions, step definitions,
//! workflow runs, and step runs. The infrastructure layer (flowline-infra)
//! implements this trait with SQLite persistence.

use flowline_types::error::RepositoryError;
use flowline_types::run::{RunPatch, RunStatus, StepRun, StepRunPatch, WorkflowRun};
use flowline_types::workflow::{Step, Workflow, WorkflowStatus};
use uuid::Uuid;

/// Repository trait for workflow persistence.
///
/// Covers four entity families:
/// - **Workflows:** definition records and their lifecycle status.
/// - **Steps:** step definitions, always listed by ascending `order`.
/// - **Runs:** workflow execution instances.
/// - **Step runs:** one record per scheduled step, listed in creation order.
///
/// Updates take partial patches; a patch against a missing record returns
/// `RepositoryError::NotFound`.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Workflows
    // -----------------------------------------------------------------------

    fn create_workflow(
        &self,
        workflow: &Workflow,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_workflow(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Workflow>, RepositoryError>> + Send;

    /// List workflows, newest first.
    fn list_workflows(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<Workflow>, RepositoryError>> + Send;

    fn update_workflow_status(
        &self,
        id: &Uuid,
        status: WorkflowStatus,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Atomically bump the version counter. Returns the new version.
    fn increment_workflow_version(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<u32, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Insert a step definition. Returns `Conflict` when the workflow already
    /// has a step with the same name or order.
    fn create_step(
        &self,
        step: &Step,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_step(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Step>, RepositoryError>> + Send;

    /// All steps of a workflow, ordered by `order` ascending.
    fn list_steps(
        &self,
        workflow_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<Step>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    fn create_run(
        &self,
        run: &WorkflowRun,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_run(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowRun>, RepositoryError>> + Send;

    fn update_run(
        &self,
        id: &Uuid,
        patch: &RunPatch,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Apply `patch` only while the run's status is one of `from`.
    ///
    /// Returns `false` when the run is missing or has already moved to a
    /// status outside `from`. The check and the write are one atomic step, so
    /// a concurrent cancel can never be overwritten.
    fn transition_run(
        &self,
        id: &Uuid,
        from: &[RunStatus],
        patch: &RunPatch,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Runs of a workflow, newest first.
    fn list_runs(
        &self,
        workflow_id: &Uuid,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRun>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Step runs
    // -----------------------------------------------------------------------

    fn create_step_run(
        &self,
        step_run: &StepRun,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_step_run(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<StepRun>, RepositoryError>> + Send;

    fn update_step_run(
        &self,
        id: &Uuid,
        patch: &StepRunPatch,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// All step runs of a run, oldest first.
    fn list_step_runs(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StepRun>, RepositoryError>> + Send;

    /// Step runs of a run in the given status, oldest first.
    fn list_step_runs_by_status(
        &self,
        run_id: &Uuid,
        status: RunStatus,
    ) -> impl std::future::Future<Output = Result<Vec<StepRun>, RepositoryError>> + Send;

    /// The most recently created step run of a run.
    fn latest_step_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<StepRun>, RepositoryError>> + Send;
}
