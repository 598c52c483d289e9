use thiserror::Error;

/// Errors from repository operations (used by trait definitions in flowline-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Errors from job queue backends.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(String),

    #[error("job payload serialization error: {0}")]
    Serialization(String),

    #[error("job '{0}' not found")]
    JobNotFound(String),

    /// The job was requeued or settled by someone else since this worker
    /// reserved it.
    #[error("job '{0}' is no longer reserved by this worker")]
    ReservationLost(String),
}

/// Errors raised by the execution engine and the management services.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{resource} with id '{id}' not found")]
    NotFound { resource: String, id: String },

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("Step '{step_id}' failed: {message}")]
    StepExecution {
        step_id: String,
        message: String,
        retryable: bool,
    },

    #[error("Workflow run '{run_id}' failed: {message}")]
    WorkflowExecution { run_id: String, message: String },

    #[error("Tool '{0}' not found in registry")]
    ToolNotFound(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl EngineError {
    pub fn not_found(resource: impl Into<String>, id: impl ToString) -> Self {
        EngineError::NotFound {
            resource: resource.into(),
            id: id.to_string(),
        }
    }

    /// A step failure that the queue may retry.
    pub fn step_retryable(step_id: impl ToString, message: impl Into<String>) -> Self {
        EngineError::StepExecution {
            step_id: step_id.to_string(),
            message: message.into(),
            retryable: true,
        }
    }

    /// A step failure that must not be retried.
    pub fn step_fatal(step_id: impl ToString, message: impl Into<String>) -> Self {
        EngineError::StepExecution {
            step_id: step_id.to_string(),
            message: message.into(),
            retryable: false,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotFound { .. } => "NOT_FOUND",
            EngineError::Validation(_) => "VALIDATION_ERROR",
            EngineError::InvalidState(_) => "INVALID_STATE",
            EngineError::StepExecution { .. } => "STEP_EXECUTION_ERROR",
            EngineError::WorkflowExecution { .. } => "WORKFLOW_EXECUTION_ERROR",
            EngineError::ToolNotFound(_) => "TOOL_NOT_FOUND",
            EngineError::Repository(_) => "REPOSITORY_ERROR",
            EngineError::Queue(_) => "QUEUE_ERROR",
        }
    }

    /// Whether another attempt of the same job could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::StepExecution { retryable, .. } => *retryable,
            EngineError::Repository(RepositoryError::Connection) => true,
            EngineError::Queue(QueueError::Backend(_)) => true,
            _ => false,
        }
    }

    /// The bare failure message, without the step/run prefix.
    pub fn message(&self) -> String {
        match self {
            EngineError::StepExecution { message, .. }
            | EngineError::WorkflowExecution { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}
