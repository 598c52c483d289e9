//! Workflow and step definition types.
//!
//! A `Workflow` is a named, versioned container of `Step` definitions. Steps
//! execute strictly by ascending `order`; each step names the tool that does
//! the work and carries an input-mapping template resolved against the run
//! input and the outputs of earlier steps.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// A workflow definition record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// UUIDv7 assigned at creation.
    pub id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Monotonic version counter, bumped on every structural change.
    pub version: u32,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Workflow lifecycle states. Only `Active` workflows may be triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Draft,
    Active,
    Archived,
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowStatus::Draft => write!(f, "DRAFT"),
            WorkflowStatus::Active => write!(f, "ACTIVE"),
            WorkflowStatus::Archived => write!(f, "ARCHIVED"),
        }
    }
}

impl FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "DRAFT" => Ok(WorkflowStatus::Draft),
            "ACTIVE" => Ok(WorkflowStatus::Active),
            "ARCHIVED" => Ok(WorkflowStatus::Archived),
            other => Err(format!("invalid workflow status: '{other}'")),
        }
    }
}

impl Default for WorkflowStatus {
    fn default() -> Self {
        WorkflowStatus::Draft
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// A step definition within a workflow.
///
/// `name` and `order` are both unique within the owning workflow. The name is
/// the key under which this step's output is exposed to later steps
/// (`{{ steps.<name>.field }}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Registry name of the tool that executes this step.
    pub tool_name: String,
    /// Static tool configuration.
    #[serde(default)]
    pub config: Value,
    /// Arbitrary nested template resolved into the tool input.
    #[serde(default)]
    pub input_mapping: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Timeout hint in milliseconds, enforced at the tool boundary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Execution position; steps run by ascending order.
    pub order: i32,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Per-step retry budget and backoff, handed to the queue at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Maximum number of attempts (default 3, must be at least 1).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: Backoff::default(),
        }
    }
}

/// Delay applied between retried attempts of a failed step job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backoff {
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    #[serde(alias = "delay")]
    pub delay_ms: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Exponential,
    Fixed,
}

impl fmt::Display for BackoffKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffKind::Exponential => write!(f, "exponential"),
            BackoffKind::Fixed => write!(f, "fixed"),
        }
    }
}

impl FromStr for BackoffKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "exponential" => Ok(BackoffKind::Exponential),
            "fixed" => Ok(BackoffKind::Fixed),
            other => Err(format!("invalid backoff type: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Definition documents
// ---------------------------------------------------------------------------

/// A workflow definition document (YAML or JSON) used for bulk import.
///
/// ```yaml
/// name: enrich-user
/// steps:
///   - name: fetch
///     tool: http-fetch
///     order: 0
///     input:
///       url: "https://api.example.com/users/{{ input.userId }}"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Activate the workflow right after import.
    #[serde(default)]
    pub activate: bool,
    #[serde(default)]
    pub steps: Vec<NewStep>,
}

/// Input for creating a step definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewStep {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(alias = "tool")]
    pub tool_name: String,
    #[serde(default)]
    pub config: Value,
    #[serde(default, alias = "input")]
    pub input_mapping: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    pub order: i32,
}

impl WorkflowSpec {
    /// Parse a definition document. JSON is a subset of YAML, so both work.
    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml_ng::Error> {
        serde_yaml_ng::from_str(content)
    }
}
