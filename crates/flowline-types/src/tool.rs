//! Tool boundary types.
//!
//! A tool is the unit of work a step invokes. It receives the resolved input
//! plus a read-only `ToolContext` and answers with a `ToolResult`; a tool
//! reports failure through the result rather than by erroring.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::run::{StepRun, WorkflowRun};

/// Execution context handed to a tool alongside its input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolContext {
    pub workflow_run: WorkflowRun,
    pub step_run: StepRun,
    /// Outputs of earlier steps keyed by step name.
    #[serde(default)]
    pub previous_outputs: Map<String, Value>,
    #[serde(default)]
    pub variables: Value,
}

/// Outcome of a tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Descriptive metadata a tool publishes about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub name: String,
    pub version: String,
    pub description: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_result_constructors() {
        let ok = ToolResult::ok(json!({"x": 1}));
        assert!(ok.success);
        assert_eq!(ok.data, Some(json!({"x": 1})));
        assert!(ok.error.is_none());

        let fail = ToolResult::fail("nope");
        assert!(!fail.success);
        assert!(fail.data.is_none());
        assert_eq!(fail.error.as_deref(), Some("nope"));
    }
}
