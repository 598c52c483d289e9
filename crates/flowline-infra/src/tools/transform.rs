//! `transform`: pick a value out of JSON data by path.
//!
//! Input: `{ data, expression }`. The expression is a dotted path where each
//! segment is a key or a `key[idx]` array access (`body.items[0].id`); an
//! empty expression returns `data` unchanged.
//!
//! Output: `{ result }`, with `result` set to `null` when the path does not
//! lead anywhere.

use flowline_core::engine::resolver::follow_path;
use flowline_core::tool::Tool;
use flowline_types::tool::{ToolContext, ToolMetadata, ToolResult};
use serde::Deserialize;
use serde_json::{Value, json};

#[derive(Debug, Deserialize)]
struct TransformInput {
    #[serde(default)]
    data: Value,
    expression: String,
}

/// Built-in tool reshaping step outputs.
pub struct TransformTool {
    metadata: ToolMetadata,
}

impl TransformTool {
    pub fn new() -> Self {
        Self {
            metadata: ToolMetadata {
                name: "transform".to_string(),
                version: "1.0.0".to_string(),
                description: "Transform data using JSONPath-like expressions".to_string(),
            },
        }
    }
}

impl Default for TransformTool {
    fn default() -> Self {
        Self::new()
    }
}

impl Tool for TransformTool {
    fn metadata(&self) -> &ToolMetadata {
        &self.metadata
    }

    async fn execute(&self, input: &Value, ctx: &ToolContext) -> ToolResult {
        let parsed: TransformInput = match serde_json::from_value(input.clone()) {
            Ok(parsed) => parsed,
            Err(e) => return ToolResult::fail(format!("Invalid input: {e}")),
        };

        let result = follow_path(&parsed.data, &parsed.expression)
            .cloned()
            .unwrap_or(Value::Null);
        tracing::debug!(
            step_run_id = %ctx.step_run.id,
            expression = %parsed.expression,
            found = !result.is_null(),
            "transform evaluated"
        );
        ToolResult::ok(json!({ "result": result }))
    }
}
