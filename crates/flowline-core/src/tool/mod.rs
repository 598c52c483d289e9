//! Tool abstraction: the pluggable unit of work behind each step.
//!
//! `Tool` uses RPITIT for `execute`, so it cannot be a trait object directly.
//! [`BoxTool`] provides type erasure and [`ToolRegistry`] looks tools up by
//! name at execution time.

pub mod box_tool;
pub mod registry;

use flowline_types::tool::{ToolContext, ToolMetadata, ToolResult};
use serde_json::Value;

pub use box_tool::BoxTool;
pub use registry::{InMemoryToolRegistry, ToolRegistry};

/// A named capability a step can invoke.
///
/// Tools report failure through `ToolResult::fail`; they never panic or
/// error out of `execute`.
pub trait Tool: Send + Sync {
    fn metadata(&self) -> &ToolMetadata;

    /// Run the tool on its resolved input.
    fn execute(
        &self,
        input: &Value,
        ctx: &ToolContext,
    ) -> impl std::future::Future<Output = ToolResult> + Send;
}
