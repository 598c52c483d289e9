//! Built-in tools and their registration.

pub mod http_fetch;
pub mod llm_chat;
pub mod transform;

#[cfg(test)]
pub(crate) mod test_support;

use flowline_core::tool::{BoxTool, ToolRegistry};
use flowline_types::error::EngineError;
use serde::{Deserialize, Serialize};

pub use http_fetch::HttpFetchTool;
pub use llm_chat::{LlmChatConfig, LlmChatTool};
pub use transform::TransformTool;

/// Which built-in tools a worker process registers at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRegistrationConfig {
    /// `llm-chat`, configured from `LLM_BASE_URL` / `LLM_API_KEY` / `LLM_MODEL`.
    #[serde(default = "default_true")]
    pub llm_chat: bool,
    #[serde(default = "default_true")]
    pub http_fetch: bool,
    #[serde(default = "default_true")]
    pub transform: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ToolRegistrationConfig {
    fn default() -> Self {
        Self {
            llm_chat: true,
            http_fetch: true,
            transform: true,
        }
    }
}

/// Register every enabled built-in tool.
///
/// Fails with `EngineError::Validation` if a tool of the same name is already
/// registered.
pub fn register_default_tools(
    registry: &dyn ToolRegistry,
    config: &ToolRegistrationConfig,
) -> Result<(), EngineError> {
    if config.llm_chat {
        registry.register(BoxTool::new(LlmChatTool::new(LlmChatConfig::from_env())))?;
    }
    if config.http_fetch {
        registry.register(BoxTool::new(HttpFetchTool::new()))?;
    }
    if config.transform {
        registry.register(BoxTool::new(TransformTool::new()))?;
    }

    tracing::info!(tools = registry.list().len(), "built-in tools registered");
    Ok(())
}
