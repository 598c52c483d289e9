//! Tool registry for runtime tool lookup.
//!
//! A name-indexed registry of boxed tools. The step processor resolves the
//! tool named by a step definition through this registry on every attempt.

use std::sync::Arc;

use dashmap::DashMap;
use flowline_types::error::EngineError;
use flowline_types::tool::ToolMetadata;

use super::box_tool::BoxTool;

/// Name-indexed lookup of executable tools.
pub trait ToolRegistry: Send + Sync {
    /// Register a tool. A second tool with the same name is rejected.
    fn register(&self, tool: BoxTool) -> Result<(), EngineError>;

    /// Look up a tool by name. A miss is `EngineError::ToolNotFound`.
    fn get(&self, name: &str) -> Result<Arc<BoxTool>, EngineError>;

    fn has(&self, name: &str) -> bool;

    /// Metadata of every registered tool, sorted by name.
    fn list(&self) -> Vec<ToolMetadata>;

    fn clear(&self);
}

/// Registry backed by a concurrent map; safe to share across worker tasks.
#[derive(Default)]
pub struct InMemoryToolRegistry {
    tools: DashMap<String, Arc<BoxTool>>,
}

impl InMemoryToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: DashMap::new(),
        }
    }
}

impl ToolRegistry for InMemoryToolRegistry {
    fn register(&self, tool: BoxTool) -> Result<(), EngineError> {
        let name = tool.name().to_string();
        match self.tools.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(EngineError::Validation(format!(
                "Tool '{name}' is already registered"
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(tool));
                tracing::debug!(tool = %name, "registered tool");
                Ok(())
            }
        }
    }

    fn get(&self, name: &str) -> Result<Arc<BoxTool>, EngineError> {
        self.tools
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EngineError::ToolNotFound(name.to_string()))
    }

    fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    fn list(&self) -> Vec<ToolMetadata> {
        let mut tools: Vec<ToolMetadata> = self
            .tools
            .iter()
            .map(|entry| entry.value().metadata().clone())
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    fn clear(&self) {
        self.tools.clear();
    }
}
