//! The execution engine: template resolution and step sequencing.

pub mod orchestrator;
pub mod resolver;
