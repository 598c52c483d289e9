//! Job processors: the units of work the worker pools execute.
//!
//! - [`workflow::WorkflowProcessor`] advances a run (start, continue).
//! - [`step::StepProcessor`] performs one attempt of one step.

pub mod step;
pub mod workflow;

pub use step::StepProcessor;
pub use workflow::WorkflowProcessor;
