//! Queue consumers.
//!
//! [`WorkerPool`] is the generic poll loop; [`WorkflowWorker`] and
//! [`StepWorker`] settle jobs on the two logical queues; [`Engine`] wires
//! everything together from an `EngineConfig`.

pub mod engine;
pub mod pool;
pub mod step;
pub mod workflow;

pub use engine::Engine;
pub use pool::{JobHandler, PoolConfig, WorkerPool};
pub use step::StepWorker;
pub use workflow::WorkflowWorker;
