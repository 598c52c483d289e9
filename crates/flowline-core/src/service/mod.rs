pub mod run;
pub mod workflow;

pub use run::RunService;
pub use workflow::{WorkflowDetail, WorkflowService};
