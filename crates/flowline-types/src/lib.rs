//! Shared domain types for Flowline.
//!
//! Workflow and step definitions, run/step-run execution records, queue job
//! payloads, the tool boundary types, engine configuration, and the error
//! taxonomy shared by every other crate.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod job;
pub mod run;
pub mod tool;
pub mod workflow;
