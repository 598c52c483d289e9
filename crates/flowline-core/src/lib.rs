//! Execution engine, ports, and worker glue for Flowline.
//!
//! This crate defines the "ports" (repository, queue, and tool traits) that
//! the infrastructure layer implements, plus everything that runs on top of
//! them: the template resolver, the sequential orchestrator, the job
//! processors, the worker pools, and the management services. It depends
//! only on `flowline-types` and never on `flowline-infra`.

pub mod engine;
pub mod processor;
pub mod queue;
pub mod repository;
pub mod service;
pub mod tool;
pub mod worker;

#[cfg(test)]
pub mod testing;
