//! Observability setup for Flowline processes.

pub mod tracing_setup;
