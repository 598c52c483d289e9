//! Infrastructure adapters for Flowline.
//!
//! Implements the ports defined in `flowline-core`: the SQLite workflow
//! repository and durable job queue, the `config.toml` loader, data
//! directory resolution, and the built-in tools.

pub mod config;
pub mod data_dir;
pub mod sqlite;
pub mod tools;
