//! testbed - end-to-end test environment orchestrator
//!
//! Supervises the processes of a multi-service test environment, pulls a
//! runtime-generated admin secret out of their logs, synthesizes config
//! files, logs in, runs the test suite and tears everything down.

pub mod auth;
pub mod cli;
pub mod commands;
pub mod common;
pub mod pipeline;
pub mod process;
pub mod synth;
pub mod watch;

// Re-export commonly used types for tests
pub use common::config::Config;
pub use common::{Error, Result};
pub use pipeline::{Pipeline, PipelineReport, RunOptions};
