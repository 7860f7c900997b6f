//! Orchestration pipeline
//!
//! Runs the fixed stage sequence against one [`crate::Config`]: free ports,
//! install, prime and start the backend, pull the admin secret from its log,
//! log in, write the client config, optionally start the secondary service,
//! run the tests, and always tear everything down.

mod context;
mod report;
mod runner;
mod stage;

pub use context::{OrchestrationContext, TestOutcome};
pub use report::{FailureLog, PipelineReport};
pub use runner::{Pipeline, RunOptions};
pub use stage::{PipelineStage, StageError, StageKind, StageStatus};
