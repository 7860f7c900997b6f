//! Error types for the test-environment orchestrator
//!
//! Each message names the resource involved: the command, port, path or
//! marker that failed.

use std::io;
use std::path::Path;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the orchestrator
#[derive(Error, Debug)]
pub enum Error {
    // === Process Errors ===
    #[error("Failed to start '{command}': {reason}")]
    ProcessStart { command: String, reason: String },

    #[error("Process '{name}' exited before it became ready (exit code {code:?})")]
    ProcessExited { name: String, code: Option<i32> },

    #[error("Command '{command}' failed with exit code {code:?}")]
    CommandFailed { command: String, code: Option<i32> },

    #[error("Could not free port {port}: {reason}")]
    PortReclaim { port: u16, reason: String },

    #[error("Service '{name}' did not accept connections on port {port} within {secs} seconds")]
    ReadinessTimeout { name: String, port: u16, secs: u64 },

    #[error("{} process(es) survived forced termination: {survivors:?}", .survivors.len())]
    TeardownIncomplete { survivors: Vec<u32> },

    // === Log Watch Errors ===
    #[error("Marker '{label}' not observed within {budget_secs} seconds")]
    LogMarkerTimeout { label: String, budget_secs: u64 },

    #[error("Output ended before marker '{label}' appeared")]
    LogMarkerMissing { label: String },

    #[error("Invalid marker pattern: {0}")]
    InvalidPattern(String),

    // === Credential Errors ===
    #[error("Authentication failed: {0}")]
    AuthFailure(String),

    // === Test Runner Errors ===
    #[error("Test runner exited with code {code:?}")]
    TestRunnerFailure { code: Option<i32> },

    // === Timeout Errors ===
    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    #[error("Interrupted by {0}")]
    Interrupted(String),

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    #[error("Cannot access config document '{path}': {reason}")]
    ConfigIo { path: String, reason: String },

    #[error("Malformed config document '{path}': {reason}")]
    ConfigFormat { path: String, reason: String },

    #[error("Cannot apply mutation at '{path}': {reason}")]
    ConfigMutation { path: String, reason: String },

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // === Internal Errors ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a process start error
    pub fn process_start(command: impl Into<String>, reason: impl ToString) -> Self {
        Self::ProcessStart {
            command: command.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a config IO error for a document path
    pub fn config_io(path: &Path, reason: impl ToString) -> Self {
        Self::ConfigIo {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }

    /// Create a config format error for a document path
    pub fn config_format(path: &Path, reason: impl ToString) -> Self {
        Self::ConfigFormat {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }

    /// Create a mutation error for a key path
    pub fn config_mutation(path: impl ToString, reason: impl ToString) -> Self {
        Self::ConfigMutation {
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Stable machine-readable code, used in run reports
    pub fn code(&self) -> &'static str {
        match self {
            Error::ProcessStart { .. } => "PROCESS_START_FAILURE",
            Error::ProcessExited { .. } => "PROCESS_EXITED",
            Error::CommandFailed { .. } => "COMMAND_FAILED",
            Error::PortReclaim { .. } => "PORT_RECLAIM_FAILURE",
            Error::ReadinessTimeout { .. } => "READINESS_TIMEOUT",
            Error::TeardownIncomplete { .. } => "TEARDOWN_INCOMPLETE",
            Error::LogMarkerTimeout { .. } => "LOG_MARKER_TIMEOUT",
            Error::LogMarkerMissing { .. } => "LOG_MARKER_MISSING",
            Error::InvalidPattern(_) => "INVALID_PATTERN",
            Error::AuthFailure(_) => "AUTH_FAILURE",
            Error::TestRunnerFailure { .. } => "TEST_RUNNER_FAILURE",
            Error::Timeout(_) => "TIMEOUT",
            Error::Interrupted(_) => "INTERRUPTED",
            Error::Config(_) | Error::ConfigParse(_) => "CONFIG_INVALID",
            Error::ConfigIo { .. } | Error::ConfigFormat { .. } | Error::ConfigMutation { .. } => {
                "CONFIG_IO_FAILURE"
            }
            Error::Io(_) => "IO_ERROR",
            Error::Json(_) | Error::Yaml(_) => "SERIALIZATION_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_group_config_document_failures() {
        let io = Error::config_io(Path::new("a.json"), "missing");
        let fmt = Error::config_format(Path::new("a.json"), "bad");
        let mutation = Error::config_mutation("services.x", "not a map");
        assert_eq!(io.code(), "CONFIG_IO_FAILURE");
        assert_eq!(fmt.code(), "CONFIG_IO_FAILURE");
        assert_eq!(mutation.code(), "CONFIG_IO_FAILURE");
    }

    #[test]
    fn test_teardown_message_counts_survivors() {
        let e = Error::TeardownIncomplete {
            survivors: vec![10, 11],
        };
        assert!(e.to_string().starts_with("2 process(es)"));
    }
}
