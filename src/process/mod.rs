//! Process supervision
//!
//! Spawns external commands in their own process group, captures their
//! output, and tears whole process trees down with graceful-then-forced
//! signalling. Also reclaims TCP ports leaked by earlier runs.

pub mod procfs;
mod signal;
mod supervisor;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::common::{Error, Result};

pub use supervisor::{CommandOutcome, ProcessSummary, ProcessSupervisor, StopOutcome};

/// A command to launch: either a shell line or an explicit argument vector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandLine {
    /// Run through `sh -c`
    Shell(String),
    /// Program followed by its arguments, no shell involved
    Argv(Vec<String>),
}

impl CommandLine {
    /// Build an argv command line
    pub fn argv<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandLine::Argv(parts.into_iter().map(Into::into).collect())
    }

    /// Resolve to a program and its arguments
    pub fn program_and_args(&self) -> Result<(PathBuf, Vec<String>)> {
        match self {
            CommandLine::Shell(line) => {
                if line.trim().is_empty() {
                    return Err(Error::process_start(line.clone(), "empty command"));
                }
                Ok((
                    PathBuf::from("sh"),
                    vec!["-c".to_string(), line.clone()],
                ))
            }
            CommandLine::Argv(parts) => {
                let (program, args) = parts
                    .split_first()
                    .ok_or_else(|| Error::process_start("", "empty argument list"))?;
                // Bare names go through PATH so a typo fails with a clear message
                let program_path = Path::new(program);
                let resolved = if program_path.components().count() > 1 {
                    program_path.to_path_buf()
                } else {
                    which::which(program).map_err(|e| {
                        Error::process_start(self.to_string(), format!("executable not found: {e}"))
                    })?
                };
                Ok((resolved, args.to_vec()))
            }
        }
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandLine::Shell(line) => f.write_str(line),
            CommandLine::Argv(parts) => f.write_str(&parts.join(" ")),
        }
    }
}

impl From<&str> for CommandLine {
    fn from(line: &str) -> Self {
        CommandLine::Shell(line.to_string())
    }
}

/// Where a process's stdout/stderr go
#[derive(Debug, Clone)]
pub struct CaptureTarget {
    /// Log file receiving every captured line
    pub log_file: PathBuf,
    /// Append to an existing log instead of truncating it
    pub append: bool,
    /// Also expose the lines as a live stream (see [`ManagedProcess::take_output`])
    pub live: bool,
    /// Mirror lines to our own stdout
    pub echo: bool,
}

impl CaptureTarget {
    /// Capture into a fresh (truncated) log file
    pub fn file(log_file: impl Into<PathBuf>) -> Self {
        Self {
            log_file: log_file.into(),
            append: false,
            live: false,
            echo: false,
        }
    }

    pub fn appending(mut self) -> Self {
        self.append = true;
        self
    }

    pub fn with_live_stream(mut self) -> Self {
        self.live = true;
        self
    }

    pub fn echoed(mut self) -> Self {
        self.echo = true;
        self
    }
}

/// Lifecycle state of a managed process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Starting,
    Running,
    Terminated,
    Failed,
}

impl ProcessState {
    pub fn is_live(&self) -> bool {
        matches!(self, ProcessState::Starting | ProcessState::Running)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Terminated => "terminated",
            ProcessState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// State cell shared between the supervisor, the output pumps and handles
#[derive(Debug, Clone)]
pub(crate) struct SharedState(Arc<Mutex<ProcessState>>);

impl SharedState {
    fn new(state: ProcessState) -> Self {
        Self(Arc::new(Mutex::new(state)))
    }

    pub(crate) fn get(&self) -> ProcessState {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set(&self, state: ProcessState) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Starting -> Running; any other state is left alone
    fn promote(&self) {
        let mut guard = self.0.lock().unwrap_or_else(|e| e.into_inner());
        if *guard == ProcessState::Starting {
            *guard = ProcessState::Running;
        }
    }
}

/// Supervisor-assigned identifier of a managed process
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(u64);

/// Handle to a process spawned by [`ProcessSupervisor::start`]
///
/// The supervisor owns the OS child; this handle carries identity, the log
/// location, the shared lifecycle state and (optionally) the live output.
#[derive(Debug)]
pub struct ManagedProcess {
    id: ProcessId,
    name: String,
    command: CommandLine,
    workdir: PathBuf,
    log_file: PathBuf,
    pid: u32,
    port: Option<u16>,
    state: SharedState,
    output: Option<mpsc::UnboundedReceiver<String>>,
}

impl ManagedProcess {
    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn command(&self) -> &CommandLine {
        &self.command
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    /// OS pid; also the process-group id since every process leads its group
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn state(&self) -> ProcessState {
        self.state.get()
    }

    /// Take the live output stream (only once, and only if requested at start)
    pub fn take_output(&mut self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.output.take()
    }
}
