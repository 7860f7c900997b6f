//! Process supervisor implementation

use std::collections::BTreeMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::common::{Error, Result};

use super::{
    procfs, signal, CaptureTarget, CommandLine, ManagedProcess, ProcessId, ProcessState,
    SharedState,
};

/// Interval between liveness checks while waiting on a process tree
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long the forced round may take before survivors are reported
const FORCE_WINDOW: Duration = Duration::from_secs(2);

/// Bound on waiting for output pumps after the process is gone
const PUMP_DRAIN: Duration = Duration::from_secs(1);

/// How long killed port owners get to release their sockets
const RECLAIM_WINDOW: Duration = Duration::from_secs(3);

/// Result of stopping a process tree
#[derive(Debug, Clone, Default, Serialize)]
pub struct StopOutcome {
    /// Whether the graceful window expired and SIGKILL was used
    pub forced: bool,
    /// Pids from the tree still alive after the forced round
    pub survivors: Vec<u32>,
    /// Exit code of the root, if it exited normally
    pub exit_code: Option<i32>,
}

/// Result of running a command to completion
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub exit_code: Option<i32>,
    pub output: String,
    pub duration: Duration,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Row of the supervisor's process table, for reports
#[derive(Debug, Clone, Serialize)]
pub struct ProcessSummary {
    pub name: String,
    pub command: String,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub state: ProcessState,
    pub exit_code: Option<i32>,
}

struct Tracked {
    name: String,
    command: CommandLine,
    pid: Option<u32>,
    port: Option<u16>,
    state: SharedState,
    child: Option<Child>,
    exit_status: Option<ExitStatus>,
    pumps: Vec<JoinHandle<()>>,
}

struct Spawned {
    child: Child,
    pid: u32,
    pumps: Vec<JoinHandle<()>>,
    output: Option<mpsc::UnboundedReceiver<String>>,
}

/// Owns every process the pipeline starts
pub struct ProcessSupervisor {
    next_id: u64,
    /// Grace period used when a port occupant has to make room
    grace: Duration,
    tracked: BTreeMap<ProcessId, Tracked>,
}

impl ProcessSupervisor {
    pub fn new(grace: Duration) -> Self {
        Self {
            next_id: 1,
            grace,
            tracked: BTreeMap::new(),
        }
    }

    /// Launch `command` in its own process group without waiting for readiness
    pub async fn start(
        &mut self,
        name: &str,
        command: &CommandLine,
        workdir: &Path,
        capture: CaptureTarget,
        port: Option<u16>,
    ) -> Result<ManagedProcess> {
        if let Some(port) = port {
            for id in self.live_on_port(port) {
                tracing::warn!(port, "port already held by a tracked process, stopping it first");
                self.stop_by_id(id, self.grace).await?;
            }
        }

        let id = ProcessId(self.next_id);
        self.next_id += 1;
        let state = SharedState::new(ProcessState::Starting);

        match spawn_captured(command, workdir, &capture, &state, capture.live).await {
            Ok(spawned) => {
                tracing::info!(
                    name,
                    pid = spawned.pid,
                    command = %command,
                    log = %capture.log_file.display(),
                    "process started"
                );
                self.tracked.insert(
                    id,
                    Tracked {
                        name: name.to_string(),
                        command: command.clone(),
                        pid: Some(spawned.pid),
                        port,
                        state: state.clone(),
                        child: Some(spawned.child),
                        exit_status: None,
                        pumps: spawned.pumps,
                    },
                );
                Ok(ManagedProcess {
                    id,
                    name: name.to_string(),
                    command: command.clone(),
                    workdir: workdir.to_path_buf(),
                    log_file: capture.log_file,
                    pid: spawned.pid,
                    port,
                    state,
                    output: spawned.output,
                })
            }
            Err(e) => {
                tracing::error!(name, command = %command, error = %e, "process failed to start");
                state.set(ProcessState::Failed);
                self.tracked.insert(
                    id,
                    Tracked {
                        name: name.to_string(),
                        command: command.clone(),
                        pid: None,
                        port,
                        state,
                        child: None,
                        exit_status: None,
                        pumps: Vec::new(),
                    },
                );
                Err(e)
            }
        }
    }

    /// Mark a process ready once the caller's readiness wait succeeded
    pub fn mark_running(&self, process: &ManagedProcess) {
        process.state.promote();
    }

    /// Non-blocking check whether the root process has exited
    pub fn has_exited(&mut self, process: &ManagedProcess) -> Result<Option<ExitStatus>> {
        let Some(tracked) = self.tracked.get_mut(&process.id) else {
            return Ok(None);
        };
        poll_exit(tracked)
    }

    /// Stop a process and all of its descendants
    ///
    /// Sends SIGTERM to the group and every discovered descendant, waits up
    /// to `grace`, then SIGKILLs descendants (deepest first) and the root.
    /// Unknown or already-terminated handles succeed without doing anything.
    pub async fn stop(&mut self, process: &ManagedProcess, grace: Duration) -> Result<StopOutcome> {
        self.stop_by_id(process.id, grace).await
    }

    /// Stop every tracked process, most recently started first
    pub async fn shutdown_all(&mut self, grace: Duration) -> Vec<(String, Result<StopOutcome>)> {
        let ids: Vec<ProcessId> = self
            .tracked
            .iter()
            .rev()
            .filter(|(_, t)| t.pid.is_some() && t.state.get() != ProcessState::Terminated)
            .map(|(id, _)| *id)
            .collect();

        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            let name = self.tracked[&id].name.clone();
            let outcome = self.stop_by_id(id, grace).await;
            results.push((name, outcome));
        }
        results
    }

    /// Free a TCP port by killing whatever owns it
    ///
    /// Returns the pids that were killed. A port nobody owns is a no-op.
    pub async fn reclaim_port(&mut self, port: u16) -> Result<Vec<u32>> {
        for id in self.live_on_port(port) {
            self.stop_by_id(id, self.grace).await?;
        }

        let owners = match procfs::port_owners(port) {
            Ok(owners) => owners,
            Err(e) => {
                return if port_is_free(port) {
                    tracing::warn!(port, error = %e, "cannot query port owners, but the port is free");
                    Ok(Vec::new())
                } else {
                    Err(Error::PortReclaim {
                        port,
                        reason: format!("owner lookup failed ({e}) and the port is in use"),
                    })
                };
            }
        };

        if owners.is_empty() {
            // Sockets of other users, or our own, do not map to an owner
            if !port_is_free(port) {
                return Err(Error::PortReclaim {
                    port,
                    reason: "bound by a process that cannot be identified".to_string(),
                });
            }
            tracing::debug!(port, "port is free");
            return Ok(owners);
        }

        tracing::info!(port, ?owners, "killing processes bound to port");
        for &pid in &owners {
            if let Err(e) = signal::kill(pid) {
                tracing::warn!(port, pid, error = %e, "failed to signal port owner");
            }
        }

        let deadline = Instant::now() + RECLAIM_WINDOW;
        loop {
            let remaining = procfs::port_owners(port).unwrap_or_default();
            if remaining.is_empty() {
                return Ok(owners);
            }
            if Instant::now() >= deadline {
                return Err(Error::PortReclaim {
                    port,
                    reason: format!("still owned by {remaining:?}"),
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Run a command to completion, capturing its output
    ///
    /// The command gets its own process group; anything it leaves running in
    /// that group is killed once the root exits. It stays in the process
    /// table, so if this future is dropped early, `shutdown_all` still
    /// reaches whatever the command left behind.
    pub async fn run(
        &mut self,
        name: &str,
        command: &CommandLine,
        workdir: &Path,
        capture: CaptureTarget,
        timeout: Option<Duration>,
    ) -> Result<CommandOutcome> {
        let state = SharedState::new(ProcessState::Starting);
        let started = Instant::now();
        let mut spawned = spawn_captured(command, workdir, &capture, &state, true).await?;
        tracing::info!(name, pid = spawned.pid, command = %command, "running command");

        let id = ProcessId(self.next_id);
        self.next_id += 1;
        self.tracked.insert(
            id,
            Tracked {
                name: name.to_string(),
                command: command.clone(),
                pid: Some(spawned.pid),
                port: None,
                state: state.clone(),
                // The child stays with this future; stop_by_id falls back to /proc
                child: None,
                exit_status: None,
                pumps: Vec::new(),
            },
        );

        let collected = Arc::new(Mutex::new(String::new()));
        let collector = spawned.output.take().map(|mut rx| {
            let sink = Arc::clone(&collected);
            tokio::spawn(async move {
                while let Some(line) = rx.recv().await {
                    let mut out = sink.lock().unwrap_or_else(|e| e.into_inner());
                    out.push_str(&line);
                    out.push('\n');
                }
            })
        });

        let status = match timeout {
            Some(limit) => match tokio::time::timeout(limit, spawned.child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    tracing::warn!(name, secs = limit.as_secs(), "command timed out, killing it");
                    let _ = signal::kill_group(spawned.pid);
                    let _ = spawned.child.kill().await;
                    state.set(ProcessState::Terminated);
                    return Err(Error::Timeout(limit.as_secs()));
                }
            },
            None => spawned.child.wait().await?,
        };
        state.set(ProcessState::Terminated);
        if let Some(tracked) = self.tracked.get_mut(&id) {
            tracked.exit_status = Some(status);
        }

        let leftovers = procfs::group_members(spawned.pid);
        if !leftovers.is_empty() {
            tracing::warn!(name, ?leftovers, "command left processes behind, killing them");
            let _ = signal::kill_group(spawned.pid);
        }

        // Background grandchildren may hold the pipes open; don't wait on them forever
        for pump in spawned.pumps {
            let _ = tokio::time::timeout(PUMP_DRAIN, pump).await;
        }
        if let Some(collector) = collector {
            let _ = tokio::time::timeout(PUMP_DRAIN, collector).await;
        }
        let output = collected.lock().unwrap_or_else(|e| e.into_inner()).clone();

        tracing::info!(name, exit_code = ?status.code(), "command finished");
        Ok(CommandOutcome {
            exit_code: status.code(),
            output,
            duration: started.elapsed(),
        })
    }

    /// Process table for reporting
    pub fn snapshot(&self) -> Vec<ProcessSummary> {
        self.tracked
            .values()
            .map(|t| ProcessSummary {
                name: t.name.clone(),
                command: t.command.to_string(),
                pid: t.pid,
                port: t.port,
                state: t.state.get(),
                exit_code: t.exit_status.and_then(|s| s.code()),
            })
            .collect()
    }

    fn live_on_port(&self, port: u16) -> Vec<ProcessId> {
        self.tracked
            .iter()
            .filter(|(_, t)| t.port == Some(port) && t.state.get().is_live())
            .map(|(id, _)| *id)
            .collect()
    }

    async fn stop_by_id(&mut self, id: ProcessId, grace: Duration) -> Result<StopOutcome> {
        let Some(tracked) = self.tracked.get_mut(&id) else {
            return Ok(StopOutcome::default());
        };
        let Some(pid) = tracked.pid else {
            return Ok(StopOutcome::default());
        };
        if tracked.state.get() == ProcessState::Terminated {
            return Ok(StopOutcome {
                exit_code: tracked.exit_status.and_then(|s| s.code()),
                ..StopOutcome::default()
            });
        }

        let mut tree = process_tree(pid);
        let already_reaped = tracked.exit_status.is_some();
        tracing::debug!(name = %tracked.name, pid, descendants = tree.len(), "stopping process tree");

        // Once the root is reaped its pid may be recycled; only signal the
        // group while it still has members keeping the id reserved
        if !already_reaped || !tree.is_empty() {
            if let Err(e) = signal::terminate_group(pid) {
                tracing::debug!(pid, error = %e, "SIGTERM to process group failed");
            }
        }
        for &child_pid in &tree {
            let _ = signal::terminate(child_pid);
        }
        #[cfg(not(unix))]
        if let Some(child) = tracked.child.as_mut() {
            let _ = child.start_kill();
        }

        let deadline = Instant::now() + grace;
        let graceful = loop {
            let root_done = root_exited(tracked, pid)?;
            if root_done && tree.iter().all(|p| !procfs::is_alive(*p)) {
                // Anything forked during the grace window gets the same treatment
                let late: Vec<u32> = process_tree(pid)
                    .into_iter()
                    .filter(|p| !tree.contains(p))
                    .collect();
                if late.is_empty() {
                    break true;
                }
                tracing::debug!(pid, ?late, "processes appeared while stopping");
                for &late_pid in &late {
                    let _ = signal::terminate(late_pid);
                }
                tree.extend(late);
            }
            if Instant::now() >= deadline {
                break false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        };

        let mut survivors = Vec::new();
        if !graceful {
            tracing::warn!(
                name = %tracked.name,
                pid,
                grace_secs = grace.as_secs_f64(),
                "graceful shutdown timed out, escalating to SIGKILL"
            );
            let root_done = root_exited(tracked, pid)?;
            for late in process_tree(pid) {
                if !tree.contains(&late) {
                    tree.push(late);
                }
            }
            for &child_pid in tree.iter().rev() {
                let _ = signal::kill(child_pid);
            }
            if !root_done || !procfs::group_members(pid).is_empty() {
                let _ = signal::kill_group(pid);
            }
            if !root_done {
                if let Some(child) = tracked.child.as_mut() {
                    let _ = child.start_kill();
                    match tokio::time::timeout(FORCE_WINDOW, child.wait()).await {
                        Ok(Ok(status)) => tracked.exit_status = Some(status),
                        Ok(Err(e)) => tracing::warn!(pid, error = %e, "failed to reap process"),
                        Err(_) => tracing::warn!(pid, "process not reaped after SIGKILL"),
                    }
                }
            }
            survivors = wait_until_gone(&tree, FORCE_WINDOW).await;
            if tracked.exit_status.is_none() && procfs::is_alive(pid) {
                survivors.insert(0, pid);
            }
        }

        tracked.state.set(ProcessState::Terminated);
        for pump in tracked.pumps.drain(..) {
            let _ = tokio::time::timeout(PUMP_DRAIN, pump).await;
        }

        let outcome = StopOutcome {
            forced: !graceful,
            survivors,
            exit_code: tracked.exit_status.and_then(|s| s.code()),
        };
        if outcome.survivors.is_empty() {
            tracing::info!(name = %tracked.name, pid, forced = outcome.forced, "process stopped");
        } else {
            tracing::error!(
                name = %tracked.name,
                pid,
                survivors = ?outcome.survivors,
                "processes survived forced termination"
            );
        }
        Ok(outcome)
    }
}

/// Whether the root is gone; roots owned by `run` are only visible in /proc
fn root_exited(tracked: &mut Tracked, pid: u32) -> Result<bool> {
    if poll_exit(tracked)?.is_some() {
        return Ok(true);
    }
    Ok(tracked.child.is_none() && !procfs::is_alive(pid))
}

fn poll_exit(tracked: &mut Tracked) -> Result<Option<ExitStatus>> {
    if tracked.exit_status.is_some() {
        return Ok(tracked.exit_status);
    }
    if let Some(child) = tracked.child.as_mut() {
        if let Some(status) = child.try_wait()? {
            tracked.exit_status = Some(status);
        }
    }
    Ok(tracked.exit_status)
}

/// Descendants plus remaining group members (orphans keep the group id)
fn process_tree(pid: u32) -> Vec<u32> {
    let mut tree = procfs::descendants(pid);
    for member in procfs::group_members(pid) {
        if !tree.contains(&member) {
            tree.push(member);
        }
    }
    tree
}

async fn wait_until_gone(pids: &[u32], window: Duration) -> Vec<u32> {
    let deadline = Instant::now() + window;
    loop {
        let alive: Vec<u32> = pids.iter().copied().filter(|p| procfs::is_alive(*p)).collect();
        if alive.is_empty() || Instant::now() >= deadline {
            return alive;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn port_is_free(port: u16) -> bool {
    std::net::TcpListener::bind(("0.0.0.0", port)).is_ok()
}

async fn open_log(path: &Path, append: bool) -> Result<(File, File)> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    if !append {
        File::create(path).await?;
    }
    let mut options = OpenOptions::new();
    options.create(true).append(true);
    let stdout_log = options.open(path).await?;
    let stderr_log = options.open(path).await?;
    Ok((stdout_log, stderr_log))
}

async fn spawn_captured(
    command: &CommandLine,
    workdir: &Path,
    capture: &CaptureTarget,
    state: &SharedState,
    live: bool,
) -> Result<Spawned> {
    let (program, args) = command.program_and_args()?;
    let (stdout_log, stderr_log) = open_log(&capture.log_file, capture.append)
        .await
        .map_err(|e| {
            Error::process_start(
                command.to_string(),
                format!("cannot open log '{}': {e}", capture.log_file.display()),
            )
        })?;

    let mut cmd = Command::new(&program);
    cmd.args(&args)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::process_start(command.to_string(), e))?;
    let pid = child
        .id()
        .ok_or_else(|| Error::process_start(command.to_string(), "process exited immediately"))?;

    let (tx, rx) = if live {
        let (tx, rx) = mpsc::unbounded_channel();
        (Some(tx), Some(rx))
    } else {
        (None, None)
    };

    let mut pumps = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        pumps.push(tokio::spawn(pump(
            stdout,
            stdout_log,
            tx.clone(),
            state.clone(),
            capture.echo,
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(tokio::spawn(pump(
            stderr,
            stderr_log,
            tx,
            state.clone(),
            capture.echo,
        )));
    }

    Ok(Spawned {
        child,
        pid,
        pumps,
        output: rx,
    })
}

/// Copy one output stream line by line into the log (and the live channel)
async fn pump<R>(
    stream: R,
    mut log: File,
    tx: Option<mpsc::UnboundedSender<String>>,
    state: SharedState,
    echo: bool,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(error = %e, "output stream closed with error");
                break;
            }
        }
        state.promote();

        if !buf.ends_with(b"\n") {
            buf.push(b'\n');
        }
        // Flush per line so file followers see output as it happens
        if let Err(e) = log.write_all(&buf).await.and(log.flush().await) {
            tracing::debug!(error = %e, "failed to write captured output");
        }

        let line = String::from_utf8_lossy(&buf)
            .trim_end_matches(['\r', '\n'])
            .to_string();
        if echo {
            println!("{line}");
        }
        if let Some(tx) = &tx {
            let _ = tx.send(line);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn log_in(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        dir.path().join(name)
    }

    #[tokio::test]
    async fn test_start_captures_output_to_file_and_stream() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = ProcessSupervisor::new(Duration::from_secs(1));
        let cmd = CommandLine::from("echo hello; echo oops 1>&2; sleep 5");
        let capture = CaptureTarget::file(log_in(&dir, "out.log")).with_live_stream();
        let mut proc = sup.start("echo", &cmd, dir.path(), capture, None).await.unwrap();

        let mut rx = proc.take_output().unwrap();
        let mut seen = Vec::new();
        while seen.len() < 2 {
            let line = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            seen.push(line);
        }
        seen.sort();
        assert_eq!(seen, vec!["hello", "oops"]);
        assert_eq!(proc.state(), ProcessState::Running);

        let outcome = sup.stop(&proc, Duration::from_secs(2)).await.unwrap();
        assert!(outcome.survivors.is_empty());
        assert_eq!(proc.state(), ProcessState::Terminated);

        let log = std::fs::read_to_string(log_in(&dir, "out.log")).unwrap();
        assert!(log.contains("hello\n"));
        assert!(log.contains("oops\n"));
    }

    #[tokio::test]
    async fn test_failed_start_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = ProcessSupervisor::new(Duration::from_secs(1));
        let cmd = CommandLine::argv(["/nonexistent/binary"]);
        let err = sup
            .start("ghost", &cmd, dir.path(), CaptureTarget::file(log_in(&dir, "g.log")), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PROCESS_START_FAILURE");

        let table = sup.snapshot();
        assert_eq!(table.len(), 1);
        assert_eq!(table[0].state, ProcessState::Failed);
        // Teardown over a failed entry is a no-op
        assert!(sup.shutdown_all(Duration::from_millis(100)).await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = ProcessSupervisor::new(Duration::from_secs(1));
        let proc = sup
            .start(
                "sleeper",
                &CommandLine::argv(["sleep", "30"]),
                dir.path(),
                CaptureTarget::file(log_in(&dir, "s.log")),
                None,
            )
            .await
            .unwrap();

        let first = sup.stop(&proc, Duration::from_secs(2)).await.unwrap();
        assert!(!first.forced);
        let second = sup.stop(&proc, Duration::from_secs(2)).await.unwrap();
        assert!(!second.forced);
        assert!(second.survivors.is_empty());
        assert!(!procfs::is_alive(proc.pid()));
    }

    #[tokio::test]
    async fn test_stop_escalates_when_sigterm_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = ProcessSupervisor::new(Duration::from_secs(1));
        let cmd = CommandLine::from("trap '' TERM; sleep 30 & wait");
        let proc = sup
            .start("stubborn", &cmd, dir.path(), CaptureTarget::file(log_in(&dir, "t.log")), None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = Instant::now();
        let outcome = sup.stop(&proc, Duration::from_millis(500)).await.unwrap();
        assert!(outcome.forced);
        assert!(outcome.survivors.is_empty(), "survivors: {:?}", outcome.survivors);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!procfs::is_alive(proc.pid()));
    }

    #[tokio::test]
    async fn test_run_collects_output_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = ProcessSupervisor::new(Duration::from_secs(1));
        let outcome = sup
            .run(
                "runner",
                &CommandLine::from("echo one; echo two; exit 3"),
                dir.path(),
                CaptureTarget::file(log_in(&dir, "run.log")),
                None,
            )
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, Some(3));
        assert!(!outcome.success());
        assert_eq!(outcome.output, "one\ntwo\n");
    }

    #[tokio::test]
    async fn test_run_enforces_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = ProcessSupervisor::new(Duration::from_secs(1));
        let err = sup
            .run(
                "slow",
                &CommandLine::argv(["sleep", "30"]),
                dir.path(),
                CaptureTarget::file(log_in(&dir, "slow.log")),
                Some(Duration::from_secs(1)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(1)));
    }

    #[tokio::test]
    async fn test_shutdown_reaches_leftovers_of_an_abandoned_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = ProcessSupervisor::new(Duration::from_secs(1));
        let cmd = CommandLine::from("sleep 300 & echo $! > bg.pid; wait");
        let abandoned = tokio::time::timeout(
            Duration::from_millis(500),
            sup.run("tests", &cmd, dir.path(), CaptureTarget::file(log_in(&dir, "r.log")), None),
        )
        .await;
        assert!(abandoned.is_err());

        let background: u32 = std::fs::read_to_string(dir.path().join("bg.pid"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(procfs::is_alive(background));

        let results = sup.shutdown_all(Duration::from_secs(2)).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "tests");
        assert!(results[0].1.as_ref().unwrap().survivors.is_empty());
        assert!(wait_until_gone(&[background], Duration::from_secs(2)).await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_catches_children_forked_during_grace() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = ProcessSupervisor::new(Duration::from_secs(1));
        let cmd = CommandLine::from(
            "trap 'sleep 30 & echo $! > late.pid; exit 0' TERM; while :; do sleep 0.1; done",
        );
        let proc = sup
            .start("forker", &cmd, dir.path(), CaptureTarget::file(log_in(&dir, "f.log")), None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let outcome = sup.stop(&proc, Duration::from_secs(3)).await.unwrap();
        assert!(outcome.survivors.is_empty(), "survivors: {:?}", outcome.survivors);

        let late: u32 = std::fs::read_to_string(dir.path().join("late.pid"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(wait_until_gone(&[late], Duration::from_secs(2)).await.is_empty());
    }

    #[tokio::test]
    async fn test_reclaim_fails_for_unidentifiable_owner() {
        // Our own sockets never show up as owners
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut sup = ProcessSupervisor::new(Duration::from_secs(1));

        let err = sup.reclaim_port(port).await.unwrap_err();
        assert!(matches!(err, Error::PortReclaim { port: p, .. } if p == port), "{err}");

        drop(listener);
        assert!(sup.reclaim_port(port).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_appending_capture_keeps_previous_output() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(&dir, "shared.log");
        let mut sup = ProcessSupervisor::new(Duration::from_secs(1));
        sup.run("first", &CommandLine::from("echo first"), dir.path(), CaptureTarget::file(&log), None)
            .await
            .unwrap();
        sup.run(
            "second",
            &CommandLine::from("echo second"),
            dir.path(),
            CaptureTarget::file(&log).appending(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "first\nsecond\n");
    }
}
