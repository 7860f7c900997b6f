//! End-to-end integration tests for the orchestrator
//!
//! These tests drive full pipeline runs against the `mock_backend` binary:
//! 1. Writing a run configuration into a scratch working directory
//! 2. Running the pipeline (through the CLI or the library)
//! 3. Verifying stage outcomes, synthesized files and that nothing leaks

#![cfg(unix)]

use std::fs;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use serde_json::Value;
use tempfile::TempDir;
use testbed::pipeline::{StageKind, StageStatus};
use testbed::process::procfs;
use testbed::{Config, Pipeline, RunOptions};

const MOCK_BACKEND: &str = env!("CARGO_BIN_EXE_mock_backend");
const TESTBED: &str = env!("CARGO_BIN_EXE_testbed");

/// Scratch working directory with a free backend port
struct TestEnv {
    dir: TempDir,
    port: u16,
}

impl TestEnv {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        fs::write(
            dir.path().join("client-template.yml"),
            "url: http://placeholder\nauth_token: \"\"\nsuites:\n  - fs\n  - auth\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("run-tests.sh"),
            "grep -q 'tok-' client.yml || exit 3\n\
             echo 'running suites'\n\
             echo 'nightly build results begin'\n\
             echo '12 passed, 0 failed'\n\
             echo 'nightly build results end'\n",
        )
        .unwrap();
        Self {
            dir,
            port: free_port(),
        }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Run configuration with the given extra backend flags and extra TOML
    fn config_toml(&self, backend_flags: &[&str], extra: &str) -> String {
        let mut command = vec![
            format!("\"{MOCK_BACKEND}\""),
            "\"--port\"".to_string(),
            format!("\"{}\"", self.port),
        ];
        command.extend(backend_flags.iter().map(|f| format!("\"{f}\"")));

        format!(
            r#"
workdir = "{workdir}"

[server]
base_url = "http://127.0.0.1:{port}"

[install]
command = ""

[backend]
command = [{command}]
port = {port}
prime_budget_secs = 5
settle_secs = 10

[client]
template = "client-template.yml"
output = "client.yml"

[tests]
command = ["sh", "run-tests.sh"]
timeout_secs = 30

[timeouts]
login_secs = 5
grace_secs = 1

{extra}
"#,
            workdir = self.path().display(),
            port = self.port,
            command = command.join(", "),
        )
    }

    fn write_config(&self, toml: &str) -> PathBuf {
        let path = self.path().join("testbed.toml");
        fs::write(&path, toml).unwrap();
        path
    }

    fn load(&self, toml: &str) -> Config {
        Config::from_file(&self.write_config(toml)).expect("config should load")
    }

    fn backend_log(&self) -> String {
        fs::read_to_string(self.path().join("testbed-logs/backend.log")).unwrap_or_default()
    }
}

fn free_port() -> u16 {
    TcpListener::bind(("127.0.0.1", 0))
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .expect("Failed to find a free port")
}

fn port_is_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Give the kernel a moment to reap and release
fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..50 {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    false
}

fn child_pids_in(log: &str) -> Vec<u32> {
    log.lines()
        .filter_map(|l| l.strip_prefix("spawned child pid "))
        .filter_map(|pid| pid.trim().parse().ok())
        .collect()
}

#[test]
fn test_cli_run_with_secondary_service() {
    let env = TestEnv::new();
    let secondary_port = free_port();
    fs::write(env.path().join("secondary-template.json"), "{\"database\": {}}\n").unwrap();

    let secondary = format!(
        r#"
[secondary]
enabled = true
name = "broadcast"
command = ["{MOCK_BACKEND}", "--port", "{secondary_port}", "--config", "volatile/secondary/config.json", "--no-marker"]
port = {secondary_port}
url = "http://127.0.0.1:{secondary_port}"
template = "secondary-template.json"
config_path = "volatile/secondary/config.json"
"#
    );
    let config = env.write_config(&env.config_toml(&[], &secondary));
    let report_path = env.path().join("report.json");

    let output = Command::new(TESTBED)
        .args(["run", "--config"])
        .arg(&config)
        .arg("--report")
        .arg(&report_path)
        .stdin(Stdio::null())
        .output()
        .expect("Failed to run testbed");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        output.status.success(),
        "run failed\nstdout:\n{stdout}\nstderr:\n{stderr}"
    );
    // Test output is echoed live
    assert!(stdout.contains("running suites"));

    let report: Value = serde_json::from_str(&fs::read_to_string(&report_path).unwrap()).unwrap();
    assert_eq!(report["exit_code"], 0);
    let stages = report["stages"].as_array().unwrap();
    assert_eq!(stages.len(), 10);
    for stage in stages {
        let expected = if stage["kind"] == "install_dependencies" {
            "skipped"
        } else {
            "succeeded"
        };
        assert_eq!(stage["status"], expected, "stage {}", stage["kind"]);
    }
    assert!(report["tests"]["results"]
        .as_str()
        .unwrap()
        .contains("12 passed, 0 failed"));

    // Client config: token and url written, the rest of the template kept
    let client = fs::read_to_string(env.path().join("client.yml")).unwrap();
    let client: serde_yaml::Value = serde_yaml::from_str(&client).unwrap();
    assert!(client["auth_token"].as_str().unwrap().starts_with("tok-"));
    assert_eq!(
        client["url"].as_str(),
        Some(format!("http://127.0.0.1:{}", env.port).as_str())
    );
    assert_eq!(client["suites"].as_sequence().map(|s| s.len()), Some(2));

    // Backend config edited after the prime run
    let backend: Value = serde_json::from_str(
        &fs::read_to_string(env.path().join("volatile/config/config.json")).unwrap(),
    )
    .unwrap();
    let services = &backend["services"];
    assert_eq!(services["mountpoint"]["mountpoints"]["/"]["mounter"], "puterfs");
    assert_eq!(
        services["mountpoint"]["mountpoints"]["/admin/tmp"]["mounter"],
        "memoryfs"
    );
    assert_eq!(services["broadcast"]["enabled"], true);

    // Secondary config synthesized from its template
    let secondary: Value = serde_json::from_str(
        &fs::read_to_string(env.path().join("volatile/secondary/config.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(secondary["database"]["driver"], "sqlite");
    assert!(secondary["database"]["sqlite"]["path"]
        .as_str()
        .unwrap()
        .ends_with("volatile/runtime/puter-database.sqlite"));

    for process in report["processes"].as_array().unwrap() {
        if let Some(pid) = process["pid"].as_u64() {
            assert!(
                eventually(|| !procfs::is_alive(pid as u32)),
                "{} still alive",
                process["name"]
            );
        }
    }
    assert!(eventually(|| port_is_free(env.port)));
    assert!(eventually(|| port_is_free(secondary_port)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_secret_fails_but_tears_down() {
    let env = TestEnv::new();
    let config = env.load(&env.config_toml(&["--no-marker"], "[secret]\nbudget_secs = 2\n"));

    let report = Pipeline::new(config, RunOptions::default())
        .unwrap()
        .run()
        .await;

    let failed = report.failed_stage().expect("a stage should fail");
    assert_eq!(failed.kind, StageKind::ExtractAdminSecret);
    assert_eq!(failed.error.as_ref().unwrap().code, "LOG_MARKER_TIMEOUT");
    assert_eq!(
        report.stage(StageKind::ObtainToken).unwrap().status,
        StageStatus::Skipped
    );
    assert_eq!(
        report.stage(StageKind::Teardown).unwrap().status,
        StageStatus::Succeeded
    );
    assert_ne!(report.exit_code(), 0);
    assert!(report.tests.is_none());
    assert!(report.failure_log.is_some());

    for process in &report.processes {
        if let Some(pid) = process.pid {
            assert!(eventually(|| !procfs::is_alive(pid)), "{} still alive", process.name);
        }
    }
    assert!(eventually(|| port_is_free(env.port)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_leftover_listener_is_reclaimed() {
    let env = TestEnv::new();
    let stray_dir = env.path().join("stray");
    let mut stray = Command::new(MOCK_BACKEND)
        .args(["--port", &env.port.to_string(), "--no-marker", "--config"])
        .arg(stray_dir.join("config.json"))
        .stdout(Stdio::null())
        .spawn()
        .expect("Failed to start stray backend");
    assert!(eventually(|| !port_is_free(env.port)), "stray never bound");

    let config = env.load(&env.config_toml(&[], ""));
    let report = Pipeline::new(config, RunOptions::default())
        .unwrap()
        .run()
        .await;

    let reclaim = report.stage(StageKind::ReclaimPorts).unwrap();
    assert_eq!(reclaim.status, StageStatus::Succeeded);
    assert!(reclaim.note.as_deref().unwrap_or_default().contains(&stray.id().to_string()));
    assert!(report.succeeded(), "{:?}", report.failed_stage());
    assert!(eventually(|| matches!(stray.try_wait(), Ok(Some(_)))));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_teardown_kills_stubborn_process_trees() {
    let env = TestEnv::new();
    let config = env.load(&env.config_toml(&["--ignore-term", "--spawn-child"], ""));

    let report = Pipeline::new(config, RunOptions::default())
        .unwrap()
        .run()
        .await;

    assert!(report.succeeded(), "{:?}", report.failed_stage());
    assert!(report.teardown_warnings.is_empty());

    // Prime run and main run each left a grandchild behind
    let children = child_pids_in(&env.backend_log());
    assert_eq!(children.len(), 2, "log:\n{}", env.backend_log());
    for pid in children {
        assert!(eventually(|| !procfs::is_alive(pid)), "grandchild {pid} survived");
    }
    for process in &report.processes {
        if let Some(pid) = process.pid {
            assert!(eventually(|| !procfs::is_alive(pid)), "{} still alive", process.name);
        }
    }
    assert!(eventually(|| port_is_free(env.port)));
}

/// Stands in for a signal that arrives once `ready` holds
async fn shutdown_when(mut ready: impl FnMut() -> bool) -> String {
    while !ready() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    "SIGINT".to_string()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_interrupt_during_backend_start_skips_the_rest() {
    let env = TestEnv::new();
    // Without a port the backend stage waits out the whole settle delay
    let toml = env
        .config_toml(&[], "")
        .replace(&format!("port = {}\nprime", env.port), "port = 0\nprime");
    let config = env.load(&toml);

    let shutdown = shutdown_when(|| env.backend_log().matches("listening on").count() >= 2);
    let report = Pipeline::new(config, RunOptions::default())
        .unwrap()
        .run_until(shutdown)
        .await;

    let failed = report.failed_stage().expect("a stage should fail");
    assert_eq!(failed.kind, StageKind::StartBackend);
    assert_eq!(failed.error.as_ref().unwrap().code, "INTERRUPTED");
    for kind in [
        StageKind::ExtractAdminSecret,
        StageKind::ObtainToken,
        StageKind::SynthesizeClientConfig,
        StageKind::StartSecondaryService,
        StageKind::RunTests,
    ] {
        assert_eq!(report.stage(kind).unwrap().status, StageStatus::Skipped, "{kind}");
    }
    assert_eq!(
        report.stage(StageKind::Teardown).unwrap().status,
        StageStatus::Succeeded
    );
    assert_ne!(report.exit_code(), 0);

    for process in &report.processes {
        if let Some(pid) = process.pid {
            assert!(eventually(|| !procfs::is_alive(pid)), "{} still alive", process.name);
        }
    }
    assert!(eventually(|| port_is_free(env.port)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_interrupt_during_tests_kills_their_background_children() {
    let env = TestEnv::new();
    let toml = env.config_toml(&[], "").replace(
        r#"command = ["sh", "run-tests.sh"]"#,
        r#"command = ["sh", "-c", "sleep 300 & echo $! > bg.pid; wait"]"#,
    );
    let config = env.load(&toml);

    let pid_file = env.path().join("bg.pid");
    let shutdown = shutdown_when(|| {
        fs::read_to_string(&pid_file).is_ok_and(|pid| pid.trim().parse::<u32>().is_ok())
    });
    let report = Pipeline::new(config, RunOptions::default())
        .unwrap()
        .run_until(shutdown)
        .await;

    let failed = report.failed_stage().expect("a stage should fail");
    assert_eq!(failed.kind, StageKind::RunTests);
    assert_eq!(failed.error.as_ref().unwrap().code, "INTERRUPTED");
    assert_eq!(
        report.stage(StageKind::Teardown).unwrap().status,
        StageStatus::Succeeded
    );
    assert!(report.teardown_warnings.is_empty(), "{:?}", report.teardown_warnings);
    assert_ne!(report.exit_code(), 0);

    let background: u32 = fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
    assert!(
        eventually(|| !procfs::is_alive(background)),
        "background child {background} survived"
    );
    assert!(eventually(|| port_is_free(env.port)));
}

#[test]
fn test_cli_synthesize_and_extract() {
    let env = TestEnv::new();
    let output = env.path().join("out/config.json");

    let status = Command::new(TESTBED)
        .args(["synthesize", "--template"])
        .arg(env.path().join("client-template.yml"))
        .arg("--output")
        .arg(&output)
        .args(["--set", "auth_token=abc", "--ensure", "extra.nested"])
        .status()
        .unwrap();
    assert!(status.success());
    let written: Value = serde_json::from_str(&fs::read_to_string(&output).unwrap()).unwrap();
    assert_eq!(written["auth_token"], "abc");
    assert!(written["extra"]["nested"].is_object());

    let log = env.path().join("app.log");
    fs::write(&log, "booting\npassword for admin is: s3cret\n").unwrap();
    let extracted = Command::new(TESTBED)
        .args(["extract", "--label", "password for admin is:", "--timeout", "2", "--file"])
        .arg(&log)
        .output()
        .unwrap();
    assert!(extracted.status.success());
    assert_eq!(String::from_utf8_lossy(&extracted.stdout).trim(), "s3cret");
}
