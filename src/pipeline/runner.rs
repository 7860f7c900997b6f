//! Stage sequencing

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::auth::{AdminSecret, CredentialBroker, SessionToken};
use crate::common::config::{Config, SecondaryConfig, ServerConfig, Timeouts};
use crate::common::{Error, Result};
use crate::process::{CaptureTarget, ManagedProcess, ProcessSupervisor};
use crate::synth::{ConfigDocument, DocumentFormat, KeyPath, Mutation};
use crate::watch::{extract_block, tail_lines, wait_for_marker, wait_for_path, FileFollower};

use super::context::{OrchestrationContext, TestOutcome};
use super::report::{FailureLog, PipelineReport};
use super::stage::{PipelineStage, StageError, StageKind};

const READINESS_POLL: Duration = Duration::from_millis(200);
const CONNECT_PROBE: Duration = Duration::from_millis(500);

/// Per-run switches that are not part of the config file
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Start the secondary service even if the config leaves it disabled
    pub secondary: bool,
    pub skip_install: bool,
}

/// One orchestration run
pub struct Pipeline {
    config: Config,
    options: RunOptions,
    secondary: Option<SecondaryConfig>,
    supervisor: ProcessSupervisor,
    context: OrchestrationContext,
    stages: Vec<PipelineStage>,
}

impl Pipeline {
    pub fn new(config: Config, options: RunOptions) -> Result<Self> {
        config.validate()?;
        let secondary = config.secondary_for_run(options.secondary)?.cloned();
        let grace = Duration::from_secs(config.timeouts.grace_secs);
        Ok(Self {
            config,
            options,
            secondary,
            supervisor: ProcessSupervisor::new(grace),
            context: OrchestrationContext::new(),
            stages: StageKind::ALL.iter().map(|&k| PipelineStage::new(k)).collect(),
        })
    }

    pub async fn run(self) -> PipelineReport {
        self.run_until(std::future::pending()).await
    }

    /// Run every stage; `shutdown` completing aborts the current stage
    ///
    /// Teardown runs regardless of how the earlier stages ended.
    pub async fn run_until<F>(mut self, shutdown: F) -> PipelineReport
    where
        F: Future<Output = String>,
    {
        let started_at = Utc::now();
        let mut failure_log = None;
        let mut failed = false;
        tokio::pin!(shutdown);

        for (idx, kind) in StageKind::ALL.into_iter().enumerate() {
            if kind == StageKind::Teardown {
                break;
            }
            if failed {
                self.stages[idx].skip("skipped after an earlier failure");
                continue;
            }
            if let Some(reason) = self.disabled_reason(kind) {
                tracing::info!(stage = %kind, reason, "stage skipped");
                self.stages[idx].skip(reason);
                continue;
            }

            self.stages[idx].begin();
            tracing::info!(stage = %kind, "stage started");
            let outcome = tokio::select! {
                outcome = self.execute(kind) => outcome,
                signal = &mut shutdown => Err(Error::Interrupted(signal)),
            };
            match outcome {
                Ok(note) => {
                    if let Some(note) = note {
                        self.stages[idx].set_note(note);
                    }
                    self.stages[idx].succeed();
                    tracing::info!(stage = %kind, "stage succeeded");
                }
                Err(e) => {
                    tracing::error!(stage = %kind, code = e.code(), error = %e, "stage failed");
                    self.stages[idx].fail(&e);
                    failure_log = self.failure_log_for(kind);
                    failed = true;
                }
            }
        }

        let teardown = StageKind::ALL.len() - 1;
        self.stages[teardown].begin();
        let warnings = self.teardown().await;
        match warnings.first() {
            None => self.stages[teardown].succeed(),
            Some(first) => {
                self.stages[teardown].set_note(format!("{} warning(s)", warnings.len()));
                self.stages[teardown].fail_with(first.clone());
            }
        }

        let processes = self.supervisor.snapshot();
        let tests = self.context.take_test_outcome();
        let report = PipelineReport::new(started_at, self.stages, tests, warnings, failure_log, processes);
        tracing::info!(exit_code = report.exit_code(), "run finished");
        report
    }

    fn disabled_reason(&self, kind: StageKind) -> Option<&'static str> {
        match kind {
            StageKind::InstallDependencies if self.options.skip_install => {
                Some("--skip-install given")
            }
            StageKind::InstallDependencies if self.config.install.command().is_none() => {
                Some("no install command configured")
            }
            StageKind::StartSecondaryService if self.secondary.is_none() => {
                Some("secondary service not enabled")
            }
            _ => None,
        }
    }

    async fn execute(&mut self, kind: StageKind) -> Result<Option<String>> {
        match kind {
            StageKind::ReclaimPorts => self.reclaim_ports().await,
            StageKind::InstallDependencies => self.install().await,
            StageKind::PrimeBackendConfig => self.prime_backend().await,
            StageKind::StartBackend => self.start_backend().await,
            StageKind::ExtractAdminSecret => self.extract_secret().await,
            StageKind::ObtainToken => self.obtain_token().await,
            StageKind::SynthesizeClientConfig => self.synthesize_client().await,
            StageKind::StartSecondaryService => self.start_secondary().await,
            StageKind::RunTests => self.run_tests().await,
            StageKind::Teardown => Err(Error::Internal("teardown runs separately".to_string())),
        }
    }

    async fn reclaim_ports(&mut self) -> Result<Option<String>> {
        let mut killed = Vec::new();
        for port in self.config.ports(self.secondary.is_some()) {
            killed.extend(self.supervisor.reclaim_port(port).await?);
        }
        Ok((!killed.is_empty()).then(|| format!("killed leftover processes {killed:?}")))
    }

    async fn install(&mut self) -> Result<Option<String>> {
        let Some(command) = self.config.install.command() else {
            return Ok(None);
        };
        let log = self.config.resolve(&self.config.install.log_file);
        let timeout = self.config.install.timeout_secs.map(Duration::from_secs);
        let outcome = self
            .supervisor
            .run("install", command, &self.config.workdir, CaptureTarget::file(log), timeout)
            .await?;
        if !outcome.success() {
            return Err(Error::CommandFailed {
                command: command.to_string(),
                code: outcome.exit_code,
            });
        }
        Ok(Some(format!("finished in {:.1}s", outcome.duration.as_secs_f64())))
    }

    /// Short first start so the backend writes its default config, then edit it
    async fn prime_backend(&mut self) -> Result<Option<String>> {
        let backend = &self.config.backend;
        let log = self.config.resolve(&backend.log_file);
        let config_path = self.config.resolve(&backend.config_path);
        let budget = Duration::from_secs(backend.prime_budget_secs);
        let pattern = self.config.secret.pattern()?;

        let mut process = self
            .supervisor
            .start(
                "backend-prime",
                &backend.command,
                &self.config.workdir,
                CaptureTarget::file(&log).with_live_stream(),
                backend.port(),
            )
            .await?;

        let started = Instant::now();
        let marker_seen = match process.take_output() {
            Some(mut output) => wait_for_marker(&mut output, &pattern, budget).await?.matched(),
            None => false,
        };
        let config_ready = wait_for_path(&config_path, budget.saturating_sub(started.elapsed())).await;
        tracing::debug!(marker_seen, config_ready, "prime run observed");

        let grace = Duration::from_secs(self.config.timeouts.grace_secs);
        let stopped = self.supervisor.stop(&process, grace).await?;
        if !stopped.survivors.is_empty() {
            return Err(Error::TeardownIncomplete {
                survivors: stopped.survivors,
            });
        }

        let mut document = ConfigDocument::load(&config_path)?;
        document.apply(&self.backend_mutations())?;
        document.write(&config_path)?;

        Ok(Some(if marker_seen {
            "admin secret printed during prime run".to_string()
        } else {
            "no admin secret during prime run".to_string()
        }))
    }

    fn backend_mutations(&self) -> Vec<Mutation> {
        let mountpoints = KeyPath::new(["services", "mountpoint", "mountpoints"]);
        let mut mutations = vec![
            Mutation::ensure_path(mountpoints.clone()),
            Mutation::merge_map(mountpoints, self.config.backend.mountpoint_entries()),
        ];
        if let Some(secondary) = &self.secondary {
            let service = KeyPath::new(["services", secondary.name.as_str()]);
            mutations.push(Mutation::set_scalar(service.child("enabled"), true));
            if let Some(url) = &secondary.url {
                mutations.push(Mutation::set_scalar(service.child("url"), url.as_str()));
            }
        }
        mutations.extend(self.config.backend.mutations.iter().cloned());
        mutations
    }

    async fn start_backend(&mut self) -> Result<Option<String>> {
        let backend = &self.config.backend;
        // Append so the prime run's output stays in the same log
        let capture = CaptureTarget::file(self.config.resolve(&backend.log_file)).appending();
        let process = self
            .supervisor
            .start("backend", &backend.command, &self.config.workdir, capture, backend.port())
            .await?;
        let pid = process.pid();
        self.context.record_backend(process)?;

        let settle = Duration::from_secs(backend.settle_secs);
        await_ready(&mut self.supervisor, self.context.backend()?, backend.port(), settle).await?;
        Ok(Some(format!("pid {pid}")))
    }

    async fn extract_secret(&mut self) -> Result<Option<String>> {
        let log = self.config.resolve(&self.config.backend.log_file);
        let budget = Duration::from_secs(self.config.secret.budget_secs);
        let pattern = self.config.secret.pattern()?;

        let mut follower = FileFollower::new(&log);
        let result = wait_for_marker(&mut follower, &pattern, budget).await?;
        let elapsed = result.elapsed;
        let secret = result.into_value(&pattern.describe(), budget)?;
        self.context.record_secret(AdminSecret::new(secret))?;
        Ok(Some(format!("found after {:.1}s", elapsed.as_secs_f64())))
    }

    async fn obtain_token(&mut self) -> Result<Option<String>> {
        let timeouts = &self.config.timeouts;
        let broker = CredentialBroker::new(Duration::from_secs(timeouts.login_secs))?;
        let (token, attempt) =
            login_with_retry(&broker, &self.config.server, timeouts, self.context.secret()?).await?;
        self.context.record_token(token)?;
        Ok((attempt > 1).then(|| format!("succeeded on attempt {attempt}")))
    }

    async fn synthesize_client(&mut self) -> Result<Option<String>> {
        let client = &self.config.client;
        let template = self.config.resolve(&client.template);
        let output = self.config.resolve(&client.output);

        let mut mutations = vec![Mutation::set_scalar(
            client.token_key.as_str(),
            self.context.token()?.expose(),
        )];
        if let Some(url_key) = client.url_key() {
            mutations.push(Mutation::set_scalar(url_key, self.config.server.base_url.as_str()));
        }

        let mut document = ConfigDocument::load(&template)?;
        document.apply(&mutations)?;
        document.set_format(DocumentFormat::from_path(&output)?);
        document.write(&output)?;
        Ok(Some(format!("wrote {}", output.display())))
    }

    async fn start_secondary(&mut self) -> Result<Option<String>> {
        let Some(secondary) = self.secondary.as_ref() else {
            return Ok(None);
        };
        let template = self.config.resolve(&secondary.template);
        let config_path = self.config.resolve(&secondary.config_path);
        let database = self.config.resolve(&secondary.database_path);
        let driver = secondary.database_driver.as_str();

        let mut document = ConfigDocument::load(&template)?;
        document.apply(&[
            Mutation::set_scalar(KeyPath::new(["database", "driver"]), driver),
            Mutation::set_scalar(
                KeyPath::new(["database", driver, "path"]),
                database.to_string_lossy().into_owned(),
            ),
        ])?;
        document.set_format(DocumentFormat::from_path(&config_path)?);
        document.write(&config_path)?;

        let capture = CaptureTarget::file(self.config.resolve(&secondary.log_file));
        let process = self
            .supervisor
            .start(&secondary.name, &secondary.command, &self.config.workdir, capture, secondary.port())
            .await?;
        let pid = process.pid();
        self.context.record_secondary(process)?;

        let settle = Duration::from_secs(secondary.settle_secs);
        await_ready(&mut self.supervisor, self.context.secondary()?, secondary.port(), settle).await?;
        Ok(Some(format!("{} pid {pid}", secondary.name)))
    }

    async fn run_tests(&mut self) -> Result<Option<String>> {
        let tests = &self.config.tests;
        let capture = CaptureTarget::file(self.config.resolve(&tests.log_file)).echoed();
        let timeout = tests.timeout_secs.map(Duration::from_secs);

        let started_at = Utc::now();
        let outcome = self
            .supervisor
            .run("tests", &tests.command, &self.config.workdir, capture, timeout)
            .await?;
        let results = extract_block(&outcome.output, &tests.results_begin, &tests.results_end);
        if results.is_none() {
            tracing::debug!("test output has no results block");
        }

        let code = outcome.exit_code;
        self.context.record_test_outcome(TestOutcome {
            exit_code: code,
            started_at,
            duration: outcome.duration,
            results,
        })?;
        if code != Some(0) {
            return Err(Error::TestRunnerFailure { code });
        }
        Ok(Some(format!("passed in {:.1}s", outcome.duration.as_secs_f64())))
    }

    /// Stop everything, then free the ports again; problems become warnings
    async fn teardown(&mut self) -> Vec<StageError> {
        let grace = Duration::from_secs(self.config.timeouts.grace_secs);
        let mut warnings = Vec::new();

        for (name, result) in self.supervisor.shutdown_all(grace).await {
            match result {
                Ok(outcome) if !outcome.survivors.is_empty() => {
                    let e = Error::TeardownIncomplete {
                        survivors: outcome.survivors,
                    };
                    tracing::warn!(process = %name, error = %e, "teardown incomplete");
                    warnings.push(StageError::from(&e));
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(process = %name, error = %e, "failed to stop process");
                    warnings.push(StageError {
                        code: e.code().to_string(),
                        message: format!("{name}: {e}"),
                    });
                }
            }
        }

        if self.config.teardown.reclaim_ports {
            for port in self.config.ports(self.secondary.is_some()) {
                if let Err(e) = self.supervisor.reclaim_port(port).await {
                    tracing::warn!(port, error = %e, "port still busy after teardown");
                    warnings.push(StageError::from(&e));
                }
            }
        }
        warnings
    }

    /// Log tail of whatever process the failed stage depended on
    fn failure_log_for(&self, kind: StageKind) -> Option<FailureLog> {
        let path: PathBuf = match kind {
            StageKind::InstallDependencies => self.config.install.log_file.clone(),
            StageKind::PrimeBackendConfig
            | StageKind::StartBackend
            | StageKind::ExtractAdminSecret
            | StageKind::ObtainToken => self.config.backend.log_file.clone(),
            StageKind::StartSecondaryService => self.secondary.as_ref()?.log_file.clone(),
            _ => return None,
        };
        let path = self.config.resolve(&path);
        match tail_lines(&path, self.config.teardown.log_tail_lines) {
            Ok(lines) => Some(FailureLog {
                stage: kind,
                path,
                lines,
            }),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "no log to show");
                None
            }
        }
    }
}

/// Log in, retrying up to `timeouts.login_attempts` times
///
/// Returns the token and the attempt that produced it; once attempts run
/// out the last error is returned.
async fn login_with_retry(
    broker: &CredentialBroker,
    server: &ServerConfig,
    timeouts: &Timeouts,
    secret: &AdminSecret,
) -> Result<(SessionToken, u32)> {
    let attempts = timeouts.login_attempts.max(1);
    let delay = Duration::from_secs(timeouts.login_retry_delay_secs);

    let mut attempt = 1;
    loop {
        match broker.login(&server.base_url, &server.username, secret).await {
            Ok(token) => return Ok((token, attempt)),
            Err(e) if attempt < attempts => {
                tracing::warn!(attempt, attempts, error = %e, "login failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::warn!(attempt, attempts, error = %e, "login failed");
                return Err(e);
            }
        }
    }
}

/// Wait until `process` accepts connections on `port`, or just let it settle
async fn await_ready(
    supervisor: &mut ProcessSupervisor,
    process: &ManagedProcess,
    port: Option<u16>,
    settle: Duration,
) -> Result<()> {
    let deadline = Instant::now() + settle;
    loop {
        if let Some(status) = supervisor.has_exited(process)? {
            return Err(Error::ProcessExited {
                name: process.name().to_string(),
                code: status.code(),
            });
        }
        if let Some(port) = port {
            if accepts_connections(port).await {
                tracing::debug!(name = process.name(), port, "service is accepting connections");
                supervisor.mark_running(process);
                return Ok(());
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return match port {
                Some(port) => Err(Error::ReadinessTimeout {
                    name: process.name().to_string(),
                    port,
                    secs: settle.as_secs(),
                }),
                None => {
                    supervisor.mark_running(process);
                    Ok(())
                }
            };
        }
        tokio::time::sleep(READINESS_POLL.min(deadline - now)).await;
    }
}

async fn accepts_connections(port: u16) -> bool {
    matches!(
        tokio::time::timeout(CONNECT_PROBE, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}
