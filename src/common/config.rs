//! Run configuration (`testbed.toml`)
//!
//! Every section is optional. The defaults describe the stock environment:
//! an npm-managed backend on port 4100 exercised by the api-tester suite.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::paths;
use super::{Error, Result};
use crate::process::CommandLine;
use crate::synth::{Mutation, Node};
use crate::watch::MarkerPattern;

/// File name looked up in the current directory
pub const LOCAL_CONFIG_FILE: &str = "testbed.toml";

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Directory every relative path and command is resolved against
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,

    /// Additional ports to free before and after the run
    #[serde(default)]
    pub extra_ports: Vec<u16>,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub install: InstallConfig,

    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub secret: SecretConfig,

    #[serde(default)]
    pub client: ClientConfig,

    /// Auxiliary service started after the client config is written
    #[serde(default)]
    pub secondary: Option<SecondaryConfig>,

    #[serde(default)]
    pub tests: TestsConfig,

    #[serde(default)]
    pub timeouts: Timeouts,

    #[serde(default)]
    pub teardown: TeardownConfig,

    /// Where this configuration was read from, if anywhere
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workdir: default_workdir(),
            extra_ports: Vec::new(),
            server: ServerConfig::default(),
            install: InstallConfig::default(),
            backend: BackendConfig::default(),
            secret: SecretConfig::default(),
            client: ClientConfig::default(),
            secondary: None,
            tests: TestsConfig::default(),
            timeouts: Timeouts::default(),
            teardown: TeardownConfig::default(),
            source: None,
        }
    }
}

fn default_workdir() -> PathBuf {
    PathBuf::from(".")
}

/// Backend HTTP endpoint and login identity
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_username")]
    pub username: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            username: default_username(),
        }
    }
}

fn default_base_url() -> String {
    "http://api.puter.localhost:4100".to_string()
}
fn default_username() -> String {
    "admin".to_string()
}

/// Dependency installation step
#[derive(Debug, Clone, Deserialize)]
pub struct InstallConfig {
    /// Install command; an empty string disables the step
    #[serde(default = "default_install_command")]
    pub command: CommandLine,

    #[serde(default = "default_install_log")]
    pub log_file: PathBuf,

    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            command: default_install_command(),
            log_file: default_install_log(),
            timeout_secs: None,
        }
    }
}

impl InstallConfig {
    /// The command to run, unless it was configured away
    pub fn command(&self) -> Option<&CommandLine> {
        (!is_blank(&self.command)).then_some(&self.command)
    }
}

fn default_install_command() -> CommandLine {
    CommandLine::from("npm install")
}
fn default_install_log() -> PathBuf {
    PathBuf::from("testbed-logs/install.log")
}

/// The backend service under test
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_command")]
    pub command: CommandLine,

    /// Port the backend listens on; used for reclaiming and readiness.
    /// `0` means none: readiness then just waits `settle_secs`.
    #[serde(default = "default_backend_port")]
    pub port: Option<u16>,

    #[serde(default = "default_backend_log")]
    pub log_file: PathBuf,

    /// Config document the backend materializes on first start
    #[serde(default = "default_backend_config_path")]
    pub config_path: PathBuf,

    /// Mount path to mounter driver
    #[serde(default = "default_mountpoints")]
    pub mountpoints: BTreeMap<String, String>,

    /// Extra edits applied after the mountpoints
    #[serde(default)]
    pub mutations: Vec<Mutation>,

    /// How long the prime run may take to print the secret and write its config
    #[serde(default = "default_prime_budget")]
    pub prime_budget_secs: u64,

    /// Readiness window after the real start
    #[serde(default = "default_settle")]
    pub settle_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: default_backend_command(),
            port: default_backend_port(),
            log_file: default_backend_log(),
            config_path: default_backend_config_path(),
            mountpoints: default_mountpoints(),
            mutations: Vec::new(),
            prime_budget_secs: default_prime_budget(),
            settle_secs: default_settle(),
        }
    }
}

impl BackendConfig {
    pub fn port(&self) -> Option<u16> {
        self.port.filter(|&p| p != 0)
    }

    /// The mountpoint table in document form: `{path: {mounter: driver}}`
    pub fn mountpoint_entries(&self) -> Vec<(String, Node)> {
        self.mountpoints
            .iter()
            .map(|(path, mounter)| {
                (
                    path.clone(),
                    Node::map([("mounter", Node::from(mounter.as_str()))]),
                )
            })
            .collect()
    }
}

fn default_backend_command() -> CommandLine {
    CommandLine::from("npm start")
}
fn default_backend_port() -> Option<u16> {
    Some(4100)
}
fn default_backend_log() -> PathBuf {
    PathBuf::from("testbed-logs/backend.log")
}
fn default_backend_config_path() -> PathBuf {
    PathBuf::from("volatile/config/config.json")
}
fn default_mountpoints() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("/".to_string(), "puterfs".to_string()),
        ("/admin/tmp".to_string(), "memoryfs".to_string()),
    ])
}
fn default_prime_budget() -> u64 {
    10
}
fn default_settle() -> u64 {
    10
}

/// How the admin secret is found in the backend log
#[derive(Debug, Clone, Deserialize)]
pub struct SecretConfig {
    #[serde(default = "default_secret_label")]
    pub label: String,

    /// Regex with a `value` group (or group 1); overrides `label`
    #[serde(default)]
    pub regex: Option<String>,

    #[serde(default = "default_secret_budget")]
    pub budget_secs: u64,
}

impl Default for SecretConfig {
    fn default() -> Self {
        Self {
            label: default_secret_label(),
            regex: None,
            budget_secs: default_secret_budget(),
        }
    }
}

impl SecretConfig {
    pub fn pattern(&self) -> Result<MarkerPattern> {
        match &self.regex {
            Some(re) => MarkerPattern::regex(re),
            None => Ok(MarkerPattern::label(self.label.as_str())),
        }
    }
}

fn default_secret_label() -> String {
    "password for admin is:".to_string()
}
fn default_secret_budget() -> u64 {
    60
}

/// Client config written for the test runner
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_client_template")]
    pub template: PathBuf,

    #[serde(default = "default_client_output")]
    pub output: PathBuf,

    #[serde(default = "default_token_key")]
    pub token_key: String,

    /// Key receiving the base URL; empty to leave the template's value alone
    #[serde(default = "default_url_key")]
    pub url_key: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            template: default_client_template(),
            output: default_client_output(),
            token_key: default_token_key(),
            url_key: default_url_key(),
        }
    }
}

impl ClientConfig {
    pub fn url_key(&self) -> Option<&str> {
        (!self.url_key.is_empty()).then_some(self.url_key.as_str())
    }
}

fn default_client_template() -> PathBuf {
    PathBuf::from("tools/api-tester/example_config.yml")
}
fn default_client_output() -> PathBuf {
    PathBuf::from("tools/api-tester/config.yml")
}
fn default_token_key() -> String {
    "auth_token".to_string()
}
fn default_url_key() -> String {
    "url".to_string()
}

/// Optional auxiliary service
#[derive(Debug, Clone, Deserialize)]
pub struct SecondaryConfig {
    /// Start it on every run, not only with `--secondary`
    #[serde(default)]
    pub enabled: bool,

    /// Service key under `services.` in the backend config
    #[serde(default = "default_secondary_name")]
    pub name: String,

    pub command: CommandLine,

    /// Unset or `0` means none
    #[serde(default)]
    pub port: Option<u16>,

    /// URL the backend uses to reach the service
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_secondary_log")]
    pub log_file: PathBuf,

    pub template: PathBuf,

    pub config_path: PathBuf,

    #[serde(default = "default_database_driver")]
    pub database_driver: String,

    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    #[serde(default = "default_settle")]
    pub settle_secs: u64,
}

impl SecondaryConfig {
    pub fn port(&self) -> Option<u16> {
        self.port.filter(|&p| p != 0)
    }
}

fn default_secondary_name() -> String {
    "secondary".to_string()
}
fn default_secondary_log() -> PathBuf {
    PathBuf::from("testbed-logs/secondary.log")
}
fn default_database_driver() -> String {
    "sqlite".to_string()
}
fn default_database_path() -> PathBuf {
    PathBuf::from("volatile/runtime/puter-database.sqlite")
}

/// The test runner
#[derive(Debug, Clone, Deserialize)]
pub struct TestsConfig {
    #[serde(default = "default_tests_command")]
    pub command: CommandLine,

    #[serde(default = "default_tests_log")]
    pub log_file: PathBuf,

    #[serde(default = "default_results_begin")]
    pub results_begin: String,

    #[serde(default = "default_results_end")]
    pub results_end: String,

    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for TestsConfig {
    fn default() -> Self {
        Self {
            command: default_tests_command(),
            log_file: default_tests_log(),
            results_begin: default_results_begin(),
            results_end: default_results_end(),
            timeout_secs: None,
        }
    }
}

fn default_tests_command() -> CommandLine {
    CommandLine::argv([
        "node",
        "./tools/api-tester/apitest.js",
        "--unit",
        "--stop-on-failure",
    ])
}
fn default_tests_log() -> PathBuf {
    PathBuf::from("testbed-logs/tests.log")
}
fn default_results_begin() -> String {
    "nightly build results begin".to_string()
}
fn default_results_end() -> String {
    "nightly build results end".to_string()
}

/// Timeout settings in seconds
#[derive(Debug, Clone, Deserialize)]
pub struct Timeouts {
    /// Per-request login timeout
    #[serde(default = "default_login")]
    pub login_secs: u64,

    /// Graceful shutdown window per process before SIGKILL
    #[serde(default = "default_grace")]
    pub grace_secs: u64,

    #[serde(default = "default_login_attempts")]
    pub login_attempts: u32,

    #[serde(default = "default_login_retry_delay")]
    pub login_retry_delay_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            login_secs: default_login(),
            grace_secs: default_grace(),
            login_attempts: default_login_attempts(),
            login_retry_delay_secs: default_login_retry_delay(),
        }
    }
}

fn default_login() -> u64 {
    30
}
fn default_grace() -> u64 {
    10
}
fn default_login_attempts() -> u32 {
    1
}
fn default_login_retry_delay() -> u64 {
    2
}

#[derive(Debug, Clone, Deserialize)]
pub struct TeardownConfig {
    /// Free the environment's ports again after stopping everything
    #[serde(default = "default_true")]
    pub reclaim_ports: bool,

    /// Log lines included in the report when a stage fails
    #[serde(default = "default_tail_lines")]
    pub log_tail_lines: usize,
}

impl Default for TeardownConfig {
    fn default() -> Self {
        Self {
            reclaim_ports: true,
            log_tail_lines: default_tail_lines(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_tail_lines() -> usize {
    40
}

fn is_blank(command: &CommandLine) -> bool {
    match command {
        CommandLine::Shell(line) => line.trim().is_empty(),
        CommandLine::Argv(parts) => parts.is_empty(),
    }
}

impl Config {
    /// Load configuration
    ///
    /// Uses `explicit` if given, else `./testbed.toml`, else the user config
    /// file. Returns the defaults when none of them exist.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            if !path.exists() {
                return Err(Error::Config(format!(
                    "config file '{}' does not exist",
                    path.display()
                )));
            }
            return Self::from_file(path);
        }

        let candidates = [Some(PathBuf::from(LOCAL_CONFIG_FILE)), paths::config_path()];
        for path in candidates.into_iter().flatten() {
            if path.exists() {
                return Self::from_file(&path);
            }
        }
        tracing::debug!("no config file found, using defaults");
        Ok(Self::default())
    }

    /// Parse a config file; a relative `workdir` is taken relative to it
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read '{}': {e}", path.display())))?;
        let mut config: Config = toml::from_str(&content)
            .map_err(|e| Error::ConfigParse(format!("{}: {e}", path.display())))?;

        if config.workdir.is_relative() {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                config.workdir = dir.join(&config.workdir);
            }
        }
        config.source = Some(path.to_path_buf());
        tracing::debug!(path = %path.display(), workdir = %config.workdir.display(), "loaded config");
        Ok(config)
    }

    /// Resolve a path from the config against the working directory
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workdir.join(path)
        }
    }

    /// Secondary service settings if it should run
    pub fn secondary_for_run(&self, requested: bool) -> Result<Option<&SecondaryConfig>> {
        match &self.secondary {
            Some(secondary) if secondary.enabled || requested => Ok(Some(secondary)),
            Some(_) => Ok(None),
            None if requested => Err(Error::Config(
                "--secondary given but the config has no [secondary] section".to_string(),
            )),
            None => Ok(None),
        }
    }

    /// Every port the environment uses, without duplicates
    pub fn ports(&self, with_secondary: bool) -> Vec<u16> {
        let mut ports = Vec::new();
        let secondary_port = self
            .secondary
            .as_ref()
            .filter(|_| with_secondary)
            .and_then(SecondaryConfig::port);
        for port in self
            .backend
            .port()
            .into_iter()
            .chain(secondary_port)
            .chain(self.extra_ports.iter().copied())
        {
            if !ports.contains(&port) {
                ports.push(port);
            }
        }
        ports
    }

    /// Catch mistakes that would otherwise surface halfway through a run
    pub fn validate(&self) -> Result<()> {
        if !self.workdir.is_dir() {
            return Err(Error::Config(format!(
                "workdir '{}' is not a directory",
                self.workdir.display()
            )));
        }
        if is_blank(&self.backend.command) {
            return Err(Error::Config("backend.command is empty".to_string()));
        }
        if is_blank(&self.tests.command) {
            return Err(Error::Config("tests.command is empty".to_string()));
        }
        if self.timeouts.login_attempts == 0 {
            return Err(Error::Config("timeouts.login_attempts must be at least 1".to_string()));
        }
        if self.tests.results_begin.is_empty() || self.tests.results_end.is_empty() {
            return Err(Error::Config("results markers must not be empty".to_string()));
        }
        if self.client.token_key.is_empty() {
            return Err(Error::Config("client.token_key must not be empty".to_string()));
        }
        self.secret.pattern()?;
        if let Some(secondary) = &self.secondary {
            if secondary.name.is_empty() || secondary.name.contains('.') {
                return Err(Error::Config(format!(
                    "secondary.name '{}' must be a single non-empty key",
                    secondary.name
                )));
            }
        }
        Ok(())
    }
}
