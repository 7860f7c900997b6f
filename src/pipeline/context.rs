//! State handed from one stage to the next

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::auth::{AdminSecret, SessionToken};
use crate::common::{Error, Result};
use crate::process::ManagedProcess;

use super::stage::duration_millis;

/// What the test runner did
#[derive(Debug, Clone, Serialize)]
pub struct TestOutcome {
    /// `None` when the runner was killed by a signal
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    /// Lines between the results markers, if the runner printed them
    pub results: Option<String>,
}

impl TestOutcome {
    pub fn passed(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Values produced by earlier stages
///
/// Each slot is filled once, by the stage that owns it. Reading a slot that
/// was never filled is a sequencing bug and reported as an internal error.
#[derive(Debug, Default)]
pub struct OrchestrationContext {
    secret: Option<AdminSecret>,
    token: Option<SessionToken>,
    backend: Option<ManagedProcess>,
    secondary: Option<ManagedProcess>,
    test_outcome: Option<TestOutcome>,
}

fn fill<T>(slot: &mut Option<T>, value: T, what: &str) -> Result<()> {
    if slot.is_some() {
        return Err(Error::Internal(format!("{what} recorded twice")));
    }
    *slot = Some(value);
    Ok(())
}

fn read<'a, T>(slot: &'a Option<T>, what: &str) -> Result<&'a T> {
    slot.as_ref()
        .ok_or_else(|| Error::Internal(format!("{what} is not available yet")))
}

impl OrchestrationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_secret(&mut self, secret: AdminSecret) -> Result<()> {
        fill(&mut self.secret, secret, "admin secret")
    }

    pub fn secret(&self) -> Result<&AdminSecret> {
        read(&self.secret, "admin secret")
    }

    pub fn record_token(&mut self, token: SessionToken) -> Result<()> {
        fill(&mut self.token, token, "session token")
    }

    pub fn token(&self) -> Result<&SessionToken> {
        read(&self.token, "session token")
    }

    pub fn record_backend(&mut self, process: ManagedProcess) -> Result<()> {
        fill(&mut self.backend, process, "backend process")
    }

    pub fn backend(&self) -> Result<&ManagedProcess> {
        read(&self.backend, "backend process")
    }

    pub fn record_secondary(&mut self, process: ManagedProcess) -> Result<()> {
        fill(&mut self.secondary, process, "secondary process")
    }

    pub fn secondary(&self) -> Result<&ManagedProcess> {
        read(&self.secondary, "secondary process")
    }

    pub fn record_test_outcome(&mut self, outcome: TestOutcome) -> Result<()> {
        fill(&mut self.test_outcome, outcome, "test outcome")
    }

    /// The test outcome, if tests ran
    pub fn test_outcome(&self) -> Option<&TestOutcome> {
        self.test_outcome.as_ref()
    }

    pub(crate) fn take_test_outcome(&mut self) -> Option<TestOutcome> {
        self.test_outcome.take()
    }
}
