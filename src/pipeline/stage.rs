//! Stage bookkeeping

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::common::Error;

/// The pipeline's stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    ReclaimPorts,
    InstallDependencies,
    PrimeBackendConfig,
    StartBackend,
    ExtractAdminSecret,
    ObtainToken,
    SynthesizeClientConfig,
    StartSecondaryService,
    RunTests,
    Teardown,
}

impl StageKind {
    pub const ALL: [StageKind; 10] = [
        StageKind::ReclaimPorts,
        StageKind::InstallDependencies,
        StageKind::PrimeBackendConfig,
        StageKind::StartBackend,
        StageKind::ExtractAdminSecret,
        StageKind::ObtainToken,
        StageKind::SynthesizeClientConfig,
        StageKind::StartSecondaryService,
        StageKind::RunTests,
        StageKind::Teardown,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StageKind::ReclaimPorts => "reclaim-ports",
            StageKind::InstallDependencies => "install-dependencies",
            StageKind::PrimeBackendConfig => "prime-backend-config",
            StageKind::StartBackend => "start-backend",
            StageKind::ExtractAdminSecret => "extract-admin-secret",
            StageKind::ObtainToken => "obtain-token",
            StageKind::SynthesizeClientConfig => "synthesize-client-config",
            StageKind::StartSecondaryService => "start-secondary-service",
            StageKind::RunTests => "run-tests",
            StageKind::Teardown => "teardown",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

/// Error recorded against a stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageError {
    pub code: String,
    pub message: String,
}

impl From<&Error> for StageError {
    fn from(e: &Error) -> Self {
        Self {
            code: e.code().to_string(),
            message: e.to_string(),
        }
    }
}

/// One stage's record in the run report
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStage {
    pub kind: StageKind,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    pub error: Option<StageError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl PipelineStage {
    pub fn new(kind: StageKind) -> Self {
        Self {
            kind,
            status: StageStatus::Pending,
            started_at: None,
            finished_at: None,
            duration: Duration::ZERO,
            error: None,
            note: None,
        }
    }

    pub fn begin(&mut self) {
        self.status = StageStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn succeed(&mut self) {
        self.finish(StageStatus::Succeeded);
    }

    pub fn fail(&mut self, error: &Error) {
        self.fail_with(StageError::from(error));
    }

    pub fn fail_with(&mut self, error: StageError) {
        self.error = Some(error);
        self.finish(StageStatus::Failed);
    }

    pub fn skip(&mut self, note: impl Into<String>) {
        self.status = StageStatus::Skipped;
        self.note = Some(note.into());
    }

    pub fn set_note(&mut self, note: impl Into<String>) {
        self.note = Some(note.into());
    }

    fn finish(&mut self, status: StageStatus) {
        let now = Utc::now();
        self.status = status;
        self.finished_at = Some(now);
        if let Some(started) = self.started_at {
            self.duration = (now - started).to_std().unwrap_or_default();
        }
    }
}

/// Durations as integer milliseconds in JSON
pub(crate) mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_ends_with_teardown() {
        assert_eq!(StageKind::ALL.len(), 10);
        assert_eq!(StageKind::ALL[0], StageKind::ReclaimPorts);
        assert_eq!(StageKind::ALL[9], StageKind::Teardown);
    }

    #[test]
    fn test_failed_stage_records_error_code() {
        let mut stage = PipelineStage::new(StageKind::ObtainToken);
        stage.begin();
        stage.fail(&Error::AuthFailure("no token".into()));
        assert_eq!(stage.status, StageStatus::Failed);
        assert_eq!(stage.error.as_ref().unwrap().code, "AUTH_FAILURE");
        assert!(stage.finished_at.is_some());

        let json = serde_json::to_value(&stage).unwrap();
        assert_eq!(json["kind"], "obtain_token");
        assert_eq!(json["status"], "failed");
        assert!(json["duration"].is_u64());
    }
}
