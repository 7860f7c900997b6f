//! Run report

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use colored::Colorize;
use serde::Serialize;

use crate::common::Result;
use crate::process::ProcessSummary;

use super::context::TestOutcome;
use super::stage::{PipelineStage, StageError, StageKind, StageStatus};

/// Tail of the log belonging to the stage that failed
#[derive(Debug, Clone, Serialize)]
pub struct FailureLog {
    pub stage: StageKind,
    pub path: PathBuf,
    pub lines: Vec<String>,
}

/// Everything a run produced
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stages: Vec<PipelineStage>,
    pub tests: Option<TestOutcome>,
    /// Teardown problems; reported, never folded into the exit code
    pub teardown_warnings: Vec<StageError>,
    pub failure_log: Option<FailureLog>,
    pub processes: Vec<ProcessSummary>,
    pub exit_code: i32,
}

impl PipelineReport {
    pub(crate) fn new(
        started_at: DateTime<Utc>,
        stages: Vec<PipelineStage>,
        tests: Option<TestOutcome>,
        teardown_warnings: Vec<StageError>,
        failure_log: Option<FailureLog>,
        processes: Vec<ProcessSummary>,
    ) -> Self {
        let exit_code = exit_code_for(&stages, tests.as_ref());
        Self {
            started_at,
            finished_at: Utc::now(),
            stages,
            tests,
            teardown_warnings,
            failure_log,
            processes,
            exit_code,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stage(&self, kind: StageKind) -> Option<&PipelineStage> {
        self.stages.iter().find(|s| s.kind == kind)
    }

    /// The first non-teardown stage that failed
    pub fn failed_stage(&self) -> Option<&PipelineStage> {
        self.stages
            .iter()
            .find(|s| s.kind != StageKind::Teardown && s.status == StageStatus::Failed)
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json + "\n")?;
        Ok(())
    }

    /// Human-readable summary on stdout
    pub fn print_summary(&self) {
        println!("\n{}", "Stages:".cyan());
        for stage in &self.stages {
            let mark = match stage.status {
                StageStatus::Succeeded => "✓".green(),
                StageStatus::Failed => "✗".red(),
                StageStatus::Skipped => "-".dimmed(),
                StageStatus::Pending | StageStatus::Running => "?".yellow(),
            };
            let timing = if stage.status == StageStatus::Skipped {
                String::new()
            } else {
                format!("{:.1}s", stage.duration.as_secs_f64())
            };
            println!("  {} {:<26} {}", mark, stage.kind.name(), timing.dimmed());
            if let Some(err) = &stage.error {
                println!("      {}", err.message.red());
            }
            if let Some(note) = &stage.note {
                println!("      {}", note.dimmed());
            }
        }

        if let Some(tests) = &self.tests {
            if let Some(results) = &tests.results {
                println!("\n{}", "Results:".cyan());
                for line in results.lines() {
                    println!("  {line}");
                }
            }
        }

        if !self.teardown_warnings.is_empty() {
            println!("\n{}", "Teardown warnings:".yellow());
            for warning in &self.teardown_warnings {
                println!("  {} {}", "!".yellow(), warning.message);
            }
        }

        println!();
        if self.succeeded() {
            println!("{} {}", "✓".green().bold(), "Run passed".green().bold());
        } else {
            println!(
                "{} {} (exit code {})",
                "✗".red().bold(),
                "Run failed".red().bold(),
                self.exit_code
            );
        }
    }

    /// Failure log tail on stderr
    pub fn print_failure_log(&self) {
        let Some(log) = &self.failure_log else {
            return;
        };
        eprintln!(
            "\n{} last {} line(s) of {} ({}):",
            "Log tail".yellow(),
            log.lines.len(),
            log.path.display(),
            log.stage
        );
        for line in &log.lines {
            eprintln!("  {line}");
        }
    }
}

/// Test runner's code if tests ran, else 1 on any failure, else 0
fn exit_code_for(stages: &[PipelineStage], tests: Option<&TestOutcome>) -> i32 {
    if let Some(tests) = tests {
        return tests.exit_code.unwrap_or(1);
    }
    let failed = stages
        .iter()
        .any(|s| s.kind != StageKind::Teardown && s.status == StageStatus::Failed);
    i32::from(failed)
}
