//! Bounded marker detection

use std::io;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::common::{Error, Result};

use super::{LineSource, MarkerPattern};

/// Outcome of a marker wait
///
/// Exactly one of these holds: a value was found, the budget expired
/// (`truncated`), or the source ran dry first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogWatchResult {
    pub value: Option<String>,
    pub elapsed: Duration,
    pub truncated: bool,
}

impl LogWatchResult {
    pub fn matched(&self) -> bool {
        self.value.is_some()
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    /// Turn a miss into the matching error
    pub fn into_value(self, label: &str, budget: Duration) -> Result<String> {
        match self.value {
            Some(value) => Ok(value),
            None if self.truncated => Err(Error::LogMarkerTimeout {
                label: label.to_string(),
                budget_secs: budget.as_secs(),
            }),
            None => Err(Error::LogMarkerMissing {
                label: label.to_string(),
            }),
        }
    }
}

/// Read `source` until a line matches `pattern` or `budget` runs out
///
/// The whole scan runs under one deadline, so a producer that goes quiet
/// (or dies without closing its output) cannot stall the caller.
pub async fn wait_for_marker<S>(
    source: &mut S,
    pattern: &MarkerPattern,
    budget: Duration,
) -> Result<LogWatchResult>
where
    S: LineSource + ?Sized,
{
    let started = Instant::now();
    let scan = async {
        while let Some(line) = source.next_line().await? {
            if let Some(value) = pattern.extract(&line) {
                return Ok(Some(value));
            }
        }
        Ok::<_, io::Error>(None)
    };

    let outcome = tokio::time::timeout(budget, scan).await;
    let elapsed = started.elapsed();
    match outcome {
        Ok(Ok(Some(value))) => {
            tracing::debug!(marker = %pattern, elapsed_ms = elapsed.as_millis() as u64, "marker observed");
            Ok(LogWatchResult {
                value: Some(value),
                elapsed,
                truncated: false,
            })
        }
        Ok(Ok(None)) => {
            tracing::warn!(marker = %pattern, "output ended without the marker");
            Ok(LogWatchResult {
                value: None,
                elapsed,
                truncated: false,
            })
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => {
            tracing::warn!(marker = %pattern, budget_secs = budget.as_secs(), "marker wait timed out");
            Ok(LogWatchResult {
                value: None,
                elapsed,
                truncated: true,
            })
        }
    }
}

/// Lines strictly between the first `begin` line and the following `end` line
pub fn extract_block(text: &str, begin: &str, end: &str) -> Option<String> {
    let mut lines = text.lines();
    lines.by_ref().find(|line| line.contains(begin))?;

    let mut block = Vec::new();
    for line in lines {
        if line.contains(end) {
            let joined = block.join("\n");
            return Some(joined.trim_matches('\n').to_string());
        }
        block.push(line);
    }
    None
}

/// Last `n` lines of a log file
pub fn tail_lines(path: &Path, n: usize) -> io::Result<Vec<String>> {
    let bytes = std::fs::read(path)?;
    let text = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = text.lines().collect();
    let skip = lines.len().saturating_sub(n);
    Ok(lines[skip..].iter().map(|l| l.to_string()).collect())
}

/// Poll until `path` exists; false if `budget` ran out first
pub async fn wait_for_path(path: &Path, budget: Duration) -> bool {
    let deadline = Instant::now() + budget;
    loop {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
