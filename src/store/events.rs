//! Append-only iteration log.
//!
//! One JSON object per line in `events.jsonl`. Dashboards can tail the file
//! without coordinating with the loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::classifier::ErrorCategory;
use crate::error::Result;
use crate::r#loop::state::IterationOutcome;

const EVENTS_FILE: &str = "events.jsonl";

/// What an event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    Clean,
    Repaired,
    FailedPermanent,
    /// Loop terminated normally.
    Done,
    /// Loop terminated on a fatal error.
    Aborted,
    /// Loop terminated on a stop request.
    Stopped,
}

impl From<IterationOutcome> for EventOutcome {
    fn from(outcome: IterationOutcome) -> Self {
        match outcome {
            IterationOutcome::Clean => Self::Clean,
            IterationOutcome::Repaired => Self::Repaired,
            IterationOutcome::FailedPermanent => Self::FailedPermanent,
        }
    }
}

impl std::fmt::Display for EventOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Clean => "clean",
            Self::Repaired => "repaired",
            Self::FailedPermanent => "failed_permanent",
            Self::Done => "done",
            Self::Aborted => "aborted",
            Self::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// One line of the event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopEvent {
    pub timestamp: DateTime<Utc>,
    pub loop_count: u32,
    pub outcome: EventOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<ErrorCategory>,
    #[serde(default)]
    pub detail: String,
}

impl LoopEvent {
    /// Event for a completed iteration.
    pub fn iteration(
        loop_count: u32,
        outcome: IterationOutcome,
        run_id: impl Into<String>,
        category: Option<ErrorCategory>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            loop_count,
            outcome: outcome.into(),
            run_id: Some(run_id.into()),
            category,
            detail: detail.into(),
        }
    }

    /// Event for loop termination.
    pub fn terminal(loop_count: u32, outcome: EventOutcome, detail: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            loop_count,
            outcome,
            run_id: None,
            category: None,
            detail: detail.into(),
        }
    }
}

/// Handle to the event log file.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(EVENTS_FILE),
        }
    }

    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.path.clone()
    }

    /// Append one event as a single line.
    pub fn append(&self, event: &LoopEvent) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    /// Read all events. Malformed lines (such as a torn final write) are skipped.
    pub fn read_all(&self) -> Result<Vec<LoopEvent>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut events = Vec::new();
        for (index, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(event) => events.push(event),
                Err(e) => warn!("Skipping malformed event on line {}: {}", index + 1, e),
            }
        }
        Ok(events)
    }

    /// Last `n` events, oldest first.
    pub fn tail(&self, n: usize) -> Result<Vec<LoopEvent>> {
        let mut events = self.read_all()?;
        let skip = events.len().saturating_sub(n);
        Ok(events.split_off(skip))
    }
}
