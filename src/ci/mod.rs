//! CI provider types and status polling.
//!
//! A [`Run`] is one observed execution of the external pipeline. Runs are
//! produced by a [`StatusSource`](crate::testing::StatusSource); the real
//! implementation lives in [`github`].

pub mod github;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

use crate::testing::StatusSource;

/// Lifecycle status of a CI run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Terminal runs never change again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// A single observed CI execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    /// Opaque provider identifier.
    pub run_id: String,
    pub status: RunStatus,
    /// Mirrors `status` once the run is terminal.
    pub conclusion: Option<RunStatus>,
    pub started_at: DateTime<Utc>,
    /// Name of the first step that failed.
    pub failed_step: Option<String>,
    pub exit_code: Option<i32>,
    /// Failure log text used for classification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_excerpt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Run {
    /// Create a run with the given status, starting now.
    pub fn new(run_id: impl Into<String>, status: RunStatus) -> Self {
        Self {
            run_id: run_id.into(),
            status,
            conclusion: status.is_terminal().then_some(status),
            started_at: Utc::now(),
            failed_step: None,
            exit_code: None,
            log_excerpt: None,
            branch: None,
            url: None,
        }
    }

    #[must_use]
    pub fn with_failed_step(mut self, step: impl Into<String>) -> Self {
        self.failed_step = Some(step.into());
        self
    }

    #[must_use]
    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    #[must_use]
    pub fn with_log(mut self, log: impl Into<String>) -> Self {
        self.log_excerpt = Some(log.into());
        self
    }

    #[must_use]
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    #[must_use]
    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self
    }

    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}

/// Failure while querying the CI provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Network, rate limit or timeout. Retry with backoff.
    #[error("transient CI fetch error: {message}")]
    Transient { message: String },

    /// Credentials invalid or missing. Fatal.
    #[error("CI authentication error: {message}")]
    Auth { message: String },
}

impl FetchError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }
}

/// Re-fetch the latest run until it is terminal.
///
/// The provider is eventually consistent, so a run reported as running may
/// still change. Gives up with a transient error once `timeout` elapses.
pub async fn poll_until_terminal(
    source: &dyn StatusSource,
    interval: Duration,
    timeout: Duration,
) -> Result<Run, FetchError> {
    let deadline = Instant::now() + timeout;
    loop {
        let run = source.fetch_latest_run().await?;
        if run.is_terminal() {
            return Ok(run);
        }
        if Instant::now() >= deadline {
            return Err(FetchError::transient(format!(
                "run {} still {} after {}s",
                run.run_id,
                run.status,
                timeout.as_secs()
            )));
        }
        debug!("Run {} is {}, waiting {:?}", run.run_id, run.status, interval);
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockStatusSource;

    #[test]
    fn test_terminal_statuses() {
        assert!(RunStatus::Success.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Queued.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn test_new_run_sets_conclusion_only_when_terminal() {
        assert_eq!(
            Run::new("1", RunStatus::Failed).conclusion,
            Some(RunStatus::Failed)
        );
        assert_eq!(Run::new("2", RunStatus::Running).conclusion, None);
    }

    #[test]
    fn test_run_status_serializes_snake_case() {
        let json = serde_json::to_string(&RunStatus::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
    }

    #[tokio::test]
    async fn test_poll_until_terminal_waits_for_completion() {
        let source = MockStatusSource::new()
            .then_run(Run::new("7", RunStatus::Queued))
            .then_run(Run::new("7", RunStatus::Running))
            .then_run(Run::new("7", RunStatus::Success));

        let run = poll_until_terminal(&source, Duration::ZERO, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(source.fetch_count(), 3);
    }

    #[tokio::test]
    async fn test_poll_until_terminal_times_out_as_transient() {
        let source = MockStatusSource::new().then_run(Run::new("8", RunStatus::Running));

        let err = poll_until_terminal(&source, Duration::ZERO, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Transient { .. }));
    }

    #[tokio::test]
    async fn test_poll_until_terminal_propagates_auth() {
        let source = MockStatusSource::new().then_error(FetchError::auth("HTTP 401"));

        let err = poll_until_terminal(&source, Duration::ZERO, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_auth());
    }
}
