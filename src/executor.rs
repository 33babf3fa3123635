//! Repair execution with timeouts and failure isolation.
//!
//! The executor never returns an error. Every problem inside a strategy
//! (failed command, rejected push, declined action, panic, timeout) becomes
//! the [`RepairOutcome`] of the returned [`RepairAttempt`], so the loop can
//! keep going and decide what to do next.
//!
//! # Architecture
//!
//! ```text
//! RepairStrategy ──spawn──> step task ──timeout──> RepairAttempt
//!                              │                       ▲
//!                              ├─ Rerun ─> StatusSource│
//!                              ├─ Command ─> CommandRunner
//!                              └─ CommitAndPush ─> GitOperations
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ci::Run;
use crate::classifier::{ErrorCategory, ErrorRecord};
use crate::strategy::{RepairAction, RepairStrategy, RUN_ID_PLACEHOLDER};
use crate::testing::{CommandRunner, GitOperations, StatusSource};

/// Characters of captured output kept per attempt.
pub const DEFAULT_OUTPUT_LIMIT: usize = 4000;

/// Result of one repair attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairOutcome {
    Success,
    Failure,
    Timeout,
}

impl std::fmt::Display for RepairOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Timeout => "timeout",
        };
        write!(f, "{}", s)
    }
}

/// One execution of a repair strategy against an error record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairAttempt {
    pub attempt_id: Uuid,
    pub run_id: String,
    pub category: ErrorCategory,
    pub action_name: String,
    pub started_at: DateTime<Utc>,
    /// `None` while the attempt is in flight.
    pub ended_at: Option<DateTime<Utc>>,
    /// `None` while the attempt is in flight.
    pub outcome: Option<RepairOutcome>,
    /// 0-based index within the category's retry budget.
    pub retry_index: u32,
    /// Tail of the captured step output, for audit.
    #[serde(default)]
    pub output_summary: String,
    /// A step asked the provider for a new run (re-run or push), so the
    /// next run observed should be newer than this attempt.
    #[serde(default)]
    pub triggered_run: bool,
}

impl RepairAttempt {
    /// Start a new in-flight attempt.
    pub fn begin(record: &ErrorRecord, action_name: impl Into<String>, retry_index: u32) -> Self {
        Self {
            attempt_id: Uuid::new_v4(),
            run_id: record.run_id.clone(),
            category: record.category,
            action_name: action_name.into(),
            started_at: Utc::now(),
            ended_at: None,
            outcome: None,
            retry_index,
            output_summary: String::new(),
            triggered_run: false,
        }
    }

    /// Complete the attempt. Completed attempts are not modified again.
    #[must_use]
    pub fn finish(mut self, outcome: RepairOutcome, output: &str, limit: usize) -> Self {
        self.ended_at = Some(Utc::now());
        self.outcome = Some(outcome);
        self.output_summary = tail_chars(output, limit);
        self
    }

    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        self.outcome.is_none()
    }

    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.outcome == Some(RepairOutcome::Success)
    }

    /// True when `run` cannot have been observed before this attempt began:
    /// a different run, or the same run started again after a re-run.
    #[must_use]
    pub fn is_superseded_by(&self, run: &Run) -> bool {
        run.run_id != self.run_id || run.started_at >= self.started_at
    }
}

/// Runs repair strategies against external collaborators.
#[derive(Clone)]
pub struct RepairExecutor {
    source: Arc<dyn StatusSource>,
    git: Arc<dyn GitOperations>,
    runner: Arc<dyn CommandRunner>,
}

impl RepairExecutor {
    pub fn new(
        source: Arc<dyn StatusSource>,
        git: Arc<dyn GitOperations>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            source,
            git,
            runner,
        }
    }

    /// Execute `strategy` for `record` within the strategy's timeout.
    pub async fn execute(
        &self,
        strategy: &RepairStrategy,
        record: &ErrorRecord,
        retry_index: u32,
    ) -> RepairAttempt {
        let attempt = RepairAttempt::begin(record, &strategy.action_name, retry_index);
        self.execute_attempt(strategy, attempt).await
    }

    /// Execute `strategy` and complete an attempt that was started (and
    /// possibly persisted) by the caller.
    pub async fn execute_attempt(
        &self,
        strategy: &RepairStrategy,
        attempt: RepairAttempt,
    ) -> RepairAttempt {
        info!(
            "Repair '{}' for {} failure on run {} (attempt {})",
            strategy.action_name,
            attempt.category,
            attempt.run_id,
            attempt.retry_index + 1
        );

        let steps = strategy.steps.clone();
        let run_id = attempt.run_id.clone();
        let source = Arc::clone(&self.source);
        let git = Arc::clone(&self.git);
        let runner = Arc::clone(&self.runner);

        // A spawned task isolates panics, and aborting it drops any child
        // process (spawned with kill_on_drop) on timeout.
        let handle = tokio::spawn(async move {
            run_steps(&steps, &run_id, source.as_ref(), git.as_ref(), runner.as_ref()).await
        });
        let abort = handle.abort_handle();

        let (outcome, log) = match tokio::time::timeout(strategy.timeout, handle).await {
            Ok(Ok(Ok(log))) => (RepairOutcome::Success, log),
            Ok(Ok(Err(log))) => (RepairOutcome::Failure, log),
            Ok(Err(join_error)) => {
                warn!("Repair task for run {} crashed: {}", attempt.run_id, join_error);
                (
                    RepairOutcome::Failure,
                    StepLog::from(format!("repair task crashed: {}", join_error)),
                )
            }
            Err(_elapsed) => {
                abort.abort();
                warn!(
                    "Repair '{}' timed out after {}s",
                    strategy.action_name,
                    strategy.timeout.as_secs()
                );
                (
                    RepairOutcome::Timeout,
                    StepLog::from(format!("timed out after {}s", strategy.timeout.as_secs())),
                )
            }
        };

        let mut attempt = attempt.finish(outcome, &log.text, DEFAULT_OUTPUT_LIMIT);
        attempt.triggered_run = log.triggered_run;
        info!("Repair '{}' finished: {}", attempt.action_name, outcome);
        attempt
    }
}

/// Transcript of a step sequence.
#[derive(Debug, Default)]
struct StepLog {
    text: String,
    triggered_run: bool,
}

impl From<String> for StepLog {
    fn from(text: String) -> Self {
        Self {
            text,
            triggered_run: false,
        }
    }
}

/// Run steps in order, stopping at the first failure.
///
/// `Ok` and `Err` both carry the transcript.
async fn run_steps(
    steps: &[RepairAction],
    run_id: &str,
    source: &dyn StatusSource,
    git: &dyn GitOperations,
    runner: &dyn CommandRunner,
) -> std::result::Result<StepLog, StepLog> {
    let mut log = String::new();
    let mut triggered_run = false;

    for step in steps {
        log.push_str(&format!("$ {}\n", step.describe()));
        debug!("Repair step: {}", step.describe());

        match step {
            RepairAction::Rerun => {
                if let Err(e) = source.rerun_failed_jobs(run_id).await {
                    log.push_str(&format!("{}\n", e));
                    return Err(StepLog { text: log, triggered_run });
                }
                log.push_str(&format!("requested re-run of run {}\n", run_id));
                triggered_run = true;
            }
            RepairAction::Command { program, args } => {
                let args: Vec<String> = args
                    .iter()
                    .map(|a| a.replace(RUN_ID_PLACEHOLDER, run_id))
                    .collect();
                match runner.run(program, &args).await {
                    Ok(output) => {
                        append_output(&mut log, &output.stdout);
                        append_output(&mut log, &output.stderr);
                        if !output.success() {
                            log.push_str(&format!("exit code {}\n", output.exit_code));
                            return Err(StepLog { text: log, triggered_run });
                        }
                    }
                    Err(e) => {
                        log.push_str(&format!("failed to run {}: {}\n", program, e));
                        return Err(StepLog { text: log, triggered_run });
                    }
                }
            }
            RepairAction::CommitAndPush { message } => {
                let files = match git.modified_files().await {
                    Ok(files) => files,
                    Err(e) => {
                        log.push_str(&format!("git status failed: {}\n", e));
                        return Err(StepLog { text: log, triggered_run });
                    }
                };
                if files.is_empty() {
                    log.push_str("working tree clean, nothing to publish\n");
                    continue;
                }
                if let Err(e) = git.commit_all(message).await {
                    log.push_str(&format!("commit failed: {}\n", e));
                    return Err(StepLog { text: log, triggered_run });
                }
                if let Err(e) = git.push().await {
                    log.push_str(&format!("push failed: {}\n", e));
                    return Err(StepLog { text: log, triggered_run });
                }
                log.push_str(&format!("pushed {} changed file(s)\n", files.len()));
                triggered_run = true;
            }
            RepairAction::Decline { reason } => {
                log.push_str(&format!("declined: {}\n", reason));
                return Err(StepLog { text: log, triggered_run });
            }
        }
    }

    Ok(StepLog {
        text: log,
        triggered_run,
    })
}

fn append_output(log: &mut String, text: &str) {
    let text = text.trim_end();
    if !text.is_empty() {
        log.push_str(text);
        log.push('\n');
    }
}

/// Keep the last `limit` characters of `text`.
fn tail_chars(text: &str, limit: usize) -> String {
    let count = text.chars().count();
    if count <= limit {
        return text.to_string();
    }
    text.chars().skip(count - limit).collect()
}
