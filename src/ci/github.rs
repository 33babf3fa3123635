//! GitHub Actions status source backed by the `gh` CLI.
//!
//! Uses `gh` as a subprocess rather than an HTTP client: it already owns
//! authentication (`gh auth login`) and pagination, and keeps the binary free
//! of a TLS stack.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use super::{FetchError, Run, RunStatus};
use crate::error::{AutorepairError, Result};
use crate::testing::StatusSource;

/// Maximum number of log lines kept from `gh run view --log-failed`.
pub const MAX_LOG_LINES: usize = 200;

/// Fields requested from `gh run list`.
const RUN_FIELDS: &str = "databaseId,status,conclusion,createdAt,startedAt,headBranch,url";

/// Status source for GitHub Actions runs on one branch.
#[derive(Debug, Clone)]
pub struct GhStatusSource {
    project_dir: PathBuf,
    branch: String,
    workflow: Option<String>,
    fetch_timeout: Duration,
}

impl GhStatusSource {
    /// Create a source, failing if the `gh` binary is not on `PATH`.
    pub fn detect(project_dir: PathBuf, branch: impl Into<String>) -> Result<Self> {
        if which::which("gh").is_err() {
            return Err(AutorepairError::MissingTool {
                tool: "gh".to_string(),
            });
        }
        Ok(Self {
            project_dir,
            branch: branch.into(),
            workflow: None,
            fetch_timeout: Duration::from_secs(30),
        })
    }

    /// Restrict polling to a single workflow (file name or display name).
    #[must_use]
    pub fn with_workflow(mut self, workflow: Option<String>) -> Self {
        self.workflow = workflow;
        self
    }

    #[must_use]
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    async fn gh(&self, args: &[&str]) -> std::result::Result<String, FetchError> {
        debug!("gh {}", args.join(" "));

        let output = Command::new("gh")
            .args(args)
            .current_dir(&self.project_dir)
            .env("GH_PROMPT_DISABLED", "1")
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.fetch_timeout, output)
            .await
            .map_err(|_| {
                FetchError::transient(format!(
                    "gh {} timed out after {}s",
                    args.first().copied().unwrap_or_default(),
                    self.fetch_timeout.as_secs()
                ))
            })?
            .map_err(|e| FetchError::transient(format!("Failed to execute gh: {}", e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(gh_error(&String::from_utf8_lossy(&output.stderr)))
        }
    }
}

#[async_trait]
impl StatusSource for GhStatusSource {
    async fn fetch_latest_run(&self) -> std::result::Result<Run, FetchError> {
        let mut args: Vec<&str> = vec![
            "run",
            "list",
            "--branch",
            self.branch.as_str(),
            "--limit",
            "1",
            "--json",
            RUN_FIELDS,
        ];
        if let Some(ref workflow) = self.workflow {
            args.push("--workflow");
            args.push(workflow.as_str());
        }

        let stdout = self.gh(&args).await?;
        let mut run = parse_run_list(&stdout)?
            .ok_or_else(|| FetchError::transient(format!("no runs found on {}", self.branch)))?;

        if run.status == RunStatus::Failed {
            let jobs = self
                .gh(&["run", "view", run.run_id.as_str(), "--json", "jobs"])
                .await?;
            run.failed_step = first_failed_step(&jobs);

            // Logs can lag behind the run conclusion; classify on what we have.
            let log = self
                .gh(&["run", "view", run.run_id.as_str(), "--log-failed"])
                .await;
            match log {
                Ok(log) => {
                    run.exit_code = extract_exit_code(&log);
                    run.log_excerpt = Some(tail_lines(&log, MAX_LOG_LINES));
                }
                Err(FetchError::Auth { message }) => return Err(FetchError::Auth { message }),
                Err(e) => debug!("Failed log unavailable for run {}: {}", run.run_id, e),
            }
        }

        Ok(run)
    }

    async fn rerun_failed_jobs(&self, run_id: &str) -> std::result::Result<(), FetchError> {
        self.gh(&["run", "rerun", run_id, "--failed"]).await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhRun {
    database_id: u64,
    status: String,
    #[serde(default)]
    conclusion: Option<String>,
    created_at: DateTime<Utc>,
    /// Moves forward when failed jobs are re-run; `createdAt` does not.
    #[serde(default)]
    started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    head_branch: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GhJobs {
    #[serde(default)]
    jobs: Vec<GhJob>,
}

#[derive(Debug, Deserialize)]
struct GhJob {
    name: String,
    #[serde(default)]
    conclusion: Option<String>,
    #[serde(default)]
    steps: Vec<GhStep>,
}

#[derive(Debug, Deserialize)]
struct GhStep {
    name: String,
    #[serde(default)]
    conclusion: Option<String>,
}

/// Parse `gh run list --json` output into the newest run, if any.
fn parse_run_list(json: &str) -> std::result::Result<Option<Run>, FetchError> {
    let runs: Vec<GhRun> = serde_json::from_str(json)
        .map_err(|e| FetchError::transient(format!("unexpected gh output: {}", e)))?;

    Ok(runs.into_iter().next().map(|gh| {
        let status = map_status(&gh.status, gh.conclusion.as_deref());
        let started_at = gh.started_at.map_or(gh.created_at, |s| s.max(gh.created_at));
        let mut run = Run::new(gh.database_id.to_string(), status).with_started_at(started_at);
        run.branch = gh.head_branch;
        if let Some(url) = gh.url {
            run = run.with_url(url);
        }
        run
    }))
}

/// Map GitHub's status/conclusion pair onto [`RunStatus`].
fn map_status(status: &str, conclusion: Option<&str>) -> RunStatus {
    match status {
        "completed" => match conclusion.unwrap_or_default() {
            "success" | "neutral" | "skipped" => RunStatus::Success,
            "cancelled" => RunStatus::Cancelled,
            _ => RunStatus::Failed,
        },
        "in_progress" => RunStatus::Running,
        _ => RunStatus::Queued,
    }
}

/// Name of the first failed step of the first failed job.
fn first_failed_step(json: &str) -> Option<String> {
    let jobs: GhJobs = serde_json::from_str(json).ok()?;
    let job = jobs
        .jobs
        .into_iter()
        .find(|j| j.conclusion.as_deref() == Some("failure"))?;

    job.steps
        .into_iter()
        .find(|s| s.conclusion.as_deref() == Some("failure"))
        .map(|s| s.name)
        .or(Some(job.name))
}

/// Extract the exit code GitHub prints for a failed step.
fn extract_exit_code(log: &str) -> Option<i32> {
    static EXIT_CODE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = EXIT_CODE
        .get_or_init(|| Regex::new(r"Process completed with exit code (\d+)").ok())
        .as_ref()?;
    re.captures(log)?.get(1)?.as_str().parse().ok()
}

fn tail_lines(text: &str, max: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max);
    lines[start..].join("\n")
}

/// Classify a `gh` failure by its stderr.
fn gh_error(stderr: &str) -> FetchError {
    let lower = stderr.to_lowercase();
    let message = stderr.trim().to_string();

    if lower.contains("rate limit") {
        return FetchError::transient(message);
    }
    if lower.contains("gh auth login")
        || lower.contains("http 401")
        || lower.contains("bad credentials")
        || lower.contains("authentication required")
    {
        return FetchError::auth(message);
    }
    FetchError::transient(message)
}
