//! Real implementations of testable traits.
//!
//! These implementations spawn actual `git` and repair subprocesses. They
//! implement the same traits as the mocks, enabling dependency injection.
//! Every child is spawned with `kill_on_drop` so that a repair timeout
//! terminates it.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::testing::{CommandOutput, CommandRunner, GitOperations};

/// Real git operations implementation.
#[derive(Debug, Clone)]
pub struct RealGitOperations {
    project_dir: PathBuf,
}

impl RealGitOperations {
    /// Create a new git operations instance for the given directory.
    #[must_use]
    pub fn new(project_dir: PathBuf) -> Self {
        Self { project_dir }
    }

    async fn git(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.project_dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_SSH_COMMAND", "ssh -o BatchMode=yes -o ConnectTimeout=10")
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to run git {}", args.first().unwrap_or(&"")))
    }
}

#[async_trait]
impl GitOperations for RealGitOperations {
    async fn modified_files(&self) -> Result<Vec<String>> {
        let output = self.git(&["status", "--porcelain"]).await?;

        if !output.status.success() {
            bail!(
                "git status failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .filter_map(|line| {
                // Format: "XY filename" where XY is status
                line.get(3..).map(str::to_string)
            })
            .collect())
    }

    async fn commit_all(&self, message: &str) -> Result<()> {
        let add = self.git(&["add", "--all"]).await?;
        if !add.status.success() {
            bail!("git add failed: {}", String::from_utf8_lossy(&add.stderr).trim());
        }

        let commit = self.git(&["commit", "-m", message]).await?;
        if commit.status.success() {
            Ok(())
        } else {
            let stdout = String::from_utf8_lossy(&commit.stdout);
            let stderr = String::from_utf8_lossy(&commit.stderr);
            bail!("git commit failed: {} {}", stdout.trim(), stderr.trim())
        }
    }

    async fn push(&self) -> Result<()> {
        let output = self.git(&["push"]).await?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("Push failed: {}", stderr.trim())
        }
    }
}

/// Runs repair commands as subprocesses in the project directory.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    project_dir: PathBuf,
}

impl ProcessRunner {
    #[must_use]
    pub fn new(project_dir: PathBuf) -> Self {
        Self { project_dir }
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        debug!("Running {} {}", program, args.join(" "));

        let output = Command::new(program)
            .args(args)
            .current_dir(&self.project_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to spawn {}", program))?;

        Ok(CommandOutput {
            // Killed by a signal has no exit code.
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_captures_output_and_exit_code() {
        let temp = TempDir::new().unwrap();
        let runner = ProcessRunner::new(temp.path().to_path_buf());

        let out = runner
            .run("sh", &["-c".to_string(), "echo fixed; echo warn >&2; exit 4".to_string()])
            .await
            .unwrap();
        assert_eq!(out.exit_code, 4);
        assert_eq!(out.stdout.trim(), "fixed");
        assert_eq!(out.stderr.trim(), "warn");
    }

    #[tokio::test]
    async fn test_process_runner_missing_program_is_error() {
        let temp = TempDir::new().unwrap();
        let runner = ProcessRunner::new(temp.path().to_path_buf());
        assert!(runner
            .run("definitely-not-a-real-binary-4821", &[])
            .await
            .is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_killed_on_timeout() {
        let temp = TempDir::new().unwrap();
        let runner = ProcessRunner::new(temp.path().to_path_buf());
        let marker = temp.path().join("finished");
        let script = format!("sleep 2; touch {}", marker.display());

        let result = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            runner.run("sh", &["-c".to_string(), script]),
        )
        .await;
        assert!(result.is_err());

        tokio::time::sleep(std::time::Duration::from_millis(2500)).await;
        assert!(!marker.exists(), "child process outlived its timeout");
    }
}
