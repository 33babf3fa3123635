//! Trait definitions for testable abstractions.
//!
//! These traits abstract external dependencies to enable unit testing
//! without a real CI provider, git repository, or subprocesses.

use anyhow::Result;
use async_trait::async_trait;

use crate::ci::{FetchError, Run};

/// Abstraction over the external CI provider.
///
/// # Example
///
/// ```rust,ignore
/// use ci_autorepair::testing::StatusSource;
///
/// async fn is_green(source: &dyn StatusSource) -> bool {
///     matches!(source.fetch_latest_run().await, Ok(run) if run.is_success())
/// }
/// ```
#[async_trait]
pub trait StatusSource: Send + Sync {
    /// Fetch the most recent run on the tracked branch.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Transient`] on network or rate-limit problems
    /// and [`FetchError::Auth`] when credentials are rejected.
    async fn fetch_latest_run(&self) -> std::result::Result<Run, FetchError>;

    /// Ask the provider to re-run the failed jobs of a run.
    ///
    /// # Errors
    ///
    /// Same classification as [`StatusSource::fetch_latest_run`].
    async fn rerun_failed_jobs(&self, run_id: &str) -> std::result::Result<(), FetchError>;
}

/// Abstraction for git operations used by repairs.
///
/// Async so that pushes can be cancelled on repair timeout.
#[async_trait]
pub trait GitOperations: Send + Sync {
    /// List of modified or untracked paths in the working tree.
    async fn modified_files(&self) -> Result<Vec<String>>;

    /// Stage everything and commit with the given message.
    ///
    /// # Errors
    ///
    /// Returns an error if git fails (including "nothing to commit").
    async fn commit_all(&self, message: &str) -> Result<()>;

    /// Push the current branch to its upstream.
    ///
    /// # Errors
    ///
    /// Returns an error if push fails (auth, network, etc.).
    async fn push(&self) -> Result<()>;
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Abstraction for running repair commands.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` to completion.
    ///
    /// Implementations must kill the child process if the returned future
    /// is dropped before completion.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be spawned.
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;
}
