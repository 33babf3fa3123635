//! Mock implementations of testing traits.
//!
//! These mocks provide controllable test doubles for external dependencies,
//! enabling deterministic unit tests of the repair loop.

use super::traits::{CommandOutput, CommandRunner, GitOperations, StatusSource};
use crate::ci::{FetchError, Run};
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Scripted CI provider.
///
/// Responses are served in order; the last one repeats forever.
///
/// # Example
///
/// ```rust,ignore
/// let source = MockStatusSource::new()
///     .then_run(fixtures::failed_run("1", "push"))
///     .then_run(fixtures::success_run("2"));
/// ```
#[derive(Debug, Default)]
pub struct MockStatusSource {
    script: Mutex<VecDeque<std::result::Result<Run, FetchError>>>,
    rerun_error: Option<FetchError>,
    fetch_count: AtomicU32,
    rerun_count: AtomicU32,
}

impl MockStatusSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a run to be returned.
    #[must_use]
    pub fn then_run(self, run: Run) -> Self {
        self.push(Ok(run));
        self
    }

    /// Queue an error to be returned.
    #[must_use]
    pub fn then_error(self, error: FetchError) -> Self {
        self.push(Err(error));
        self
    }

    /// Queue the same run `times` times.
    #[must_use]
    pub fn then_repeat(self, run: &Run, times: usize) -> Self {
        for _ in 0..times {
            self.push(Ok(run.clone()));
        }
        self
    }

    /// Make rerun requests fail.
    #[must_use]
    pub fn with_rerun_error(mut self, error: FetchError) -> Self {
        self.rerun_error = Some(error);
        self
    }

    fn push(&self, item: std::result::Result<Run, FetchError>) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(item);
        }
    }

    /// Number of fetches served so far.
    pub fn fetch_count(&self) -> u32 {
        self.fetch_count.load(Ordering::SeqCst)
    }

    /// Number of rerun requests received.
    pub fn rerun_count(&self) -> u32 {
        self.rerun_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StatusSource for MockStatusSource {
    async fn fetch_latest_run(&self) -> std::result::Result<Run, FetchError> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        let mut script = self
            .script
            .lock()
            .map_err(|_| FetchError::transient("mock script poisoned"))?;

        match script.len() {
            0 => Err(FetchError::transient("mock script is empty")),
            1 => script
                .front()
                .cloned()
                .unwrap_or_else(|| Err(FetchError::transient("mock script is empty"))),
            _ => script
                .pop_front()
                .unwrap_or_else(|| Err(FetchError::transient("mock script is empty"))),
        }
    }

    async fn rerun_failed_jobs(&self, _run_id: &str) -> std::result::Result<(), FetchError> {
        self.rerun_count.fetch_add(1, Ordering::SeqCst);
        match self.rerun_error {
            Some(ref e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

/// Mock implementation of git operations.
///
/// # Example
///
/// ```rust,ignore
/// let git = MockGitOperations::new()
///     .with_modified_files(vec!["package-lock.json".into()]);
/// ```
#[derive(Debug, Default)]
pub struct MockGitOperations {
    modified_files: Mutex<Vec<String>>,
    push_error: Option<String>,
    commit_count: AtomicU32,
    push_count: AtomicU32,
}

impl MockGitOperations {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the list of modified files. A commit clears it.
    #[must_use]
    pub fn with_modified_files(self, files: Vec<String>) -> Self {
        if let Ok(mut current) = self.modified_files.lock() {
            *current = files;
        }
        self
    }

    /// Configure push to fail with an error.
    #[must_use]
    pub fn with_push_error(mut self, error: &str) -> Self {
        self.push_error = Some(error.to_string());
        self
    }

    pub fn commit_count(&self) -> u32 {
        self.commit_count.load(Ordering::SeqCst)
    }

    pub fn push_count(&self) -> u32 {
        self.push_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GitOperations for MockGitOperations {
    async fn modified_files(&self) -> Result<Vec<String>> {
        match self.modified_files.lock() {
            Ok(files) => Ok(files.clone()),
            Err(_) => bail!("mock state poisoned"),
        }
    }

    async fn commit_all(&self, _message: &str) -> Result<()> {
        let mut files = match self.modified_files.lock() {
            Ok(files) => files,
            Err(_) => bail!("mock state poisoned"),
        };
        if files.is_empty() {
            bail!("nothing to commit, working tree clean");
        }
        files.clear();
        self.commit_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn push(&self) -> Result<()> {
        self.push_count.fetch_add(1, Ordering::SeqCst);
        match self.push_error {
            Some(ref error) => bail!("{}", error),
            None => Ok(()),
        }
    }
}

/// Mock command runner.
///
/// Thread-safe for use in async contexts.
#[derive(Debug, Default)]
pub struct MockCommandRunner {
    output: CommandOutput,
    spawn_error: Option<String>,
    delay: Option<Duration>,
    panics: bool,
    calls: Mutex<Vec<String>>,
}

impl MockCommandRunner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.output.exit_code = code;
        self
    }

    #[must_use]
    pub fn with_stdout(mut self, stdout: &str) -> Self {
        self.output.stdout = stdout.to_string();
        self
    }

    #[must_use]
    pub fn with_stderr(mut self, stderr: &str) -> Self {
        self.output.stderr = stderr.to_string();
        self
    }

    /// Fail to spawn with the given message.
    #[must_use]
    pub fn with_spawn_error(mut self, error: &str) -> Self {
        self.spawn_error = Some(error.to_string());
        self
    }

    /// Sleep before returning, to exercise timeouts.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Panic inside `run`.
    #[must_use]
    pub fn panicking(mut self) -> Self {
        self.panics = true;
        self
    }

    /// Command lines received so far.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CommandRunner for MockCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        if let Ok(mut calls) = self.calls.lock() {
            let mut line = program.to_string();
            for arg in args {
                line.push(' ');
                line.push_str(arg);
            }
            calls.push(line);
        }

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.panics {
            panic!("mock command runner panicked");
        }
        if let Some(ref error) = self.spawn_error {
            bail!("{}", error);
        }
        Ok(self.output.clone())
    }
}
