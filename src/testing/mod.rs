//! Testing infrastructure for the repair loop.
//!
//! This module provides traits, mocks and fixtures for testing the loop and
//! its components without real external dependencies.
//!
//! # Architecture
//!
//! The testing infrastructure is organized into:
//! - **Traits**: Abstractions for external dependencies (CI provider, git, subprocess)
//! - **Mocks**: Test doubles that implement the traits with controllable behavior
//! - **Fixtures**: Canned CI runs for common failure signatures
//!
//! # Example
//!
//! ```rust,ignore
//! use ci_autorepair::testing::{fixtures, MockStatusSource, MockCommandRunner};
//!
//! let source = MockStatusSource::new()
//!     .then_run(fixtures::dependency_failure_run("1"))
//!     .then_run(fixtures::success_run("2"));
//!
//! let runner = MockCommandRunner::new().with_exit_code(0);
//! ```

pub mod fixtures;
pub mod mocks;
pub mod traits;

// Re-export commonly used types
pub use mocks::*;
pub use traits::*;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ci::FetchError;

    // =========================================================================
    // Mock Status Source Tests
    // =========================================================================

    #[tokio::test]
    async fn test_mock_status_source_serves_in_order_then_repeats_last() {
        let source = MockStatusSource::new()
            .then_run(fixtures::running_run("1"))
            .then_run(fixtures::success_run("2"));

        assert_eq!(source.fetch_latest_run().await.unwrap().run_id, "1");
        assert_eq!(source.fetch_latest_run().await.unwrap().run_id, "2");
        assert_eq!(source.fetch_latest_run().await.unwrap().run_id, "2");
        assert_eq!(source.fetch_count(), 3);
    }

    #[tokio::test]
    async fn test_mock_status_source_empty_is_transient() {
        let source = MockStatusSource::new();
        let err = source.fetch_latest_run().await.unwrap_err();
        assert!(matches!(err, FetchError::Transient { .. }));
    }

    #[tokio::test]
    async fn test_mock_status_source_rerun() {
        let ok = MockStatusSource::new();
        assert!(ok.rerun_failed_jobs("1").await.is_ok());
        assert_eq!(ok.rerun_count(), 1);

        let failing = MockStatusSource::new().with_rerun_error(FetchError::auth("HTTP 403"));
        assert!(failing.rerun_failed_jobs("1").await.unwrap_err().is_auth());
    }

    // =========================================================================
    // Mock Git Operations Tests
    // =========================================================================

    #[tokio::test]
    async fn test_mock_git_commit_clears_modified_files() {
        let git = MockGitOperations::new().with_modified_files(vec!["package-lock.json".into()]);
        assert_eq!(git.modified_files().await.unwrap().len(), 1);

        git.commit_all("chore: lockfile").await.unwrap();
        assert!(git.modified_files().await.unwrap().is_empty());
        assert_eq!(git.commit_count(), 1);

        let err = git.commit_all("again").await.unwrap_err();
        assert!(err.to_string().contains("nothing to commit"));
    }

    #[tokio::test]
    async fn test_mock_git_push_error() {
        let git = MockGitOperations::new().with_push_error("Permission denied");
        assert!(git.push().await.is_err());
        assert_eq!(git.push_count(), 1);
    }

    // =========================================================================
    // Mock Command Runner Tests
    // =========================================================================

    #[tokio::test]
    async fn test_mock_command_runner_records_calls() {
        let runner = MockCommandRunner::new().with_exit_code(3).with_stderr("boom");
        let out = runner
            .run("npm", &["install".to_string()])
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert!(!out.success());
        assert_eq!(runner.calls(), vec!["npm install".to_string()]);
    }

    #[tokio::test]
    async fn test_mock_command_runner_spawn_error() {
        let runner = MockCommandRunner::new().with_spawn_error("No such file");
        assert!(runner.run("missing", &[]).await.is_err());
    }
}
