//! Canned CI runs for consistent testing.
//!
//! Each fixture mirrors a failure signature seen in real pipelines.

use crate::ci::{Run, RunStatus};

/// A successful run.
#[must_use]
pub fn success_run(run_id: &str) -> Run {
    Run::new(run_id, RunStatus::Success).with_branch("main")
}

/// A push rejected because the workflow token is read-only.
#[must_use]
pub fn permission_denied_run(run_id: &str) -> Run {
    Run::new(run_id, RunStatus::Failed)
        .with_branch("main")
        .with_failed_step("push")
        .with_exit_code(128)
        .with_log(
            "remote: Permission to acme/it-dashboard.git denied to github-actions[bot].\n\
             fatal: unable to access 'https://github.com/acme/it-dashboard/': The requested URL returned error: 403\n\
             ##[error]Process completed with exit code 128.",
        )
}

/// An npm install that could not resolve the dependency tree.
#[must_use]
pub fn dependency_failure_run(run_id: &str) -> Run {
    Run::new(run_id, RunStatus::Failed)
        .with_branch("main")
        .with_failed_step("Install dependencies")
        .with_exit_code(1)
        .with_log(
            "npm ERR! code ERESOLVE\n\
             npm ERR! ERESOLVE unable to resolve dependency tree\n\
             npm ERR! Could not resolve dependency: peer vue@\"^2.6.0\" from element-ui@2.15.14\n\
             ##[error]Process completed with exit code 1.",
        )
}

/// A registry timeout.
#[must_use]
pub fn network_failure_run(run_id: &str) -> Run {
    Run::new(run_id, RunStatus::Failed)
        .with_branch("main")
        .with_failed_step("Install dependencies")
        .with_exit_code(1)
        .with_log("npm ERR! request to https://registry.npmjs.org/echarts failed, reason: connect ETIMEDOUT 104.16.0.35:443")
}

/// A failure no rule recognises.
#[must_use]
pub fn unknown_failure_run(run_id: &str) -> Run {
    Run::new(run_id, RunStatus::Failed)
        .with_branch("main")
        .with_failed_step("Deploy preview")
        .with_exit_code(2)
        .with_log("Error: preview environment quota reached")
}

/// A run still in progress.
#[must_use]
pub fn running_run(run_id: &str) -> Run {
    Run::new(run_id, RunStatus::Running).with_branch("main")
}
