//! Project configuration.
//!
//! Settings live in `<project>/.autorepair/settings.json`. Every field is
//! optional; a missing file yields the defaults. Command-line flags override
//! file values.
//!
//! ```json
//! {
//!   "branch": "main",
//!   "maxIterations": 10,
//!   "cleanThreshold": 3,
//!   "rules": [
//!     { "name": "storybook", "category": "build", "stepPattern": "storybook" }
//!   ],
//!   "strategies": {
//!     "lint": { "steps": [{ "type": "command", "program": "npx", "args": ["eslint", "--fix", "."] }] }
//!   }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::classifier::{ClassificationRule, ErrorCategory, ErrorClassifier};
use crate::error::{AutorepairError, Result};
use crate::r#loop::retry::RetryPolicy;
use crate::r#loop::LoopCoordinatorConfig;
use crate::strategy::{StrategyOverride, StrategyRegistry};

/// Default state directory, relative to the project.
pub const DEFAULT_STATE_DIR: &str = ".autorepair";

fn default_branch() -> String {
    "main".to_string()
}

fn default_state_dir() -> String {
    DEFAULT_STATE_DIR.to_string()
}

fn default_max_iterations() -> u32 {
    10
}

fn default_clean_threshold() -> u32 {
    3
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_verify_delay_secs() -> u64 {
    10
}

fn default_run_poll_interval_secs() -> u64 {
    15
}

fn default_fetch_retries() -> u32 {
    5
}

fn default_fetch_timeout_secs() -> u64 {
    60
}

fn default_run_timeout_secs() -> u64 {
    1800
}

/// Project configuration loaded from `.autorepair/settings.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    /// Branch whose latest run is monitored.
    #[serde(default = "default_branch")]
    pub branch: String,

    /// Restrict monitoring to one workflow (file name or display name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,

    /// State directory, relative to the project unless absolute.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    #[serde(default = "default_clean_threshold")]
    pub clean_threshold: u32,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_verify_delay_secs")]
    pub verify_delay_secs: u64,

    /// Re-fetch interval while a run is queued or in progress.
    #[serde(default = "default_run_poll_interval_secs")]
    pub run_poll_interval_secs: u64,

    /// Attempts per fetch before the loop aborts.
    #[serde(default = "default_fetch_retries")]
    pub fetch_retries: u32,

    /// Timeout for a single provider call.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    /// How long to wait for a run to finish.
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,

    /// Extra classification rules, evaluated before the built-in ones.
    #[serde(default)]
    pub rules: Vec<ClassificationRule>,

    /// Per-category strategy overrides.
    #[serde(default)]
    pub strategies: BTreeMap<ErrorCategory, StrategyOverride>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            branch: default_branch(),
            workflow: None,
            state_dir: default_state_dir(),
            max_iterations: default_max_iterations(),
            clean_threshold: default_clean_threshold(),
            poll_interval_secs: default_poll_interval_secs(),
            verify_delay_secs: default_verify_delay_secs(),
            run_poll_interval_secs: default_run_poll_interval_secs(),
            fetch_retries: default_fetch_retries(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            run_timeout_secs: default_run_timeout_secs(),
            rules: Vec::new(),
            strategies: BTreeMap::new(),
        }
    }
}

impl ProjectConfig {
    /// Load configuration from a project directory
    pub fn load(project_dir: &Path) -> Result<Self> {
        let settings_path = Self::settings_path(project_dir);

        if !settings_path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&settings_path).map_err(|e| {
            AutorepairError::config_with_path(e.to_string(), settings_path.clone())
        })?;
        serde_json::from_str(&content).map_err(|e| {
            AutorepairError::config_with_path(format!("failed to parse: {e}"), settings_path)
        })
    }

    /// Get the settings.json path for a project
    pub fn settings_path(project_dir: &Path) -> PathBuf {
        project_dir.join(DEFAULT_STATE_DIR).join("settings.json")
    }

    /// Resolve the state directory against the project directory.
    pub fn state_dir(&self, project_dir: &Path) -> PathBuf {
        let dir = Path::new(&self.state_dir);
        if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            project_dir.join(dir)
        }
    }

    /// Build the classifier: configured rules first, then built-ins.
    pub fn classifier(&self) -> Result<ErrorClassifier> {
        ErrorClassifier::with_extra_rules(&self.rules)
    }

    /// Build the strategy registry with overrides applied.
    pub fn strategies(&self) -> StrategyRegistry {
        StrategyRegistry::with_defaults().with_overrides(&self.strategies)
    }

    /// Coordinator settings derived from this configuration.
    pub fn coordinator_config(&self) -> LoopCoordinatorConfig {
        LoopCoordinatorConfig::new()
            .with_max_iterations(self.max_iterations)
            .with_clean_threshold(self.clean_threshold)
            .with_poll_interval(Duration::from_secs(self.poll_interval_secs))
            .with_verify_delay(Duration::from_secs(self.verify_delay_secs))
            .with_run_polling(
                Duration::from_secs(self.run_poll_interval_secs),
                Duration::from_secs(self.run_timeout_secs),
            )
            .with_fetch_retry(RetryPolicy::new(self.fetch_retries))
    }

    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Check the configuration for problems.
    pub fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::new();

        if self.branch.trim().is_empty() {
            report.errors.push("branch must not be empty".to_string());
        }
        if self.max_iterations == 0 {
            report.errors.push("maxIterations must be at least 1".to_string());
        }
        if self.clean_threshold == 0 {
            report.errors.push("cleanThreshold must be at least 1".to_string());
        }
        if self.clean_threshold > self.max_iterations {
            report.warnings.push(format!(
                "cleanThreshold ({}) exceeds maxIterations ({}); the loop can only end by iteration limit",
                self.clean_threshold, self.max_iterations
            ));
        }
        if self.fetch_retries == 0 {
            report.errors.push("fetchRetries must be at least 1".to_string());
        }
        if self.fetch_timeout_secs == 0 {
            report.errors.push("fetchTimeoutSecs must be at least 1".to_string());
        }
        if self.run_timeout_secs == 0 {
            report.errors.push("runTimeoutSecs must be at least 1".to_string());
        }

        for rule in &self.rules {
            if let Err(e) = rule.validate() {
                report.errors.push(format!("rule '{}': {}", rule.name, e));
            }
        }

        for (category, strategy) in &self.strategies {
            match category {
                ErrorCategory::Permission => report.warnings.push(
                    "strategies.permission is ignored; permission failures are never repaired"
                        .to_string(),
                ),
                ErrorCategory::Unknown => report.warnings.push(
                    "strategies.unknown is ignored; unknown failures are never repaired".to_string(),
                ),
                _ => {
                    if strategy.steps.as_ref().is_some_and(Vec::is_empty) {
                        report
                            .errors
                            .push(format!("strategies.{}: steps must not be empty", category));
                    }
                    if strategy.timeout_secs == Some(0) {
                        report
                            .errors
                            .push(format!("strategies.{}: timeoutSecs must be at least 1", category));
                    }
                }
            }
        }

        report
    }
}

/// Result of configuration validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    /// Errors that prevent the configuration from being used.
    pub errors: Vec<String>,
    /// Suspicious but usable settings.
    pub warnings: Vec<String>,
}

impl ValidationReport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Warnings do not affect validity.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Convert into an error when invalid.
    pub fn into_result(self) -> Result<()> {
        match self.errors.first() {
            None => Ok(()),
            Some(first) => Err(AutorepairError::InvalidConfig {
                field: "settings".to_string(),
                reason: if self.errors.len() == 1 {
                    first.clone()
                } else {
                    format!("{} (and {} more)", first, self.errors.len() - 1)
                },
            }),
        }
    }
}
