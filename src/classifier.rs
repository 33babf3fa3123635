//! Failure classification for CI runs.
//!
//! Classification is driven by an ordered list of [`ClassificationRule`]s.
//! Rules are plain data (regex strings plus an optional exit code) so new
//! failure signatures can be added from configuration without touching the
//! loop. The first matching rule wins; anything unmatched is
//! [`ErrorCategory::Unknown`] and is never repaired automatically.
//!
//! # Example
//!
//! ```
//! use ci_autorepair::ci::{Run, RunStatus};
//! use ci_autorepair::classifier::{ErrorCategory, ErrorClassifier};
//!
//! let classifier = ErrorClassifier::with_defaults();
//! let run = Run::new("42", RunStatus::Failed)
//!     .with_failed_step("push")
//!     .with_exit_code(128)
//!     .with_log("remote: Permission to acme/dash.git denied to github-actions[bot].");
//!
//! let record = classifier.classify(&run).unwrap();
//! assert_eq!(record.category, ErrorCategory::Permission);
//! ```

use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::ci::Run;
use crate::error::{AutorepairError, Result};

/// Category assigned to a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Token or credentials lack the rights the pipeline needs
    Permission,
    /// Package resolution or install failure
    Dependency,
    /// Compilation or bundling failure
    Build,
    /// Test suite failure
    Test,
    /// Lint or formatting check failure
    Lint,
    /// Connectivity, registry outage, timeouts
    Network,
    /// No rule matched
    Unknown,
}

impl ErrorCategory {
    /// All categories, in rule-evaluation order of the defaults.
    pub const ALL: [ErrorCategory; 7] = [
        Self::Permission,
        Self::Dependency,
        Self::Build,
        Self::Test,
        Self::Lint,
        Self::Network,
        Self::Unknown,
    ];

    /// Whether the loop may attempt a repair for this category.
    #[must_use]
    pub fn is_repairable(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Permission => "permission",
            Self::Dependency => "dependency",
            Self::Build => "build",
            Self::Test => "test",
            Self::Lint => "lint",
            Self::Network => "network",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ErrorCategory {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown error category '{}'", s))
    }
}

/// A classified failure derived from a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub run_id: String,
    pub category: ErrorCategory,
    /// Diagnostic line that triggered the match, or the best available text.
    pub message: String,
    pub detected_at: DateTime<Utc>,
    /// Name of the matching rule; `None` when nothing matched.
    #[serde(default)]
    pub rule: Option<String>,
}

impl ErrorRecord {
    /// Downgrade this record to `unknown`, keeping the diagnostic.
    #[must_use]
    pub fn reclassified_unknown(mut self) -> Self {
        self.category = ErrorCategory::Unknown;
        self
    }
}

/// One classification rule.
///
/// A rule matches when every populated matcher matches. Patterns are
/// case-insensitive regexes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationRule {
    pub name: String,
    pub category: ErrorCategory,
    /// Matched against the failed step name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_pattern: Option<String>,
    /// Matched against the failure log text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl ClassificationRule {
    pub fn new(name: impl Into<String>, category: ErrorCategory) -> Self {
        Self {
            name: name.into(),
            category,
            step_pattern: None,
            log_pattern: None,
            exit_code: None,
        }
    }

    #[must_use]
    pub fn with_step(mut self, pattern: impl Into<String>) -> Self {
        self.step_pattern = Some(pattern.into());
        self
    }

    #[must_use]
    pub fn with_log(mut self, pattern: impl Into<String>) -> Self {
        self.log_pattern = Some(pattern.into());
        self
    }

    #[must_use]
    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    /// Check that the rule has a matcher and its patterns compile.
    pub fn validate(&self) -> Result<()> {
        self.compile().map(|_| ())
    }

    fn compile(&self) -> Result<CompiledRule> {
        if self.step_pattern.is_none() && self.log_pattern.is_none() && self.exit_code.is_none() {
            return Err(AutorepairError::InvalidConfig {
                field: format!("rules.{}", self.name),
                reason: "rule has no matchers".to_string(),
            });
        }
        Ok(CompiledRule {
            name: self.name.clone(),
            category: self.category,
            step: self.step_pattern.as_deref().map(compile_pattern).transpose()?,
            log: self.log_pattern.as_deref().map(compile_pattern).transpose()?,
            exit_code: self.exit_code,
        })
    }
}

fn compile_pattern(pattern: &str) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| AutorepairError::InvalidConfig {
            field: "rules".to_string(),
            reason: format!("invalid pattern '{}': {}", pattern, e),
        })
}

#[derive(Debug)]
struct CompiledRule {
    name: String,
    category: ErrorCategory,
    step: Option<Regex>,
    log: Option<Regex>,
    exit_code: Option<i32>,
}

impl CompiledRule {
    /// Returns the matching diagnostic line when the rule applies.
    fn matches(&self, run: &Run) -> Option<String> {
        if let Some(code) = self.exit_code {
            if run.exit_code != Some(code) {
                return None;
            }
        }
        if let Some(ref step) = self.step {
            if !step.is_match(run.failed_step.as_deref()?) {
                return None;
            }
        }
        match self.log {
            Some(ref log) => {
                let text = run.log_excerpt.as_deref()?;
                text.lines()
                    .find(|line| log.is_match(line))
                    .or_else(|| log.is_match(text).then_some(text))
                    .map(|line| line.trim().to_string())
            }
            None => Some(fallback_message(run)),
        }
    }
}

fn fallback_message(run: &Run) -> String {
    let log_line = run
        .log_excerpt
        .as_deref()
        .and_then(|log| log.lines().rev().find(|l| !l.trim().is_empty()))
        .map(|l| l.trim().to_string());

    match (&run.failed_step, run.exit_code, log_line) {
        (_, _, Some(line)) => line,
        (Some(step), Some(code), None) => format!("step '{}' exited with {}", step, code),
        (Some(step), None, None) => format!("step '{}' failed", step),
        (None, _, None) => format!("run {} {}", run.run_id, run.status),
    }
}

/// Built-in rules, most specific first.
#[must_use]
pub fn default_rules() -> Vec<ClassificationRule> {
    use ErrorCategory::*;

    vec![
        // Permission first: a denied push must never fall through to a
        // retryable category.
        ClassificationRule::new("push-permission-denied", Permission)
            .with_exit_code(128)
            .with_step("push")
            .with_log(r"permission .*denied|denied to|403"),
        ClassificationRule::new("permission-denied", Permission).with_log(
            r"permission to .+ denied|resource not accessible by integration|\b403\b.*forbidden|could not read username|write access to repository not granted",
        ),
        // Network
        ClassificationRule::new("network-unreachable", Network).with_log(
            r"ETIMEDOUT|ECONNRESET|ECONNREFUSED|EAI_AGAIN|could not resolve host|connection (timed out|reset|refused)|network is unreachable|tls handshake timeout|\b50[234]\b .*(bad gateway|service unavailable|gateway timeout)",
        ),
        // Dependency
        ClassificationRule::new("dependency-resolution", Dependency).with_log(
            r"npm ERR! code E(RESOLVE|NOTARGET|404|INTEGRITY)|ERESOLVE|could not resolve dependency|no matching version|failed to select a version|lockfile .*(out of date|needs to be updated)|ERR_PNPM_|cannot find module|ModuleNotFoundError|unresolved dependency",
        ),
        ClassificationRule::new("dependency-install-step", Dependency)
            .with_step(r"install|dependencies|npm ci|yarn|pnpm|bundle"),
        // Lint
        ClassificationRule::new("lint-step", Lint).with_step(r"lint|eslint|prettier|clippy|fmt|format|stylelint"),
        ClassificationRule::new("lint-output", Lint)
            .with_log(r"✖ \d+ problems?|\d+ errors? and \d+ warnings? potentially fixable|Code style issues found|Diff in .+ at line"),
        // Test
        ClassificationRule::new("test-step", Test).with_step(r"\b(test|spec|e2e|vitest|jest|pytest)"),
        ClassificationRule::new("test-output", Test).with_log(
            r"test result: FAILED|Tests?:\s+\d+ failed|\bFAIL\b .+\.(spec|test)\.|AssertionError|assertion .+ failed|panicked at",
        ),
        // Build
        ClassificationRule::new("build-step", Build).with_step(r"build|compile|bundle|tsc"),
        ClassificationRule::new("build-output", Build).with_log(
            r"error TS\d+|error\[E\d+\]|build failed|compilation failed|failed to compile|\[vite\].*error|Module build failed",
        ),
    ]
}

/// Classifies runs using ordered rules; the first match wins.
#[derive(Debug)]
pub struct ErrorClassifier {
    rules: Vec<CompiledRule>,
}

impl ErrorClassifier {
    /// Build a classifier from an ordered rule list.
    pub fn new(rules: &[ClassificationRule]) -> Result<Self> {
        let rules = rules
            .iter()
            .map(ClassificationRule::compile)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Classifier with only the built-in rules.
    #[must_use]
    pub fn with_defaults() -> Self {
        // Built-in patterns are static and covered by tests.
        let rules = default_rules()
            .iter()
            .filter_map(|r| r.compile().ok())
            .collect();
        Self { rules }
    }

    /// User rules evaluated before the built-ins.
    pub fn with_extra_rules(extra: &[ClassificationRule]) -> Result<Self> {
        let mut all = extra.to_vec();
        all.extend(default_rules());
        Self::new(&all)
    }

    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Classify a run. Returns `None` only for successful runs.
    #[must_use]
    pub fn classify(&self, run: &Run) -> Option<ErrorRecord> {
        if run.is_success() {
            return None;
        }

        let (category, message, rule) = self
            .rules
            .iter()
            .find_map(|rule| {
                rule.matches(run)
                    .map(|message| (rule.category, message, Some(rule.name.clone())))
            })
            .unwrap_or_else(|| (ErrorCategory::Unknown, fallback_message(run), None));

        Some(ErrorRecord {
            run_id: run.run_id.clone(),
            category,
            message,
            detected_at: Utc::now(),
            rule,
        })
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::with_defaults()
    }
}
