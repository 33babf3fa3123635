//! Repair strategies keyed by error category.
//!
//! A [`RepairStrategy`] is a named, ordered list of [`RepairAction`] steps
//! plus its retry policy. Every strategy must be idempotent: the loop may
//! re-run it after a flaky verification, and re-running an already applied
//! fix has to be a no-op success.
//!
//! Permission failures always resolve to a declining strategy. A CI token
//! that cannot push cannot grant itself write access, so no amount of
//! retrying helps; the attempt is recorded and the failure escalated.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::warn;

use crate::classifier::ErrorCategory;

/// Placeholder replaced by the failing run id in command arguments.
pub const RUN_ID_PLACEHOLDER: &str = "{run_id}";

/// One step of a repair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RepairAction {
    /// Re-run the failed jobs of the run on the CI provider.
    Rerun,
    /// Run a local command in the project directory.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Commit all working-tree changes and push. No-op when the tree is clean.
    CommitAndPush { message: String },
    /// Refuse to act; always yields a failed attempt.
    Decline { reason: String },
}

impl RepairAction {
    pub fn command(program: impl Into<String>, args: &[&str]) -> Self {
        Self::Command {
            program: program.into(),
            args: args.iter().map(|a| (*a).to_string()).collect(),
        }
    }

    /// Short human-readable label for logs.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Rerun => "rerun failed jobs".to_string(),
            Self::Command { program, args } => {
                if args.is_empty() {
                    program.clone()
                } else {
                    format!("{} {}", program, args.join(" "))
                }
            }
            Self::CommitAndPush { message } => format!("commit and push ({})", message),
            Self::Decline { reason } => format!("decline: {}", reason),
        }
    }
}

/// A repair procedure and its retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairStrategy {
    pub action_name: String,
    pub steps: Vec<RepairAction>,
    /// Additional attempts allowed after the first, per category per session.
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub timeout: Duration,
}

impl RepairStrategy {
    pub fn new(action_name: impl Into<String>, steps: Vec<RepairAction>) -> Self {
        Self {
            action_name: action_name.into(),
            steps,
            max_retries: 2,
            retry_backoff: Duration::from_secs(30),
            timeout: Duration::from_secs(300),
        }
    }

    /// Strategy that never acts.
    pub fn decline(action_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            action_name: action_name.into(),
            steps: vec![RepairAction::Decline {
                reason: reason.into(),
            }],
            max_retries: 0,
            retry_backoff: Duration::ZERO,
            timeout: Duration::from_secs(1),
        }
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Total attempts allowed for one category in a session.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// True when the strategy refuses to act.
    #[must_use]
    pub fn declines(&self) -> bool {
        self.steps
            .iter()
            .any(|s| matches!(s, RepairAction::Decline { .. }))
    }
}

/// Per-category override loaded from settings.
///
/// Unset fields keep the built-in value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<RepairAction>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_backoff_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Maps error categories to repair strategies.
#[derive(Debug, Clone)]
pub struct StrategyRegistry {
    strategies: BTreeMap<ErrorCategory, RepairStrategy>,
}

impl StrategyRegistry {
    /// Registry with the built-in strategies.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut strategies = BTreeMap::new();

        strategies.insert(ErrorCategory::Permission, permission_strategy());
        strategies.insert(
            ErrorCategory::Network,
            RepairStrategy::new("rerun-after-network-failure", vec![RepairAction::Rerun])
                .with_max_retries(3)
                .with_retry_backoff(Duration::from_secs(60))
                .with_timeout(Duration::from_secs(60)),
        );
        strategies.insert(
            ErrorCategory::Test,
            RepairStrategy::new("rerun-flaky-tests", vec![RepairAction::Rerun])
                .with_max_retries(1)
                .with_timeout(Duration::from_secs(60)),
        );
        strategies.insert(
            ErrorCategory::Build,
            RepairStrategy::new("rerun-with-clean-cache", vec![RepairAction::Rerun])
                .with_max_retries(1)
                .with_timeout(Duration::from_secs(60)),
        );
        strategies.insert(
            ErrorCategory::Dependency,
            RepairStrategy::new(
                "refresh-lockfile",
                vec![
                    RepairAction::command("npm", &["install", "--no-audit", "--no-fund"]),
                    RepairAction::CommitAndPush {
                        message: "chore(deps): refresh lockfile".to_string(),
                    },
                ],
            )
            .with_max_retries(2)
            .with_timeout(Duration::from_secs(600)),
        );
        strategies.insert(
            ErrorCategory::Lint,
            RepairStrategy::new(
                "apply-lint-fixes",
                vec![
                    RepairAction::command("npm", &["run", "lint", "--", "--fix"]),
                    RepairAction::CommitAndPush {
                        message: "style: apply automatic lint fixes".to_string(),
                    },
                ],
            )
            .with_max_retries(2)
            .with_timeout(Duration::from_secs(300)),
        );

        Self { strategies }
    }

    /// Apply settings overrides on top of the defaults.
    ///
    /// Permission overrides are ignored: that strategy always declines.
    #[must_use]
    pub fn with_overrides(mut self, overrides: &BTreeMap<ErrorCategory, StrategyOverride>) -> Self {
        for (category, o) in overrides {
            if !category.is_repairable() || *category == ErrorCategory::Permission {
                warn!("Ignoring strategy override for '{}' category", category);
                continue;
            }
            let base = self
                .strategies
                .remove(category)
                .unwrap_or_else(|| RepairStrategy::new(format!("custom-{}", category), Vec::new()));

            let mut s = base;
            if let Some(ref name) = o.action_name {
                s.action_name = name.clone();
            }
            if let Some(ref steps) = o.steps {
                s.steps = steps.clone();
            }
            if let Some(n) = o.max_retries {
                s.max_retries = n;
            }
            if let Some(secs) = o.retry_backoff_secs {
                s.retry_backoff = Duration::from_secs(secs);
            }
            if let Some(secs) = o.timeout_secs {
                s.timeout = Duration::from_secs(secs);
            }
            self.strategies.insert(*category, s);
        }
        self
    }

    /// Replace the strategy for a category.
    pub fn register(&mut self, category: ErrorCategory, strategy: RepairStrategy) {
        if category == ErrorCategory::Permission {
            warn!("Permission strategy is fixed; registration ignored");
            return;
        }
        self.strategies.insert(category, strategy);
    }

    /// Look up the strategy for a category. `None` for `unknown`.
    #[must_use]
    pub fn resolve(&self, category: ErrorCategory) -> Option<&RepairStrategy> {
        if !category.is_repairable() {
            return None;
        }
        self.strategies.get(&category)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ErrorCategory, &RepairStrategy)> {
        self.strategies.iter()
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn permission_strategy() -> RepairStrategy {
    RepairStrategy::decline(
        "escalate-permission-failure",
        "the CI token lacks required permissions and cannot grant them to itself",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_repairable_category_resolves() {
        let registry = StrategyRegistry::with_defaults();
        for category in ErrorCategory::ALL {
            assert_eq!(
                registry.resolve(category).is_some(),
                category.is_repairable(),
                "category {}",
                category
            );
        }
    }

    #[test]
    fn test_permission_strategy_declines_without_retries() {
        let registry = StrategyRegistry::with_defaults();
        let strategy = registry.resolve(ErrorCategory::Permission).unwrap();
        assert!(strategy.declines());
        assert_eq!(strategy.max_retries, 0);
        assert_eq!(strategy.max_attempts(), 1);
        assert!(strategy
            .steps
            .iter()
            .all(|s| matches!(s, RepairAction::Decline { .. })));
    }

    #[test]
    fn test_permission_cannot_be_overridden() {
        let mut overrides = BTreeMap::new();
        overrides.insert(
            ErrorCategory::Permission,
            StrategyOverride {
                steps: Some(vec![RepairAction::command("gh", &["auth", "refresh"])]),
                max_retries: Some(10),
                ..Default::default()
            },
        );
        let registry = StrategyRegistry::with_defaults().with_overrides(&overrides);
        let strategy = registry.resolve(ErrorCategory::Permission).unwrap();
        assert!(strategy.declines());
        assert_eq!(strategy.max_retries, 0);

        let mut registry = registry;
        registry.register(
            ErrorCategory::Permission,
            RepairStrategy::new("grant", vec![RepairAction::Rerun]),
        );
        assert!(registry.resolve(ErrorCategory::Permission).unwrap().declines());
    }

    #[test]
    fn test_override_merges_fields() {
        let mut overrides = BTreeMap::new();
        overrides.insert(
            ErrorCategory::Lint,
            StrategyOverride {
                steps: Some(vec![RepairAction::command("cargo", &["fmt"])]),
                timeout_secs: Some(45),
                ..Default::default()
            },
        );
        let registry = StrategyRegistry::with_defaults().with_overrides(&overrides);
        let lint = registry.resolve(ErrorCategory::Lint).unwrap();
        assert_eq!(lint.action_name, "apply-lint-fixes");
        assert_eq!(lint.steps, vec![RepairAction::command("cargo", &["fmt"])]);
        assert_eq!(lint.timeout, Duration::from_secs(45));
        assert_eq!(lint.max_retries, 2);
    }

    #[test]
    fn test_unknown_never_resolves() {
        let mut overrides = BTreeMap::new();
        overrides.insert(ErrorCategory::Unknown, StrategyOverride::default());
        let registry = StrategyRegistry::with_defaults().with_overrides(&overrides);
        assert!(registry.resolve(ErrorCategory::Unknown).is_none());
    }

    #[test]
    fn test_repair_action_serde_shape() {
        let json = r#"[
            {"type": "rerun"},
            {"type": "command", "program": "npm", "args": ["ci"]},
            {"type": "commit_and_push", "message": "fix"}
        ]"#;
        let actions: Vec<RepairAction> = serde_json::from_str(json).unwrap();
        assert_eq!(actions[0], RepairAction::Rerun);
        assert_eq!(actions[1], RepairAction::command("npm", &["ci"]));
        assert_eq!(actions[1].describe(), "npm ci");
        assert!(matches!(actions[2], RepairAction::CommitAndPush { .. }));
    }
}
