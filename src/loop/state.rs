//! Loop state types and transitions.
//!
//! [`LoopState`] is the single persisted record of loop progress. It is
//! written only by the coordinator (through the state store) and read by
//! dashboards. [`LoopPhase`] names the coordinator's state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::classifier::ErrorCategory;
use crate::error::{AutorepairError, Result};
use crate::executor::RepairAttempt;

/// Current schema version of the state file.
pub const STATE_VERSION: u32 = 1;

/// Coordinator phase.
///
/// ```text
/// Idle → Polling → Classifying → Repairing → Verifying ─┐
///                      │  ▲                              │
///                      │  └──────────────────────────────┤
///                      ▼                                 ▼
///          FailedPermanent / Clean ──> Sleeping ──> Polling …
///                                  └─> Done
/// ```
///
/// A stop request moves any live phase to `Stopped`. Unlike `Done`, a
/// stopped session is resumed by the next start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPhase {
    Idle,
    Polling,
    Classifying,
    Repairing,
    Verifying,
    Clean,
    FailedPermanent,
    Sleeping,
    Stopped,
    Done,
}

impl LoopPhase {
    /// Check whether moving to `target` is a legal transition.
    ///
    /// Any live phase may move to `Done` (termination or fatal abort) or to
    /// `Stopped`.
    #[must_use]
    pub fn can_transition_to(&self, target: LoopPhase) -> bool {
        use LoopPhase::*;
        matches!(
            (self, target),
            (Idle, Polling) |
            (Polling, Classifying) |
            (Classifying, Clean) | (Classifying, Repairing) | (Classifying, FailedPermanent) |
            (Repairing, Verifying) |
            (Verifying, Clean) | (Verifying, Classifying) |
            (Clean, Sleeping) | (FailedPermanent, Sleeping) |
            (Sleeping, Polling)
        ) || (self.is_live() && matches!(target, Done | Stopped))
    }

    /// Neither finished nor stopped.
    #[must_use]
    pub fn is_live(&self) -> bool {
        !matches!(self, LoopPhase::Done | LoopPhase::Stopped)
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoopPhase::Done)
    }
}

impl std::fmt::Display for LoopPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Polling => "polling",
            Self::Classifying => "classifying",
            Self::Repairing => "repairing",
            Self::Verifying => "verifying",
            Self::Clean => "clean",
            Self::FailedPermanent => "failed_permanent",
            Self::Sleeping => "sleeping",
            Self::Stopped => "stopped",
            Self::Done => "done",
        };
        write!(f, "{}", s)
    }
}

/// How a completed iteration ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationOutcome {
    /// The polled run was green without any repair.
    Clean,
    /// A repair was followed by a green verification.
    Repaired,
    /// The failure needs a human.
    FailedPermanent,
}

impl std::fmt::Display for IterationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Clean => "clean",
            Self::Repaired => "repaired",
            Self::FailedPermanent => "failed_permanent",
        };
        write!(f, "{}", s)
    }
}

/// Persisted loop progress.
///
/// # Example
///
/// ```
/// use ci_autorepair::r#loop::state::LoopState;
///
/// let mut state = LoopState::new();
/// state.next_iteration();
/// state.record_clean();
/// assert_eq!(state.loop_count, 1);
/// assert_eq!(state.consecutive_clean_count, 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopState {
    #[serde(default = "default_version")]
    pub version: u32,
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Iterations started. Never decreases.
    pub loop_count: u32,
    /// Successful repair attempts. Never decreases.
    pub total_errors_fixed: u32,
    pub consecutive_clean_count: u32,
    /// Time of the most recent provider poll.
    pub last_scan: Option<DateTime<Utc>>,
    /// In-flight repairs keyed by run id; empty when idle.
    #[serde(default)]
    pub active_repairs: BTreeMap<String, RepairAttempt>,
    #[serde(default = "default_phase")]
    pub phase: LoopPhase,
    /// Attempts consumed per category in this session.
    #[serde(default)]
    pub retries_by_category: BTreeMap<ErrorCategory, u32>,
    #[serde(default)]
    pub last_outcome: Option<IterationOutcome>,
}

fn default_version() -> u32 {
    STATE_VERSION
}

fn default_phase() -> LoopPhase {
    LoopPhase::Idle
}

impl Default for LoopState {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopState {
    /// Fresh state for a new monitoring session.
    #[must_use]
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            version: STATE_VERSION,
            session_id: Uuid::new_v4().to_string(),
            started_at: now,
            updated_at: now,
            loop_count: 0,
            total_errors_fixed: 0,
            consecutive_clean_count: 0,
            last_scan: None,
            active_repairs: BTreeMap::new(),
            phase: LoopPhase::Idle,
            retries_by_category: BTreeMap::new(),
            last_outcome: None,
        }
    }

    #[must_use]
    pub fn is_version_compatible(&self) -> bool {
        self.version == STATE_VERSION
    }

    /// Increment iteration counter.
    pub fn next_iteration(&mut self) {
        self.loop_count = self.loop_count.saturating_add(1);
    }

    /// Record a provider poll.
    pub fn record_scan(&mut self) {
        self.last_scan = Some(Utc::now());
    }

    /// Record a clean run.
    pub fn record_clean(&mut self) {
        self.consecutive_clean_count = self.consecutive_clean_count.saturating_add(1);
    }

    /// Record a detected error (resets the clean streak).
    pub fn record_error(&mut self) {
        self.consecutive_clean_count = 0;
    }

    /// Record a successful repair attempt.
    pub fn record_fix(&mut self) {
        self.total_errors_fixed = self.total_errors_fixed.saturating_add(1);
    }

    /// Attempts already used for `category` this session.
    #[must_use]
    pub fn retries_used(&self, category: ErrorCategory) -> u32 {
        self.retries_by_category.get(&category).copied().unwrap_or(0)
    }

    /// Consume one attempt for `category`, returning its 0-based index.
    pub fn consume_retry(&mut self, category: ErrorCategory) -> u32 {
        let used = self.retries_by_category.entry(category).or_insert(0);
        let index = *used;
        *used = used.saturating_add(1);
        index
    }

    /// Register an in-flight repair. At most one per run.
    pub fn begin_repair(&mut self, attempt: RepairAttempt) -> Result<()> {
        if self.active_repairs.contains_key(&attempt.run_id) {
            return Err(AutorepairError::RepairInFlight {
                run_id: attempt.run_id,
            });
        }
        self.active_repairs.insert(attempt.run_id.clone(), attempt);
        Ok(())
    }

    /// Clear the in-flight repair for a run.
    pub fn end_repair(&mut self, run_id: &str) -> Option<RepairAttempt> {
        self.active_repairs.remove(run_id)
    }

    /// Update the save timestamp.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ErrorClassifier;
    use crate::testing::fixtures;

    fn attempt_for(run_id: &str) -> RepairAttempt {
        let record = ErrorClassifier::with_defaults()
            .classify(&fixtures::dependency_failure_run(run_id))
            .unwrap();
        RepairAttempt::begin(&record, "refresh-lockfile", 0)
    }

    #[test]
    fn test_happy_path_transitions() {
        use LoopPhase::*;
        let path = [
            Idle,
            Polling,
            Classifying,
            Repairing,
            Verifying,
            Classifying,
            Repairing,
            Verifying,
            Clean,
            Sleeping,
            Polling,
            Classifying,
            FailedPermanent,
            Sleeping,
            Done,
        ];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{} -> {} should be allowed",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_invalid_transitions() {
        use LoopPhase::*;
        assert!(!Polling.can_transition_to(Repairing));
        assert!(!Classifying.can_transition_to(Verifying));
        assert!(!Repairing.can_transition_to(Clean));
        assert!(!Clean.can_transition_to(Polling));
        assert!(!Done.can_transition_to(Polling));
        assert!(!Done.can_transition_to(Done));
        assert!(!Stopped.can_transition_to(Done));
        assert!(!Done.can_transition_to(Stopped));
        assert!(Done.is_terminal());
    }

    #[test]
    fn test_stop_reachable_from_live_phases_and_not_terminal() {
        use LoopPhase::*;
        for phase in [Idle, Polling, Classifying, Repairing, Verifying, Sleeping] {
            assert!(phase.can_transition_to(Stopped), "{} -> stopped", phase);
        }
        assert!(!Stopped.is_terminal());
        assert!(!Stopped.is_live());
        assert_eq!(
            serde_json::to_string(&Stopped).unwrap(),
            "\"stopped\""
        );
    }

    #[test]
    fn test_clean_streak_resets_on_error() {
        let mut state = LoopState::new();
        state.record_clean();
        state.record_clean();
        assert_eq!(state.consecutive_clean_count, 2);
        state.record_error();
        assert_eq!(state.consecutive_clean_count, 0);
    }

    #[test]
    fn test_consume_retry_returns_zero_based_index() {
        let mut state = LoopState::new();
        assert_eq!(state.consume_retry(ErrorCategory::Lint), 0);
        assert_eq!(state.consume_retry(ErrorCategory::Lint), 1);
        assert_eq!(state.consume_retry(ErrorCategory::Test), 0);
        assert_eq!(state.retries_used(ErrorCategory::Lint), 2);
        assert_eq!(state.retries_used(ErrorCategory::Build), 0);
    }

    #[test]
    fn test_at_most_one_repair_per_run() {
        let mut state = LoopState::new();
        state.begin_repair(attempt_for("1")).unwrap();
        let err = state.begin_repair(attempt_for("1")).unwrap_err();
        assert!(matches!(err, AutorepairError::RepairInFlight { .. }));

        state.begin_repair(attempt_for("2")).unwrap();
        assert_eq!(state.active_repairs.len(), 2);

        assert!(state.end_repair("1").is_some());
        assert!(state.end_repair("1").is_none());
        state.begin_repair(attempt_for("1")).unwrap();
    }

    #[test]
    fn test_state_json_shape_for_dashboards() {
        let mut state = LoopState::new();
        state.next_iteration();
        state.record_scan();
        state.begin_repair(attempt_for("77")).unwrap();
        state.consume_retry(ErrorCategory::Dependency);

        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["loop_count"], 1);
        assert_eq!(value["total_errors_fixed"], 0);
        assert!(value["last_scan"].is_string());
        assert!(value["active_repairs"]["77"].is_object());
        assert_eq!(value["phase"], "idle");
        assert_eq!(value["retries_by_category"]["dependency"], 1);

        let back: LoopState = serde_json::from_value(value).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let json = r#"{
            "session_id": "s",
            "started_at": "2026-10-01T00:00:00Z",
            "updated_at": "2026-10-01T00:00:00Z",
            "loop_count": 4,
            "total_errors_fixed": 1,
            "consecutive_clean_count": 0,
            "last_scan": null
        }"#;
        let state: LoopState = serde_json::from_str(json).unwrap();
        assert_eq!(state.version, STATE_VERSION);
        assert_eq!(state.phase, LoopPhase::Idle);
        assert!(state.active_repairs.is_empty());
        assert_eq!(state.loop_count, 4);
    }
}
