//! Loop coordinator.
//!
//! Drives the poll → classify → repair → verify cycle until the pipeline has
//! been green for `required_clean_threshold` consecutive iterations or
//! `max_iterations` iterations have started.
//!
//! # State machine
//!
//! ```text
//!  Idle ─> Polling ─> Classifying ─┬─> Clean ──────────┐
//!            ▲            ▲        ├─> FailedPermanent ┤
//!            │            │        └─> Repairing       │
//!            │            │              │             │
//!            │            └── Verifying <┘             │
//!            │                    └──────> Clean       │
//!            └──────────── Sleeping <──────────────────┘
//! ```
//!
//! State is saved after every iteration and before every repair, so a crash
//! never loses a completed iteration and an in-flight repair is visible in
//! the state file. A stop request saves the `stopped` phase, which the next
//! start resumes; only `done` begins a new session.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::ci::{poll_until_terminal, Run};
use crate::classifier::{ErrorCategory, ErrorClassifier, ErrorRecord};
use crate::error::{AutorepairError, Result};
use crate::executor::{RepairAttempt, RepairExecutor};
use crate::r#loop::retry::RetryPolicy;
use crate::r#loop::signals::StopSignal;
use crate::r#loop::state::{IterationOutcome, LoopPhase, LoopState};
use crate::store::{EventLog, EventOutcome, LoopEvent, StateStore};
use crate::strategy::{RepairStrategy, StrategyRegistry};
use crate::testing::StatusSource;

/// Coordinator settings.
#[derive(Debug, Clone)]
pub struct LoopCoordinatorConfig {
    /// Iterations to start before stopping.
    pub max_iterations: u32,
    /// Consecutive clean iterations that end the session.
    pub required_clean_threshold: u32,
    /// Sleep between iterations.
    pub poll_interval: Duration,
    /// Wait between a repair and the verifying fetch.
    pub verify_delay: Duration,
    /// Re-fetch interval while a run is queued or running.
    pub run_poll_interval: Duration,
    /// Give up waiting for a run to finish after this long.
    pub run_timeout: Duration,
    /// Retry policy for transient fetch failures.
    pub fetch_retry: RetryPolicy,
    /// Discard any persisted state at start.
    pub fresh: bool,
}

impl Default for LoopCoordinatorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            required_clean_threshold: 3,
            poll_interval: Duration::from_secs(30),
            verify_delay: Duration::from_secs(10),
            run_poll_interval: Duration::from_secs(15),
            run_timeout: Duration::from_secs(1800),
            fetch_retry: RetryPolicy::default(),
            fresh: false,
        }
    }
}

impl LoopCoordinatorConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    #[must_use]
    pub fn with_clean_threshold(mut self, threshold: u32) -> Self {
        self.required_clean_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn with_verify_delay(mut self, delay: Duration) -> Self {
        self.verify_delay = delay;
        self
    }

    #[must_use]
    pub fn with_run_polling(mut self, interval: Duration, timeout: Duration) -> Self {
        self.run_poll_interval = interval;
        self.run_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_fetch_retry(mut self, policy: RetryPolicy) -> Self {
        self.fetch_retry = policy;
        self
    }

    #[must_use]
    pub fn with_fresh(mut self, fresh: bool) -> Self {
        self.fresh = fresh;
        self
    }
}

/// Why the loop ended normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    CleanThreshold,
    MaxIterations,
    Stopped,
}

impl std::fmt::Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CleanThreshold => write!(f, "clean threshold reached"),
            Self::MaxIterations => write!(f, "max iterations reached"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Final counters of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopSummary {
    pub termination: Termination,
    pub loop_count: u32,
    pub total_errors_fixed: u32,
    pub consecutive_clean_count: u32,
}

/// Result of one iteration, before it is written to the event log.
struct IterationReport {
    outcome: IterationOutcome,
    run_id: String,
    category: Option<ErrorCategory>,
    detail: String,
}

/// The repair loop.
pub struct LoopCoordinator {
    config: LoopCoordinatorConfig,
    source: Arc<dyn StatusSource>,
    classifier: ErrorClassifier,
    strategies: StrategyRegistry,
    executor: RepairExecutor,
    store: StateStore,
    events: EventLog,
    stop: StopSignal,
}

impl LoopCoordinator {
    pub fn new(
        config: LoopCoordinatorConfig,
        source: Arc<dyn StatusSource>,
        classifier: ErrorClassifier,
        strategies: StrategyRegistry,
        executor: RepairExecutor,
        store: StateStore,
    ) -> Self {
        let events = EventLog::new(store.dir());
        Self {
            config,
            source,
            classifier,
            strategies,
            executor,
            store,
            events,
            stop: StopSignal::new(),
        }
    }

    /// Use an externally owned stop signal.
    #[must_use]
    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    #[must_use]
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Run until a termination condition holds.
    ///
    /// Fatal conditions (rejected credentials, exhausted fetch retries,
    /// unwritable state) are recorded in the event log and returned.
    pub async fn run(&self) -> Result<LoopSummary> {
        let mut state = self.initial_state()?;
        info!(
            "Starting repair loop (session {}, max {} iterations, clean threshold {})",
            state.session_id, self.config.max_iterations, self.config.required_clean_threshold
        );

        loop {
            if let Some(termination) = self.termination(&state) {
                return self.finish(state, termination);
            }

            state.next_iteration();
            self.transition(&mut state, LoopPhase::Polling)?;
            info!("Iteration {}/{}", state.loop_count, self.config.max_iterations);

            let report = match self.iterate(&mut state).await {
                Ok(Some(report)) => report,
                Ok(None) => return self.finish(state, Termination::Stopped),
                Err(e) => return Err(self.abort(&mut state, e)),
            };

            state.last_outcome = Some(report.outcome);
            let event = LoopEvent::iteration(
                state.loop_count,
                report.outcome,
                report.run_id,
                report.category,
                report.detail,
            );
            if let Err(e) = self.record(&mut state, &event) {
                return Err(self.abort(&mut state, e));
            }
            info!(
                "Iteration {} {} (clean streak {}, fixed {})",
                state.loop_count,
                report.outcome,
                state.consecutive_clean_count,
                state.total_errors_fixed
            );

            if self.termination(&state).is_some() {
                continue;
            }

            self.transition(&mut state, LoopPhase::Sleeping)?;
            if let Err(e) = self.save(&mut state) {
                return Err(self.abort(&mut state, e));
            }
            debug!("Sleeping {:?}", self.config.poll_interval);
            self.stop.sleep(self.config.poll_interval).await;
        }
    }

    fn initial_state(&self) -> Result<LoopState> {
        if self.config.fresh {
            info!("Starting fresh session");
            return Ok(LoopState::new());
        }

        let Some(mut state) = self.store.load()? else {
            return Ok(LoopState::new());
        };

        if state.phase.is_terminal() {
            info!("Previous session {} finished, starting a new one", state.session_id);
            return Ok(LoopState::new());
        }

        for (run_id, attempt) in std::mem::take(&mut state.active_repairs) {
            warn!(
                "Abandoning repair '{}' for run {} interrupted by a restart",
                attempt.action_name, run_id
            );
        }
        info!(
            "Resuming session {} at iteration {}",
            state.session_id, state.loop_count
        );
        state.phase = LoopPhase::Idle;
        Ok(state)
    }

    fn termination(&self, state: &LoopState) -> Option<Termination> {
        if self.stop.is_stopped() {
            Some(Termination::Stopped)
        } else if state.consecutive_clean_count >= self.config.required_clean_threshold {
            Some(Termination::CleanThreshold)
        } else if state.loop_count >= self.config.max_iterations {
            Some(Termination::MaxIterations)
        } else {
            None
        }
    }

    /// One iteration. `None` means a stop was observed before it completed.
    async fn iterate(&self, state: &mut LoopState) -> Result<Option<IterationReport>> {
        let Some(mut run) = self.fetch_terminal_run().await? else {
            return Ok(None);
        };
        state.record_scan();
        self.transition(state, LoopPhase::Classifying)?;

        let mut actions: Vec<String> = Vec::new();
        let mut repaired_category = None;

        loop {
            let Some(record) = self.classifier.classify(&run) else {
                state.record_clean();
                self.transition(state, LoopPhase::Clean)?;
                let outcome = if actions.is_empty() {
                    IterationOutcome::Clean
                } else {
                    IterationOutcome::Repaired
                };
                return Ok(Some(IterationReport {
                    outcome,
                    run_id: run.run_id,
                    category: repaired_category,
                    detail: actions.join(", "),
                }));
            };

            state.record_error();
            info!(
                "Run {} failed: {} ({})",
                record.run_id, record.category, record.message
            );

            let strategy = match self.strategies.resolve(record.category) {
                Some(strategy) if record.category.is_repairable() => strategy,
                _ => return self.failed_permanent(state, record, "no repair strategy"),
            };

            let used = state.retries_used(record.category);
            if used >= strategy.max_attempts() {
                let reason = format!(
                    "retry budget exhausted for {} ({} attempt(s))",
                    record.category, used
                );
                // A declined permission failure is handed over as unknown.
                let record = if record.category == ErrorCategory::Permission {
                    record.reclassified_unknown()
                } else {
                    record
                };
                return self.failed_permanent(state, record, &reason);
            }

            if self.stop.is_stopped() {
                return Ok(None);
            }
            self.transition(state, LoopPhase::Repairing)?;

            let retry_index = state.consume_retry(record.category);
            if retry_index > 0 {
                debug!("Backing off {:?} before retry", strategy.retry_backoff);
                if self.stop.sleep(strategy.retry_backoff).await {
                    return Ok(None);
                }
            }

            let attempt = self.repair(state, strategy, &record, retry_index).await?;
            actions.push(format!("{}:{}", attempt.action_name, outcome_label(&attempt)));
            repaired_category = Some(record.category);

            self.transition(state, LoopPhase::Verifying)?;
            if self.stop.sleep(self.config.verify_delay).await {
                return Ok(None);
            }
            let Some(verified) = self.fetch_verification_run(&attempt).await? else {
                return Ok(None);
            };
            state.record_scan();
            run = verified;

            if !run.is_success() {
                self.transition(state, LoopPhase::Classifying)?;
            }
        }
    }

    /// Run a repair with the attempt registered in persisted state.
    async fn repair(
        &self,
        state: &mut LoopState,
        strategy: &RepairStrategy,
        record: &ErrorRecord,
        retry_index: u32,
    ) -> Result<RepairAttempt> {
        let pending = RepairAttempt::begin(record, &strategy.action_name, retry_index);
        state.begin_repair(pending.clone())?;
        self.save(state)?;

        let attempt = self.executor.execute_attempt(strategy, pending).await;

        state.end_repair(&record.run_id);
        if attempt.succeeded() {
            state.record_fix();
        } else {
            warn!(
                "Repair '{}' for run {} ended with {}",
                attempt.action_name,
                attempt.run_id,
                outcome_label(&attempt)
            );
        }
        self.save(state)?;
        Ok(attempt)
    }

    fn failed_permanent(
        &self,
        state: &mut LoopState,
        record: ErrorRecord,
        reason: &str,
    ) -> Result<Option<IterationReport>> {
        self.transition(state, LoopPhase::FailedPermanent)?;
        error!(
            "Run {} needs human attention: {} [{}] {}",
            record.run_id, reason, record.category, record.message
        );
        Ok(Some(IterationReport {
            outcome: IterationOutcome::FailedPermanent,
            run_id: record.run_id,
            category: Some(record.category),
            detail: format!("{}: {}", reason, record.message),
        }))
    }

    /// Fetch the latest run and wait for it to finish, retrying transient
    /// failures. `None` when a stop arrives first.
    async fn fetch_terminal_run(&self) -> Result<Option<Run>> {
        let source = self.source.as_ref();
        let fetch = self.config.fetch_retry.run("Fetch latest run", || {
            poll_until_terminal(
                source,
                self.config.run_poll_interval,
                self.config.run_timeout,
            )
        });

        tokio::select! {
            result = fetch => match result {
                Ok(run) => Ok(Some(run)),
                Err((e, attempts)) => Err(AutorepairError::from_fetch(e, attempts)),
            },
            () = self.stop.wait() => Ok(None),
        }
    }

    /// Fetch the run that verifies `attempt`.
    ///
    /// When the repair triggered a new run, runs that began before the
    /// attempt are skipped until a newer one appears or `run_timeout`
    /// elapses. After the timeout the stale run is used and counts as a
    /// failed verification.
    async fn fetch_verification_run(&self, attempt: &RepairAttempt) -> Result<Option<Run>> {
        let deadline = Instant::now() + self.config.run_timeout;
        loop {
            let Some(run) = self.fetch_terminal_run().await? else {
                return Ok(None);
            };
            if !attempt.triggered_run || attempt.is_superseded_by(&run) {
                return Ok(Some(run));
            }
            if Instant::now() >= deadline {
                warn!(
                    "No run newer than repair '{}' after {}s, verifying against run {}",
                    attempt.action_name,
                    self.config.run_timeout.as_secs(),
                    run.run_id
                );
                return Ok(Some(run));
            }
            debug!(
                "Run {} predates repair '{}', waiting {:?}",
                run.run_id, attempt.action_name, self.config.run_poll_interval
            );
            if self.stop.sleep(self.config.run_poll_interval).await {
                return Ok(None);
            }
        }
    }

    fn transition(&self, state: &mut LoopState, next: LoopPhase) -> Result<()> {
        if !state.phase.can_transition_to(next) {
            return Err(AutorepairError::InvalidTransition {
                from: state.phase.to_string(),
                to: next.to_string(),
            });
        }
        debug!("Phase {} -> {}", state.phase, next);
        state.phase = next;
        Ok(())
    }

    fn save(&self, state: &mut LoopState) -> Result<()> {
        state.touch();
        self.store.save(state)
    }

    fn record(&self, state: &mut LoopState, event: &LoopEvent) -> Result<()> {
        self.save(state)?;
        self.events.append(event)
    }

    fn finish(&self, mut state: LoopState, termination: Termination) -> Result<LoopSummary> {
        let (phase, outcome) = match termination {
            Termination::Stopped => (LoopPhase::Stopped, EventOutcome::Stopped),
            Termination::CleanThreshold | Termination::MaxIterations => {
                (LoopPhase::Done, EventOutcome::Done)
            }
        };
        self.transition(&mut state, phase)?;
        let event = LoopEvent::terminal(state.loop_count, outcome, termination.to_string());
        self.record(&mut state, &event)?;
        info!(
            "Repair loop finished: {} after {} iteration(s), {} error(s) fixed",
            termination, state.loop_count, state.total_errors_fixed
        );

        Ok(LoopSummary {
            termination,
            loop_count: state.loop_count,
            total_errors_fixed: state.total_errors_fixed,
            consecutive_clean_count: state.consecutive_clean_count,
        })
    }

    /// Record a fatal error and hand it back for propagation.
    fn abort(&self, state: &mut LoopState, err: AutorepairError) -> AutorepairError {
        error!("Repair loop aborted: {}", err);
        // Resumable once the cause is fixed.
        state.phase = LoopPhase::Stopped;
        let event = LoopEvent::terminal(state.loop_count, EventOutcome::Aborted, err.to_string());
        if let Err(e) = self.record(state, &event) {
            error!("Failed to record abort: {}", e);
        }
        err
    }
}

fn outcome_label(attempt: &RepairAttempt) -> String {
    attempt
        .outcome
        .map_or_else(|| "in_flight".to_string(), |o| o.to_string())
}
