//! ci-autorepair - CI failure detection and repair loop
//!
//! Watches the latest CI run of a branch, classifies failures, applies a
//! bounded repair for known failure categories, and re-verifies until the
//! pipeline has been green for several consecutive iterations.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`ci`] - CI run model and the GitHub (`gh` CLI) status source
//! - [`classifier`] - Rule-based failure classification
//! - [`strategy`] - Repair strategies per failure category
//! - [`executor`] - Runs repair strategies with timeouts
//! - [`r#loop`] - Loop coordinator, state machine and retry policy
//! - [`store`] - Atomic state file and append-only event log
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Custom error types and handling
//! - [`operations`] - Real git and subprocess implementations
//! - [`testing`] - Testing infrastructure (traits, mocks, fixtures)
//!
//! # Example
//!
//! ```rust,ignore
//! use ci_autorepair::ci::github::GhStatusSource;
//! use ci_autorepair::{LoopCoordinator, ProjectConfig, RepairExecutor, StateStore};
//!
//! let config = ProjectConfig::load(project_dir)?;
//! let source = Arc::new(GhStatusSource::detect(project_dir.to_path_buf(), &config.branch)?);
//! let executor = RepairExecutor::new(source.clone(), git, runner);
//! let coordinator = LoopCoordinator::new(
//!     config.coordinator_config(),
//!     source,
//!     config.classifier()?,
//!     config.strategies(),
//!     executor,
//!     StateStore::new(config.state_dir(project_dir)),
//! );
//! let summary = coordinator.run().await?;
//! ```

pub mod ci;
pub mod classifier;
pub mod config;
pub mod error;
pub mod executor;
pub mod r#loop;
pub mod operations;
pub mod store;
pub mod strategy;
pub mod testing;

// Re-export commonly used types
pub use error::{AutorepairError, Result};

pub use ci::{FetchError, Run, RunStatus};
pub use classifier::{ClassificationRule, ErrorCategory, ErrorClassifier, ErrorRecord};
pub use config::ProjectConfig;
pub use executor::{RepairAttempt, RepairExecutor, RepairOutcome};
pub use r#loop::{
    LoopCoordinator, LoopCoordinatorConfig, LoopPhase, LoopState, LoopSummary, StopSignal,
    Termination,
};
pub use store::{EventLog, EventOutcome, LoopEvent, StateStore};
pub use strategy::{RepairAction, RepairStrategy, StrategyRegistry};

// Re-export testing types for convenience
pub use testing::{
    CommandOutput, CommandRunner, GitOperations, MockCommandRunner, MockGitOperations,
    MockStatusSource, StatusSource,
};
