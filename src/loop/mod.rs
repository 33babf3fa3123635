//! Loop management module.
//!
//! This module contains the repair loop components:
//!
//! - [`coordinator`] - Drives poll, classify, repair and verify iterations
//! - [`state`] - Persisted loop state and phase transitions
//! - [`retry`] - Capped exponential backoff for provider fetches
//! - [`signals`] - Cooperative stop signal
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐     ┌──────────────┐     ┌─────────────┐
//! │LoopCoordinator │────>│ LoopState    │────>│ StateStore  │
//! │                │     │              │     │ + EventLog  │
//! └────────────────┘     └──────────────┘     └─────────────┘
//!       │
//!       v
//! ┌────────────────┐     ┌──────────────┐     ┌─────────────┐
//! │ StatusSource   │────>│ Classifier   │────>│ Executor    │
//! └────────────────┘     └──────────────┘     └─────────────┘
//! ```

pub mod coordinator;
pub mod retry;
pub mod signals;
pub mod state;

// Re-exports for convenience
pub use coordinator::{LoopCoordinator, LoopCoordinatorConfig, LoopSummary, Termination};
pub use signals::StopSignal;
pub use state::{IterationOutcome, LoopPhase, LoopState};
