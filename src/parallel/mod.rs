//! Scope-aware parallel phase execution.
//!
//! The scheduler decides which queued phases may run simultaneously without
//! touching overlapping files, then runs them on a bounded worker pool. It
//! trusts the [`ScopeConflictChecker`] answer: scope is declared intent, not
//! a verified lock, and any after-the-fact verification that a phase stayed
//! inside its scope belongs to an external validator.
//!
//! # Overview
//!
//! - **ScopeConflictChecker**: answers "may these phases run together?"
//! - **PhaseExecutor**: performs one phase's actual work (LLM call, patch,
//!   CI); opaque to this module and may block arbitrarily long.
//! - **ParallelExecutionScheduler**: greedily grows a pairwise
//!   conflict-free group from a primary phase and executes it, degrading to
//!   a sequential signal when no group of at least 2 can be formed.
//! - **FileScopeChecker**: the provided file-overlap checker.

pub mod scheduler;
pub mod scope;

use async_trait::async_trait;

use crate::phase::Phase;

pub use scheduler::{
    ParallelExecutionScheduler, ParallelSchedulerConfig, PhaseOutcome, SchedulerStats,
};
pub use scope::FileScopeChecker;

/// Error type for the external executor seam.
///
/// Implementations surface whatever failure their work produced; the
/// scheduler converts it into a failed [`PhaseOutcome`] without ever
/// letting it disturb sibling workers.
pub type PhaseExecutorError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Decides whether a set of phases may execute in parallel.
///
/// Must be deterministic for a fixed input and callable with an arbitrary
/// sublist of phases.
pub trait ScopeConflictChecker: Send + Sync {
    /// Returns whether all pairs in `phases` are conflict-free, plus a
    /// human-readable reason when they are not.
    fn can_execute_parallel(&self, phases: &[Phase]) -> (bool, String);
}

/// Per-dispatch hints passed to the executor.
///
/// Carries the phase's current counters so the executor can adapt its work
/// (prompt framing, model selection) to how contested the phase has been.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionAdjustments {
    /// Retries attempted so far.
    pub retry_attempt: u32,
    /// Current escalation level.
    pub escalation_level: u32,
    /// Current revision epoch.
    pub revision_epoch: u32,
}

impl ExecutionAdjustments {
    /// Snapshot the adjustment hints from a phase's counters.
    pub fn from_phase(phase: &Phase) -> Self {
        Self {
            retry_attempt: phase.retry_attempt,
            escalation_level: phase.escalation_level,
            revision_epoch: phase.revision_epoch,
        }
    }
}

/// Performs one phase's work.
///
/// May block for the full duration of the phase, including network calls.
/// Not assumed idempotent; retries are the caller's decision.
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    /// Execute one phase, returning `(success, status)`.
    async fn execute_phase(
        &self,
        phase: &Phase,
        adjustments: &ExecutionAdjustments,
    ) -> Result<(bool, String), PhaseExecutorError>;
}
