//! Concurrency-and-consistency core for an autonomous pipeline executor.
//!
//! An autonomous executor runs a queue of phases (units of automated work)
//! against a shared workspace, with possibly-concurrent workers and
//! possibly-concurrent processes touching the same data. This crate keeps
//! that safe:
//!
//! - [`phase::PhaseStateManager`] serializes concurrent attempts to mutate
//!   a phase's retry/escalation counters with optimistic locking: every
//!   write is conditioned on the version it read, and a lost race surfaces
//!   as a typed error instead of a silent lost update.
//! - [`parallel::ParallelExecutionScheduler`] decides which queued phases
//!   may run simultaneously without touching overlapping files, and runs
//!   them on a bounded worker pool where one worker's failure never
//!   disturbs its siblings.
//! - [`lease::WorkspaceLease`] is a filesystem lease that serializes
//!   exclusive maintenance operations (e.g. workspace compaction) across
//!   independent executor processes, recovering from crashed holders via
//!   TTL expiry.
//! - [`executor::ExecutorStateManager`] is the thin status-transition and
//!   health-budget layer the surrounding loop uses to report terminal
//!   outcomes.
//!
//! The actual phase work (LLM calls, patching, CI) lives behind the
//! [`parallel::PhaseExecutor`] and [`parallel::ScopeConflictChecker`]
//! seams and is not part of this crate.

pub mod config;
pub mod executor;
pub mod lease;
pub mod parallel;
pub mod phase;

pub use config::{ConfigError, ExecutorConfig};
pub use executor::{ExecutionOutcome, ExecutorStateManager, HealthBudget, PhaseStatusStore};
pub use lease::{LeaseError, WorkspaceLease};
pub use parallel::{
    ExecutionAdjustments, FileScopeChecker, ParallelExecutionScheduler, ParallelSchedulerConfig,
    PhaseExecutor, PhaseExecutorError, PhaseOutcome, SchedulerStats, ScopeConflictChecker,
};
pub use phase::{Phase, PhaseState, PhaseStateManager, PhaseStore, StateError, StateUpdateRequest};
