//! Parallel execution scheduler.
//!
//! Grows a pairwise conflict-free group of phases and runs it on a bounded
//! worker pool. Group membership is deterministic for a fixed queue
//! snapshot: candidates are evaluated in queue order, so the same queue
//! always produces the same group. Results come back in completion order,
//! not submission order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::parallel::{ExecutionAdjustments, PhaseExecutor, ScopeConflictChecker};
use crate::phase::Phase;

/// Hard cap on worker-pool size, regardless of host core count or
/// `max_parallel_phases`. Bounds resource usage on large hosts.
const MAX_POOL_WORKERS: usize = 10;

/// Configuration for the parallel scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParallelSchedulerConfig {
    /// Whether parallel execution is enabled at all.
    pub enabled: bool,
    /// Maximum number of phases in one parallel group.
    pub max_parallel_phases: usize,
}

impl Default for ParallelSchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_parallel_phases: 3,
        }
    }
}

impl ParallelSchedulerConfig {
    /// Enable or disable parallel execution.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the maximum group size.
    pub fn with_max_parallel_phases(mut self, max: usize) -> Self {
        self.max_parallel_phases = max;
        self
    }
}

/// Read-only scheduler statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Whether parallel execution is enabled.
    pub enabled: bool,
    /// Configured maximum group size.
    pub max_parallel_phases: usize,
    /// Total phases dispatched through `execute_group`.
    pub phases_executed_in_parallel: u64,
    /// Number of parallel attempts that degraded to sequential fallback.
    pub phases_skipped: u64,
}

/// Result of one phase's execution inside a group.
#[derive(Debug, Clone)]
pub struct PhaseOutcome {
    /// The phase that was executed.
    pub phase: Phase,
    /// Whether the executor reported success.
    pub success: bool,
    /// Executor status string, or `PARALLEL_EXECUTION_ERROR: <message>`
    /// when the worker itself failed.
    pub status: String,
}

/// Decides which queued phases may run simultaneously and runs them on a
/// bounded worker pool.
pub struct ParallelExecutionScheduler {
    config: ParallelSchedulerConfig,
    executor: Arc<dyn PhaseExecutor>,
    phases_executed_in_parallel: AtomicU64,
    phases_skipped: AtomicU64,
}

impl ParallelExecutionScheduler {
    /// Create a scheduler dispatching to the given executor.
    pub fn new(config: ParallelSchedulerConfig, executor: Arc<dyn PhaseExecutor>) -> Self {
        Self {
            config,
            executor,
            phases_executed_in_parallel: AtomicU64::new(0),
            phases_skipped: AtomicU64::new(0),
        }
    }

    /// Current statistics snapshot.
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            enabled: self.config.enabled,
            max_parallel_phases: self.config.max_parallel_phases,
            phases_executed_in_parallel: self.phases_executed_in_parallel.load(Ordering::Relaxed),
            phases_skipped: self.phases_skipped.load(Ordering::Relaxed),
        }
    }

    /// Attempt to execute a parallel group grown from `primary_phase`.
    ///
    /// Candidates are taken from `queued_phases` in queue order; each is
    /// added only if the scope checker accepts the whole grown group, and
    /// growth stops at `max_parallel`. Returns `None`, meaning "execute
    /// sequentially", when parallel execution is disabled, fewer than 2
    /// phases are queued, or no candidate can pair with the primary.
    ///
    /// On success, returns the completion-ordered outcomes and the size of
    /// the group that ran.
    pub async fn try_parallel_execution(
        &self,
        queued_phases: &[Phase],
        primary_phase: &Phase,
        scope_checker: &dyn ScopeConflictChecker,
        max_parallel: usize,
    ) -> Option<(Vec<PhaseOutcome>, usize)> {
        if !self.config.enabled {
            return None;
        }

        if queued_phases.len() < 2 {
            self.phases_skipped.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let mut group: Vec<Phase> = vec![primary_phase.clone()];
        for candidate in queued_phases {
            if group.len() >= max_parallel {
                break;
            }
            if candidate.phase_id == primary_phase.phase_id {
                continue;
            }

            let mut trial = group.clone();
            trial.push(candidate.clone());
            let (ok, reason) = scope_checker.can_execute_parallel(&trial);
            if ok {
                group = trial;
            } else {
                debug!(
                    candidate = %candidate.phase_id,
                    reason,
                    "candidate rejected by scope checker"
                );
            }
        }

        if group.len() < 2 {
            debug!(
                primary = %primary_phase.phase_id,
                "no conflict-free pairing found; falling back to sequential"
            );
            self.phases_skipped.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let group_size = group.len();
        let results = self.execute_group(&group).await;
        Some((results, group_size))
    }

    /// Execute a group of phases, one executor call per phase.
    ///
    /// Groups of size 1 are run directly with no pool. Larger groups run on
    /// a pool of `min(group size, host parallelism, 10)` workers. A worker
    /// whose executor call fails (or whose task panics) is reported as a
    /// failed outcome and never aborts or blocks its siblings.
    pub async fn execute_group(&self, group: &[Phase]) -> Vec<PhaseOutcome> {
        self.phases_executed_in_parallel
            .fetch_add(group.len() as u64, Ordering::Relaxed);

        if group.len() == 1 {
            return vec![run_phase(self.executor.as_ref(), group[0].clone()).await];
        }

        let host_parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let pool_size = worker_pool_size(group.len(), host_parallelism);
        debug!(
            group_size = group.len(),
            pool_size, "dispatching parallel group"
        );

        let semaphore = Arc::new(Semaphore::new(pool_size));
        let mut in_flight = FuturesUnordered::new();
        for phase in group.iter().cloned() {
            let semaphore = Arc::clone(&semaphore);
            let executor = Arc::clone(&self.executor);
            let fallback_phase = phase.clone();

            let handle = tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                run_phase(executor.as_ref(), phase).await
            });

            in_flight.push(async move {
                match handle.await {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        // Worker panicked or was cancelled; report it like
                        // any other executor failure.
                        warn!(phase_id = %fallback_phase.phase_id, %err, "worker task failed");
                        PhaseOutcome {
                            phase: fallback_phase,
                            success: false,
                            status: format!("PARALLEL_EXECUTION_ERROR: {err}"),
                        }
                    }
                }
            });
        }

        let mut results = Vec::with_capacity(group.len());
        while let Some(outcome) = in_flight.next().await {
            results.push(outcome);
        }
        results
    }
}

/// Pool size for a group: bounded by the group itself, the host's
/// parallelism, and the hard cap.
fn worker_pool_size(group_size: usize, host_parallelism: usize) -> usize {
    group_size.min(host_parallelism).min(MAX_POOL_WORKERS).max(1)
}

async fn run_phase(executor: &dyn PhaseExecutor, phase: Phase) -> PhaseOutcome {
    let adjustments = ExecutionAdjustments::from_phase(&phase);
    match executor.execute_phase(&phase, &adjustments).await {
        Ok((success, status)) => PhaseOutcome {
            phase,
            success,
            status,
        },
        Err(err) => {
            warn!(phase_id = %phase.phase_id, %err, "phase executor failed");
            PhaseOutcome {
                phase,
                success: false,
                status: format!("PARALLEL_EXECUTION_ERROR: {err}"),
            }
        }
    }
}
