//! Executor-facing status transitions and health budgeting.
//!
//! A thin layer between the surrounding autonomous loop and the phase
//! store. It isolates callers from transient update errors (boolean
//! returns, never exceptions), rewrites the non-persistable BLOCKED status
//! to FAILED, fires a run-summary hook on terminal transitions, and owns
//! the per-run [`HealthBudget`] counters the loop consults when deciding
//! whether to keep running.

pub mod health;
pub mod outcome;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::phase::{PhaseState, StateError};

pub use health::HealthBudget;
pub use outcome::{status_to_outcome, ExecutionOutcome};

/// Writes phase status transitions to the datastore.
///
/// [`PhaseStateManager`](crate::phase::PhaseStateManager) is the
/// production implementation; tests substitute doubles.
#[async_trait]
pub trait PhaseStatusStore: Send + Sync {
    /// Persist a new state for a phase, bumping its version.
    async fn set_state(&self, phase_id: &str, state: PhaseState) -> Result<(), StateError>;
}

/// Hook invoked after a terminal status is persisted.
pub type RunSummaryHook = Arc<dyn Fn(&str, PhaseState) + Send + Sync>;

/// Status-transition and health-budget layer consumed by the scheduler
/// and the surrounding loop to report terminal outcomes.
pub struct ExecutorStateManager {
    store: Arc<dyn PhaseStatusStore>,
    summary_hook: Option<RunSummaryHook>,
    health: Mutex<HealthBudget>,
}

impl ExecutorStateManager {
    /// Create a manager writing through the given status store.
    pub fn new(store: Arc<dyn PhaseStatusStore>) -> Self {
        Self {
            store,
            summary_hook: None,
            health: Mutex::new(HealthBudget::default()),
        }
    }

    /// Install a hook fired after every terminal status write.
    pub fn with_summary_hook(
        mut self,
        hook: impl Fn(&str, PhaseState) + Send + Sync + 'static,
    ) -> Self {
        self.summary_hook = Some(Arc::new(hook));
        self
    }

    /// Persist a phase status.
    ///
    /// BLOCKED is rewritten to FAILED before the write. Returns `false`
    /// on any underlying failure instead of raising, isolating callers
    /// from transient update errors. Terminal statuses (COMPLETE, FAILED,
    /// SKIPPED) fire the run-summary hook; non-terminal statuses never do.
    pub async fn update_phase_status(&self, phase_id: &str, status: PhaseState) -> bool {
        let status = status.persistable();

        match self.store.set_state(phase_id, status).await {
            Ok(()) => {
                if status.is_terminal() {
                    if let Some(hook) = &self.summary_hook {
                        hook(phase_id, status);
                    }
                }
                true
            }
            Err(err) => {
                warn!(phase_id, status = %status, %err, "phase status update failed");
                false
            }
        }
    }

    /// Map an executor status string to an outcome. Pure lookup; unknown
    /// statuses become [`ExecutionOutcome::Rejected`].
    pub fn status_to_outcome(status: &str) -> ExecutionOutcome {
        outcome::status_to_outcome(status)
    }

    /// Last-resort path for when the normal completion flow itself
    /// errored: try to persist FAILED up to `max_retries` times.
    ///
    /// Returns `false` only if every attempt failed. Never panics or
    /// propagates an error; there is nothing above this to catch one.
    pub async fn force_mark_phase_failed(&self, phase_id: &str, max_retries: u32) -> bool {
        for attempt in 1..=max_retries {
            if self.update_phase_status(phase_id, PhaseState::Failed).await {
                debug!(phase_id, attempt, "force-marked phase failed");
                return true;
            }
            warn!(phase_id, attempt, max_retries, "force-mark attempt failed");
        }
        false
    }

    /// Record an upstream HTTP 500.
    pub fn record_http_500(&self) {
        if let Ok(mut health) = self.health.lock() {
            health.record_http_500();
        }
    }

    /// Record a patch that failed to apply.
    pub fn record_patch_failure(&self) {
        if let Ok(mut health) = self.health.lock() {
            health.record_patch_failure();
        }
    }

    /// Record a failure not covered by a more specific counter.
    pub fn record_failure(&self) {
        if let Ok(mut health) = self.health.lock() {
            health.record_failure();
        }
    }

    /// Snapshot the current health budget.
    pub fn health_budget(&self) -> HealthBudget {
        self.health.lock().map(|h| *h).unwrap_or_default()
    }

    /// Bulk-restore the health budget from a snapshot, e.g. after a
    /// process restart.
    pub fn restore_health_budget(&self, snapshot: HealthBudget) {
        if let Ok(mut health) = self.health.lock() {
            *health = snapshot;
        }
    }
}
