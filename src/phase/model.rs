//! Phase row model and state-update requests.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a phase.
///
/// `Blocked` exists so callers can express the transition, but it is never
/// persisted: every write of `Blocked` is rewritten to `Failed` before it
/// reaches the datastore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseState {
    Queued,
    Executing,
    CiRunning,
    Blocked,
    Complete,
    Failed,
    Skipped,
}

impl PhaseState {
    /// Stable string form used for persistence and logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseState::Queued => "QUEUED",
            PhaseState::Executing => "EXECUTING",
            PhaseState::CiRunning => "CI_RUNNING",
            PhaseState::Blocked => "BLOCKED",
            PhaseState::Complete => "COMPLETE",
            PhaseState::Failed => "FAILED",
            PhaseState::Skipped => "SKIPPED",
        }
    }

    /// Parse the persisted string form back into a state.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "QUEUED" => Some(PhaseState::Queued),
            "EXECUTING" => Some(PhaseState::Executing),
            "CI_RUNNING" => Some(PhaseState::CiRunning),
            "BLOCKED" => Some(PhaseState::Blocked),
            "COMPLETE" => Some(PhaseState::Complete),
            "FAILED" => Some(PhaseState::Failed),
            "SKIPPED" => Some(PhaseState::Skipped),
            _ => None,
        }
    }

    /// Whether this state ends a phase's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PhaseState::Complete | PhaseState::Failed | PhaseState::Skipped
        )
    }

    /// Rewrite states that must never be persisted.
    ///
    /// `Blocked` is a scheduling condition, not a durable outcome; it is
    /// stored as `Failed` so the row always reflects a real terminal state.
    pub fn persistable(self) -> Self {
        match self {
            PhaseState::Blocked => PhaseState::Failed,
            other => other,
        }
    }
}

impl std::fmt::Display for PhaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One queued unit of autonomous work.
///
/// The state manager owns the counters and `version`; the scheduler reads
/// `scope` but never mutates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    /// Unique identifier within a run.
    pub phase_id: String,
    /// Run this phase belongs to.
    pub run_id: String,
    /// Current lifecycle state.
    pub state: PhaseState,
    /// Number of retries attempted so far.
    pub retry_attempt: u32,
    /// Revision epoch, advanced when the phase's plan is regenerated.
    pub revision_epoch: u32,
    /// Escalation level, raised when retries keep failing.
    pub escalation_level: u32,
    /// Optimistic-lock token; +1 on every successful mutation.
    pub version: u32,
    /// File paths this phase is expected to touch.
    pub scope: BTreeSet<String>,
    /// Why the phase failed, if it did.
    pub failure_reason: Option<String>,
}

impl Phase {
    /// Create a freshly queued phase with zeroed counters.
    pub fn queued(
        run_id: impl Into<String>,
        phase_id: impl Into<String>,
        scope: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            phase_id: phase_id.into(),
            run_id: run_id.into(),
            state: PhaseState::Queued,
            retry_attempt: 0,
            revision_epoch: 0,
            escalation_level: 0,
            version: 0,
            scope: scope.into_iter().collect(),
            failure_reason: None,
        }
    }

    /// Whether this phase's scope overlaps another's.
    pub fn scope_overlaps(&self, other: &Phase) -> bool {
        !self.scope.is_disjoint(&other.scope)
    }
}

/// A single requested mutation of a phase's counters.
///
/// Exactly one variant is honored per call to
/// [`PhaseStateManager::update`](crate::phase::PhaseStateManager::update);
/// it is always applied atomically with the version bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateUpdateRequest {
    /// Set `retry_attempt` to an absolute value.
    SetRetryAttempt(u32),
    /// Increment `retry_attempt` by one.
    IncrementRetryAttempt,
    /// Increment `escalation_level` by one.
    IncrementEscalationLevel,
    /// Advance `revision_epoch` by one.
    AdvanceRevisionEpoch,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trips_through_persisted_form() {
        for state in [
            PhaseState::Queued,
            PhaseState::Executing,
            PhaseState::CiRunning,
            PhaseState::Blocked,
            PhaseState::Complete,
            PhaseState::Failed,
            PhaseState::Skipped,
        ] {
            assert_eq!(PhaseState::parse(state.as_str()), Some(state));
        }
        assert_eq!(PhaseState::parse("NOT_A_STATE"), None);
    }

    #[test]
    fn test_blocked_is_rewritten_to_failed() {
        assert_eq!(PhaseState::Blocked.persistable(), PhaseState::Failed);
        assert_eq!(PhaseState::Complete.persistable(), PhaseState::Complete);
        assert_eq!(PhaseState::Queued.persistable(), PhaseState::Queued);
    }

    #[test]
    fn test_terminal_states() {
        assert!(PhaseState::Complete.is_terminal());
        assert!(PhaseState::Failed.is_terminal());
        assert!(PhaseState::Skipped.is_terminal());
        assert!(!PhaseState::Queued.is_terminal());
        assert!(!PhaseState::Executing.is_terminal());
        assert!(!PhaseState::CiRunning.is_terminal());
    }

    #[test]
    fn test_scope_overlap() {
        let a = Phase::queued("run-1", "PH-001", ["src/a.rs".to_string()]);
        let b = Phase::queued("run-1", "PH-002", ["src/b.rs".to_string()]);
        let c = Phase::queued(
            "run-1",
            "PH-003",
            ["src/a.rs".to_string(), "src/c.rs".to_string()],
        );

        assert!(!a.scope_overlaps(&b));
        assert!(a.scope_overlaps(&c));
        assert!(c.scope_overlaps(&a));
    }

    #[test]
    fn test_queued_phase_starts_at_version_zero() {
        let phase = Phase::queued("run-1", "PH-001", []);
        assert_eq!(phase.version, 0);
        assert_eq!(phase.retry_attempt, 0);
        assert_eq!(phase.state, PhaseState::Queued);
        assert!(phase.failure_reason.is_none());
    }
}
