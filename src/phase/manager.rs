//! Optimistic-locked phase state mutation.
//!
//! Every mutation runs the same sequence inside one transaction: read the
//! row, compute the new field values, write them back conditioned on the
//! version that was read, bump the version by exactly one, commit. A
//! concurrent writer that commits first makes the conditioned write match
//! zero rows (or makes the driver report a busy/locked conflict); either
//! way the caller sees [`StateError::OptimisticLock`] and owns the retry
//! decision. This component never retries on its own.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tracing::debug;

use crate::executor::PhaseStatusStore;
use crate::phase::model::{PhaseState, StateUpdateRequest};
use crate::phase::store::{translate_row_error, PhaseStore, StateError};

/// Serializes concurrent attempts to mutate one phase's counters and state.
#[derive(Debug, Clone)]
pub struct PhaseStateManager {
    pool: SqlitePool,
    run_id: String,
}

/// What one transaction writes, beyond the version bump.
enum Mutation<'a> {
    Counters(StateUpdateRequest),
    State {
        state: PhaseState,
        failure_reason: Option<&'a str>,
    },
}

impl PhaseStateManager {
    /// Create a manager scoped to one run.
    pub fn new(store: &PhaseStore, run_id: impl Into<String>) -> Self {
        Self {
            pool: store.pool().clone(),
            run_id: run_id.into(),
        }
    }

    /// The run this manager mutates.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Apply exactly one counter mutation plus the version bump.
    ///
    /// Returns `Ok(true)` on success. Returns
    /// [`StateError::OptimisticLock`] when a concurrent writer won the
    /// race; callers apply their own backoff and attempt budget around
    /// that error. Any other datastore failure propagates unchanged.
    pub async fn update(
        &self,
        phase_id: &str,
        request: &StateUpdateRequest,
    ) -> Result<bool, StateError> {
        self.apply(phase_id, Mutation::Counters(*request)).await
    }

    /// Mark a phase COMPLETE through the same row-locked sequence as
    /// [`update`](Self::update), so two terminal writers cannot both
    /// believe they won.
    pub async fn mark_complete(&self, phase_id: &str) -> Result<bool, StateError> {
        self.apply(
            phase_id,
            Mutation::State {
                state: PhaseState::Complete,
                failure_reason: None,
            },
        )
        .await
    }

    /// Mark a phase FAILED, recording why.
    pub async fn mark_failed(&self, phase_id: &str, reason: &str) -> Result<bool, StateError> {
        self.apply(
            phase_id,
            Mutation::State {
                state: PhaseState::Failed,
                failure_reason: Some(reason),
            },
        )
        .await
    }

    async fn apply(&self, phase_id: &str, mutation: Mutation<'_>) -> Result<bool, StateError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| translate_row_error(phase_id, 0, e))?;

        let row = sqlx::query(
            "SELECT state, retry_attempt, revision_epoch, escalation_level, \
             version, failure_reason \
             FROM phases WHERE run_id = ? AND phase_id = ?",
        )
        .bind(&self.run_id)
        .bind(phase_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| translate_row_error(phase_id, 0, e))?
        .ok_or_else(|| StateError::PhaseNotFound(phase_id.to_string()))?;

        let version = row
            .try_get::<i64, _>("version")
            .map_err(StateError::Database)? as u32;
        let mut state = {
            let state_str: String = row.try_get("state").map_err(StateError::Database)?;
            PhaseState::parse(&state_str)
                .ok_or_else(|| StateError::Corrupt(format!("unknown state {state_str:?}")))?
        };
        let mut retry_attempt = row
            .try_get::<i64, _>("retry_attempt")
            .map_err(StateError::Database)?;
        let mut revision_epoch = row
            .try_get::<i64, _>("revision_epoch")
            .map_err(StateError::Database)?;
        let mut escalation_level = row
            .try_get::<i64, _>("escalation_level")
            .map_err(StateError::Database)?;
        let mut failure_reason: Option<String> = row
            .try_get("failure_reason")
            .map_err(StateError::Database)?;

        match mutation {
            Mutation::Counters(StateUpdateRequest::SetRetryAttempt(value)) => {
                retry_attempt = value as i64;
            }
            Mutation::Counters(StateUpdateRequest::IncrementRetryAttempt) => {
                retry_attempt += 1;
            }
            Mutation::Counters(StateUpdateRequest::IncrementEscalationLevel) => {
                escalation_level += 1;
            }
            Mutation::Counters(StateUpdateRequest::AdvanceRevisionEpoch) => {
                revision_epoch += 1;
            }
            Mutation::State {
                state: requested,
                failure_reason: reason,
            } => {
                // BLOCKED is never persisted.
                state = requested.persistable();
                if let Some(reason) = reason {
                    failure_reason = Some(reason.to_string());
                }
            }
        }

        let result = sqlx::query(
            "UPDATE phases SET state = ?, retry_attempt = ?, revision_epoch = ?, \
             escalation_level = ?, failure_reason = ?, version = ?, updated_at = ? \
             WHERE run_id = ? AND phase_id = ? AND version = ?",
        )
        .bind(state.as_str())
        .bind(retry_attempt)
        .bind(revision_epoch)
        .bind(escalation_level)
        .bind(&failure_reason)
        .bind((version + 1) as i64)
        .bind(Utc::now().to_rfc3339())
        .bind(&self.run_id)
        .bind(phase_id)
        .bind(version as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| translate_row_error(phase_id, version, e))?;

        if result.rows_affected() == 0 {
            // The version moved between our read and the conditioned write.
            return Err(StateError::OptimisticLock {
                phase_id: phase_id.to_string(),
                version,
            });
        }

        tx.commit()
            .await
            .map_err(|e| translate_row_error(phase_id, version, e))?;

        debug!(
            run_id = %self.run_id,
            phase_id,
            state = %state,
            version = version + 1,
            "phase row updated"
        );
        Ok(true)
    }
}

#[async_trait]
impl PhaseStatusStore for PhaseStateManager {
    async fn set_state(&self, phase_id: &str, state: PhaseState) -> Result<(), StateError> {
        self.apply(
            phase_id,
            Mutation::State {
                state,
                failure_reason: None,
            },
        )
        .await
        .map(|_| ())
    }
}
