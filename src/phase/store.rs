//! SQLite-backed phase store.
//!
//! The store owns the connection pool and the `phases` table DDL. All
//! mutation goes through [`PhaseStateManager`](crate::phase::PhaseStateManager);
//! the store itself only bootstraps, inserts, and reads rows.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;

use crate::phase::model::{Phase, PhaseState};

/// Errors from phase persistence and state mutation.
#[derive(Error, Debug)]
pub enum StateError {
    /// A concurrent writer won the race for this row. The mutation was not
    /// applied; retry policy belongs to the caller.
    #[error("optimistic lock conflict on phase {phase_id} (stale version {version})")]
    OptimisticLock {
        /// Phase whose row was contended.
        phase_id: String,
        /// Version this writer read before losing the race.
        version: u32,
    },

    /// No row exists for the requested phase.
    #[error("phase {0} not found")]
    PhaseNotFound(String),

    /// A persisted row could not be decoded back into a `Phase`.
    #[error("corrupt phase row: {0}")]
    Corrupt(String),

    /// Any other datastore failure, propagated unchanged.
    #[error("datastore error: {0}")]
    Database(#[source] sqlx::Error),
}

/// Decide whether a driver error is a serialization conflict.
///
/// This is the single place where driver-specific conflict detection lives;
/// everything else treats the result as a typed `OptimisticLock` error.
/// SQLite reports a contended write as `SQLITE_BUSY` (5), `SQLITE_LOCKED`
/// (6), or `SQLITE_BUSY_SNAPSHOT` (517).
pub(crate) fn is_serialization_conflict(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            matches!(db.code().as_deref(), Some("5") | Some("6") | Some("517"))
                || db.message().contains("database is locked")
        }
        _ => false,
    }
}

/// Translate a driver error into the typed taxonomy for one phase row.
pub(crate) fn translate_row_error(phase_id: &str, version: u32, err: sqlx::Error) -> StateError {
    if is_serialization_conflict(&err) {
        StateError::OptimisticLock {
            phase_id: phase_id.to_string(),
            version,
        }
    } else {
        StateError::Database(err)
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS phases (
    run_id           TEXT    NOT NULL,
    phase_id         TEXT    NOT NULL,
    state            TEXT    NOT NULL,
    retry_attempt    INTEGER NOT NULL DEFAULT 0,
    revision_epoch   INTEGER NOT NULL DEFAULT 0,
    escalation_level INTEGER NOT NULL DEFAULT 0,
    version          INTEGER NOT NULL DEFAULT 0,
    scope            TEXT    NOT NULL DEFAULT '[]',
    failure_reason   TEXT,
    updated_at       TEXT    NOT NULL,
    PRIMARY KEY (run_id, phase_id)
)
"#;

/// Phase store backed by a SQLite connection pool.
#[derive(Debug, Clone)]
pub struct PhaseStore {
    pool: SqlitePool,
}

impl PhaseStore {
    /// Connect to the database at `database_url` and ensure the schema
    /// exists. The database file is created if missing.
    pub async fn connect(database_url: &str) -> Result<Self, StateError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StateError::Database)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_millis(250));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(StateError::Database)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// The underlying pool, shared with the state manager.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> Result<(), StateError> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(StateError::Database)?;
        Ok(())
    }

    /// Insert a new phase row.
    ///
    /// The state is passed through the BLOCKED-to-FAILED rewrite so a
    /// non-persistable state can never enter the table.
    pub async fn insert_phase(&self, phase: &Phase) -> Result<(), StateError> {
        let scope = serde_json::to_string(&phase.scope)
            .map_err(|e| StateError::Corrupt(format!("scope encode: {e}")))?;

        sqlx::query(
            "INSERT INTO phases \
             (run_id, phase_id, state, retry_attempt, revision_epoch, escalation_level, \
              version, scope, failure_reason, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&phase.run_id)
        .bind(&phase.phase_id)
        .bind(phase.state.persistable().as_str())
        .bind(phase.retry_attempt as i64)
        .bind(phase.revision_epoch as i64)
        .bind(phase.escalation_level as i64)
        .bind(phase.version as i64)
        .bind(scope)
        .bind(&phase.failure_reason)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(StateError::Database)?;

        Ok(())
    }

    /// Fetch one phase row, or `None` if it does not exist.
    pub async fn fetch_phase(
        &self,
        run_id: &str,
        phase_id: &str,
    ) -> Result<Option<Phase>, StateError> {
        let row = sqlx::query(
            "SELECT run_id, phase_id, state, retry_attempt, revision_epoch, \
             escalation_level, version, scope, failure_reason \
             FROM phases WHERE run_id = ? AND phase_id = ?",
        )
        .bind(run_id)
        .bind(phase_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StateError::Database)?;

        row.map(decode_phase).transpose()
    }

    /// Fetch every phase belonging to a run, in phase-id order.
    pub async fn fetch_run_phases(&self, run_id: &str) -> Result<Vec<Phase>, StateError> {
        let rows = sqlx::query(
            "SELECT run_id, phase_id, state, retry_attempt, revision_epoch, \
             escalation_level, version, scope, failure_reason \
             FROM phases WHERE run_id = ? ORDER BY phase_id",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(StateError::Database)?;

        rows.into_iter().map(decode_phase).collect()
    }
}

fn decode_phase(row: SqliteRow) -> Result<Phase, StateError> {
    let state_str: String = row.try_get("state").map_err(StateError::Database)?;
    let state = PhaseState::parse(&state_str)
        .ok_or_else(|| StateError::Corrupt(format!("unknown state {state_str:?}")))?;

    let scope_json: String = row.try_get("scope").map_err(StateError::Database)?;
    let scope: BTreeSet<String> = serde_json::from_str(&scope_json)
        .map_err(|e| StateError::Corrupt(format!("scope decode: {e}")))?;

    Ok(Phase {
        run_id: row.try_get("run_id").map_err(StateError::Database)?,
        phase_id: row.try_get("phase_id").map_err(StateError::Database)?,
        state,
        retry_attempt: row
            .try_get::<i64, _>("retry_attempt")
            .map_err(StateError::Database)? as u32,
        revision_epoch: row
            .try_get::<i64, _>("revision_epoch")
            .map_err(StateError::Database)? as u32,
        escalation_level: row
            .try_get::<i64, _>("escalation_level")
            .map_err(StateError::Database)? as u32,
        version: row
            .try_get::<i64, _>("version")
            .map_err(StateError::Database)? as u32,
        scope,
        failure_reason: row
            .try_get("failure_reason")
            .map_err(StateError::Database)?,
    })
}
