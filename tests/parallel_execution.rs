//! End-to-end parallel execution: the scheduler dispatches a group whose
//! executor persists results through a real on-disk phase store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use phaserunner::{
    ExecutionAdjustments, FileScopeChecker, ParallelExecutionScheduler, ParallelSchedulerConfig,
    Phase, PhaseExecutor, PhaseExecutorError, PhaseStateManager, PhaseStore, StateError,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn scratch_store() -> (TempDir, PhaseStore) {
    init_tracing();
    let dir = TempDir::new().expect("Failed to create temp dir");
    let url = format!("sqlite://{}", dir.path().join("phases.db").display());
    let store = PhaseStore::connect(&url).await.expect("connect");
    (dir, store)
}

fn phase(id: &str, scope: &[&str]) -> Phase {
    Phase::queued("run-1", id, scope.iter().map(|s| s.to_string()))
}

/// Executor that records each phase's terminal state through the real
/// state manager, failing the phases it is told to fail.
struct PersistingExecutor {
    manager: Arc<PhaseStateManager>,
    fail_ids: Vec<String>,
}

impl PersistingExecutor {
    /// Retry a terminal write when a sibling worker's commit wins the
    /// row race, the way a real call site applies its own backoff.
    async fn persist_with_retry(
        &self,
        phase_id: &str,
        failed: bool,
    ) -> Result<(), PhaseExecutorError> {
        for attempt in 0..20u32 {
            let result = if failed {
                self.manager
                    .mark_failed(phase_id, "executor reported failure")
                    .await
            } else {
                self.manager.mark_complete(phase_id).await
            };
            match result {
                Ok(_) => return Ok(()),
                Err(StateError::OptimisticLock { .. }) => {
                    tokio::time::sleep(Duration::from_millis(5 * (attempt as u64 + 1))).await;
                }
                Err(other) => return Err(other.into()),
            }
        }
        Err("terminal write never landed".into())
    }
}

#[async_trait]
impl PhaseExecutor for PersistingExecutor {
    async fn execute_phase(
        &self,
        phase: &Phase,
        _adjustments: &ExecutionAdjustments,
    ) -> Result<(bool, String), PhaseExecutorError> {
        // Small stagger so the workers genuinely overlap.
        tokio::time::sleep(Duration::from_millis(10)).await;
        if self.fail_ids.contains(&phase.phase_id) {
            self.persist_with_retry(&phase.phase_id, true).await?;
            return Ok((false, "CI_FAILED".to_string()));
        }
        self.persist_with_retry(&phase.phase_id, false).await?;
        Ok((true, "COMPLETE".to_string()))
    }
}

#[tokio::test]
async fn test_group_outcomes_are_persisted_per_phase() {
    let (_dir, store) = scratch_store().await;
    let queued = vec![
        phase("PH-A", &["src/a.rs"]),
        phase("PH-B", &["src/b.rs"]),
        phase("PH-C", &["src/c.rs"]),
    ];
    for p in &queued {
        store.insert_phase(p).await.expect("insert");
    }

    let manager = Arc::new(PhaseStateManager::new(&store, "run-1"));
    let executor = PersistingExecutor {
        manager,
        fail_ids: vec!["PH-B".to_string()],
    };
    let scheduler =
        ParallelExecutionScheduler::new(ParallelSchedulerConfig::default(), Arc::new(executor));

    let (results, group_size) = scheduler
        .try_parallel_execution(&queued, &queued[0], &FileScopeChecker, 3)
        .await
        .expect("parallel group");
    assert_eq!(group_size, 3);
    assert_eq!(results.len(), 3);

    // One failed outcome, two successes, none masked by the failure.
    assert_eq!(results.iter().filter(|r| !r.success).count(), 1);

    let rows = store.fetch_run_phases("run-1").await.expect("fetch run");
    for row in rows {
        match row.phase_id.as_str() {
            "PH-B" => {
                assert_eq!(row.state.as_str(), "FAILED");
                assert_eq!(row.failure_reason.as_deref(), Some("executor reported failure"));
            }
            _ => assert_eq!(row.state.as_str(), "COMPLETE"),
        }
        // Exactly one conditioned write per phase.
        assert_eq!(row.version, 1);
    }
}

#[tokio::test]
async fn test_overlapping_scope_excludes_candidate_from_group() {
    let (_dir, store) = scratch_store().await;
    let queued = vec![
        phase("PH-A", &["src/shared.rs"]),
        phase("PH-B", &["src/shared.rs"]),
        phase("PH-C", &["src/other.rs"]),
    ];
    for p in &queued {
        store.insert_phase(p).await.expect("insert");
    }

    let manager = Arc::new(PhaseStateManager::new(&store, "run-1"));
    let executor = PersistingExecutor {
        manager,
        fail_ids: Vec::new(),
    };
    let scheduler =
        ParallelExecutionScheduler::new(ParallelSchedulerConfig::default(), Arc::new(executor));

    let (results, group_size) = scheduler
        .try_parallel_execution(&queued, &queued[0], &FileScopeChecker, 3)
        .await
        .expect("parallel group");

    // PH-B shares a path with the primary and never joins; PH-C does.
    assert_eq!(group_size, 2);
    let mut ids: Vec<&str> = results.iter().map(|r| r.phase.phase_id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["PH-A", "PH-C"]);

    // The excluded phase is untouched in the store.
    let untouched = store
        .fetch_phase("run-1", "PH-B")
        .await
        .expect("fetch")
        .expect("row");
    assert_eq!(untouched.state.as_str(), "QUEUED");
    assert_eq!(untouched.version, 0);
}
