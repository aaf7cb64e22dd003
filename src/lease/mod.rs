//! Cross-process workspace lease.
//!
//! A time-bounded, renewable exclusive claim on a named resource,
//! represented as a lock file on a shared filesystem. Independent executor
//! processes acquire the lease before exclusive maintenance operations
//! (e.g. workspace compaction); a crashed holder is recovered from via TTL
//! expiry rather than explicit cleanup.
//!
//! Ownership is proven only by token equality, never by path existence: a
//! handle that finds its token replaced in the lock file has lost the
//! lease and must treat all subsequent work as unprotected.
//!
//! The grace period gives an in-flight renewal a buffer before any waiter
//! is permitted to break the lock; without it, a renewal racing against
//! expiry could leave two processes both believing they hold the lease.
//!
//! This is a single-host/shared-filesystem primitive. It is deliberately
//! not extended to network filesystems with weak consistency; that would
//! be a different component with different invariants.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default time-to-live for a held lease.
const DEFAULT_TTL: Duration = Duration::from_secs(300);
/// Default renewal buffer before waiters may break the lock.
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);
/// Default sleep between acquisition attempts while the lock is held.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Rewrite attempts for transient filesystem contention during renewal.
const RENEW_WRITE_ATTEMPTS: u32 = 3;

/// Errors from lease operations.
#[derive(Error, Debug)]
pub enum LeaseError {
    /// The acquisition deadline passed while the lock stayed validly held.
    #[error("timed out acquiring lease at {}: held by {}", lock_path.display(), holder.as_deref().unwrap_or("unknown"))]
    Timeout {
        /// Path of the contested lock file.
        lock_path: PathBuf,
        /// Owner label read from the lock file, if any.
        holder: Option<String>,
    },

    /// Filesystem failure outside the lease's own retry window.
    #[error("lease I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The lease payload could not be encoded.
    #[error("lease payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Lock-file payload, stored as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeasePayload {
    owner: String,
    token: String,
    pid: u32,
    ttl_seconds: f64,
    grace_period_seconds: f64,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    last_renewed_at: DateTime<Utc>,
}

impl LeasePayload {
    /// Whether the TTL plus the holder's declared grace period has elapsed.
    fn is_stale(&self, now: DateTime<Utc>) -> bool {
        let grace = chrono::Duration::milliseconds((self.grace_period_seconds * 1000.0) as i64);
        now > self.expires_at + grace
    }
}

/// Ownership proof kept while the lease is held.
#[derive(Debug, Clone)]
struct HeldLease {
    token: String,
    created_at: DateTime<Utc>,
}

/// A renewable exclusive claim on a lock path.
///
/// State machine: `Unheld -> Acquiring (polling) -> Held -> [Renewing]* ->
/// Released | Lost`.
#[derive(Debug)]
pub struct WorkspaceLease {
    lock_path: PathBuf,
    owner: String,
    ttl: Duration,
    grace_period: Duration,
    poll_interval: Duration,
    held: Option<HeldLease>,
}

impl WorkspaceLease {
    /// Create an unheld lease handle for the given lock path.
    pub fn new(lock_path: impl Into<PathBuf>, owner: impl Into<String>) -> Self {
        Self {
            lock_path: lock_path.into(),
            owner: owner.into(),
            ttl: DEFAULT_TTL,
            grace_period: DEFAULT_GRACE_PERIOD,
            poll_interval: DEFAULT_POLL_INTERVAL,
            held: None,
        }
    }

    /// Set the time-to-live written into the lock file.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the renewal grace period.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Set the sleep between acquisition polls.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// The lock path this handle claims.
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Whether this handle currently believes it holds the lease.
    pub fn is_acquired(&self) -> bool {
        self.held.is_some()
    }

    /// Acquire the lease, polling until success or `timeout` elapses.
    ///
    /// A missing lock file is claimed with an atomic exclusive create. An
    /// unreadable or malformed lock file is treated as stale and removed
    /// rather than blocking forever on a corrupt lock. A readable lock
    /// file past its TTL plus grace period is broken and retried
    /// immediately; a live one is polled until the deadline.
    pub async fn acquire(&mut self, timeout: Duration) -> Result<(), LeaseError> {
        let deadline = Instant::now() + timeout;
        let mut last_holder: Option<String> = None;

        loop {
            match self.try_create().await {
                Ok(held) => {
                    debug!(lock_path = %self.lock_path.display(), owner = %self.owner, "lease acquired");
                    self.held = Some(held);
                    return Ok(());
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    match self.read_payload().await {
                        Some(payload) => {
                            last_holder = Some(payload.owner.clone());
                            if payload.is_stale(Utc::now()) {
                                debug!(
                                    lock_path = %self.lock_path.display(),
                                    holder = %payload.owner,
                                    "breaking stale lease"
                                );
                                let _ = tokio::fs::remove_file(&self.lock_path).await;
                                continue; // retry immediately, no sleep
                            }
                        }
                        None => {
                            // Unreadable or malformed: safe default is to
                            // treat it as stale rather than block forever.
                            warn!(
                                lock_path = %self.lock_path.display(),
                                "removing unreadable lock file"
                            );
                            let _ = tokio::fs::remove_file(&self.lock_path).await;
                            continue;
                        }
                    }

                    if Instant::now() >= deadline {
                        return Err(LeaseError::Timeout {
                            lock_path: self.lock_path.clone(),
                            holder: last_holder,
                        });
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
                Err(err) => return Err(LeaseError::Io(err)),
            }

            if Instant::now() >= deadline {
                return Err(LeaseError::Timeout {
                    lock_path: self.lock_path.clone(),
                    holder: last_holder,
                });
            }
        }
    }

    /// Renew the lease, extending its expiry.
    ///
    /// Returns `Ok(false)` (ownership lost) when the handle is not held,
    /// the lock file is missing or unreadable, or its token no longer
    /// matches this handle (the lock was broken as stale and re-acquired
    /// by another waiter). On loss the handle clears its held state; the
    /// caller must abort or re-acquire before doing further protected
    /// work. On success `created_at` and `token` are preserved.
    pub async fn renew(&mut self) -> Result<bool, LeaseError> {
        let held = match &self.held {
            Some(held) => held.clone(),
            None => return Ok(false),
        };

        let payload = match self.read_payload().await {
            Some(payload) => payload,
            None => {
                warn!(lock_path = %self.lock_path.display(), "lease file gone; ownership lost");
                self.held = None;
                return Ok(false);
            }
        };

        if payload.token != held.token {
            warn!(
                lock_path = %self.lock_path.display(),
                new_owner = %payload.owner,
                "lease token mismatch; ownership lost"
            );
            self.held = None;
            return Ok(false);
        }

        let now = Utc::now();
        let renewed = LeasePayload {
            owner: self.owner.clone(),
            token: held.token.clone(),
            pid: std::process::id(),
            ttl_seconds: self.ttl.as_secs_f64(),
            grace_period_seconds: self.grace_period.as_secs_f64(),
            created_at: held.created_at,
            expires_at: now + chrono::Duration::milliseconds(self.ttl.as_millis() as i64),
            last_renewed_at: now,
        };

        self.write_replacing(&renewed).await?;
        debug!(lock_path = %self.lock_path.display(), "lease renewed");
        Ok(true)
    }

    /// Release the lease. Idempotent; a no-op when not held.
    ///
    /// The lock file is deleted only if its token still matches this
    /// handle: a holder whose lease was broken as stale and re-acquired
    /// must not delete the new owner's lock. Deletion is best-effort and
    /// local state is cleared regardless, so a handle can always be
    /// safely discarded.
    pub async fn release(&mut self) {
        let held = match self.held.take() {
            Some(held) => held,
            None => return,
        };

        match self.read_payload().await {
            Some(payload) if payload.token == held.token => {
                let _ = tokio::fs::remove_file(&self.lock_path).await;
                debug!(lock_path = %self.lock_path.display(), "lease released");
            }
            Some(payload) => {
                warn!(
                    lock_path = %self.lock_path.display(),
                    new_owner = %payload.owner,
                    "lock re-acquired by another owner; leaving it in place"
                );
            }
            None => {}
        }
    }

    /// Atomically create the lock file; fails with `AlreadyExists` if a
    /// lock file is present.
    async fn try_create(&self) -> Result<HeldLease, std::io::Error> {
        if let Some(parent) = self.lock_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let now = Utc::now();
        let payload = LeasePayload {
            owner: self.owner.clone(),
            token: Uuid::new_v4().to_string(),
            pid: std::process::id(),
            ttl_seconds: self.ttl.as_secs_f64(),
            grace_period_seconds: self.grace_period.as_secs_f64(),
            created_at: now,
            expires_at: now + chrono::Duration::milliseconds(self.ttl.as_millis() as i64),
            last_renewed_at: now,
        };

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await?;

        let body = serde_json::to_vec_pretty(&payload)
            .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;
        file.write_all(&body).await?;
        file.sync_all().await?;

        Ok(HeldLease {
            token: payload.token,
            created_at: payload.created_at,
        })
    }

    /// Read and parse the current lock file; `None` when it is missing,
    /// unreadable, or malformed.
    async fn read_payload(&self) -> Option<LeasePayload> {
        let content = tokio::fs::read_to_string(&self.lock_path).await.ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Rewrite the lock file via temp-file-then-atomic-replace, with a
    /// small bounded retry for transient filesystem contention (antivirus
    /// or indexer locks), not for correctness.
    async fn write_replacing(&self, payload: &LeasePayload) -> Result<(), LeaseError> {
        let body = serde_json::to_vec_pretty(payload)?;
        let tmp_path = self
            .lock_path
            .with_extension(format!("tmp.{}", std::process::id()));

        let mut last_err: Option<std::io::Error> = None;
        for attempt in 1..=RENEW_WRITE_ATTEMPTS {
            let result = async {
                tokio::fs::write(&tmp_path, &body).await?;
                tokio::fs::rename(&tmp_path, &self.lock_path).await
            }
            .await;

            match result {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(
                        lock_path = %self.lock_path.display(),
                        attempt,
                        %err,
                        "lease rewrite failed"
                    );
                    last_err = Some(err);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }

        let _ = tokio::fs::remove_file(&tmp_path).await;
        Err(LeaseError::Io(last_err.unwrap_or_else(|| {
            std::io::Error::new(ErrorKind::Other, "lease rewrite failed")
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn lock_path(dir: &TempDir) -> PathBuf {
        dir.path().join("workspace.lock")
    }

    fn lease(dir: &TempDir, owner: &str) -> WorkspaceLease {
        WorkspaceLease::new(lock_path(dir), owner)
            .with_ttl(Duration::from_secs(1))
            .with_grace_period(Duration::from_millis(200))
            .with_poll_interval(Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_acquire_creates_lock_file() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut lease = lease(&dir, "executor-1");

        lease.acquire(Duration::from_secs(1)).await.expect("acquire");
        assert!(lease.is_acquired());
        assert!(lock_path(&dir).exists());
    }

    #[tokio::test]
    async fn test_second_acquire_times_out_while_held() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut first = lease(&dir, "executor-1");
        first.acquire(Duration::from_secs(1)).await.expect("acquire");

        let mut second = lease(&dir, "executor-2");
        let err = second
            .acquire(Duration::from_millis(500))
            .await
            .expect_err("lock is held");

        match err {
            LeaseError::Timeout { holder, .. } => {
                assert_eq!(holder.as_deref(), Some("executor-1"));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(!second.is_acquired());
    }

    #[tokio::test]
    async fn test_stale_lock_is_broken_without_polling() {
        let dir = TempDir::new().expect("Failed to create temp dir");

        // Expired well past the grace period.
        let now = Utc::now();
        let stale = LeasePayload {
            owner: "crashed-executor".to_string(),
            token: Uuid::new_v4().to_string(),
            pid: 0,
            ttl_seconds: 1.0,
            grace_period_seconds: 0.2,
            created_at: now - chrono::Duration::seconds(60),
            expires_at: now - chrono::Duration::seconds(30),
            last_renewed_at: now - chrono::Duration::seconds(60),
        };
        std::fs::write(
            lock_path(&dir),
            serde_json::to_vec(&stale).expect("encode"),
        )
        .expect("write stale lock");

        // A huge poll interval proves the break does not wait out a poll.
        let mut waiter = lease(&dir, "executor-2").with_poll_interval(Duration::from_secs(30));
        let started = std::time::Instant::now();
        waiter.acquire(Duration::from_secs(2)).await.expect("acquire");

        assert!(waiter.is_acquired());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_malformed_lock_is_treated_as_stale() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        std::fs::write(lock_path(&dir), b"not json at all").expect("write garbage");

        let mut waiter = lease(&dir, "executor-2").with_poll_interval(Duration::from_secs(30));
        waiter.acquire(Duration::from_secs(2)).await.expect("acquire");
        assert!(waiter.is_acquired());
    }

    #[tokio::test]
    async fn test_renew_extends_expiry_and_preserves_identity() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut lease = lease(&dir, "executor-1");
        lease.acquire(Duration::from_secs(1)).await.expect("acquire");

        let before: LeasePayload = serde_json::from_str(
            &std::fs::read_to_string(lock_path(&dir)).expect("read"),
        )
        .expect("parse");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(lease.renew().await.expect("renew"));

        let after: LeasePayload = serde_json::from_str(
            &std::fs::read_to_string(lock_path(&dir)).expect("read"),
        )
        .expect("parse");

        assert_eq!(after.token, before.token);
        assert_eq!(after.created_at, before.created_at);
        assert!(after.expires_at > before.expires_at);
        assert!(after.last_renewed_at > before.last_renewed_at);
    }

    #[tokio::test]
    async fn test_renew_fails_when_token_was_replaced() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut original = lease(&dir, "executor-1");
        original
            .acquire(Duration::from_secs(1))
            .await
            .expect("acquire");

        // Another waiter broke the lock as stale and re-created it.
        std::fs::remove_file(lock_path(&dir)).expect("remove");
        let mut thief = lease(&dir, "executor-2");
        thief.acquire(Duration::from_secs(1)).await.expect("acquire");

        assert!(!original.renew().await.expect("renew returns, not errors"));
        assert!(!original.is_acquired());

        // The thief's own renewal still works.
        assert!(thief.renew().await.expect("renew"));
    }

    #[tokio::test]
    async fn test_renew_fails_when_file_is_missing() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut lease = lease(&dir, "executor-1");
        lease.acquire(Duration::from_secs(1)).await.expect("acquire");

        std::fs::remove_file(lock_path(&dir)).expect("remove");

        assert!(!lease.renew().await.expect("renew returns"));
        assert!(!lease.is_acquired());
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut lease = lease(&dir, "executor-1");

        // Release before acquire is a no-op.
        lease.release().await;

        lease.acquire(Duration::from_secs(1)).await.expect("acquire");
        lease.release().await;
        assert!(!lease.is_acquired());
        assert!(!lock_path(&dir).exists());

        // Releasing again stays a no-op.
        lease.release().await;
    }

    #[tokio::test]
    async fn test_release_lets_the_next_waiter_in() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut first = lease(&dir, "executor-1");
        first.acquire(Duration::from_secs(1)).await.expect("acquire");
        first.release().await;

        let mut second = lease(&dir, "executor-2");
        second
            .acquire(Duration::from_millis(500))
            .await
            .expect("acquire after release");
        assert!(second.is_acquired());
    }

    #[tokio::test]
    async fn test_release_leaves_a_reacquired_lock_in_place() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut original = lease(&dir, "executor-1");
        original
            .acquire(Duration::from_secs(1))
            .await
            .expect("acquire");

        // The lock was broken as stale and re-acquired while the original
        // holder still believed it held the lease.
        std::fs::remove_file(lock_path(&dir)).expect("remove");
        let mut current = lease(&dir, "executor-2");
        current
            .acquire(Duration::from_secs(1))
            .await
            .expect("acquire");

        original.release().await;
        assert!(!original.is_acquired());

        // The new owner's lock survives; a third waiter still has to wait.
        assert!(lock_path(&dir).exists());
        assert!(current.renew().await.expect("renew"));
        let mut third = lease(&dir, "executor-3");
        let result = third.acquire(Duration::from_millis(300)).await;
        assert!(matches!(result, Err(LeaseError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_renew_without_acquire_is_false() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut lease = lease(&dir, "executor-1");
        assert!(!lease.renew().await.expect("renew returns"));
    }
}
