//! Per-run health budget counters.

use serde::{Deserialize, Serialize};

/// Failure counters for one run.
///
/// The counters only grow unless explicitly restored from a snapshot; the
/// decision logic that reads them (when to abort a run) lives in the
/// surrounding loop, not here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthBudget {
    /// HTTP 500 responses seen from upstream services.
    pub http_500_count: u64,
    /// Patches that failed to apply.
    pub patch_failure_count: u64,
    /// All failures, of any kind.
    pub total_failures: u64,
}

impl HealthBudget {
    /// Record an upstream HTTP 500.
    pub fn record_http_500(&mut self) {
        self.http_500_count += 1;
        self.total_failures += 1;
    }

    /// Record a patch that failed to apply.
    pub fn record_patch_failure(&mut self) {
        self.patch_failure_count += 1;
        self.total_failures += 1;
    }

    /// Record a failure not covered by a more specific counter.
    pub fn record_failure(&mut self) {
        self.total_failures += 1;
    }
}
