//! Executor status to outcome mapping.

/// Small outcome vocabulary the surrounding loop branches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionOutcome {
    /// The phase finished its work.
    Success,
    /// CI ran and failed.
    CiFail,
    /// The generated patch did not apply.
    PatchApplyError,
    /// The phase ran out of time.
    Timeout,
    /// The worker itself failed before producing a result.
    ExecutionError,
    /// Anything else: the phase's output was rejected.
    Rejected,
}

impl ExecutionOutcome {
    /// Stable label used in logs and run summaries.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionOutcome::Success => "success",
            ExecutionOutcome::CiFail => "ci_fail",
            ExecutionOutcome::PatchApplyError => "patch_apply_error",
            ExecutionOutcome::Timeout => "timeout",
            ExecutionOutcome::ExecutionError => "execution_error",
            ExecutionOutcome::Rejected => "rejected",
        }
    }
}

/// Map an executor status string to an outcome.
///
/// Pure lookup; unknown statuses become [`ExecutionOutcome::Rejected`]
/// rather than erroring, so the executor can grow new status strings
/// without breaking callers.
pub fn status_to_outcome(status: &str) -> ExecutionOutcome {
    if status.starts_with("PARALLEL_EXECUTION_ERROR") {
        return ExecutionOutcome::ExecutionError;
    }
    match status {
        "COMPLETE" | "SUCCESS" => ExecutionOutcome::Success,
        "CI_FAILED" => ExecutionOutcome::CiFail,
        "PATCH_FAILED" => ExecutionOutcome::PatchApplyError,
        "TIMEOUT" => ExecutionOutcome::Timeout,
        _ => ExecutionOutcome::Rejected,
    }
}
