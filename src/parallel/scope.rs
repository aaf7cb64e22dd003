//! File-scope conflict checking.

use crate::parallel::ScopeConflictChecker;
use crate::phase::Phase;

/// Conflict checker that compares declared file scopes.
///
/// Two phases conflict when their scope sets share any path. The check is
/// pairwise over the whole candidate group, so a group that passes is
/// safe regardless of which subset actually overlaps in time.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileScopeChecker;

impl ScopeConflictChecker for FileScopeChecker {
    fn can_execute_parallel(&self, phases: &[Phase]) -> (bool, String) {
        for i in 0..phases.len() {
            for j in (i + 1)..phases.len() {
                let a = &phases[i];
                let b = &phases[j];
                if a.scope_overlaps(b) {
                    let shared: Vec<&str> = a
                        .scope
                        .intersection(&b.scope)
                        .map(String::as_str)
                        .collect();
                    return (
                        false,
                        format!(
                            "{} and {} overlap on {}",
                            a.phase_id,
                            b.phase_id,
                            shared.join(", ")
                        ),
                    );
                }
            }
        }
        (true, "no scope overlap".to_string())
    }
}
