use std::sync::LockResult;

use tracing::warn;

/// Unwrap a lock acquisition, logging and recovering the guard when a
/// previous holder panicked. `module` and `op` label the warning.
pub(crate) fn recover<Guard>(result: LockResult<Guard>, module: &str, op: &str) -> Guard {
    match result {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(module, op, "Lock poisoned by a panicked holder, recovering the guard");
            poisoned.into_inner()
        }
    }
}
