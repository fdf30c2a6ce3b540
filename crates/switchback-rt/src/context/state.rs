//! Identity, state and errors for execution contexts.
//!
//! Every worker context carries a [`ContextId`] drawn from a process-wide
//! counter, so ids are never reused and a stale id always refers to a
//! context that has already finished.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

// ---------------------------------------------------------------------------
// ContextId
// ---------------------------------------------------------------------------

/// Unique identifier for an execution context.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u64);

impl ContextId {
    /// Generate a fresh, globally unique context id.
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        ContextId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Return the raw numeric value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CTX({})", self.0)
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<ctx.{}>", self.0)
    }
}

// ---------------------------------------------------------------------------
// ContextState
// ---------------------------------------------------------------------------

/// The execution state of a context.
///
/// A freshly spawned context is `Suspended`: it has a stack and a body but
/// has not been switched into yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Currently executing. At most one context per thread is in this state
    /// without also being an ancestor of the running one.
    Runnable,
    /// Waiting to be switched into.
    Suspended,
    /// The body returned or panicked. Never resumed again.
    Finished,
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default context stack size: 64 KiB.
///
/// Virtual memory lazy-commits pages, so thousands of parked workers with
/// 64 KiB virtual stacks are cheap.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// Smallest stack size accepted by configuration.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

// ---------------------------------------------------------------------------
// ContextError
// ---------------------------------------------------------------------------

/// Errors raised by the execution context manager.
///
/// All of these indicate misuse of the scheduler rather than an I/O
/// failure, and none of them is recoverable inside the affected worker.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    /// The coroutine stack could not be mapped.
    #[error("failed to allocate a {size}-byte context stack")]
    StackAllocation {
        size: usize,
        #[source]
        source: std::io::Error,
    },

    /// Attempt to switch into a context that has already finished.
    #[error("cannot switch into finished context {0}")]
    InvalidSwitch(ContextId),

    /// `switch_to_parent` was called from the controller context.
    #[error("switch_to_parent called outside of any worker context")]
    NoParent,

    /// The values passed to `switch_to_parent` do not match the types the
    /// current context was spawned with.
    #[error("switch value types do not match context {0}")]
    TypeMismatch(ContextId),

    /// `switch_to_parent` was called while a dropped context's stack was
    /// being unwound.
    #[error("context {0} is being torn down and cannot switch")]
    TearingDown(ContextId),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawned_contexts_get_distinct_increasing_ids() {
        use crate::context::ExecutionContext;

        // Contexts are created on several threads; each thread sees its
        // own ids increase and no id is handed out twice overall.
        let handles: Vec<_> = (0..4)
            .map(|_| {
                std::thread::spawn(|| {
                    let contexts: Vec<_> = (0..25)
                        .map(|_| {
                            ExecutionContext::<(), (), ()>::spawn(MIN_STACK_SIZE, |()| ()).unwrap()
                        })
                        .collect();
                    contexts.iter().map(|c| c.id().as_u64()).collect::<Vec<u64>>()
                })
            })
            .collect();

        let mut seen = std::collections::HashSet::new();
        for handle in handles {
            let ids = handle.join().unwrap();
            assert!(ids.windows(2).all(|w| w[0] < w[1]), "{ids:?}");
            for id in ids {
                assert!(seen.insert(id), "Duplicate context id: {id}");
            }
        }
        assert_eq!(seen.len(), 100);
    }

    #[test]
    fn test_context_id_formatting() {
        let id = ContextId(42);
        assert_eq!(format!("{}", id), "<ctx.42>");
        assert_eq!(format!("{:?}", id), "CTX(42)");
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            ContextError::InvalidSwitch(ContextId(7)).to_string(),
            "cannot switch into finished context <ctx.7>"
        );
        assert_eq!(
            ContextError::NoParent.to_string(),
            "switch_to_parent called outside of any worker context"
        );
        assert_eq!(
            ContextError::TearingDown(ContextId(3)).to_string(),
            "context <ctx.3> is being torn down and cannot switch"
        );
    }
}
