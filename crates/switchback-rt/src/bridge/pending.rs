//! Bookkeeping for in-flight operations.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::context::ContextId;

/// Monotonic identity of one submitted operation. Diagnostics only.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(pub u64);

impl OperationId {
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        OperationId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OP({})", self.0)
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One outstanding asynchronous call.
///
/// Created right before the operation is submitted and removed right after
/// its worker has been resumed. The payload stays `None` until the
/// completion's resume task runs on the loop thread.
pub(crate) struct PendingOperation {
    pub id: OperationId,
    pub worker: ContextId,
    pub submitted_at: Instant,
    pub payload: Option<Box<dyn Any + Send>>,
}

impl PendingOperation {
    pub fn new(worker: ContextId) -> Self {
        PendingOperation {
            id: OperationId::next(),
            worker,
            submitted_at: Instant::now(),
            payload: None,
        }
    }
}

impl fmt::Debug for PendingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingOperation")
            .field("id", &self.id)
            .field("worker", &self.worker)
            .field("elapsed", &self.submitted_at.elapsed())
            .field("completed", &self.payload.is_some())
            .finish()
    }
}
