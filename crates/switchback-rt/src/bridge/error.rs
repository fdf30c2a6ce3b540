//! Error types raised at the `await` call site.

use crate::context::{ContextError, ContextId};

use super::pending::OperationId;

/// Failure reported by an asynchronous operation.
///
/// Expected and recoverable: work functions handle these with ordinary
/// `match` / `?` around the await.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    /// The operation gave up waiting.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The operation could not reach its peer or lost the connection.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The peer answered with a non-success status.
    #[error("non-success status {code}")]
    Status { code: u16, body: String },

    /// Any other operation-specific failure.
    #[error("{0}")]
    Failed(String),
}

impl OperationError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, OperationError::Timeout(_))
    }

    /// Status code for `Status` failures.
    pub fn status(&self) -> Option<u16> {
        match self {
            OperationError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Violations of the scheduler's invariants.
///
/// These mean the bridge was misused. They end the affected unit of work
/// and leave the reactor and all other workers untouched.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Context(#[from] ContextError),

    /// A worker tried to issue a second operation while one is in flight.
    #[error("worker {worker} already has operation {outstanding} in flight")]
    DoubleSubmission {
        worker: ContextId,
        outstanding: OperationId,
    },

    /// `await` was called from a context this scheduler does not own.
    #[error("context {0} is not a worker of this scheduler")]
    ForeignContext(ContextId),

    /// A resume targeted a worker that is currently running.
    #[error("worker {0} is already running")]
    WorkerBusy(ContextId),

    /// A resume arrived for an operation the worker is not waiting on.
    #[error("worker {worker} resumed for operation {operation} it is not waiting on")]
    UnexpectedResume {
        worker: ContextId,
        operation: OperationId,
    },

    /// The delivered payload is not the type the worker awaited.
    #[error("result of operation {0} does not match the awaited type")]
    PayloadMismatch(OperationId),

    /// The worker body panicked outside the unit-of-work wrapper.
    #[error("worker {worker} panicked: {message}")]
    Panicked { worker: ContextId, message: String },

    /// The scheduler was dropped.
    #[error("scheduler has shut down")]
    Shutdown,
}

/// Error returned by `Bridge::await_op`.
#[derive(Debug, thiserror::Error)]
pub enum AwaitError {
    #[error(transparent)]
    Operation(#[from] OperationError),

    #[error(transparent)]
    Scheduling(#[from] SchedulerError),
}

impl From<ContextError> for AwaitError {
    fn from(err: ContextError) -> Self {
        AwaitError::Scheduling(SchedulerError::Context(err))
    }
}

impl AwaitError {
    /// The operation failure, if this is one.
    pub fn operation(&self) -> Option<&OperationError> {
        match self {
            AwaitError::Operation(e) => Some(e),
            AwaitError::Scheduling(_) => None,
        }
    }

    pub fn is_scheduling(&self) -> bool {
        matches!(self, AwaitError::Scheduling(_))
    }
}
