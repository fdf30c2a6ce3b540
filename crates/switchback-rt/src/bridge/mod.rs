//! Async bridge: blocking-style awaits on top of a callback reactor.
//!
//! ## Architecture
//!
//! - **Scheduler** (`scheduler.rs`): per-reactor worker table, pending
//!   operation table, resume routing and the worker-facing [`Bridge`].
//! - **Operation** (`operation.rs`): the [`AsyncOperation`] trait and the
//!   single-use [`Completion`] an operation calls when it is done.
//! - **Pending** (`pending.rs`): [`OperationId`] and the in-flight record.
//! - **Error** (`error.rs`): [`OperationError`], [`SchedulerError`] and
//!   [`AwaitError`].
//!
//! ## The await protocol
//!
//! ```text
//!  worker                      controller / reactor            anywhere
//!  ------                      --------------------            --------
//!  await_op(op)
//!    record PendingOperation
//!    op.submit(completion) ------------------------------------> I/O
//!    switch_to_parent  ------> loop keeps running
//!                                                   <---------- completion.complete(r)
//!                              resume task queued (FIFO)
//!                              resume task runs:
//!                                store r, switch_to(worker)
//!    <------------------------
//!    take r, drop record
//!    return value / raise error
//! ```
//!
//! The switch back into a worker always happens from the loop thread's
//! controller context, never from inside the completion call.

pub mod error;
pub mod operation;
pub mod pending;
pub mod scheduler;

pub use error::{AwaitError, OperationError, SchedulerError};
pub use operation::{from_fn, AsyncOperation, Completion, FnOperation, Sleep};
pub use pending::OperationId;
pub use scheduler::{Bridge, Scheduler, SchedulerId, SchedulerStats};

pub(crate) use scheduler::panic_message;
