//! The reactor capability and a single-threaded event loop implementing it.
//!
//! The bridge only needs two things from a reactor: run a callback on the
//! loop thread soon, and run one after a delay. Both are expressed by the
//! [`Reactor`] trait so hosts can plug in their own loop.
//!
//! [`EventLoop`] is the bundled implementation: a FIFO task queue fed by a
//! `crossbeam-channel`, plus a timer heap. Handles are `Send`, so
//! completions produced on other threads can always reach the loop.

pub mod event_loop;
pub mod timer;

use std::time::Duration;

pub use event_loop::{EventLoop, LoopHandle};

/// A unit of deferred work posted to the reactor.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Black-box reactor capability used by the async bridge.
///
/// Implementations must run callbacks on the loop thread, in the order
/// they were posted.
pub trait Reactor: Send + Sync + 'static {
    /// Run `callback` on the loop thread after everything already queued.
    fn add_callback(&self, callback: Callback);

    /// Run `callback` on the loop thread once `delay` has elapsed.
    fn call_later(&self, delay: Duration, callback: Callback);
}
