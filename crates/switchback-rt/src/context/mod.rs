//! Execution context manager.
//!
//! Worker code runs on its own stackful coroutine so that it can be
//! suspended in the middle of an ordinary, blocking-style call chain and
//! resumed later exactly where it left off.
//!
//! ## Architecture
//!
//! - **State** (`state.rs`): context ids, the RUNNABLE / SUSPENDED /
//!   FINISHED state machine, stack size constants and `ContextError`.
//! - **Stack** (`stack.rs`): corosensei coroutines, the thread-local chain
//!   of running contexts, `switch_to` and `switch_to_parent`.
//!
//! The controller context is the thread itself: it owns no coroutine and
//! has no parent. It switches into workers; workers only ever switch back
//! to whoever resumed them.

pub mod stack;
pub mod state;

pub use stack::{current, depth, switch_to_parent, tearing_down, ExecutionContext, Switch};
pub use state::{ContextError, ContextId, ContextState, DEFAULT_STACK_SIZE, MIN_STACK_SIZE};
