//! Switchback runtime library.
//!
//! Lets callback-driven code be written in a straight-line, blocking style.
//! Each unit of work runs on its own stackful worker context; when it awaits
//! an asynchronous operation the worker parks, the reactor loop keeps
//! running, and the worker is switched back in with the result once the
//! operation completes.
//!
//! ## Modules
//!
//! - [`context`]: execution contexts -- corosensei coroutines, parent
//!   chain, `switch_to` / `switch_to_parent`
//! - [`reactor`]: the `Reactor` capability and a single-threaded event loop
//! - [`bridge`]: the scheduler, `Bridge::await_op` and operation completions
//! - [`unit`]: the unit-of-work lifecycle wrapper (`Scheduler::run_unit`)
//! - [`http`]: pooled HTTP client and `fetch` for use inside workers
//! - [`config`]: TOML runtime configuration
//!
//! ## Threading
//!
//! A scheduler, its workers and its event loop all live on one thread.
//! Operations may complete on any thread; their results are always routed
//! through the loop before a worker is resumed.

pub mod bridge;
pub mod config;
pub mod context;
pub mod http;
pub mod reactor;
pub mod unit;

pub use bridge::{
    from_fn, AsyncOperation, AwaitError, Bridge, Completion, OperationError, OperationId,
    Scheduler, SchedulerError, SchedulerStats,
};
pub use config::{ConfigError, RuntimeConfig};
pub use context::{ContextError, ContextId, ExecutionContext, Switch};
pub use http::{fetch, HttpClient, HttpRequest, HttpResponse};
pub use reactor::{Callback, EventLoop, LoopHandle, Reactor};
pub use unit::{FinishKind, Outcome, UnitHandle, UnitOfWork, UnitState};
