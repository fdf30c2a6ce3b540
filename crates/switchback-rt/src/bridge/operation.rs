//! Asynchronous operations and their completion handles.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use crate::context::ContextId;
use crate::reactor::Reactor;

use super::error::OperationError;
use super::pending::OperationId;
use super::scheduler::{deliver, SchedulerId};

/// A black-box asynchronous operation.
///
/// `submit` starts the operation and hands it the [`Completion`] to call
/// once a result is available. It may complete from any thread, and may
/// even complete before `submit` returns; the worker is still only resumed
/// from the reactor loop.
pub trait AsyncOperation {
    type Output: Send + 'static;

    fn submit(self, completion: Completion<Self::Output>);
}

/// Build an operation from a closure that receives the completion.
pub fn from_fn<T, F>(submit: F) -> FnOperation<T, F>
where
    T: Send + 'static,
    F: FnOnce(Completion<T>),
{
    FnOperation {
        submit,
        _output: PhantomData,
    }
}

/// Operation returned by [`from_fn`].
pub struct FnOperation<T, F> {
    submit: F,
    _output: PhantomData<fn() -> T>,
}

impl<T, F> AsyncOperation for FnOperation<T, F>
where
    T: Send + 'static,
    F: FnOnce(Completion<T>),
{
    type Output = T;

    fn submit(self, completion: Completion<T>) {
        (self.submit)(completion)
    }
}

/// An operation that completes with `()` after `delay`, using the reactor's
/// timer.
pub struct Sleep {
    pub(crate) reactor: Arc<dyn Reactor>,
    pub(crate) delay: Duration,
}

impl AsyncOperation for Sleep {
    type Output = ();

    fn submit(self, completion: Completion<()>) {
        self.reactor
            .call_later(self.delay, Box::new(move || completion.complete(Ok(()))));
    }
}

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

/// Single-use callback that carries an operation's result back to its
/// worker.
///
/// `complete` never switches into the worker itself. It posts a resume task
/// to the reactor, and that task performs the switch from the controller
/// context. This holds no matter which thread or stack `complete` runs on.
///
/// Dropping a completion without calling `complete` leaves its worker
/// suspended forever; this is logged, and the worker shows up in
/// `Scheduler::suspended_workers`.
pub struct Completion<T: Send + 'static> {
    scheduler: SchedulerId,
    worker: ContextId,
    operation: OperationId,
    reactor: Arc<dyn Reactor>,
    completed: bool,
    _output: PhantomData<fn(T)>,
}

impl<T: Send + 'static> Completion<T> {
    pub(crate) fn new(
        scheduler: SchedulerId,
        worker: ContextId,
        operation: OperationId,
        reactor: Arc<dyn Reactor>,
    ) -> Self {
        Completion {
            scheduler,
            worker,
            operation,
            reactor,
            completed: false,
            _output: PhantomData,
        }
    }

    pub fn operation(&self) -> OperationId {
        self.operation
    }

    pub fn worker(&self) -> ContextId {
        self.worker
    }

    /// Deliver the operation's result.
    pub fn complete(mut self, result: Result<T, OperationError>) {
        self.completed = true;
        let (scheduler, worker, operation) = (self.scheduler, self.worker, self.operation);
        let payload: Box<dyn Any + Send> = Box::new(result);
        tracing::trace!(%worker, %operation, "completion posted to reactor");
        self.reactor.add_callback(Box::new(move || {
            deliver(scheduler, worker, operation, payload);
        }));
    }

    pub fn succeed(self, value: T) {
        self.complete(Ok(value));
    }

    pub fn fail(self, error: OperationError) {
        self.complete(Err(error));
    }
}

impl<T: Send + 'static> Drop for Completion<T> {
    fn drop(&mut self) {
        if !self.completed {
            tracing::warn!(
                worker = %self.worker,
                operation = %self.operation,
                "completion dropped without a result; worker will never resume"
            );
        }
    }
}

impl<T: Send + 'static> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("worker", &self.worker)
            .field("operation", &self.operation)
            .field("completed", &self.completed)
            .finish()
    }
}
