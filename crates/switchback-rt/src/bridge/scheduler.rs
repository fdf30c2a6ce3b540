//! The per-reactor scheduler: worker table, pending operations, resumes.
//!
//! ## Design
//!
//! A `Scheduler` belongs to one reactor thread. Its worker table and
//! pending-operation table live behind `RefCell`s and are only touched on
//! that thread, so no locks are involved. Worker coroutines are `!Send`
//! and never leave the thread either.
//!
//! Completions, on the other hand, may fire anywhere. They never touch the
//! scheduler directly: they post a resume task to the reactor carrying
//! only `Send` data (scheduler id, worker id, operation id, boxed result).
//! When the reactor runs that task on the loop thread it finds the
//! scheduler through a thread-local registry keyed by `SchedulerId`, which
//! lets several schedulers (on one thread or many) coexist without a
//! process-wide current-scheduler pointer.
//!
//! While a worker runs, its coroutine is taken out of the table so that no
//! `RefCell` borrow is held across the switch.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;

use crate::config::RuntimeConfig;
use crate::context::{self, ContextError, ContextId, ExecutionContext, Switch};
use crate::reactor::Reactor;
use crate::unit::{FinishKind, UnitState};

use super::error::{AwaitError, OperationError, SchedulerError};
use super::operation::{AsyncOperation, Completion, Sleep};
use super::pending::{OperationId, PendingOperation};

// ---------------------------------------------------------------------------
// Switch values
// ---------------------------------------------------------------------------

/// Passed into a worker on each switch.
pub(crate) enum Resume {
    /// First switch into a fresh worker.
    Start,
    /// The pending operation's payload is ready.
    Deliver(OperationId),
}

/// Handed back by a worker when it parks on an operation.
pub(crate) struct Park(pub OperationId);

type WorkerContext = ExecutionContext<Resume, Park, ()>;

// ---------------------------------------------------------------------------
// SchedulerId and registry
// ---------------------------------------------------------------------------

/// Identity of a scheduler, carried by completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SchedulerId(u64);

impl SchedulerId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        SchedulerId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SchedulerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scheduler-{}", self.0)
    }
}

thread_local! {
    /// Schedulers living on this thread.
    static REGISTRY: RefCell<FxHashMap<SchedulerId, Weak<Inner>>> =
        RefCell::new(FxHashMap::default());
}

fn lookup(id: SchedulerId) -> Option<Rc<Inner>> {
    REGISTRY
        .try_with(|registry| registry.borrow().get(&id).and_then(Weak::upgrade))
        .ok()
        .flatten()
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Counters describing a scheduler's activity so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Workers created.
    pub spawned: u64,
    /// Workers whose body returned or unwound.
    pub finished: u64,
    /// Times a worker parked on an operation.
    pub parks: u64,
    /// Times a worker was resumed with an operation result.
    pub resumes: u64,
    /// Resume tasks refused because they broke an invariant.
    pub rejected_resumes: u64,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// A worker whose stack is allocated but which has not run yet.
pub(crate) struct PreparedWorker {
    context: WorkerContext,
}

struct WorkerSlot {
    /// `None` while the worker is running.
    context: Option<WorkerContext>,
    state: Rc<Cell<UnitState>>,
}

struct Inner {
    id: SchedulerId,
    reactor: Arc<dyn Reactor>,
    stack_size: usize,
    debug_argument: String,
    workers: RefCell<FxHashMap<ContextId, WorkerSlot>>,
    pending: RefCell<FxHashMap<ContextId, PendingOperation>>,
    stats: Cell<SchedulerStats>,
}

impl Inner {
    fn bump(&self, update: impl FnOnce(&mut SchedulerStats)) {
        let mut stats = self.stats.get();
        update(&mut stats);
        self.stats.set(stats);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let _ = REGISTRY.try_with(|registry| registry.borrow_mut().remove(&self.id));
        let leaked = self.workers.get_mut().len();
        if leaked > 0 {
            tracing::warn!(
                scheduler = %self.id,
                leaked,
                "scheduler dropped with suspended workers; unwinding them"
            );
        }
    }
}

/// Cooperative scheduler bound to one reactor thread.
///
/// Cloning yields another handle to the same scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<Inner>,
}

impl Scheduler {
    /// Create a scheduler that resumes workers through `reactor`.
    ///
    /// `reactor` must be driven on the thread that creates the scheduler.
    pub fn new<R: Reactor>(reactor: R, config: &RuntimeConfig) -> Self {
        let inner = Rc::new(Inner {
            id: SchedulerId::next(),
            reactor: Arc::new(reactor),
            stack_size: config.scheduler.stack_size,
            debug_argument: config.unit.debug_argument.clone(),
            workers: RefCell::new(FxHashMap::default()),
            pending: RefCell::new(FxHashMap::default()),
            stats: Cell::new(SchedulerStats::default()),
        });
        REGISTRY.with(|registry| {
            registry
                .borrow_mut()
                .insert(inner.id, Rc::downgrade(&inner))
        });
        tracing::debug!(scheduler = %inner.id, stack_size = inner.stack_size, "scheduler created");
        Scheduler { inner }
    }

    pub fn with_defaults<R: Reactor>(reactor: R) -> Self {
        Self::new(reactor, &RuntimeConfig::default())
    }

    pub fn id(&self) -> SchedulerId {
        self.inner.id
    }

    /// Handle that worker code uses to await operations.
    pub fn bridge(&self) -> Bridge {
        Bridge {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn reactor(&self) -> Arc<dyn Reactor> {
        Arc::clone(&self.inner.reactor)
    }

    /// Name of the unit argument that enables failure detail rendering.
    pub fn debug_argument(&self) -> &str {
        &self.inner.debug_argument
    }

    /// Workers that have not finished yet.
    pub fn active_workers(&self) -> usize {
        self.inner.workers.borrow().len()
    }

    /// Workers parked on an operation, in creation order.
    ///
    /// A worker that stays here after the reactor is idle is leaked: its
    /// operation will never complete.
    pub fn suspended_workers(&self) -> Vec<ContextId> {
        let mut ids: Vec<ContextId> = self
            .inner
            .workers
            .borrow()
            .iter()
            .filter(|(_, slot)| slot.context.is_some())
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Operations submitted and not yet delivered to their worker.
    pub fn pending_operations(&self) -> usize {
        self.inner.pending.borrow().len()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.inner.stats.get()
    }

    /// Allocate a worker context for `body` without running it.
    pub(crate) fn prepare_worker<F>(&self, body: F) -> Result<PreparedWorker, SchedulerError>
    where
        F: FnOnce() + 'static,
    {
        let context = WorkerContext::spawn(self.inner.stack_size, move |_start: Resume| body())?;
        Ok(PreparedWorker { context })
    }

    /// Register a prepared worker and switch into it right away.
    ///
    /// Returns once the worker has finished or parked for the first time.
    pub(crate) fn start_worker(
        &self,
        prepared: PreparedWorker,
        state: Rc<Cell<UnitState>>,
    ) -> Result<ContextId, SchedulerError> {
        let context = prepared.context;
        let worker = context.id();
        self.inner
            .workers
            .borrow_mut()
            .insert(worker, WorkerSlot { context: None, state });
        self.inner.bump(|s| s.spawned += 1);
        tracing::debug!(scheduler = %self.inner.id, %worker, "worker spawned");

        self.drive(worker, context, Resume::Start)?;
        Ok(worker)
    }

    /// Switch `worker` back in now that `operation` has produced `payload`.
    fn resume(
        &self,
        worker: ContextId,
        operation: OperationId,
        payload: Box<dyn Any + Send>,
    ) -> Result<(), SchedulerError> {
        let context = match self.claim(worker, operation, payload) {
            Ok(context) => context,
            Err(err) => {
                self.inner.bump(|s| s.rejected_resumes += 1);
                tracing::error!(%worker, %operation, error = %err, "resume rejected");
                return Err(err);
            }
        };

        self.inner.bump(|s| s.resumes += 1);
        tracing::debug!(%worker, %operation, "resuming worker");
        self.drive(worker, context, Resume::Deliver(operation))
    }

    /// Check that `worker` is parked on `operation`, store the payload and
    /// take the worker's context out of its slot.
    fn claim(
        &self,
        worker: ContextId,
        operation: OperationId,
        payload: Box<dyn Any + Send>,
    ) -> Result<WorkerContext, SchedulerError> {
        let mut workers = self.inner.workers.borrow_mut();
        // Ids are never reused, so an unknown worker has finished.
        let slot = workers
            .get_mut(&worker)
            .ok_or(ContextError::InvalidSwitch(worker))?;
        if slot.context.is_none() {
            return Err(SchedulerError::WorkerBusy(worker));
        }

        let mut pending = self.inner.pending.borrow_mut();
        match pending.get_mut(&worker) {
            Some(record) if record.id == operation && record.payload.is_none() => {
                record.payload = Some(payload);
            }
            _ => return Err(SchedulerError::UnexpectedResume { worker, operation }),
        }

        slot.context
            .take()
            .ok_or(SchedulerError::WorkerBusy(worker))
    }

    /// Run `context` until it parks or finishes, then file it accordingly.
    fn drive(
        &self,
        worker: ContextId,
        mut context: WorkerContext,
        input: Resume,
    ) -> Result<(), SchedulerError> {
        let state = self
            .inner
            .workers
            .borrow()
            .get(&worker)
            .map(|slot| Rc::clone(&slot.state));
        if let Some(state) = &state {
            state.set(UnitState::Running);
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| context.switch_to(input)));

        match outcome {
            Ok(Ok(Switch::Yielded(Park(operation)))) => {
                if let Some(state) = &state {
                    state.set(UnitState::Suspended);
                }
                if let Some(slot) = self.inner.workers.borrow_mut().get_mut(&worker) {
                    slot.context = Some(context);
                }
                self.inner.bump(|s| s.parks += 1);
                tracing::debug!(%worker, %operation, "worker parked");
                Ok(())
            }
            Ok(Ok(Switch::Finished(()))) => {
                self.retire(worker);
                Ok(())
            }
            Ok(Err(err)) => {
                self.retire(worker);
                tracing::error!(%worker, error = %err, "worker switch failed");
                Err(err.into())
            }
            Err(payload) => {
                self.retire(worker);
                let message = panic_message(payload.as_ref())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                tracing::error!(%worker, %message, "worker panicked");
                Err(SchedulerError::Panicked { worker, message })
            }
        }
    }

    /// Drop all bookkeeping for a worker that will never run again.
    fn retire(&self, worker: ContextId) {
        let slot = self.inner.workers.borrow_mut().remove(&worker);
        if let Some(slot) = slot {
            if !matches!(slot.state.get(), UnitState::Finished(_)) {
                slot.state.set(UnitState::Finished(FinishKind::Error));
            }
        }
        if let Some(record) = self.inner.pending.borrow_mut().remove(&worker) {
            tracing::warn!(
                %worker,
                operation = %record.id,
                "worker finished with an operation still in flight"
            );
        }
        self.inner.bump(|s| s.finished += 1);
        tracing::debug!(%worker, "worker finished");
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("id", &self.inner.id)
            .field("active_workers", &self.active_workers())
            .field("pending_operations", &self.pending_operations())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Resume task body, run by the reactor on the loop thread.
pub(crate) fn deliver(
    scheduler: SchedulerId,
    worker: ContextId,
    operation: OperationId,
    payload: Box<dyn Any + Send>,
) {
    let Some(inner) = lookup(scheduler) else {
        tracing::error!(
            %scheduler,
            %worker,
            %operation,
            "no such scheduler on this thread; dropping operation result"
        );
        return;
    };
    let scheduler = Scheduler { inner };
    // Rejections are counted and logged by `resume` itself.
    if let Err(err) = scheduler.resume(worker, operation, payload) {
        tracing::debug!(%worker, %operation, error = %err, "resume ended in error");
    }
}

/// Extract the message from a panic payload raised by `panic!`.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> Option<String> {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        Some((*s).to_string())
    } else {
        payload.downcast_ref::<String>().cloned()
    }
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

/// Worker-side handle for awaiting asynchronous operations.
///
/// Holds only a weak reference so that a parked worker never keeps its own
/// scheduler alive.
#[derive(Clone)]
pub struct Bridge {
    inner: Weak<Inner>,
}

impl Bridge {
    /// Submit `operation` and park the calling worker until it completes.
    ///
    /// Returns the operation's value, or raises its failure as
    /// `AwaitError::Operation` right here. Must be called from a worker of
    /// this scheduler, with no other operation in flight.
    pub fn await_op<O: AsyncOperation>(&self, operation: O) -> Result<O::Output, AwaitError> {
        let inner = self.inner.upgrade().ok_or(SchedulerError::Shutdown)?;
        let worker = context::current().ok_or(ContextError::NoParent)?;
        if !inner.workers.borrow().contains_key(&worker) {
            return Err(SchedulerError::ForeignContext(worker).into());
        }

        let operation_id = {
            let mut pending = inner.pending.borrow_mut();
            if let Some(existing) = pending.get(&worker) {
                let outstanding = existing.id;
                tracing::error!(%worker, %outstanding, "operation issued while another is in flight");
                return Err(SchedulerError::DoubleSubmission {
                    worker,
                    outstanding,
                }
                .into());
            }
            let record = PendingOperation::new(worker);
            let id = record.id;
            pending.insert(worker, record);
            id
        };

        let completion = Completion::new(inner.id, worker, operation_id, Arc::clone(&inner.reactor));
        // Do not hold the scheduler alive across the suspension.
        drop(inner);

        tracing::debug!(%worker, operation = %operation_id, "submitting operation");
        operation.submit(completion);

        let resumed = context::switch_to_parent::<Resume, Park>(Park(operation_id));

        let inner = self.inner.upgrade().ok_or(SchedulerError::Shutdown)?;
        let record = inner.pending.borrow_mut().remove(&worker);
        match resumed? {
            Resume::Deliver(id) if id == operation_id => {}
            _ => {
                return Err(SchedulerError::UnexpectedResume {
                    worker,
                    operation: operation_id,
                }
                .into())
            }
        }

        let payload = record
            .and_then(|record| record.payload)
            .ok_or(SchedulerError::UnexpectedResume {
                worker,
                operation: operation_id,
            })?;
        let result = payload
            .downcast::<Result<O::Output, OperationError>>()
            .map_err(|_| SchedulerError::PayloadMismatch(operation_id))?;

        match *result {
            Ok(value) => Ok(value),
            Err(err) => {
                tracing::debug!(%worker, operation = %operation_id, error = %err, "operation failed");
                Err(AwaitError::Operation(err))
            }
        }
    }

    /// Park the calling worker for `delay` using the reactor's timer.
    pub fn sleep(&self, delay: Duration) -> Result<(), AwaitError> {
        let reactor = self
            .inner
            .upgrade()
            .map(|inner| Arc::clone(&inner.reactor))
            .ok_or(SchedulerError::Shutdown)?;
        self.await_op(Sleep { reactor, delay })
    }

    /// The reactor this bridge's scheduler resumes through.
    pub fn reactor(&self) -> Option<Arc<dyn Reactor>> {
        self.inner.upgrade().map(|inner| Arc::clone(&inner.reactor))
    }

    /// Whether an operation from the calling worker is currently in flight.
    pub fn has_pending(&self) -> bool {
        match (self.inner.upgrade(), context::current()) {
            (Some(inner), Some(worker)) => inner.pending.borrow().contains_key(&worker),
            _ => false,
        }
    }
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("scheduler", &self.inner.upgrade().map(|inner| inner.id))
            .finish()
    }
}
