//! Unit-of-work lifecycle wrapper.
//!
//! A unit of work is one end-to-end task from the host framework, such as
//! an inbound request. [`Scheduler::run_unit`] binds it to a fresh worker:
//!
//! 1. a worker context is allocated around the work function;
//! 2. the unit is marked asynchronous, so the host does not expect a
//!    synchronous result, and the worker is switched into immediately;
//! 3. `run_unit` returns as soon as the worker finishes or first parks.
//!
//! If the worker cannot be allocated the unit is never marked asynchronous;
//! it goes straight to `UnitOfWork::fail` and `run_unit` returns the error.
//!
//! When the work function returns `Outcome::Finish` the unit is finished
//! exactly once. `Outcome::DontFinish` means the work function has taken
//! care of that itself. An error (or a panic) optionally writes failure
//! detail into the unit when its debug argument is `"1"`, then goes to the
//! host's failure path through `UnitOfWork::fail`.

use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use crate::bridge::{panic_message, AwaitError, Bridge, Scheduler, SchedulerError};
use crate::context::{self, ContextId};

/// The host-side view of one unit of work.
pub trait UnitOfWork {
    /// Tell the host the result will be produced asynchronously.
    fn mark_async(&mut self);

    /// Look up an input argument by name.
    fn argument(&self, name: &str) -> Option<String>;

    /// Append output.
    fn write(&mut self, chunk: &str);

    /// Complete the unit successfully. Called at most once.
    fn finish(&mut self);

    /// Hand a failure to the host's standard failure path. Called at most
    /// once, and never together with `finish`.
    fn fail(&mut self, error: &anyhow::Error);
}

/// What the work function asks the wrapper to do once it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Finish the unit now.
    Finish,
    /// The work function finished, or will finish, the unit itself.
    DontFinish,
}

/// How a unit of work ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishKind {
    Normal,
    DontFinish,
    Error,
}

/// Lifecycle of a unit of work.
///
/// `Created -> Running -> (Suspended <-> Running)* -> Finished(_)`; nothing
/// leaves `Finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Created,
    Running,
    Suspended,
    Finished(FinishKind),
}

impl UnitState {
    pub fn is_finished(self) -> bool {
        matches!(self, UnitState::Finished(_))
    }
}

/// Observer for a unit started with [`Scheduler::run_unit`].
#[derive(Debug, Clone)]
pub struct UnitHandle {
    worker: ContextId,
    state: Rc<Cell<UnitState>>,
}

impl UnitHandle {
    /// The worker context bound to this unit.
    pub fn worker(&self) -> ContextId {
        self.worker
    }

    pub fn state(&self) -> UnitState {
        self.state.get()
    }

    pub fn is_finished(&self) -> bool {
        self.state.get().is_finished()
    }
}

impl Scheduler {
    /// Run `work` for `unit` on a new worker context.
    ///
    /// Returns once the worker has finished or parked on its first
    /// operation. Errors here mean the worker could not be created or was
    /// lost to a scheduler fault; failures of the work function itself go
    /// to `UnitOfWork::fail`.
    pub fn run_unit<U, F>(&self, unit: U, work: F) -> Result<UnitHandle, SchedulerError>
    where
        U: UnitOfWork + 'static,
        F: FnOnce(&mut U, &Bridge) -> anyhow::Result<Outcome> + 'static,
    {
        let state = Rc::new(Cell::new(UnitState::Created));
        let bridge = self.bridge();
        let debug_argument = self.debug_argument().to_string();
        let body_state = Rc::clone(&state);

        // The worker takes the unit when it first runs.
        let slot = Rc::new(RefCell::new(Some(unit)));
        let body_slot = Rc::clone(&slot);

        let prepared = self.prepare_worker(move || {
            let Some(mut unit) = body_slot.borrow_mut().take() else {
                return;
            };
            let kind = run_body(&mut unit, work, &bridge, &debug_argument);
            body_state.set(UnitState::Finished(kind));
        });
        let prepared = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                tracing::error!(error = %err, "could not create a worker for unit of work");
                if let Some(mut unit) = slot.borrow_mut().take() {
                    unit.fail(&anyhow::anyhow!("unit of work could not start: {err}"));
                }
                state.set(UnitState::Finished(FinishKind::Error));
                return Err(err);
            }
        };

        if let Some(unit) = slot.borrow_mut().as_mut() {
            unit.mark_async();
        }
        drop(slot);

        let worker = self.start_worker(prepared, Rc::clone(&state))?;
        Ok(UnitHandle { worker, state })
    }
}

/// Body of every unit worker.
fn run_body<U, F>(unit: &mut U, work: F, bridge: &Bridge, debug_argument: &str) -> FinishKind
where
    U: UnitOfWork,
    F: FnOnce(&mut U, &Bridge) -> anyhow::Result<Outcome>,
{
    let result = match panic::catch_unwind(AssertUnwindSafe(|| work(&mut *unit, bridge))) {
        Ok(result) => result,
        // The forced unwind of a worker being dropped must keep unwinding.
        // Every other panic becomes a unit failure.
        Err(payload) if context::tearing_down() => panic::resume_unwind(payload),
        Err(payload) => match panic_message(payload.as_ref()) {
            Some(message) => Err(anyhow::anyhow!("unit of work panicked: {message}")),
            None => Err(anyhow::anyhow!("unit of work panicked with a non-string payload")),
        },
    };

    match result {
        Ok(Outcome::Finish) => {
            unit.finish();
            FinishKind::Normal
        }
        Ok(Outcome::DontFinish) => FinishKind::DontFinish,
        Err(error) => {
            let scheduling = error
                .downcast_ref::<AwaitError>()
                .is_some_and(AwaitError::is_scheduling)
                || error.downcast_ref::<SchedulerError>().is_some();
            if scheduling {
                tracing::error!(error = %error, "unit of work aborted by scheduler fault");
            } else {
                tracing::debug!(error = %error, "unit of work failed");
            }

            if unit.argument(debug_argument).as_deref() == Some("1") {
                unit.write(&format!("Exception: {error}<br/>"));
                unit.write(&format!("Trace: {}", render_trace(&error)));
            }
            unit.fail(&error);
            FinishKind::Error
        }
    }
}

/// Error chain plus backtrace, one entry per line, as HTML-ish text.
fn render_trace(error: &anyhow::Error) -> String {
    format!("{error:?}").lines().collect::<Vec<_>>().join("<br/>")
}
