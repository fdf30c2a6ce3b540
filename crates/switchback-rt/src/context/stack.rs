//! Corosensei-based stackful execution contexts.
//!
//! Each worker runs its body on a dedicated coroutine stack. Control moves
//! between contexts only through [`ExecutionContext::switch_to`] (parent to
//! child) and [`switch_to_parent`] (child back to whoever resumed it).
//!
//! ## Thread-local State
//!
//! `FRAMES` is the chain of contexts currently running on this thread,
//! innermost last. A frame is pushed for the duration of each
//! `switch_to` and popped when the child yields, returns or unwinds. The
//! controller context is the empty chain, which is why
//! `switch_to_parent` on an empty chain is `ContextError::NoParent`.
//!
//! Each frame holds a type-erased pointer to the coroutine's `Yielder`,
//! installed by the coroutine body the first time it runs, plus the
//! `TypeId` of the `(Input, Yield)` pair so the pointer is only ever cast
//! back to the type it was created with.

use std::any::TypeId;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};

use super::state::{ContextError, ContextId, ContextState};

// ---------------------------------------------------------------------------
// Thread-local context chain
// ---------------------------------------------------------------------------

/// Slot holding the erased `Yielder` pointer of one context.
///
/// Null until the coroutine body has started.
type YielderSlot = Rc<Cell<*const ()>>;

struct Frame {
    id: ContextId,
    /// `None` while the context's stack is being force-unwound on drop.
    yielder: Option<YielderSlot>,
    signature: TypeId,
}

thread_local! {
    /// Contexts running on this thread, outermost first.
    static FRAMES: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

/// Pops the innermost frame when dropped, including during unwinding.
struct FrameGuard(ContextId);

impl Drop for FrameGuard {
    fn drop(&mut self) {
        let _ = FRAMES.try_with(|frames| {
            let popped = frames.borrow_mut().pop();
            debug_assert_eq!(popped.map(|f| f.id), Some(self.0));
        });
    }
}

/// The context currently running on this thread, or `None` on the
/// controller.
pub fn current() -> Option<ContextId> {
    FRAMES.with(|frames| frames.borrow().last().map(|f| f.id))
}

/// Number of nested contexts currently running on this thread.
pub fn depth() -> usize {
    FRAMES.with(|frames| frames.borrow().len())
}

/// Whether the innermost running context is being torn down, i.e. its
/// stack is unwinding because the context was dropped while suspended.
pub fn tearing_down() -> bool {
    FRAMES.with(|frames| {
        frames
            .borrow()
            .last()
            .is_some_and(|f| f.yielder.is_none())
    })
}

// ---------------------------------------------------------------------------
// Yield support
// ---------------------------------------------------------------------------

/// Suspend the current context and hand `value` to its parent.
///
/// Returns the value passed to the next `switch_to` on this context. The
/// type parameters must match the ones the current context was spawned
/// with.
pub fn switch_to_parent<I: 'static, Y: 'static>(value: Y) -> Result<I, ContextError> {
    let (id, ptr, signature) = FRAMES
        .with(|frames| {
            frames
                .borrow()
                .last()
                .map(|f| (f.id, f.yielder.as_ref().map(|slot| slot.get()), f.signature))
        })
        .ok_or(ContextError::NoParent)?;

    // There is no parent to return to while a dropped context unwinds.
    let ptr = ptr.ok_or(ContextError::TearingDown(id))?;
    if signature != TypeId::of::<(I, Y)>() {
        return Err(ContextError::TypeMismatch(id));
    }
    if ptr.is_null() {
        // The body installs the pointer before anything else runs, so a
        // null slot means we are not executing inside it.
        return Err(ContextError::NoParent);
    }

    tracing::trace!(context = %id, "switching to parent");

    // Safety: the pointer was stored by this context's own body and the
    // Yielder lives on the coroutine stack for as long as the body runs.
    // The TypeId check above guarantees the cast restores the original type.
    let yielder: &Yielder<I, Y> = unsafe { &*(ptr as *const Yielder<I, Y>) };
    Ok(yielder.suspend(value))
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Outcome of one `switch_to`.
#[derive(Debug, PartialEq, Eq)]
pub enum Switch<Y, R> {
    /// The context called `switch_to_parent` with this value.
    Yielded(Y),
    /// The context body returned this value; the context is finished.
    Finished(R),
}

/// A worker context: a coroutine with its own stack plus bookkeeping.
///
/// `I` is the value passed in on each switch, `Y` the value handed back by
/// `switch_to_parent`, `R` the body's return value.
///
/// `ExecutionContext` is `!Send`: corosensei coroutines cannot move between
/// threads, so a context is resumed only on the thread that spawned it.
pub struct ExecutionContext<I: 'static, Y: 'static, R: 'static> {
    id: ContextId,
    state: ContextState,
    parent: Option<ContextId>,
    yielder: YielderSlot,
    coro: Coroutine<I, Y, R, DefaultStack>,
}

impl<I: 'static, Y: 'static, R: 'static> ExecutionContext<I, Y, R> {
    /// Create a context that will run `work` when first switched into.
    ///
    /// `work` receives the input of that first switch. Nothing runs until
    /// then.
    pub fn spawn<F>(stack_size: usize, work: F) -> Result<Self, ContextError>
    where
        F: FnOnce(I) -> R + 'static,
    {
        let stack = DefaultStack::new(stack_size).map_err(|source| {
            ContextError::StackAllocation {
                size: stack_size,
                source,
            }
        })?;

        let id = ContextId::next();
        let yielder: YielderSlot = Rc::new(Cell::new(std::ptr::null()));
        let slot = Rc::clone(&yielder);

        let coro = Coroutine::with_stack(stack, move |y: &Yielder<I, Y>, input: I| {
            // Install the yielder before running user code so that
            // switch_to_parent can reach it.
            slot.set(y as *const Yielder<I, Y> as *const ());
            work(input)
        });

        tracing::debug!(context = %id, stack_size, "spawned context");

        Ok(ExecutionContext {
            id,
            state: ContextState::Suspended,
            parent: None,
            yielder,
            coro,
        })
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    /// The context that most recently switched into this one. `None` means
    /// the controller (or that it has never run).
    pub fn parent(&self) -> Option<ContextId> {
        self.parent
    }

    pub fn is_finished(&self) -> bool {
        self.state == ContextState::Finished
    }

    /// Transfer control into this context until it yields or returns.
    ///
    /// A panic inside the body leaves the context `Finished` and resumes
    /// unwinding in the caller.
    pub fn switch_to(&mut self, input: I) -> Result<Switch<Y, R>, ContextError> {
        if self.state == ContextState::Finished || self.coro.done() {
            self.state = ContextState::Finished;
            return Err(ContextError::InvalidSwitch(self.id));
        }

        self.parent = current();
        FRAMES.with(|frames| {
            frames.borrow_mut().push(Frame {
                id: self.id,
                yielder: Some(Rc::clone(&self.yielder)),
                signature: TypeId::of::<(I, Y)>(),
            })
        });
        let guard = FrameGuard(self.id);

        tracing::trace!(context = %self.id, parent = ?self.parent, "switching to context");
        self.state = ContextState::Runnable;
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.coro.resume(input)));
        drop(guard);

        match result {
            Ok(CoroutineResult::Yield(value)) => {
                self.state = ContextState::Suspended;
                Ok(Switch::Yielded(value))
            }
            Ok(CoroutineResult::Return(value)) => {
                self.state = ContextState::Finished;
                tracing::debug!(context = %self.id, "context finished");
                Ok(Switch::Finished(value))
            }
            Err(payload) => {
                self.state = ContextState::Finished;
                tracing::debug!(context = %self.id, "context unwound");
                panic::resume_unwind(payload)
            }
        }
    }
}

impl<I: 'static, Y: 'static, R: 'static> Drop for ExecutionContext<I, Y, R> {
    fn drop(&mut self) {
        if !self.coro.started() || self.coro.done() {
            return;
        }

        // Destructors on the unwinding stack must not reach the frame of
        // whichever context is dropping this one.
        FRAMES.with(|frames| {
            frames.borrow_mut().push(Frame {
                id: self.id,
                yielder: None,
                signature: TypeId::of::<(I, Y)>(),
            })
        });
        let _guard = FrameGuard(self.id);

        tracing::debug!(context = %self.id, "unwinding suspended context");
        self.coro.force_unwind();
        self.state = ContextState::Finished;
    }
}

impl<I: 'static, Y: 'static, R: 'static> fmt::Debug for ExecutionContext<I, Y, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("parent", &self.parent)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
