//! Single-threaded event loop.
//!
//! ## Design
//!
//! All work reaches the loop through one unbounded `crossbeam-channel`:
//! plain callbacks, timer registrations and stop requests. The loop thread
//! drains the channel in order, so callbacks run strictly FIFO. Timers are
//! kept in a local `BinaryHeap` and fired once their deadline passes.
//!
//! When nothing is ready the loop blocks on the channel, bounded by the
//! next timer deadline, so it never spins.

use std::collections::BinaryHeap;
use std::fmt;
use std::marker::PhantomData;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use super::timer::Timer;
use super::{Callback, Reactor};

enum Task {
    Callback(Callback),
    Timer { deadline: Instant, callback: Callback },
    Stop,
}

// ---------------------------------------------------------------------------
// LoopHandle
// ---------------------------------------------------------------------------

/// Cloneable, `Send` handle for posting work to an [`EventLoop`].
#[derive(Clone)]
pub struct LoopHandle {
    tx: Sender<Task>,
}

impl LoopHandle {
    /// Ask the loop to return from [`EventLoop::run`].
    ///
    /// Tasks posted before the stop request still run first.
    pub fn stop(&self) {
        self.post(Task::Stop);
    }

    fn post(&self, task: Task) {
        if self.tx.send(task).is_err() {
            tracing::warn!("event loop is gone; dropping posted task");
        }
    }
}

impl Reactor for LoopHandle {
    fn add_callback(&self, callback: Callback) {
        self.post(Task::Callback(callback));
    }

    fn call_later(&self, delay: Duration, callback: Callback) {
        self.post(Task::Timer {
            deadline: Instant::now() + delay,
            callback,
        });
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("queued", &self.tx.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// EventLoop
// ---------------------------------------------------------------------------

/// The reactor loop. Owned by, and only driven on, one thread.
pub struct EventLoop {
    tx: Sender<Task>,
    rx: Receiver<Task>,
    timers: BinaryHeap<Timer>,
    next_seq: u64,
    stopped: bool,
    /// Keeps the loop on the thread that created it.
    _not_send: PhantomData<*const ()>,
}

impl EventLoop {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        EventLoop {
            tx,
            rx,
            timers: BinaryHeap::new(),
            next_seq: 0,
            stopped: false,
            _not_send: PhantomData,
        }
    }

    /// A handle for posting work to this loop from any thread.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            tx: self.tx.clone(),
        }
    }

    /// Number of queued callbacks plus armed timers.
    pub fn pending_tasks(&self) -> usize {
        self.rx.len() + self.timers.len()
    }

    /// Run until [`LoopHandle::stop`] is called.
    pub fn run(&mut self) {
        tracing::debug!("event loop started");
        while !self.stopped {
            self.turn(None);
        }
        self.stopped = false;
        tracing::debug!("event loop stopped");
    }

    /// Run until `done` returns true or the loop is stopped.
    pub fn run_until<F: FnMut() -> bool>(&mut self, mut done: F) {
        while !self.stopped && !done() {
            self.turn(None);
        }
        self.stopped = false;
    }

    /// Like [`run_until`](Self::run_until) but gives up after `timeout`.
    ///
    /// Returns whether `done` became true.
    pub fn run_until_timeout<F: FnMut() -> bool>(&mut self, mut done: F, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if done() {
                return true;
            }
            let now = Instant::now();
            if self.stopped || now >= deadline {
                self.stopped = false;
                return false;
            }
            self.turn(Some(deadline - now));
        }
    }

    /// Run queued callbacks and armed timers until none remain.
    ///
    /// Does not wait for work that other threads have yet to post. Returns
    /// the number of callbacks run.
    pub fn run_until_idle(&mut self) -> usize {
        let mut ran = 0;
        while !self.stopped && !(self.rx.is_empty() && self.timers.is_empty()) {
            ran += self.turn(None);
        }
        self.stopped = false;
        ran
    }

    /// One loop iteration: fire due timers, run the callbacks that were
    /// queued when the turn began, and if nothing ran, block for new work
    /// (up to `timeout`, or the next timer deadline if sooner).
    ///
    /// Returns the number of callbacks run.
    pub fn turn(&mut self, timeout: Option<Duration>) -> usize {
        let mut ran = self.fire_due_timers();

        // Callbacks posted while this batch runs wait for the next turn.
        let ready = self.rx.len();
        for _ in 0..ready {
            match self.rx.try_recv() {
                Ok(task) => ran += self.dispatch(task),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }

        if ran == 0 && !self.stopped {
            let until_timer = self
                .timers
                .peek()
                .map(|t| t.deadline.saturating_duration_since(Instant::now()));
            let wait = match (until_timer, timeout) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            let task = match wait {
                Some(wait) => match self.rx.recv_timeout(wait) {
                    Ok(task) => Some(task),
                    Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
                },
                // The loop holds its own sender, so recv only fails if the
                // channel is torn down underneath us.
                None => self.rx.recv().ok(),
            };
            if let Some(task) = task {
                ran += self.dispatch(task);
            }
            ran += self.fire_due_timers();
        }

        ran
    }

    fn dispatch(&mut self, task: Task) -> usize {
        match task {
            Task::Callback(callback) => {
                callback();
                1
            }
            Task::Timer { deadline, callback } => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.timers.push(Timer {
                    deadline,
                    seq,
                    callback,
                });
                0
            }
            Task::Stop => {
                self.stopped = true;
                0
            }
        }
    }

    fn fire_due_timers(&mut self) -> usize {
        let now = Instant::now();
        let mut fired = 0;
        while self.timers.peek().is_some_and(|t| t.deadline <= now) {
            if let Some(timer) = self.timers.pop() {
                (timer.callback)();
                fired += 1;
            }
        }
        fired
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("queued", &self.rx.len())
            .field("timers", &self.timers.len())
            .field("stopped", &self.stopped)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
