//! Integration tests for awaiting operations from units of work.
//!
//! Every test drives a real `EventLoop` and `Scheduler`:
//! - results reach the worker that awaited them, in any completion order
//! - failures surface at the await call site and reach `UnitOfWork::fail`
//! - misuse (double submission, awaiting from the controller, stale
//!   completions) is reported without disturbing other workers

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use rand::SeedableRng;

use switchback_rt::bridge::SchedulerError;
use switchback_rt::context::{ContextError, ExecutionContext, Switch, DEFAULT_STACK_SIZE};
use switchback_rt::unit::FinishKind;
use switchback_rt::{
    from_fn, AwaitError, Completion, EventLoop, OperationError, Outcome, RuntimeConfig, Scheduler,
    UnitOfWork, UnitState,
};

// ── Helpers ────────────────────────────────────────────────────────────

type Log = Rc<RefCell<Vec<String>>>;

/// Unit of work that records every host callback it receives.
struct RecordingUnit {
    log: Log,
    args: Vec<(String, String)>,
}

impl RecordingUnit {
    fn new() -> (Self, Log) {
        let log: Log = Rc::default();
        let unit = RecordingUnit {
            log: Rc::clone(&log),
            args: Vec::new(),
        };
        (unit, log)
    }

    fn with_arg(mut self, name: &str, value: &str) -> Self {
        self.args.push((name.to_string(), value.to_string()));
        self
    }
}

impl UnitOfWork for RecordingUnit {
    fn mark_async(&mut self) {
        self.log.borrow_mut().push("mark_async".to_string());
    }

    fn argument(&self, name: &str) -> Option<String> {
        self.args
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.clone())
    }

    fn write(&mut self, chunk: &str) {
        self.log.borrow_mut().push(format!("write:{chunk}"));
    }

    fn finish(&mut self) {
        self.log.borrow_mut().push("finish".to_string());
    }

    fn fail(&mut self, error: &anyhow::Error) {
        self.log.borrow_mut().push(format!("fail:{error}"));
    }
}

fn setup() -> (EventLoop, Scheduler) {
    let event_loop = EventLoop::new();
    let scheduler = Scheduler::with_defaults(event_loop.handle());
    (event_loop, scheduler)
}

fn entries(log: &Log) -> Vec<String> {
    log.borrow().clone()
}

// ── Success path ───────────────────────────────────────────────────────

#[test]
fn test_await_returns_success_payload() {
    let (mut event_loop, scheduler) = setup();
    let (unit, log) = RecordingUnit::new();

    let handle = scheduler
        .run_unit(unit, |unit, bridge| {
            let value = bridge.await_op(from_fn(|c: Completion<String>| {
                c.succeed("payload".to_string())
            }))?;
            unit.write(&value);
            Ok(Outcome::Finish)
        })
        .unwrap();

    // The completion only queued a resume task; the worker is still parked.
    assert_eq!(handle.state(), UnitState::Suspended);
    assert_eq!(entries(&log), vec!["mark_async"]);

    event_loop.run_until_idle();

    assert_eq!(handle.state(), UnitState::Finished(FinishKind::Normal));
    assert_eq!(entries(&log), vec!["mark_async", "write:payload", "finish"]);
    let stats = scheduler.stats();
    assert_eq!(stats.spawned, 1);
    assert_eq!(stats.finished, 1);
    assert_eq!(stats.parks, 1);
    assert_eq!(stats.resumes, 1);
    assert_eq!(stats.rejected_resumes, 0);
    assert_eq!(scheduler.active_workers(), 0);
    assert_eq!(scheduler.pending_operations(), 0);
}

#[test]
fn test_unit_without_awaits_finishes_inside_run_unit() {
    let (_event_loop, scheduler) = setup();
    let (unit, log) = RecordingUnit::new();

    let handle = scheduler
        .run_unit(unit, |unit, _bridge| {
            unit.write("hello");
            Ok(Outcome::Finish)
        })
        .unwrap();

    assert!(handle.is_finished());
    assert_eq!(entries(&log), vec!["mark_async", "write:hello", "finish"]);
    assert_eq!(scheduler.stats().parks, 0);
}

#[test]
fn test_sequential_awaits_in_one_unit() {
    let (mut event_loop, scheduler) = setup();
    let (unit, log) = RecordingUnit::new();

    scheduler
        .run_unit(unit, |unit, bridge| {
            let a = bridge.await_op(from_fn(|c: Completion<u32>| c.succeed(2)))?;
            let b = bridge.await_op(from_fn(|c: Completion<u32>| c.succeed(3)))?;
            unit.write(&format!("{}", a * b));
            Ok(Outcome::Finish)
        })
        .unwrap();
    event_loop.run_until_idle();

    assert_eq!(entries(&log), vec!["mark_async", "write:6", "finish"]);
    assert_eq!(scheduler.stats().parks, 2);
}

#[test]
fn test_sleep_parks_worker_for_delay() {
    let (mut event_loop, scheduler) = setup();
    let (unit, log) = RecordingUnit::new();
    let started = Instant::now();

    let handle = scheduler
        .run_unit(unit, |_unit, bridge| {
            bridge.sleep(Duration::from_millis(20))?;
            Ok(Outcome::Finish)
        })
        .unwrap();

    assert_eq!(handle.state(), UnitState::Suspended);
    assert!(event_loop.run_until_timeout(|| handle.is_finished(), Duration::from_secs(5)));
    assert!(started.elapsed() >= Duration::from_millis(20));
    assert_eq!(entries(&log), vec!["mark_async", "finish"]);
}

// ── Failure path ───────────────────────────────────────────────────────

#[test]
fn test_operation_error_raised_at_second_call_site() {
    let (mut event_loop, scheduler) = setup();
    let (unit, log) = RecordingUnit::new();

    let handle = scheduler
        .run_unit(unit, |unit, bridge| {
            let a = bridge.await_op(from_fn(|c: Completion<u32>| c.succeed(1)))?;
            unit.write(&format!("a={a}"));
            let b = bridge.await_op(from_fn(|c: Completion<u32>| {
                c.fail(OperationError::Timeout("b took too long".to_string()))
            }))?;
            unit.write(&format!("b={b}"));
            Ok(Outcome::Finish)
        })
        .unwrap();
    event_loop.run_until_idle();

    assert_eq!(handle.state(), UnitState::Finished(FinishKind::Error));
    assert_eq!(
        entries(&log),
        vec!["mark_async", "write:a=1", "fail:timeout: b took too long"]
    );
}

#[test]
fn test_operation_error_can_be_handled_by_work() {
    let (mut event_loop, scheduler) = setup();
    let (unit, log) = RecordingUnit::new();

    let observer = scheduler.clone();

    let handle = scheduler
        .run_unit(unit, move |unit, bridge| {
            let result = bridge.await_op(from_fn(|c: Completion<u32>| {
                c.fail(OperationError::Status {
                    code: 404,
                    body: String::new(),
                })
            }));
            let code = result
                .unwrap_err()
                .operation()
                .and_then(OperationError::status);
            unit.write(&format!("{code:?}"));
            unit.write(&format!(
                "pending={} has_pending={}",
                observer.pending_operations(),
                bridge.has_pending()
            ));

            // The worker can await again after handling the failure.
            let next = bridge.await_op(from_fn(|c: Completion<u32>| c.succeed(5)))?;
            unit.write(&format!("next={next}"));
            Ok(Outcome::Finish)
        })
        .unwrap();
    event_loop.run_until_idle();

    assert_eq!(handle.state(), UnitState::Finished(FinishKind::Normal));
    assert_eq!(
        entries(&log),
        vec![
            "mark_async",
            "write:Some(404)",
            "write:pending=0 has_pending=false",
            "write:next=5",
            "finish"
        ]
    );
    assert_eq!(scheduler.pending_operations(), 0);
    assert_eq!(scheduler.stats().parks, 2);
}

#[test]
fn test_dont_finish_leaves_unit_open() {
    let (mut event_loop, scheduler) = setup();
    let (unit, log) = RecordingUnit::new();

    let handle = scheduler
        .run_unit(unit, |unit, bridge| {
            bridge.await_op(from_fn(|c: Completion<()>| c.succeed(())))?;
            unit.write("streaming");
            Ok(Outcome::DontFinish)
        })
        .unwrap();
    event_loop.run_until_idle();

    assert_eq!(handle.state(), UnitState::Finished(FinishKind::DontFinish));
    assert_eq!(entries(&log), vec!["mark_async", "write:streaming"]);
}

#[test]
fn test_debug_argument_writes_failure_detail() {
    let (_event_loop, scheduler) = setup();
    let (unit, log) = RecordingUnit::new();
    let unit = unit.with_arg("admin_debug_mode", "1");

    scheduler
        .run_unit(unit, |_unit, _bridge| Err(anyhow::anyhow!("boom")))
        .unwrap();

    let log = entries(&log);
    assert_eq!(log.len(), 4, "{log:?}");
    assert_eq!(log[0], "mark_async");
    assert_eq!(log[1], "write:Exception: boom<br/>");
    assert!(log[2].starts_with("write:Trace: boom"), "{log:?}");
    assert_eq!(log[3], "fail:boom");
}

#[test]
fn test_failure_without_debug_argument_writes_nothing() {
    let (_event_loop, scheduler) = setup();
    let (unit, log) = RecordingUnit::new();
    let unit = unit.with_arg("admin_debug_mode", "0");

    scheduler
        .run_unit(unit, |_unit, _bridge| Err(anyhow::anyhow!("boom")))
        .unwrap();

    assert_eq!(entries(&log), vec!["mark_async", "fail:boom"]);
}

#[test]
fn test_panic_in_work_becomes_failure() {
    let (_event_loop, scheduler) = setup();
    let (unit, log) = RecordingUnit::new();

    let handle = scheduler
        .run_unit(unit, |_unit, _bridge| -> anyhow::Result<Outcome> {
            panic!("kaboom")
        })
        .unwrap();

    assert_eq!(handle.state(), UnitState::Finished(FinishKind::Error));
    assert_eq!(
        entries(&log),
        vec!["mark_async", "fail:unit of work panicked: kaboom"]
    );
    assert_eq!(scheduler.active_workers(), 0);
}

#[test]
fn test_non_string_panic_after_await_becomes_failure() {
    let (mut event_loop, scheduler) = setup();
    let (unit, log) = RecordingUnit::new();

    let handle = scheduler
        .run_unit(unit, |_unit, bridge| -> anyhow::Result<Outcome> {
            bridge.await_op(from_fn(|c: Completion<u32>| c.succeed(1)))?;
            std::panic::panic_any(42_i32)
        })
        .unwrap();
    event_loop.run_until_idle();

    assert_eq!(handle.state(), UnitState::Finished(FinishKind::Error));
    assert_eq!(
        entries(&log),
        vec![
            "mark_async",
            "fail:unit of work panicked with a non-string payload"
        ]
    );
    let stats = scheduler.stats();
    assert_eq!(stats.resumes, 1);
    assert_eq!(stats.finished, 1);
    assert_eq!(stats.rejected_resumes, 0);
    assert_eq!(scheduler.active_workers(), 0);
}

#[test]
fn test_non_string_panic_before_await_becomes_failure() {
    let (_event_loop, scheduler) = setup();
    let (unit, log) = RecordingUnit::new();

    let handle = scheduler
        .run_unit(unit, |_unit, _bridge| -> anyhow::Result<Outcome> {
            std::panic::panic_any(vec![1_u8, 2, 3])
        })
        .unwrap();

    assert_eq!(handle.state(), UnitState::Finished(FinishKind::Error));
    assert_eq!(
        entries(&log),
        vec![
            "mark_async",
            "fail:unit of work panicked with a non-string payload"
        ]
    );
}

#[test]
fn test_unit_fails_when_worker_cannot_be_allocated() {
    let event_loop = EventLoop::new();
    let mut config = RuntimeConfig::default();
    config.scheduler.stack_size = usize::MAX / 2;
    let scheduler = Scheduler::new(event_loop.handle(), &config);
    let (unit, log) = RecordingUnit::new();

    let err = scheduler
        .run_unit(unit, |_unit, _bridge| Ok(Outcome::Finish))
        .unwrap_err();

    assert!(
        matches!(
            err,
            SchedulerError::Context(ContextError::StackAllocation { .. })
        ),
        "{err:?}"
    );
    // Never marked asynchronous, and failed exactly once.
    let log = entries(&log);
    assert_eq!(log.len(), 1, "{log:?}");
    assert!(log[0].starts_with("fail:unit of work could not start"), "{log:?}");
    assert!(log[0].contains("failed to allocate"), "{log:?}");
    assert_eq!(scheduler.stats().spawned, 0);
    assert_eq!(scheduler.active_workers(), 0);
}

// ── Misuse ─────────────────────────────────────────────────────────────

#[test]
fn test_await_from_controller_is_no_parent() {
    let (_event_loop, scheduler) = setup();
    let bridge = scheduler.bridge();

    let err = bridge
        .await_op(from_fn(|c: Completion<()>| c.succeed(())))
        .unwrap_err();

    assert!(
        matches!(
            err,
            AwaitError::Scheduling(SchedulerError::Context(ContextError::NoParent))
        ),
        "{err:?}"
    );
    assert_eq!(scheduler.pending_operations(), 0);
}

#[test]
fn test_await_from_foreign_context_rejected() {
    let (_event_loop, scheduler) = setup();
    let bridge = scheduler.bridge();

    let mut context = ExecutionContext::<(), (), Result<(), AwaitError>>::spawn(
        DEFAULT_STACK_SIZE,
        move |()| bridge.await_op(from_fn(|c: Completion<()>| c.succeed(()))),
    )
    .unwrap();

    match context.switch_to(()).unwrap() {
        Switch::Finished(Err(AwaitError::Scheduling(SchedulerError::ForeignContext(id)))) => {
            assert_eq!(id, context.id());
        }
        other => panic!("expected ForeignContext, got {other:?}"),
    }
}

#[test]
fn test_double_submission_rejected() {
    let (mut event_loop, scheduler) = setup();
    let (unit, log) = RecordingUnit::new();
    let nested: Rc<RefCell<Option<Result<u32, AwaitError>>>> = Rc::default();
    let nested_slot = Rc::clone(&nested);

    scheduler
        .run_unit(unit, move |unit, bridge| {
            let reentrant = bridge.clone();
            let value = bridge.await_op(from_fn(move |c: Completion<u32>| {
                let second = reentrant.await_op(from_fn(|c: Completion<u32>| c.succeed(2)));
                *nested_slot.borrow_mut() = Some(second);
                c.succeed(1);
            }))?;
            unit.write(&value.to_string());
            Ok(Outcome::Finish)
        })
        .unwrap();
    event_loop.run_until_idle();

    let second = nested.borrow_mut().take().unwrap();
    assert!(
        matches!(
            second,
            Err(AwaitError::Scheduling(SchedulerError::DoubleSubmission { .. }))
        ),
        "{second:?}"
    );
    // The first operation is unaffected.
    assert_eq!(entries(&log), vec!["mark_async", "write:1", "finish"]);
}

#[test]
fn test_stale_completion_is_rejected() {
    let (mut event_loop, scheduler) = setup();
    let (unit, log) = RecordingUnit::new();
    let stash: Rc<RefCell<Option<Completion<u32>>>> = Rc::default();
    let stash_slot = Rc::clone(&stash);

    let handle = scheduler
        .run_unit(unit, move |_unit, bridge| {
            bridge.await_op(from_fn(move |c: Completion<u32>| {
                *stash_slot.borrow_mut() = Some(c);
                panic!("submit exploded");
            }))?;
            Ok(Outcome::Finish)
        })
        .unwrap();

    assert_eq!(handle.state(), UnitState::Finished(FinishKind::Error));
    assert_eq!(
        entries(&log),
        vec!["mark_async", "fail:unit of work panicked: submit exploded"]
    );
    assert_eq!(scheduler.pending_operations(), 0);

    // The worker is gone; completing now must not switch into it.
    let completion = stash.borrow_mut().take().unwrap();
    completion.succeed(9);
    event_loop.run_until_idle();

    assert_eq!(scheduler.stats().rejected_resumes, 1);
    assert_eq!(entries(&log).len(), 2);
}

#[test]
fn test_dropped_completion_leaks_worker() {
    let (mut event_loop, scheduler) = setup();
    let (unit, log) = RecordingUnit::new();

    let handle = scheduler
        .run_unit(unit, |_unit, bridge| {
            bridge.await_op(from_fn(|c: Completion<u32>| drop(c)))?;
            Ok(Outcome::Finish)
        })
        .unwrap();
    event_loop.run_until_idle();

    assert_eq!(handle.state(), UnitState::Suspended);
    assert_eq!(scheduler.suspended_workers(), vec![handle.worker()]);
    assert_eq!(scheduler.pending_operations(), 1);
    assert_eq!(entries(&log), vec!["mark_async"]);
}

#[test]
fn test_scheduler_dropped_with_parked_worker() {
    let (mut event_loop, scheduler) = setup();
    let (unit, log) = RecordingUnit::new();
    let stash: Rc<RefCell<Option<Completion<u32>>>> = Rc::default();
    let stash_slot = Rc::clone(&stash);

    scheduler
        .run_unit(unit, move |_unit, bridge| {
            bridge.await_op(from_fn(move |c: Completion<u32>| {
                *stash_slot.borrow_mut() = Some(c);
            }))?;
            Ok(Outcome::Finish)
        })
        .unwrap();
    drop(scheduler);

    // The result has nowhere to go and is dropped on the loop.
    let completion = stash.borrow_mut().take().unwrap();
    completion.succeed(1);
    event_loop.run_until_idle();

    assert_eq!(entries(&log), vec!["mark_async"]);
}

// ── Many workers ───────────────────────────────────────────────────────

#[test]
fn test_many_units_resumed_in_shuffled_order() {
    const UNITS: usize = 1000;

    let (mut event_loop, scheduler) = setup();
    let completions: Rc<RefCell<Vec<(usize, Completion<usize>)>>> = Rc::default();
    let mut logs = Vec::with_capacity(UNITS);
    let mut handles = Vec::with_capacity(UNITS);

    for i in 0..UNITS {
        let (unit, log) = RecordingUnit::new();
        let completions = Rc::clone(&completions);
        let handle = scheduler
            .run_unit(unit, move |unit, bridge| {
                let value = bridge.await_op(from_fn(move |c: Completion<usize>| {
                    completions.borrow_mut().push((i, c));
                }))?;
                unit.write(&value.to_string());
                Ok(Outcome::Finish)
            })
            .unwrap();
        logs.push(log);
        handles.push(handle);
    }

    assert_eq!(scheduler.suspended_workers().len(), UNITS);
    assert_eq!(scheduler.pending_operations(), UNITS);

    let mut ready: Vec<_> = completions.borrow_mut().drain(..).collect();
    ready.shuffle(&mut rand::rngs::StdRng::seed_from_u64(0x5eed));
    for (i, completion) in ready {
        completion.succeed(i * 7);
    }
    event_loop.run_until_idle();

    for (i, log) in logs.iter().enumerate() {
        assert_eq!(
            entries(log),
            vec!["mark_async".to_string(), format!("write:{}", i * 7), "finish".to_string()]
        );
    }
    assert!(handles.iter().all(|h| h.is_finished()));
    assert_eq!(scheduler.active_workers(), 0);
    assert_eq!(scheduler.stats().rejected_resumes, 0);
}

#[test]
fn test_completions_from_other_threads() {
    const UNITS: usize = 16;

    let (mut event_loop, scheduler) = setup();
    let mut logs = Vec::new();
    let mut handles = Vec::new();
    let threads: Arc<Mutex<Vec<thread::JoinHandle<()>>>> = Arc::default();

    for i in 0..UNITS {
        let (unit, log) = RecordingUnit::new();
        let threads = Arc::clone(&threads);
        let handle = scheduler
            .run_unit(unit, move |unit, bridge| {
                let value = bridge.await_op(from_fn(move |c: Completion<usize>| {
                    let join = thread::spawn(move || {
                        thread::sleep(Duration::from_millis((UNITS - i) as u64));
                        c.succeed(i);
                    });
                    threads.lock().unwrap().push(join);
                }))?;
                unit.write(&value.to_string());
                Ok(Outcome::Finish)
            })
            .unwrap();
        logs.push(log);
        handles.push(handle);
    }

    let all_done = event_loop.run_until_timeout(
        || handles.iter().all(|h| h.is_finished()),
        Duration::from_secs(10),
    );
    assert!(all_done);

    for (i, log) in logs.iter().enumerate() {
        assert_eq!(entries(log)[1], format!("write:{i}"));
    }
    for join in threads.lock().unwrap().drain(..) {
        join.join().unwrap();
    }
}

#[test]
fn test_two_schedulers_share_one_loop() {
    let mut event_loop = EventLoop::new();
    let first = Scheduler::with_defaults(event_loop.handle());
    let second = Scheduler::with_defaults(event_loop.handle());
    let (unit_a, log_a) = RecordingUnit::new();
    let (unit_b, log_b) = RecordingUnit::new();

    first
        .run_unit(unit_a, |unit, bridge| {
            let v = bridge.await_op(from_fn(|c: Completion<&'static str>| c.succeed("a")))?;
            unit.write(v);
            Ok(Outcome::Finish)
        })
        .unwrap();
    second
        .run_unit(unit_b, |unit, bridge| {
            let v = bridge.await_op(from_fn(|c: Completion<&'static str>| c.succeed("b")))?;
            unit.write(v);
            Ok(Outcome::Finish)
        })
        .unwrap();
    event_loop.run_until_idle();

    assert_eq!(entries(&log_a), vec!["mark_async", "write:a", "finish"]);
    assert_eq!(entries(&log_b), vec!["mark_async", "write:b", "finish"]);
    assert_ne!(first.id(), second.id());
}
