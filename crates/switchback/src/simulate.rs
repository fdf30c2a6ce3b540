//! `switchback simulate`: many parked units, resumed out of order.
//!
//! Every unit awaits one timer-backed operation with a random delay, so
//! completions arrive in an order unrelated to submission. Each operation
//! carries a token derived from its unit's index; a unit that receives
//! anything else fails.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use switchback_rt::{from_fn, Completion, EventLoop, Outcome, Scheduler, UnitHandle, UnitOfWork};

#[derive(Default)]
struct Tally {
    finished: Cell<usize>,
    failed: Cell<usize>,
}

struct SimUnit {
    tally: Rc<Tally>,
}

impl UnitOfWork for SimUnit {
    fn mark_async(&mut self) {}

    fn argument(&self, _name: &str) -> Option<String> {
        None
    }

    fn write(&mut self, _chunk: &str) {}

    fn finish(&mut self) {
        self.tally.finished.set(self.tally.finished.get() + 1);
    }

    fn fail(&mut self, error: &anyhow::Error) {
        self.tally.failed.set(self.tally.failed.get() + 1);
        tracing::error!(error = %error, "simulated unit failed");
    }
}

fn token(index: usize) -> u64 {
    (index as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15) ^ 0x5bd1
}

/// Returns whether every unit finished with its own token.
pub fn run(units: usize, max_delay_ms: u64, seed: Option<u64>) -> anyhow::Result<bool> {
    let seed = seed.unwrap_or_else(|| rand::rng().random());
    let mut rng = StdRng::seed_from_u64(seed);

    let mut event_loop = EventLoop::new();
    let scheduler = Scheduler::with_defaults(event_loop.handle());
    let tally = Rc::new(Tally::default());
    let started = Instant::now();

    let mut handles: Vec<UnitHandle> = Vec::with_capacity(units);
    for index in 0..units {
        let delay = Duration::from_millis(rng.random_range(0..=max_delay_ms));
        let unit = SimUnit {
            tally: Rc::clone(&tally),
        };
        let handle = scheduler.run_unit(unit, move |_unit, bridge| {
            let reactor = bridge
                .reactor()
                .ok_or_else(|| anyhow::anyhow!("scheduler shut down"))?;
            let expected = token(index);
            let received = bridge.await_op(from_fn(move |c: Completion<u64>| {
                reactor.call_later(delay, Box::new(move || c.succeed(expected)));
            }))?;
            if received != expected {
                anyhow::bail!("unit {index} received {received:#x}, expected {expected:#x}");
            }
            Ok(Outcome::Finish)
        })?;
        handles.push(handle);
    }

    tracing::debug!(units, seed, "all units parked");
    event_loop.run_until(|| handles.iter().all(UnitHandle::is_finished));

    let stats = scheduler.stats();
    let (finished, failed) = (tally.finished.get(), tally.failed.get());
    println!(
        "simulated {} units in {:?} (seed {}): {} finished, {} failed, {} parks, {} resumes",
        units,
        started.elapsed(),
        seed,
        finished,
        failed,
        stats.parks,
        stats.resumes
    );
    Ok(finished == units && failed == 0 && stats.rejected_resumes == 0)
}
