//! The scheduler interface and the non-systematic schedulers.
//!
//! The run loop consults a [`Scheduler`] at every step boundary, handing
//! it the trace so far, the previously chosen thread with its action, and
//! the sorted runnable list with one-step lookaheads. Returning `None`
//! aborts the execution with [`crate::types::Failure::Abort`].
//!
//! Systematic exploration drives the interpreter with the DPOR scheduler
//! in [`crate::explore`]; the schedulers here are for quick seed-driven
//! stress runs in the style of a seed-sweep explorer.

use crate::action::{Lookahead, ThreadAction};
use crate::trace::TraceEntry;
use crate::types::ThreadId;
use crate::util::DetRng;

/// Chooses which runnable thread to advance at each step.
pub trait Scheduler {
    /// Picks a thread from `runnable`, which is non-empty and sorted by
    /// thread id. `prior` is the previously chosen thread and the action
    /// it performed; `prefix` is the trace so far in chronological order.
    ///
    /// Returning `None` aborts the execution.
    fn schedule(
        &mut self,
        prefix: &[TraceEntry],
        prior: Option<(ThreadId, &ThreadAction)>,
        runnable: &[(ThreadId, Lookahead)],
    ) -> Option<ThreadId>;
}

/// A seed-driven scheduler: the same seed always produces the same
/// schedule for the same program.
#[derive(Debug, Clone)]
pub struct RandomScheduler {
    rng: DetRng,
}

impl RandomScheduler {
    /// Creates a random scheduler from a seed.
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self {
            rng: DetRng::new(seed),
        }
    }
}

impl Scheduler for RandomScheduler {
    fn schedule(
        &mut self,
        _prefix: &[TraceEntry],
        _prior: Option<(ThreadId, &ThreadAction)>,
        runnable: &[(ThreadId, Lookahead)],
    ) -> Option<ThreadId> {
        Some(self.rng.pick(runnable).0)
    }
}

/// Advances threads in cyclic id order.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundRobinScheduler;

impl RoundRobinScheduler {
    /// Creates a round-robin scheduler.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Scheduler for RoundRobinScheduler {
    fn schedule(
        &mut self,
        _prefix: &[TraceEntry],
        prior: Option<(ThreadId, &ThreadAction)>,
        runnable: &[(ThreadId, Lookahead)],
    ) -> Option<ThreadId> {
        let next = prior.and_then(|(tid, _)| runnable.iter().find(|(t, _)| *t > tid));
        Some(next.unwrap_or(&runnable[0]).0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runnable(ids: &[i64]) -> Vec<(ThreadId, Lookahead)> {
        ids.iter()
            .map(|n| (ThreadId::new_for_test(*n), Lookahead::WillYield))
            .collect()
    }

    #[test]
    fn random_scheduler_is_deterministic() {
        let r = runnable(&[0, 1, 2]);
        let mut a = RandomScheduler::new(7);
        let mut b = RandomScheduler::new(7);
        for _ in 0..50 {
            assert_eq!(a.schedule(&[], None, &r), b.schedule(&[], None, &r));
        }
    }

    #[test]
    fn round_robin_cycles() {
        let r = runnable(&[0, 1, 2]);
        let mut sched = RoundRobinScheduler::new();
        let first = sched.schedule(&[], None, &r).unwrap();
        assert_eq!(first, ThreadId::new_for_test(0));

        let second = sched
            .schedule(&[], Some((first, &ThreadAction::Yield)), &r)
            .unwrap();
        assert_eq!(second, ThreadId::new_for_test(1));

        let third = sched
            .schedule(
                &[],
                Some((ThreadId::new_for_test(2), &ThreadAction::Yield)),
                &r,
            )
            .unwrap();
        assert_eq!(third, ThreadId::new_for_test(0), "wraps to the lowest id");
    }
}
