//! The prefix-replaying, sleep-set-aware scheduler that drives each
//! exploration run.
//!
//! The scheduler replays its prefix verbatim, then schedules greedily:
//! stick with the prior thread unless it yielded, push yielders to the
//! back, keep daemon threads alive ahead of a program-terminating stop,
//! filter by the bound, and drop choices the sleep set marks as already
//! covered. Two flags classify an aborted run: `bound_kill` (every choice
//! was out of bounds; the trace still matters for backtracking) and
//! `ignore` (every in-bound choice was asleep; the run is redundant and
//! is discarded).

use crate::action::{Lookahead, ThreadAction};
use crate::explore::bounds::Bounds;
use crate::explore::dependency::{dependent, DepState};
use crate::explore::dpor::SchedulePrefix;
use crate::sched::Scheduler;
use crate::trace::{decision_of, TraceEntry};
use crate::types::ThreadId;
use std::collections::{BTreeMap, VecDeque};

/// The scheduler for one systematic execution.
#[derive(Debug)]
pub struct DporScheduler {
    prefix: VecDeque<ThreadId>,
    sleep: BTreeMap<ThreadId, ThreadAction>,
    dep_state: DepState,
    bounds: Bounds,
    ignore: bool,
    bound_kill: bool,
}

impl DporScheduler {
    /// Builds the scheduler for one extracted prefix.
    #[must_use]
    pub fn new(schedule: SchedulePrefix, bounds: Bounds) -> Self {
        Self {
            prefix: schedule.prefix.into(),
            sleep: schedule.sleep,
            dep_state: DepState::new(),
            bounds,
            ignore: false,
            bound_kill: false,
        }
    }

    /// True when the run was abandoned because every in-bound choice was
    /// suppressed by the sleep set.
    #[must_use]
    pub const fn ignored(&self) -> bool {
        self.ignore
    }

    /// True when the run was cut off because every choice fell outside
    /// the bound.
    #[must_use]
    pub const fn bound_killed(&self) -> bool {
        self.bound_kill
    }
}

impl Scheduler for DporScheduler {
    fn schedule(
        &mut self,
        prefix_trace: &[TraceEntry],
        prior: Option<(ThreadId, &ThreadAction)>,
        runnable: &[(ThreadId, Lookahead)],
    ) -> Option<ThreadId> {
        let replaying = !self.prefix.is_empty();
        if let Some((ptid, paction)) = prior {
            self.dep_state.update(ptid, paction);
            if !replaying {
                // Past the divergence point: an executed action frees any
                // sleeper that depends on it.
                let state = &self.dep_state;
                self.sleep
                    .retain(|t, a| !dependent(state, (ptid, paction), (*t, a)));
            }
        }

        if let Some(next) = self.prefix.pop_front() {
            return Some(next);
        }

        let candidates = initialise(prior, runnable);

        let prior_tid = prior.map(|(t, _)| t);
        let prior_still_runnable =
            prior_tid.is_some_and(|p| runnable.iter().any(|(t, _)| *t == p));
        let in_bound: Vec<(ThreadId, Lookahead)> = candidates
            .into_iter()
            .filter(|(tid, lookahead)| {
                let decision = decision_of(prior_tid, prior_still_runnable, *tid);
                self.bounds
                    .admits(prefix_trace, decision, *tid, *lookahead)
            })
            .collect();
        if in_bound.is_empty() {
            self.bound_kill = true;
            return None;
        }

        let awake: Vec<&(ThreadId, Lookahead)> = in_bound
            .iter()
            .filter(|(tid, _)| !self.sleep.contains_key(tid))
            .collect();
        if awake.is_empty() {
            self.ignore = true;
            return None;
        }

        Some(awake[0].0)
    }
}

/// Orders the candidate set: prior thread first unless it yielded,
/// yielders last, and daemon threads ahead of a stop that would
/// terminate the program.
fn initialise(
    prior: Option<(ThreadId, &ThreadAction)>,
    runnable: &[(ThreadId, Lookahead)],
) -> Vec<(ThreadId, Lookahead)> {
    let prior_yielded = prior.is_some_and(|(_, a)| a.is_yield());

    let mut candidates: Vec<(ThreadId, Lookahead)> = match prior {
        Some((ptid, paction)) if !paction.is_yield() => {
            match runnable.iter().find(|(t, _)| *t == ptid) {
                Some(entry) => vec![*entry],
                None => runnable.to_vec(),
            }
        }
        _ => runnable.to_vec(),
    };

    // Yielders (and a prior thread that just yielded) go last.
    candidates.sort_by_key(|(tid, lookahead)| {
        *lookahead == Lookahead::WillYield || (prior_yielded && prior.map(|(t, _)| t) == Some(*tid))
    });

    // If stopping the initial thread would kill live daemons, give the
    // daemons their turn first.
    let stops_program = |&(tid, lookahead): &(ThreadId, Lookahead)| {
        tid == ThreadId::initial() && lookahead == Lookahead::WillStop
    };
    if candidates.iter().any(stops_program) && runnable.len() > 1 {
        let mut daemons: Vec<(ThreadId, Lookahead)> = runnable
            .iter()
            .filter(|(t, _)| *t != ThreadId::initial())
            .copied()
            .collect();
        daemons.sort_by_key(|(_, lookahead)| *lookahead == Lookahead::WillYield);
        daemons.extend(runnable.iter().filter(|(t, _)| *t == ThreadId::initial()));
        return daemons;
    }

    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(n: i64) -> ThreadId {
        ThreadId::new_for_test(n)
    }

    fn prefix(threads: &[i64]) -> SchedulePrefix {
        SchedulePrefix {
            prefix: threads.iter().map(|n| t(*n)).collect(),
            conservative: false,
            sleep: BTreeMap::new(),
        }
    }

    fn runnable(ids: &[i64]) -> Vec<(ThreadId, Lookahead)> {
        ids.iter().map(|n| (t(*n), Lookahead::WillReturn)).collect()
    }

    #[test]
    fn replays_the_prefix_verbatim() {
        let mut sched = DporScheduler::new(prefix(&[0, 1, 0]), Bounds::NONE);
        let r = runnable(&[0, 1]);
        assert_eq!(sched.schedule(&[], None, &r), Some(t(0)));
        assert_eq!(
            sched.schedule(&[], Some((t(0), &ThreadAction::Return)), &r),
            Some(t(1))
        );
        assert_eq!(
            sched.schedule(&[], Some((t(1), &ThreadAction::Return)), &r),
            Some(t(0))
        );
    }

    #[test]
    fn sticks_with_the_prior_thread() {
        let mut sched = DporScheduler::new(prefix(&[]), Bounds::NONE);
        let r = runnable(&[0, 1, 2]);
        let chosen = sched
            .schedule(&[], Some((t(1), &ThreadAction::Return)), &r)
            .unwrap();
        assert_eq!(chosen, t(1));
    }

    #[test]
    fn moves_on_after_a_yield() {
        let mut sched = DporScheduler::new(prefix(&[]), Bounds::NONE);
        let r = vec![
            (t(0), Lookahead::WillReturn),
            (t(1), Lookahead::WillYield),
        ];
        let chosen = sched
            .schedule(&[], Some((t(1), &ThreadAction::Yield)), &r)
            .unwrap();
        assert_eq!(chosen, t(0), "the yielder goes to the back");
    }

    #[test]
    fn daemons_run_before_a_terminating_stop() {
        let mut sched = DporScheduler::new(prefix(&[]), Bounds::NONE);
        let r = vec![
            (ThreadId::initial(), Lookahead::WillStop),
            (t(1), Lookahead::WillReturn),
        ];
        let chosen = sched
            .schedule(&[], Some((ThreadId::initial(), &ThreadAction::Return)), &r)
            .unwrap();
        assert_eq!(chosen, t(1));
    }

    #[test]
    fn sleeping_choices_are_skipped() {
        let mut sleep = BTreeMap::new();
        sleep.insert(t(0), ThreadAction::Return);
        let schedule = SchedulePrefix {
            prefix: vec![],
            conservative: false,
            sleep,
        };
        let mut sched = DporScheduler::new(schedule, Bounds::NONE);
        let r = runnable(&[0, 1]);
        // No prior: the full candidate list is considered; T0 is asleep.
        assert_eq!(sched.schedule(&[], None, &r), Some(t(1)));
        assert!(!sched.ignored());
    }

    #[test]
    fn all_asleep_flags_ignore() {
        let mut sleep = BTreeMap::new();
        sleep.insert(t(0), ThreadAction::Return);
        let schedule = SchedulePrefix {
            prefix: vec![],
            conservative: false,
            sleep,
        };
        let mut sched = DporScheduler::new(schedule, Bounds::NONE);
        let r = runnable(&[0]);
        assert_eq!(sched.schedule(&[], None, &r), None);
        assert!(sched.ignored());
        assert!(!sched.bound_killed());
    }

    #[test]
    fn out_of_bound_flags_bound_kill() {
        let mut sched = DporScheduler::new(prefix(&[]), Bounds::fair_only(0));
        let entries = vec![
            TraceEntry {
                decision: crate::trace::Decision::Start(ThreadId::initial()),
                runnable: runnable(&[0, 1]),
                action: ThreadAction::Return,
            },
            TraceEntry {
                decision: crate::trace::Decision::SwitchTo(t(1)),
                runnable: runnable(&[0, 1]),
                action: ThreadAction::Yield,
            },
        ];
        // Only the spinner is runnable, and choosing it again breaks the
        // fair bound.
        let r = vec![(t(1), Lookahead::WillYield)];
        let chosen = sched.schedule(&entries, Some((t(1), &ThreadAction::Yield)), &r);
        assert_eq!(chosen, None);
        assert!(sched.bound_killed());
    }

    #[test]
    fn dependent_action_wakes_sleeper() {
        let r0 = crate::types::CRefId::new_for_test(0);
        let mut sleep = BTreeMap::new();
        sleep.insert(t(1), ThreadAction::WriteCRef(r0));
        let schedule = SchedulePrefix {
            prefix: vec![],
            conservative: false,
            sleep,
        };
        let mut sched = DporScheduler::new(schedule, Bounds::NONE);
        let r = runnable(&[1]);
        // A dependent write by T0 frees the sleeping entry for T1.
        let write = ThreadAction::WriteCRef(r0);
        assert_eq!(sched.schedule(&[], Some((t(0), &write)), &r), Some(t(1)));
    }
}
