//! Backtracking-point computation over a completed trace.
//!
//! After an execution, each step is revisited: for every thread that was
//! runnable-but-not-chosen there, each prior thread's latest step its
//! pending operation depends on becomes a backtracking point: a place
//! where exploring that thread instead may reach a different equivalence
//! class. Bound-specific
//! adjustments are layered on top: the pre-emption bound plants an extra
//! *conservative* point before the previous context switch (the bound
//! introduces artificial dependencies that plain DPOR would miss), and the
//! fair bound widens release operations to all runnable threads.

use crate::action::{Lookahead, ThreadAction};
use crate::explore::bounds::Bounds;
use crate::explore::dependency::{dependent_lookahead, DepState};
use crate::trace::{Decision, TraceEntry};
use crate::types::ThreadId;
use std::collections::BTreeMap;

/// One trace step annotated for backtracking.
#[derive(Debug, Clone)]
pub struct BacktrackStep {
    /// The thread that acted.
    pub thread: ThreadId,
    /// How it was chosen.
    pub decision: Decision,
    /// What it did.
    pub action: ThreadAction,
    /// The runnable snapshot at this step.
    pub runnable: Vec<(ThreadId, Lookahead)>,
    /// Alternatives to explore from this step; the flag marks
    /// conservatively-added entries.
    pub backtracks: BTreeMap<ThreadId, bool>,
    /// Dependence state *after* this step.
    pub dep_state: DepState,
}

impl BacktrackStep {
    fn is_runnable(&self, tid: ThreadId) -> bool {
        self.runnable.iter().any(|(t, _)| *t == tid)
    }
}

/// Walks a completed trace and computes every backtracking point.
///
/// `bound_kill` marks an execution the scheduler cut off because every
/// remaining choice was out of bounds; its final step is then treated as
/// dependent with everything, so the alternatives are not lost.
#[must_use]
pub fn find_backtrack_steps(
    bounds: &Bounds,
    bound_kill: bool,
    trace: &[TraceEntry],
) -> Vec<BacktrackStep> {
    let mut steps: Vec<BacktrackStep> = Vec::with_capacity(trace.len());
    let mut state = DepState::new();
    let mut prior = ThreadId::initial();

    for (j, entry) in trace.iter().enumerate() {
        let tid = entry.decision.tid_of(prior);
        prior = tid;
        state.update(tid, &entry.action);
        steps.push(BacktrackStep {
            thread: tid,
            decision: entry.decision,
            action: entry.action.clone(),
            runnable: entry.runnable.clone(),
            backtracks: BTreeMap::new(),
            dep_state: state.clone(),
        });

        let kills_early = bound_kill && j == trace.len() - 1;

        for (u, n) in &entry.runnable {
            if *u == tid {
                continue;
            }
            // The latest dependent step of each other thread (this one
            // included: a blocked attempt races the operation that will
            // overtake it) becomes a backtracking point targeting `u`.
            let mut latest: BTreeMap<ThreadId, usize> = BTreeMap::new();
            for (i, step) in steps.iter().enumerate() {
                let v = step.thread;
                if v == *u {
                    continue;
                }
                if kills_early
                    || dependent_lookahead(&step.dep_state, (v, &step.action), (*u, *n))
                {
                    latest.insert(v, i);
                }
            }
            for i in latest.into_values() {
                apply_backtrack(bounds, &mut steps, i, *u);
            }
        }
    }

    steps
}

/// Inserts a backtracking point, applying the active bounds' adjustments.
fn apply_backtrack(bounds: &Bounds, steps: &mut [BacktrackStep], i: usize, tid: ThreadId) {
    let release = bounds.fair.is_some()
        && steps[i]
            .runnable
            .iter()
            .find(|(t, _)| *t == tid)
            .is_some_and(|(_, l)| l.will_release());

    if release {
        // A release operation interacts with fairness bookkeeping in ways
        // the dependency relation does not see; widen to every choice.
        let all: Vec<ThreadId> = steps[i].runnable.iter().map(|(t, _)| *t).collect();
        for t in all {
            backtrack_at(steps, i, t, false);
        }
    } else {
        backtrack_at(steps, i, tid, false);
    }

    if bounds.preemption.is_some() {
        conservative_backtrack(steps, i, tid);
    }
}

/// Inserts `tid` into the backtrack set at step `i`, widening to all
/// runnable threads when `tid` is not runnable there. An existing
/// non-conservative entry is upgraded when the new point is conservative.
pub(crate) fn backtrack_at(
    steps: &mut [BacktrackStep],
    i: usize,
    tid: ThreadId,
    conservative: bool,
) {
    if !steps[i].is_runnable(tid) {
        let all: Vec<ThreadId> = steps[i].runnable.iter().map(|(t, _)| *t).collect();
        for t in all {
            insert_point(&mut steps[i].backtracks, t, conservative);
        }
        return;
    }
    insert_point(&mut steps[i].backtracks, tid, conservative);
}

fn insert_point(backtracks: &mut BTreeMap<ThreadId, bool>, tid: ThreadId, conservative: bool) {
    backtracks
        .entry(tid)
        .and_modify(|existing| {
            if conservative && !*existing {
                *existing = true;
            }
        })
        .or_insert(conservative);
}

/// Plants a conservative point at the nearest earlier context switch:
/// scanning back from `i - 1`, the closest index whose thread differs
/// from its predecessor's with neither step a commit.
fn conservative_backtrack(steps: &mut [BacktrackStep], i: usize, tid: ThreadId) {
    for i2 in (1..=i.saturating_sub(1)).rev() {
        let switched = steps[i2].thread != steps[i2 - 1].thread;
        let commit = matches!(steps[i2].action, ThreadAction::CommitCRef(..))
            || matches!(steps[i2 - 1].action, ThreadAction::CommitCRef(..));
        if switched && !commit {
            backtrack_at(steps, i2, tid, true);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CRefId;

    fn t(n: i64) -> ThreadId {
        ThreadId::new_for_test(n)
    }

    fn r(n: u64) -> CRefId {
        CRefId::new_for_test(n)
    }

    fn entry(
        decision: Decision,
        runnable: Vec<(ThreadId, Lookahead)>,
        action: ThreadAction,
    ) -> TraceEntry {
        TraceEntry {
            decision,
            runnable,
            action,
        }
    }

    /// T0 writes while T1 (a runnable writer of the same cell) waits: the
    /// write step must gain a backtracking point for T1.
    #[test]
    fn conflicting_write_generates_point() {
        let trace = vec![
            entry(
                Decision::Start(t(0)),
                vec![
                    (t(0), Lookahead::WillWriteCRef(r(0))),
                    (t(1), Lookahead::WillWriteCRef(r(0))),
                ],
                ThreadAction::WriteCRef(r(0)),
            ),
            entry(
                Decision::Continue,
                vec![
                    (t(0), Lookahead::WillStop),
                    (t(1), Lookahead::WillWriteCRef(r(0))),
                ],
                ThreadAction::Stop,
            ),
        ];
        let steps = find_backtrack_steps(&Bounds::NONE, false, &trace);
        assert_eq!(steps[0].backtracks.get(&t(1)), Some(&false));
    }

    /// Independent operations generate no points.
    #[test]
    fn independent_steps_generate_no_points() {
        let trace = vec![
            entry(
                Decision::Start(t(0)),
                vec![
                    (t(0), Lookahead::WillWriteCRef(r(0))),
                    (t(1), Lookahead::WillWriteCRef(r(1))),
                ],
                ThreadAction::WriteCRef(r(0)),
            ),
            entry(
                Decision::SwitchTo(t(1)),
                vec![
                    (t(0), Lookahead::WillStop),
                    (t(1), Lookahead::WillWriteCRef(r(1))),
                ],
                ThreadAction::WriteCRef(r(1)),
            ),
        ];
        let steps = find_backtrack_steps(&Bounds::NONE, false, &trace);
        assert!(steps.iter().all(|s| s.backtracks.is_empty()));
    }

    /// A bound-killed final step is dependent with everything.
    #[test]
    fn bound_kill_backtracks_final_step() {
        let trace = vec![
            entry(
                Decision::Start(t(0)),
                vec![(t(0), Lookahead::WillYield), (t(1), Lookahead::WillYield)],
                ThreadAction::Yield,
            ),
            entry(
                Decision::Continue,
                vec![(t(0), Lookahead::WillYield), (t(1), Lookahead::WillYield)],
                ThreadAction::Yield,
            ),
        ];
        let steps = find_backtrack_steps(&Bounds::NONE, true, &trace);
        assert!(steps[1].backtracks.contains_key(&t(1)));
    }

    #[test]
    fn backtrack_widens_when_target_not_runnable() {
        let trace = vec![entry(
            Decision::Start(t(0)),
            vec![(t(0), Lookahead::WillReturn), (t(2), Lookahead::WillReturn)],
            ThreadAction::Return,
        )];
        let mut steps = find_backtrack_steps(&Bounds::NONE, false, &trace);
        backtrack_at(&mut steps, 0, t(9), false);
        assert!(steps[0].backtracks.contains_key(&t(0)));
        assert!(steps[0].backtracks.contains_key(&t(2)));
    }

    #[test]
    fn conservative_upgrade_keeps_strongest() {
        let mut backtracks = BTreeMap::new();
        insert_point(&mut backtracks, t(1), false);
        insert_point(&mut backtracks, t(1), true);
        assert_eq!(backtracks.get(&t(1)), Some(&true));

        insert_point(&mut backtracks, t(1), false);
        assert_eq!(backtracks.get(&t(1)), Some(&true), "never downgraded");
    }

    /// With a pre-emption bound active, an ordinary point also plants a
    /// conservative one at the previous context switch.
    #[test]
    fn preemption_bound_adds_conservative_point() {
        let all_three = vec![
            (t(0), Lookahead::WillWriteCRef(r(0))),
            (t(1), Lookahead::WillWriteCRef(r(0))),
            (t(2), Lookahead::WillReturn),
        ];
        let trace = vec![
            entry(Decision::Start(t(2)), all_three.clone(), ThreadAction::Return),
            entry(Decision::SwitchTo(t(0)), all_three.clone(), ThreadAction::Return),
            entry(
                Decision::Continue,
                all_three,
                ThreadAction::WriteCRef(r(0)),
            ),
        ];
        let steps = find_backtrack_steps(&Bounds::preemption_only(2), false, &trace);
        // The write at index 2 conflicts with T1's pending write, and the
        // nearest context switch before it is at index 1: the ordinary
        // point lands at the write, the conservative one at the switch.
        assert_eq!(steps[2].backtracks.get(&t(1)), Some(&false));
        assert_eq!(steps[1].backtracks.get(&t(1)), Some(&true));
    }
}
