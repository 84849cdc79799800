//! Schedule bounds.
//!
//! A bound is a predicate over a schedule prefix plus one proposed next
//! step; the DPOR scheduler refuses choices whose extended prefix falls
//! outside it. Bounding is what makes exploration of non-terminating or
//! exponentially-branching programs finish, at the cost of completeness
//! beyond the bound.

use crate::action::Lookahead;
use crate::trace::{Decision, TraceEntry};
use crate::types::ThreadId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The exploration bounds, combined when more than one is set.
///
/// The length bound is what guarantees termination for programs that can
/// run forever while staying fair and pre-emption-free (two threads
/// politely yielding to each other never trip the other two bounds).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    /// Maximum number of pre-emptive context switches per schedule.
    pub preemption: Option<u32>,
    /// Maximum difference in yield counts across threads.
    pub fair: Option<u32>,
    /// Maximum schedule length in steps.
    pub length: Option<u32>,
}

impl Default for Bounds {
    fn default() -> Self {
        Self {
            preemption: Some(Self::DEFAULT_PREEMPTION),
            fair: Some(Self::DEFAULT_FAIR),
            length: Some(Self::DEFAULT_LENGTH),
        }
    }
}

impl Bounds {
    /// The default pre-emption bound.
    pub const DEFAULT_PREEMPTION: u32 = 2;
    /// The default fair bound.
    pub const DEFAULT_FAIR: u32 = 5;
    /// The default length bound.
    pub const DEFAULT_LENGTH: u32 = 250;

    /// No bounding at all. Exploration only terminates for programs with
    /// finitely many schedules.
    pub const NONE: Self = Self {
        preemption: None,
        fair: None,
        length: None,
    };

    /// Bounds with only a pre-emption limit.
    #[must_use]
    pub const fn preemption_only(pb: u32) -> Self {
        Self {
            preemption: Some(pb),
            fair: None,
            length: None,
        }
    }

    /// Bounds with only a fairness limit.
    #[must_use]
    pub const fn fair_only(fb: u32) -> Self {
        Self {
            preemption: None,
            fair: Some(fb),
            length: None,
        }
    }

    /// True if the prefix extended by the proposed step stays in bound.
    #[must_use]
    pub fn admits(
        &self,
        prefix: &[TraceEntry],
        decision: Decision,
        chosen: ThreadId,
        lookahead: Lookahead,
    ) -> bool {
        if let Some(lb) = self.length {
            if prefix.len() >= lb as usize {
                return false;
            }
        }
        if let Some(pb) = self.preemption {
            if preemption_count(prefix, decision) > pb {
                return false;
            }
        }
        if let Some(fb) = self.fair {
            if yield_spread(prefix, chosen, lookahead) > fb {
                return false;
            }
        }
        true
    }
}

/// Counts pre-emptive switches in the prefix plus the proposed decision:
/// a `SwitchTo` whose displaced thread had not just yielded. Commit
/// pseudo-thread steps are transparent.
#[must_use]
pub fn preemption_count(prefix: &[TraceEntry], proposed: Decision) -> u32 {
    let mut count = 0;
    let mut prior_chosen = ThreadId::initial();
    let mut prior_real_yielded: Option<bool> = None;

    for entry in prefix {
        let tid = entry.decision.tid_of(prior_chosen);
        if !tid.is_commit() {
            if matches!(entry.decision, Decision::SwitchTo(_))
                && prior_real_yielded == Some(false)
            {
                count += 1;
            }
            prior_real_yielded = Some(entry.action.is_yield());
        }
        prior_chosen = tid;
    }

    let proposed_tid = proposed.tid_of(prior_chosen);
    if !proposed_tid.is_commit()
        && matches!(proposed, Decision::SwitchTo(_))
        && prior_real_yielded == Some(false)
    {
        count += 1;
    }
    count
}

/// The difference between the largest and smallest per-thread yield
/// counts over the prefix plus the proposed step.
#[must_use]
pub fn yield_spread(prefix: &[TraceEntry], chosen: ThreadId, lookahead: Lookahead) -> u32 {
    let mut yields: BTreeMap<ThreadId, u32> = BTreeMap::new();
    let mut prior_chosen = ThreadId::initial();

    for entry in prefix {
        let tid = entry.decision.tid_of(prior_chosen);
        prior_chosen = tid;
        if tid.is_commit() {
            continue;
        }
        let count = yields.entry(tid).or_insert(0);
        if entry.action.is_yield() {
            *count += 1;
        }
    }

    if !chosen.is_commit() {
        let count = yields.entry(chosen).or_insert(0);
        if lookahead == Lookahead::WillYield {
            *count += 1;
        }
    }

    let max = yields.values().max().copied().unwrap_or(0);
    let min = yields.values().min().copied().unwrap_or(0);
    max - min
}
