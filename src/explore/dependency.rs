//! The dependence relation between steps of different threads.
//!
//! Two steps are *dependent* when swapping their order could change the
//! execution's outcome; only dependent pairs generate backtracking points.
//! The relation needs a little context beyond the two actions: which cells
//! currently have buffered writes (two operations on such a cell are
//! ordered through the buffer even when neither writes authoritatively),
//! and each thread's masking state (delivery of an asynchronous throw
//! depends on the target being interruptible). [`DepState`] tracks both,
//! updated once per executed step.

use crate::action::{Lookahead, ThreadAction};
use crate::types::{CRefId, MaskingState, ThreadId};
use std::collections::BTreeMap;

/// Dependence-relevant state, threaded through a trace step by step.
#[derive(Debug, Clone, Default)]
pub struct DepState {
    /// Pending buffered-write counts per (cell, writer).
    buffered: BTreeMap<(CRefId, ThreadId), u32>,
    /// Masking state per thread, defaulting to unmasked.
    masks: BTreeMap<ThreadId, MaskingState>,
}

impl DepState {
    /// Fresh state for the start of an execution.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one executed step into the state.
    pub fn update(&mut self, tid: ThreadId, action: &ThreadAction) {
        match action {
            ThreadAction::WriteCRef(r) => {
                *self.buffered.entry((*r, tid)).or_insert(0) += 1;
            }
            ThreadAction::CommitCRef(writer, r) => {
                if let Some(count) = self.buffered.get_mut(&(*r, *writer)) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        self.buffered.remove(&(*r, *writer));
                    }
                }
            }
            ThreadAction::Fork(child) => {
                self.masks.insert(*child, self.mask_of(tid));
            }
            ThreadAction::SetMasking(_, m) | ThreadAction::ResetMasking(_, m) => {
                self.masks.insert(tid, *m);
            }
            ThreadAction::Stop => {
                self.masks.remove(&tid);
            }
            _ => {}
        }
        // A synchronising action flushes the actor's buffer.
        if action.is_barrier() {
            self.buffered.retain(|(_, writer), _| *writer != tid);
        }
    }

    /// True if the cell has any pending buffered write.
    #[must_use]
    pub fn is_buffered(&self, cell: CRefId) -> bool {
        self.buffered
            .range((cell, ThreadId(i64::MIN))..=(cell, ThreadId(i64::MAX)))
            .any(|(_, count)| *count > 0)
    }

    /// The recorded masking state of a thread.
    #[must_use]
    pub fn mask_of(&self, tid: ThreadId) -> MaskingState {
        self.masks.get(&tid).copied().unwrap_or_default()
    }

    /// Whether a throw to `target` would be delivered, judging the target
    /// by the action it performed at the point under consideration.
    fn can_interrupt(&self, target: ThreadId, action: &ThreadAction) -> bool {
        match self.mask_of(target) {
            MaskingState::Unmasked => true,
            MaskingState::MaskedInterruptible => action.is_block(),
            MaskingState::MaskedUninterruptible => false,
        }
    }

    /// The lookahead variant of [`Self::can_interrupt`]: a predicted
    /// operation that may block counts as interruptible.
    fn can_interrupt_l(&self, target: ThreadId, lookahead: Lookahead) -> bool {
        match self.mask_of(target) {
            MaskingState::Unmasked => true,
            MaskingState::MaskedInterruptible => matches!(
                lookahead,
                Lookahead::WillPutMVar(_)
                    | Lookahead::WillReadMVar(_)
                    | Lookahead::WillTakeMVar(_)
                    | Lookahead::WillStm
                    | Lookahead::WillThrowTo(_)
            ),
            MaskingState::MaskedUninterruptible => false,
        }
    }
}

/// Decides dependence between two executed steps of different threads.
#[must_use]
pub fn dependent(
    state: &DepState,
    (t1, a1): (ThreadId, &ThreadAction),
    (t2, a2): (ThreadId, &ThreadAction),
) -> bool {
    if t1 == t2 {
        return false;
    }

    // Asynchronous throws are dependent with whatever the (currently
    // interruptible) target does.
    if let ThreadAction::ThrowTo(target) = a1 {
        if *target == t2 && state.can_interrupt(t2, a2) {
            return true;
        }
    }
    if let ThreadAction::ThrowTo(target) = a2 {
        if *target == t1 && state.can_interrupt(t1, a1) {
            return true;
        }
    }

    // Creating a thread is dependent with anything that thread does.
    if a1.thread_affected() == Some(t2) && matches!(a1, ThreadAction::Fork(_)) {
        return true;
    }
    if a2.thread_affected() == Some(t1) && matches!(a2, ThreadAction::Fork(_)) {
        return true;
    }

    // A pending commit is ordered against its writer's barriers: the
    // barrier flushes the very write the commit step would settle.
    if let ThreadAction::CommitCRef(writer, _) = a1 {
        if *writer == t2 && a2.is_barrier() {
            return true;
        }
    }
    if let ThreadAction::CommitCRef(writer, _) = a2 {
        if *writer == t1 && a1.is_barrier() {
            return true;
        }
    }

    // Same MVar, except two non-blocking attempts that both failed.
    if let (Some(m1), Some(m2)) = (a1.mvar_of(), a2.mvar_of()) {
        if m1 == m2 {
            return !(a1.is_failed_try() && a2.is_failed_try());
        }
    }

    // Same CRef with a write on either side, or any operation on a cell
    // whose buffered writes impose an order.
    if let (Some(r1), Some(r2)) = (a1.cref_of(), a2.cref_of()) {
        if r1 == r2 {
            return a1.cref_writes() || a2.cref_writes() || state.is_buffered(r1);
        }
    }

    // Transactions conflict when one writes a cell the other touches.
    if let (Some((touched1, written1)), Some((touched2, written2))) = (a1.tvars(), a2.tvars()) {
        return !written1.is_disjoint(&touched2) || !written2.is_disjoint(&touched1);
    }

    false
}

/// Decides dependence between an executed step and a predicted one,
/// conservatively where the prediction's exact parameters are unknown.
#[must_use]
pub fn dependent_lookahead(
    state: &DepState,
    (t1, a1): (ThreadId, &ThreadAction),
    (t2, l2): (ThreadId, Lookahead),
) -> bool {
    if t1 == t2 {
        return false;
    }

    if let ThreadAction::ThrowTo(target) = a1 {
        if *target == t2 && state.can_interrupt_l(t2, l2) {
            return true;
        }
    }
    if let Lookahead::WillThrowTo(target) = l2 {
        if target == t1 && state.can_interrupt(t1, a1) {
            return true;
        }
    }

    if matches!(a1, ThreadAction::Fork(child) if *child == t2) {
        return true;
    }

    if let ThreadAction::CommitCRef(writer, _) = a1 {
        if *writer == t2 && l2.is_barrier() {
            return true;
        }
    }
    if let Lookahead::WillCommitCRef(writer, _) = l2 {
        if writer == t1 && a1.is_barrier() {
            return true;
        }
    }

    if let (Some(m1), Some(m2)) = (a1.mvar_of(), l2.mvar_of()) {
        if m1 == m2 {
            // The prediction cannot know whether a try would fail.
            return true;
        }
    }

    if let (Some(r1), Some(r2)) = (a1.cref_of(), l2.cref_of()) {
        if r1 == r2 {
            return a1.cref_writes() || l2.cref_writes() || state.is_buffered(r1);
        }
    }

    // A predicted transaction's cells are unknown; assume conflict with
    // any transactional step.
    if l2.is_stm() && a1.tvars().is_some() {
        return true;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::stm::TAction;
    use crate::types::{MVarId, TVarId};

    fn t(n: i64) -> ThreadId {
        ThreadId::new_for_test(n)
    }

    fn r(n: u64) -> CRefId {
        CRefId::new_for_test(n)
    }

    #[test]
    fn same_thread_is_never_dependent() {
        let state = DepState::new();
        let a = ThreadAction::WriteCRef(r(0));
        assert!(!dependent(&state, (t(1), &a), (t(1), &a)));
    }

    #[test]
    fn cref_read_read_independent_without_buffering() {
        let state = DepState::new();
        let a = ThreadAction::ReadCRef(r(0));
        assert!(!dependent(&state, (t(1), &a), (t(2), &a)));
    }

    #[test]
    fn cref_read_write_dependent() {
        let state = DepState::new();
        let read = ThreadAction::ReadCRef(r(0));
        let write = ThreadAction::WriteCRef(r(0));
        assert!(dependent(&state, (t(1), &read), (t(2), &write)));
        assert!(dependent(&state, (t(1), &write), (t(2), &read)));
    }

    #[test]
    fn buffered_cell_makes_reads_dependent() {
        let mut state = DepState::new();
        state.update(t(3), &ThreadAction::WriteCRef(r(0)));
        let read = ThreadAction::ReadCRef(r(0));
        assert!(dependent(&state, (t(1), &read), (t(2), &read)));

        state.update(t(3), &ThreadAction::CommitCRef(t(3), r(0)));
        assert!(!dependent(&state, (t(1), &read), (t(2), &read)));
    }

    #[test]
    fn barrier_clears_actor_buffering_only() {
        let mut state = DepState::new();
        state.update(t(1), &ThreadAction::WriteCRef(r(0)));
        state.update(t(2), &ThreadAction::WriteCRef(r(1)));
        state.update(t(1), &ThreadAction::PutMVar(MVarId::new_for_test(0), vec![]));
        assert!(!state.is_buffered(r(0)));
        assert!(state.is_buffered(r(1)));
    }

    #[test]
    fn mvar_failed_tries_independent() {
        let state = DepState::new();
        let m = MVarId::new_for_test(0);
        let failed = ThreadAction::TryTakeMVar(m, false, vec![]);
        let succeeded = ThreadAction::TryPutMVar(m, true, vec![]);
        assert!(!dependent(&state, (t(1), &failed), (t(2), &failed.clone())));
        assert!(dependent(&state, (t(1), &failed), (t(2), &succeeded)));
    }

    #[test]
    fn throw_to_depends_on_mask() {
        let mut state = DepState::new();
        let throw = ThreadAction::ThrowTo(t(2));
        let yield_ = ThreadAction::Yield;
        assert!(dependent(&state, (t(1), &throw), (t(2), &yield_)));

        state.update(
            t(2),
            &ThreadAction::SetMasking(false, MaskingState::MaskedUninterruptible),
        );
        assert!(!dependent(&state, (t(1), &throw), (t(2), &yield_)));
    }

    #[test]
    fn commit_depends_on_writer_barrier() {
        let state = DepState::new();
        let commit = ThreadAction::CommitCRef(t(1), r(0));
        let barrier = ThreadAction::PutMVar(MVarId::new_for_test(0), vec![]);
        let c = ThreadId::new_for_test(-5);

        assert!(dependent(&state, (c, &commit), (t(1), &barrier)));
        assert!(
            !dependent(&state, (c, &commit), (t(2), &barrier)),
            "another thread's barrier leaves the buffer alone"
        );
        assert!(dependent_lookahead(
            &state,
            (t(1), &barrier),
            (c, Lookahead::WillCommitCRef(t(1), r(0))),
        ));
    }

    #[test]
    fn stm_write_overlap_dependent() {
        let state = DepState::new();
        let v = TVarId::new_for_test(0);
        let writer = ThreadAction::Stm(vec![TAction::Write(v)], vec![]);
        let reader = ThreadAction::Stm(vec![TAction::Read(v)], vec![]);
        let other = ThreadAction::Stm(vec![TAction::Read(TVarId::new_for_test(1))], vec![]);
        assert!(dependent(&state, (t(1), &writer), (t(2), &reader)));
        assert!(!dependent(&state, (t(1), &reader), (t(2), &reader.clone())));
        assert!(!dependent(&state, (t(1), &writer), (t(2), &other)));
    }

    #[test]
    fn dependence_is_symmetric() {
        let state = DepState::new();
        let m = MVarId::new_for_test(0);
        let actions = [
            ThreadAction::ReadCRef(r(0)),
            ThreadAction::WriteCRef(r(0)),
            ThreadAction::PutMVar(m, vec![]),
            ThreadAction::TakeMVar(m, vec![]),
            ThreadAction::Yield,
            ThreadAction::ThrowTo(t(2)),
        ];
        for a1 in &actions {
            for a2 in &actions {
                assert_eq!(
                    dependent(&state, (t(1), a1), (t(2), a2)),
                    dependent(&state, (t(2), a2), (t(1), a1)),
                    "asymmetric for {a1:?} / {a2:?}"
                );
            }
        }
    }

    #[test]
    fn lookahead_mvar_is_conservative() {
        let state = DepState::new();
        let m = MVarId::new_for_test(0);
        let failed = ThreadAction::TryTakeMVar(m, false, vec![]);
        assert!(dependent_lookahead(
            &state,
            (t(1), &failed),
            (t(2), Lookahead::WillTryPutMVar(m)),
        ));
    }
}
