//! The simulated thread table and blocking model.

use crate::action::{Action, Exception};
use crate::types::{CRefId, MVarId, MaskingState, TVarId, ThreadId};
use std::collections::{BTreeMap, BTreeSet};

/// Why a thread is suspended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    /// Waiting for an `MVar` to empty so a put can complete.
    OnMVarFull(MVarId),
    /// Waiting for an `MVar` to fill so a read or take can complete.
    OnMVarEmpty(MVarId),
    /// Waiting for any of the watched transactional cells to change.
    OnTVar(BTreeSet<TVarId>),
    /// Waiting for the target thread to become interruptible.
    OnMask(ThreadId),
}

/// A rendezvous or shared cell a thread has touched, tracked for the fair
/// bound's release classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum KnownRef {
    /// A rendezvous variable.
    MVar(MVarId),
    /// A shared cell.
    CRef(CRefId),
}

/// One installed exception handler.
///
/// `accept` returns `None` when the handler declines the exception's type;
/// `saved_mask` is restored on the thread when the handler runs, matching
/// the masking state at installation.
pub(crate) struct Handler {
    pub(crate) accept: Box<dyn FnOnce(Exception) -> Option<Action>>,
    pub(crate) saved_mask: MaskingState,
}

/// The state of one simulated thread.
pub(crate) struct ThreadRecord {
    /// The next action this thread will execute.
    pub(crate) continuation: Action,
    /// Why the thread is suspended, if it is.
    pub(crate) blocking: Option<BlockReason>,
    /// The thread's asynchronous-exception masking state.
    pub(crate) masking: MaskingState,
    /// Installed exception handlers, innermost last.
    pub(crate) handlers: Vec<Handler>,
    /// Cells this thread has touched.
    pub(crate) known: BTreeSet<KnownRef>,
}

impl ThreadRecord {
    fn new(continuation: Action, masking: MaskingState) -> Self {
        Self {
            continuation,
            blocking: None,
            masking,
            handlers: Vec::new(),
            known: BTreeSet::new(),
        }
    }

    /// The shared interruptibility predicate: unmasked threads always, and
    /// interruptibly-masked threads while blocked on an interruptible
    /// primitive. Every [`BlockReason`] counts as interruptible.
    pub(crate) fn is_interruptible(&self) -> bool {
        match self.masking {
            MaskingState::Unmasked => true,
            MaskingState::MaskedInterruptible => self.blocking.is_some(),
            MaskingState::MaskedUninterruptible => false,
        }
    }
}

impl std::fmt::Debug for ThreadRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadRecord")
            .field("blocking", &self.blocking)
            .field("masking", &self.masking)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// The thread table of one execution.
#[derive(Debug, Default)]
pub(crate) struct Threads {
    records: BTreeMap<ThreadId, ThreadRecord>,
}

impl Threads {
    /// Creates a table holding only the initial thread.
    pub(crate) fn new(initial: Action) -> Self {
        let mut records = BTreeMap::new();
        records.insert(
            ThreadId::initial(),
            ThreadRecord::new(initial, MaskingState::Unmasked),
        );
        Self { records }
    }

    /// Installs a forked thread inheriting the parent's masking state.
    pub(crate) fn fork(&mut self, id: ThreadId, body: Action, masking: MaskingState) {
        self.records.insert(id, ThreadRecord::new(body, masking));
    }

    pub(crate) fn get(&self, id: ThreadId) -> Option<&ThreadRecord> {
        self.records.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: ThreadId) -> Option<&mut ThreadRecord> {
        self.records.get_mut(&id)
    }

    pub(crate) fn contains(&self, id: ThreadId) -> bool {
        self.records.contains_key(&id)
    }

    /// Removes a finished or killed thread.
    pub(crate) fn remove(&mut self, id: ThreadId) -> Option<ThreadRecord> {
        self.records.remove(&id)
    }

    /// Ids of every unblocked thread, in id order.
    pub(crate) fn runnable(&self) -> Vec<ThreadId> {
        self.records
            .iter()
            .filter(|(_, r)| r.blocking.is_none())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Suspends a thread.
    pub(crate) fn block(&mut self, id: ThreadId, reason: BlockReason) {
        if let Some(record) = self.records.get_mut(&id) {
            record.blocking = Some(reason);
        }
    }

    /// Resumes a thread, leaving its continuation to re-attempt whatever
    /// it was blocked on.
    pub(crate) fn wake(&mut self, id: ThreadId) {
        if let Some(record) = self.records.get_mut(&id) {
            record.blocking = None;
        }
    }

    /// Wakes every thread blocked on the target's mask, returning them.
    pub(crate) fn wake_on_mask(&mut self, target: ThreadId) -> Vec<ThreadId> {
        let woken: Vec<ThreadId> = self
            .records
            .iter()
            .filter(|(_, r)| r.blocking == Some(BlockReason::OnMask(target)))
            .map(|(id, _)| *id)
            .collect();
        for id in &woken {
            self.wake(*id);
        }
        woken
    }

    /// Wakes every thread watching any of the written transactional
    /// cells, returning them.
    pub(crate) fn wake_on_tvars(&mut self, written: &BTreeSet<TVarId>) -> Vec<ThreadId> {
        let woken: Vec<ThreadId> = self
            .records
            .iter()
            .filter(|(_, r)| match &r.blocking {
                Some(BlockReason::OnTVar(watched)) => !watched.is_disjoint(written),
                _ => false,
            })
            .map(|(id, _)| *id)
            .collect();
        for id in &woken {
            self.wake(*id);
        }
        woken
    }

    /// Iterates over all records in id order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (ThreadId, &ThreadRecord)> {
        self.records.iter().map(|(id, r)| (*id, r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Threads {
        Threads::new(Action::Stop)
    }

    fn t(n: i64) -> ThreadId {
        ThreadId::new_for_test(n)
    }

    #[test]
    fn initial_thread_is_runnable() {
        let threads = table();
        assert_eq!(threads.runnable(), vec![ThreadId::initial()]);
    }

    #[test]
    fn blocked_threads_are_not_runnable() {
        let mut threads = table();
        threads.fork(t(1), Action::Stop, MaskingState::Unmasked);
        threads.block(t(1), BlockReason::OnMVarEmpty(MVarId::new_for_test(0)));
        assert_eq!(threads.runnable(), vec![ThreadId::initial()]);
        threads.wake(t(1));
        assert_eq!(threads.runnable().len(), 2);
    }

    #[test]
    fn interruptibility_predicate() {
        let mut threads = table();
        threads.fork(t(1), Action::Stop, MaskingState::MaskedInterruptible);

        // Masked-interruptible and running: not interruptible.
        assert!(!threads.get(t(1)).unwrap().is_interruptible());

        // Masked-interruptible and blocked: interruptible.
        threads.block(t(1), BlockReason::OnMask(ThreadId::initial()));
        assert!(threads.get(t(1)).unwrap().is_interruptible());

        threads.fork(t(2), Action::Stop, MaskingState::MaskedUninterruptible);
        threads.block(t(2), BlockReason::OnMask(ThreadId::initial()));
        assert!(!threads.get(t(2)).unwrap().is_interruptible());
    }

    #[test]
    fn mask_wakeups() {
        let mut threads = table();
        threads.fork(t(1), Action::Stop, MaskingState::Unmasked);
        threads.fork(t(2), Action::Stop, MaskingState::Unmasked);
        threads.block(t(1), BlockReason::OnMask(ThreadId::initial()));
        threads.block(t(2), BlockReason::OnMask(t(1)));

        let woken = threads.wake_on_mask(ThreadId::initial());
        assert_eq!(woken, vec![t(1)]);
        assert!(threads.get(t(2)).unwrap().blocking.is_some());
    }

    #[test]
    fn tvar_wakeups_use_overlap() {
        let v0 = TVarId::new_for_test(0);
        let v1 = TVarId::new_for_test(1);
        let mut threads = table();
        threads.fork(t(1), Action::Stop, MaskingState::Unmasked);
        threads.block(t(1), BlockReason::OnTVar([v0].into_iter().collect()));

        assert!(threads.wake_on_tvars(&[v1].into_iter().collect()).is_empty());
        assert_eq!(threads.wake_on_tvars(&[v0].into_iter().collect()), vec![t(1)]);
    }
}
