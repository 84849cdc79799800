//! Observed step records and their one-step-ahead predictions.
//!
//! A [`ThreadAction`] is what the executor reports after reducing one step
//! of a thread. A [`Lookahead`] is the scheduler-facing prediction of what
//! a thread's *next* step would be, computed without executing it. The
//! dependence relation and the bound functions are defined over these two
//! types, so the classification helpers here (which cell an action touches,
//! whether it writes, whether it may release another thread) carry most of
//! the exploration-facing semantics of a step.

use crate::action::stm::{touched_tvars, written_tvars, TTrace};
use crate::types::{CRefId, MVarId, MaskingState, TVarId, ThreadId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// The observable record of one execution step.
///
/// Woken-thread lists record which blocked threads the step made runnable
/// again. `Blocked*` variants mean the thread attempted the operation and
/// suspended instead of completing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadAction {
    /// Forked a new thread with the given id.
    Fork(ThreadId),
    /// Read the current thread's own id.
    MyThreadId,
    /// Read the simulated capability count.
    GetNumCapabilities(u32),
    /// Replaced the simulated capability count.
    SetNumCapabilities(u32),
    /// Voluntarily gave up the remainder of the step quantum.
    Yield,
    /// A pure no-op step.
    Return,
    /// Emitted an opaque diagnostic payload.
    Message,
    /// Ran a lifted host effect.
    External,
    /// The thread finished.
    Stop,
    /// Allocated a fresh `MVar`.
    NewMVar(MVarId),
    /// Filled an empty `MVar`, waking the listed threads.
    PutMVar(MVarId, Vec<ThreadId>),
    /// Blocked trying to fill a full `MVar`.
    BlockedPutMVar(MVarId),
    /// Attempted a non-blocking fill; the flag records success.
    TryPutMVar(MVarId, bool, Vec<ThreadId>),
    /// Read a full `MVar` without draining it.
    ReadMVar(MVarId),
    /// Blocked reading an empty `MVar`.
    BlockedReadMVar(MVarId),
    /// Attempted a non-blocking read; the flag records success.
    TryReadMVar(MVarId, bool),
    /// Drained a full `MVar`, waking the listed threads.
    TakeMVar(MVarId, Vec<ThreadId>),
    /// Blocked draining an empty `MVar`.
    BlockedTakeMVar(MVarId),
    /// Attempted a non-blocking drain; the flag records success.
    TryTakeMVar(MVarId, bool, Vec<ThreadId>),
    /// Allocated a fresh `CRef`.
    NewCRef(CRefId),
    /// Read a `CRef` through the current thread's view.
    ReadCRef(CRefId),
    /// Read a `CRef` for a later compare-and-swap.
    ReadForCas(CRefId),
    /// Atomically modified a `CRef` (synchronising).
    ModCRef(CRefId),
    /// Atomically modified a `CRef` via its CAS interface (synchronising).
    ModCRefCas(CRefId),
    /// Wrote a `CRef`; immediate or buffered depending on the memory model.
    WriteCRef(CRefId),
    /// Attempted a compare-and-swap; the flag records success.
    CasCRef(CRefId, bool),
    /// Committed the oldest buffered write of the given thread to the cell.
    CommitCRef(ThreadId, CRefId),
    /// Completed a transaction, waking the listed threads.
    Stm(TTrace, Vec<ThreadId>),
    /// A transaction hit `retry`; the thread is watching its read set.
    BlockedStm(TTrace),
    /// A transaction aborted with an exception.
    ThrownStm(TTrace),
    /// Raised an exception on the current thread.
    Throw,
    /// Delivered an asynchronous exception to the target.
    ThrowTo(ThreadId),
    /// Blocked delivering an asynchronous exception to a masked target.
    BlockedThrowTo(ThreadId),
    /// Installed an exception handler.
    Catching,
    /// Removed the innermost exception handler.
    PopCatching,
    /// Installed a masking state; the flag records whether this came from
    /// an `Umask` bracket.
    SetMasking(bool, MaskingState),
    /// Restored a masking state; the flag records whether this came from
    /// an `Umask` bracket.
    ResetMasking(bool, MaskingState),
    /// Entered a nested execution.
    Subconcurrency,
    /// Returned from a nested execution.
    StopSubconcurrency,
}

impl ThreadAction {
    /// True for the voluntary yield step.
    #[must_use]
    pub const fn is_yield(&self) -> bool {
        matches!(self, Self::Yield)
    }

    /// True if the step left the thread blocked.
    #[must_use]
    pub const fn is_block(&self) -> bool {
        matches!(
            self,
            Self::BlockedPutMVar(_)
                | Self::BlockedReadMVar(_)
                | Self::BlockedTakeMVar(_)
                | Self::BlockedStm(_)
                | Self::BlockedThrowTo(_)
        )
    }

    /// True if the step was preceded by a write barrier.
    #[must_use]
    pub const fn is_barrier(&self) -> bool {
        matches!(
            self,
            Self::PutMVar(..)
                | Self::BlockedPutMVar(_)
                | Self::TryPutMVar(..)
                | Self::ReadMVar(_)
                | Self::BlockedReadMVar(_)
                | Self::TryReadMVar(..)
                | Self::TakeMVar(..)
                | Self::BlockedTakeMVar(_)
                | Self::TryTakeMVar(..)
                | Self::Stm(..)
                | Self::BlockedStm(_)
                | Self::ThrownStm(_)
                | Self::ModCRef(_)
                | Self::ModCRefCas(_)
                | Self::CasCRef(..)
                | Self::ThrowTo(_)
                | Self::BlockedThrowTo(_)
        )
    }

    /// The `MVar` the step touched, if any.
    #[must_use]
    pub const fn mvar_of(&self) -> Option<MVarId> {
        match self {
            Self::NewMVar(m)
            | Self::PutMVar(m, _)
            | Self::BlockedPutMVar(m)
            | Self::TryPutMVar(m, _, _)
            | Self::ReadMVar(m)
            | Self::BlockedReadMVar(m)
            | Self::TryReadMVar(m, _)
            | Self::TakeMVar(m, _)
            | Self::BlockedTakeMVar(m)
            | Self::TryTakeMVar(m, _, _) => Some(*m),
            _ => None,
        }
    }

    /// True for a non-blocking `MVar` attempt that failed.
    #[must_use]
    pub const fn is_failed_try(&self) -> bool {
        matches!(
            self,
            Self::TryPutMVar(_, false, _) | Self::TryReadMVar(_, false) | Self::TryTakeMVar(_, false, _)
        )
    }

    /// The `CRef` the step touched, if any.
    #[must_use]
    pub const fn cref_of(&self) -> Option<CRefId> {
        match self {
            Self::NewCRef(r)
            | Self::ReadCRef(r)
            | Self::ReadForCas(r)
            | Self::ModCRef(r)
            | Self::ModCRefCas(r)
            | Self::WriteCRef(r)
            | Self::CasCRef(r, _)
            | Self::CommitCRef(_, r) => Some(*r),
            _ => None,
        }
    }

    /// True if the step wrote (or committed a write to) its `CRef`.
    #[must_use]
    pub const fn cref_writes(&self) -> bool {
        matches!(
            self,
            Self::WriteCRef(_)
                | Self::ModCRef(_)
                | Self::ModCRefCas(_)
                | Self::CasCRef(..)
                | Self::CommitCRef(..)
        )
    }

    /// The transactional cells the step touched and wrote, if it was an
    /// STM step.
    #[must_use]
    pub fn tvars(&self) -> Option<(BTreeSet<TVarId>, BTreeSet<TVarId>)> {
        match self {
            Self::Stm(trace, _) | Self::ThrownStm(trace) => {
                Some((touched_tvars(trace), written_tvars(trace)))
            }
            Self::BlockedStm(trace) => Some((touched_tvars(trace), BTreeSet::new())),
            _ => None,
        }
    }

    /// The thread whose lifecycle or state this step directly affects.
    #[must_use]
    pub const fn thread_affected(&self) -> Option<ThreadId> {
        match self {
            Self::Fork(t) | Self::ThrowTo(t) | Self::BlockedThrowTo(t) => Some(*t),
            Self::CommitCRef(t, _) => Some(*t),
            _ => None,
        }
    }

    /// The threads this step woke, if any.
    #[must_use]
    pub fn woken(&self) -> &[ThreadId] {
        match self {
            Self::PutMVar(_, w)
            | Self::TryPutMVar(_, _, w)
            | Self::TakeMVar(_, w)
            | Self::TryTakeMVar(_, _, w)
            | Self::Stm(_, w) => w,
            _ => &[],
        }
    }
}

/// A coarse prediction of a thread's next [`ThreadAction`].
///
/// Lookaheads cannot know whether an operation will block or succeed, so
/// the classifications here are conservative: a predicted operation is
/// assumed to touch its cell and a predicted CAS is assumed to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lookahead {
    /// Will fork a new thread.
    WillFork,
    /// Will read its own thread id.
    WillMyThreadId,
    /// Will read the capability count.
    WillGetNumCapabilities,
    /// Will replace the capability count.
    WillSetNumCapabilities(u32),
    /// Will yield.
    WillYield,
    /// Will take a pure no-op step.
    WillReturn,
    /// Will emit a diagnostic payload.
    WillMessage,
    /// Will run a lifted host effect.
    WillExternal,
    /// Will finish.
    WillStop,
    /// Will allocate an `MVar`.
    WillNewMVar,
    /// Will fill (or block on) the `MVar`.
    WillPutMVar(MVarId),
    /// Will attempt a non-blocking fill.
    WillTryPutMVar(MVarId),
    /// Will read (or block on) the `MVar`.
    WillReadMVar(MVarId),
    /// Will attempt a non-blocking read.
    WillTryReadMVar(MVarId),
    /// Will drain (or block on) the `MVar`.
    WillTakeMVar(MVarId),
    /// Will attempt a non-blocking drain.
    WillTryTakeMVar(MVarId),
    /// Will allocate a `CRef`.
    WillNewCRef,
    /// Will read the `CRef`.
    WillReadCRef(CRefId),
    /// Will read the `CRef` for a later CAS.
    WillReadForCas(CRefId),
    /// Will atomically modify the `CRef`.
    WillModCRef(CRefId),
    /// Will atomically modify the `CRef` via its CAS interface.
    WillModCRefCas(CRefId),
    /// Will write the `CRef`.
    WillWriteCRef(CRefId),
    /// Will attempt a compare-and-swap on the `CRef`.
    WillCasCRef(CRefId),
    /// Will commit the thread's oldest buffered write to the cell.
    WillCommitCRef(ThreadId, CRefId),
    /// Will run a transaction.
    WillStm,
    /// Will raise an exception.
    WillThrow,
    /// Will deliver (or block delivering) an asynchronous exception.
    WillThrowTo(ThreadId),
    /// Will install an exception handler.
    WillCatching,
    /// Will remove the innermost exception handler.
    WillPopCatching,
    /// Will install a masking state.
    WillSetMasking(bool, MaskingState),
    /// Will restore a masking state.
    WillResetMasking(bool, MaskingState),
    /// Will enter a nested execution.
    WillSubconcurrency,
    /// Will return from a nested execution.
    WillStopSubconcurrency,
}

impl Lookahead {
    /// The `MVar` the predicted step would touch, if any.
    #[must_use]
    pub const fn mvar_of(self) -> Option<MVarId> {
        match self {
            Self::WillPutMVar(m)
            | Self::WillTryPutMVar(m)
            | Self::WillReadMVar(m)
            | Self::WillTryReadMVar(m)
            | Self::WillTakeMVar(m)
            | Self::WillTryTakeMVar(m) => Some(m),
            _ => None,
        }
    }

    /// The `CRef` the predicted step would touch, if any.
    #[must_use]
    pub const fn cref_of(self) -> Option<CRefId> {
        match self {
            Self::WillReadCRef(r)
            | Self::WillReadForCas(r)
            | Self::WillModCRef(r)
            | Self::WillModCRefCas(r)
            | Self::WillWriteCRef(r)
            | Self::WillCasCRef(r) => Some(r),
            Self::WillCommitCRef(_, r) => Some(r),
            _ => None,
        }
    }

    /// True if the predicted step would write its `CRef`.
    #[must_use]
    pub const fn cref_writes(self) -> bool {
        matches!(
            self,
            Self::WillWriteCRef(_)
                | Self::WillModCRef(_)
                | Self::WillModCRefCas(_)
                | Self::WillCasCRef(_)
                | Self::WillCommitCRef(..)
        )
    }

    /// True if the predicted step is a transaction.
    #[must_use]
    pub const fn is_stm(self) -> bool {
        matches!(self, Self::WillStm)
    }

    /// True if the predicted step would be preceded by a write barrier.
    #[must_use]
    pub const fn is_barrier(self) -> bool {
        matches!(
            self,
            Self::WillPutMVar(_)
                | Self::WillTryPutMVar(_)
                | Self::WillReadMVar(_)
                | Self::WillTryReadMVar(_)
                | Self::WillTakeMVar(_)
                | Self::WillTryTakeMVar(_)
                | Self::WillStm
                | Self::WillModCRef(_)
                | Self::WillModCRefCas(_)
                | Self::WillCasCRef(_)
                | Self::WillThrowTo(_)
        )
    }

    /// True if the predicted step may unblock another thread or give up
    /// control: the fair bound's "release" classification.
    #[must_use]
    pub const fn will_release(self) -> bool {
        matches!(
            self,
            Self::WillYield
                | Self::WillPutMVar(_)
                | Self::WillTryPutMVar(_)
                | Self::WillTakeMVar(_)
                | Self::WillTryTakeMVar(_)
                | Self::WillStm
                | Self::WillThrow
                | Self::WillThrowTo(_)
                | Self::WillStop
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::stm::TAction;

    #[test]
    fn failed_tries_are_recognised() {
        assert!(ThreadAction::TryTakeMVar(MVarId::new_for_test(0), false, vec![]).is_failed_try());
        assert!(!ThreadAction::TryTakeMVar(MVarId::new_for_test(0), true, vec![]).is_failed_try());
        assert!(!ThreadAction::TakeMVar(MVarId::new_for_test(0), vec![]).is_failed_try());
    }

    #[test]
    fn barrier_classification_matches_synchronising_ops() {
        let m = MVarId::new_for_test(1);
        let r = CRefId::new_for_test(1);
        assert!(ThreadAction::PutMVar(m, vec![]).is_barrier());
        assert!(ThreadAction::ModCRef(r).is_barrier());
        assert!(ThreadAction::ThrowTo(ThreadId::initial()).is_barrier());
        assert!(!ThreadAction::WriteCRef(r).is_barrier());
        assert!(!ThreadAction::ReadCRef(r).is_barrier());
    }

    #[test]
    fn stm_tvar_sets() {
        let v = TVarId::new_for_test(3);
        let w = TVarId::new_for_test(4);
        let action = ThreadAction::Stm(vec![TAction::Read(v), TAction::Write(w)], vec![]);
        let (touched, written) = action.tvars().expect("stm action");
        assert!(touched.contains(&v));
        assert!(touched.contains(&w));
        assert!(!written.contains(&v));
        assert!(written.contains(&w));
    }

    #[test]
    fn release_classification() {
        assert!(Lookahead::WillYield.will_release());
        assert!(Lookahead::WillPutMVar(MVarId::new_for_test(0)).will_release());
        assert!(Lookahead::WillStm.will_release());
        assert!(!Lookahead::WillReadCRef(CRefId::new_for_test(0)).will_release());
        assert!(!Lookahead::WillFork.will_release());
    }

    #[test]
    fn commit_lookahead_writes() {
        let l = Lookahead::WillCommitCRef(ThreadId::initial(), CRefId::new_for_test(2));
        assert!(l.cref_writes());
        assert_eq!(l.cref_of(), Some(CRefId::new_for_test(2)));
    }
}
