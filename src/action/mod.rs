//! The suspended-action representation of user programs.
//!
//! A simulated program is a lazy tree of [`Action`] values. Each variant is
//! one primitive the interpreter can execute, carrying its arguments and a
//! boxed continuation from the primitive's result to the next `Action`.
//! The engine never introspects the closures; it only forces them with
//! result values, one step at a time.
//!
//! Values cross the interpreter boundary as [`Value`] snapshots
//! (`Rc<dyn Any>`); the typed surface in [`crate::program`] wraps and
//! unwraps them.

pub mod stm;
pub mod thread_action;

pub use stm::{Stm, TAction, TTrace};
pub use thread_action::{Lookahead, ThreadAction};

use crate::exec::memory::Ticket;
use crate::types::{CRefId, Failure, MVarId, MaskingState, ThreadId};
use std::any::Any;
use std::rc::Rc;

/// A dynamically-typed value snapshot.
pub type Value = Rc<dyn Any>;

/// Wraps a concrete value as a [`Value`].
#[must_use]
pub fn value<T: Any>(v: T) -> Value {
    Rc::new(v)
}

/// Recovers a concrete value from a [`Value`] snapshot.
///
/// Returns `None` on a type mismatch, which indicates a bug in the typed
/// surface that produced the snapshot.
#[must_use]
pub fn downcast<T: Any + Clone>(v: &Value) -> Option<T> {
    v.downcast_ref::<T>().cloned()
}

/// A simulated exception: an opaque payload with its type name attached
/// for diagnostics.
#[derive(Clone)]
pub struct Exception {
    type_name: &'static str,
    payload: Rc<dyn Any>,
}

impl Exception {
    /// Wraps a concrete value as an exception.
    #[must_use]
    pub fn new<E: Any>(payload: E) -> Self {
        Self {
            type_name: std::any::type_name::<E>(),
            payload: Rc::new(payload),
        }
    }

    /// The type name of the payload, for diagnostics.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Recovers the payload if it has the expected type.
    #[must_use]
    pub fn downcast<E: Any + Clone>(&self) -> Option<E> {
        self.payload.downcast_ref::<E>().cloned()
    }
}

impl std::fmt::Debug for Exception {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Exception({})", self.type_name)
    }
}

/// A continuation from a primitive's result to the next action.
pub type Cont<T> = Box<dyn FnOnce(T) -> Action>;

/// The capability handed to a `masking` body for temporarily restoring the
/// saved masking state within the masked region.
#[derive(Debug, Clone, Copy)]
pub struct Umask {
    /// The state installed by the enclosing `masking`.
    pub(crate) entered: MaskingState,
    /// The state that was active before the enclosing `masking`.
    pub(crate) saved: MaskingState,
}

/// A suspended simulated program.
///
/// Blocking variants are re-executed from scratch when the thread wakes,
/// so the executor reconstructs and re-stores them when an operation
/// cannot complete.
pub enum Action {
    /// Create a thread running `body`; the parent continues with its id.
    Fork {
        /// Diagnostic tag for the new thread.
        name: Option<String>,
        /// The child computation.
        body: Box<dyn FnOnce() -> Action>,
        /// Parent continuation, applied to the child's id.
        k: Cont<ThreadId>,
    },
    /// Read the current thread's id.
    MyTid(Cont<ThreadId>),
    /// Read the simulated capability count.
    GetCaps(Cont<u32>),
    /// Replace the simulated capability count.
    SetCaps(u32, Box<dyn FnOnce() -> Action>),
    /// Give up the rest of this step's quantum.
    Yield(Box<dyn FnOnce() -> Action>),
    /// A pure no-op step.
    Return(Box<dyn FnOnce() -> Action>),
    /// Emit an opaque diagnostic payload into the trace.
    Message(Value, Box<dyn FnOnce() -> Action>),
    /// Run a host effect inline; it must be deterministically replayable.
    LiftExternal(Box<dyn FnOnce() -> Value>, Cont<Value>),
    /// Terminate this thread.
    Stop,
    /// Allocate a fresh `MVar`.
    NewMVar(Option<String>, Cont<MVarId>),
    /// Fill an `MVar`, blocking while it is full.
    PutMVar(MVarId, Value, Box<dyn FnOnce() -> Action>),
    /// Fill an `MVar` if it is empty; never blocks.
    TryPutMVar(MVarId, Value, Cont<bool>),
    /// Read an `MVar` without draining it, blocking while it is empty.
    ReadMVar(MVarId, Cont<Value>),
    /// Read an `MVar` if it is full; never blocks.
    TryReadMVar(MVarId, Cont<Option<Value>>),
    /// Drain an `MVar`, blocking while it is empty.
    TakeMVar(MVarId, Cont<Value>),
    /// Drain an `MVar` if it is full; never blocks.
    TryTakeMVar(MVarId, Cont<Option<Value>>),
    /// Allocate a fresh `CRef` holding the value.
    NewCRef(Option<String>, Value, Cont<CRefId>),
    /// Read a `CRef` through this thread's view.
    ReadCRef(CRefId, Cont<Value>),
    /// Read a `CRef`, obtaining a ticket for a later compare-and-swap.
    ReadCRefCas(CRefId, Cont<Ticket>),
    /// Atomically modify a `CRef`; the closure maps the old value to the
    /// new value and a result.
    ModCRef(CRefId, Box<dyn FnOnce(Value) -> (Value, Value)>, Cont<Value>),
    /// Atomically modify a `CRef` through its CAS interface.
    ModCRefCas(CRefId, Box<dyn FnOnce(Value) -> (Value, Value)>, Cont<Value>),
    /// Write a `CRef`; buffered under relaxed memory models.
    WriteCRef(CRefId, Value, Box<dyn FnOnce() -> Action>),
    /// Compare-and-swap a `CRef` against a ticket.
    CasCRef(CRefId, Ticket, Value, Cont<(bool, Ticket)>),
    /// Commit the oldest buffered write of a thread to a cell. Only commit
    /// pseudo-threads execute this.
    CommitCRef {
        /// The thread whose write is settling.
        writer: ThreadId,
        /// The write-buffer key (`None` under total store order).
        key: Option<CRefId>,
        /// The cell the head buffered write targets.
        cell: CRefId,
    },
    /// Run a transaction as one atomic step. The factory is re-invoked to
    /// rebuild the transaction after a `retry` wakes up.
    Atomically(Box<dyn FnMut() -> Stm>, Cont<Value>),
    /// Raise an exception on this thread.
    Throw(Exception),
    /// Deliver an exception to another thread, blocking while the target
    /// is masked.
    ThrowTo(ThreadId, Exception, Box<dyn FnOnce() -> Action>),
    /// Install an exception handler around `body`.
    Catching {
        /// Builds the guarded computation, given its continuation.
        body: Box<dyn FnOnce(Cont<Value>) -> Action>,
        /// Builds the handler computation, given the exception and the
        /// continuation; returns `None` to decline the exception's type.
        handler: Box<dyn FnOnce(Exception, Cont<Value>) -> Option<Action>>,
        /// Continuation receiving the body's (or handler's) result.
        k: Cont<Value>,
    },
    /// Remove the innermost exception handler.
    PopCatching(Box<dyn FnOnce() -> Action>),
    /// Install a masking state around `body`.
    Masking {
        /// The state to install.
        state: MaskingState,
        /// Builds the masked computation, given the restore capability and
        /// its continuation.
        body: Box<dyn FnOnce(Umask, Cont<Value>) -> Action>,
        /// Continuation receiving the body's result.
        k: Cont<Value>,
    },
    /// Install a masking state directly. Emitted by `masking` and `Umask`
    /// brackets to restore a saved state.
    ResetMask {
        /// True when this installs a state, false when it restores one.
        set: bool,
        /// True when the bracket came from an `Umask` capability.
        explicit: bool,
        /// The state to install.
        state: MaskingState,
        /// Continuation.
        k: Box<dyn FnOnce() -> Action>,
    },
    /// Run a nested execution to completion as a single observable region.
    Subconcurrency {
        /// Builds the nested computation, given its continuation.
        inner: Box<dyn FnOnce(Cont<Value>) -> Action>,
        /// Continuation receiving the nested result.
        k: Cont<Result<Value, Failure>>,
    },
    /// Mark the return from a nested execution.
    StopSubconcurrency(Box<dyn FnOnce() -> Action>),
}

impl Action {
    /// The scheduler-facing prediction of this action.
    #[must_use]
    pub fn lookahead(&self) -> Lookahead {
        match self {
            Self::Fork { .. } => Lookahead::WillFork,
            Self::MyTid(_) => Lookahead::WillMyThreadId,
            Self::GetCaps(_) => Lookahead::WillGetNumCapabilities,
            Self::SetCaps(n, _) => Lookahead::WillSetNumCapabilities(*n),
            Self::Yield(_) => Lookahead::WillYield,
            Self::Return(_) => Lookahead::WillReturn,
            Self::Message(..) => Lookahead::WillMessage,
            Self::LiftExternal(..) => Lookahead::WillExternal,
            Self::Stop => Lookahead::WillStop,
            Self::NewMVar(..) => Lookahead::WillNewMVar,
            Self::PutMVar(m, ..) => Lookahead::WillPutMVar(*m),
            Self::TryPutMVar(m, ..) => Lookahead::WillTryPutMVar(*m),
            Self::ReadMVar(m, _) => Lookahead::WillReadMVar(*m),
            Self::TryReadMVar(m, _) => Lookahead::WillTryReadMVar(*m),
            Self::TakeMVar(m, _) => Lookahead::WillTakeMVar(*m),
            Self::TryTakeMVar(m, _) => Lookahead::WillTryTakeMVar(*m),
            Self::NewCRef(..) => Lookahead::WillNewCRef,
            Self::ReadCRef(r, _) => Lookahead::WillReadCRef(*r),
            Self::ReadCRefCas(r, _) => Lookahead::WillReadForCas(*r),
            Self::ModCRef(r, ..) => Lookahead::WillModCRef(*r),
            Self::ModCRefCas(r, ..) => Lookahead::WillModCRefCas(*r),
            Self::WriteCRef(r, ..) => Lookahead::WillWriteCRef(*r),
            Self::CasCRef(r, ..) => Lookahead::WillCasCRef(*r),
            Self::CommitCRef { writer, cell, .. } => Lookahead::WillCommitCRef(*writer, *cell),
            Self::Atomically(..) => Lookahead::WillStm,
            Self::Throw(_) => Lookahead::WillThrow,
            Self::ThrowTo(t, ..) => Lookahead::WillThrowTo(*t),
            Self::Catching { .. } => Lookahead::WillCatching,
            Self::PopCatching(_) => Lookahead::WillPopCatching,
            Self::Masking { state, .. } => Lookahead::WillSetMasking(false, *state),
            Self::ResetMask {
                set,
                explicit,
                state,
                ..
            } => {
                if *set {
                    Lookahead::WillSetMasking(*explicit, *state)
                } else {
                    Lookahead::WillResetMasking(*explicit, *state)
                }
            }
            Self::Subconcurrency { .. } => Lookahead::WillSubconcurrency,
            Self::StopSubconcurrency(_) => Lookahead::WillStopSubconcurrency,
        }
    }
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Action::{:?}", self.lookahead())
    }
}
