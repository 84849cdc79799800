//! Typed builders for simulated programs.
//!
//! A [`Program<T>`] is a suspended computation in continuation-passing
//! style: it knows how to produce an [`Action`] tree once handed the
//! continuation for its result. The combinators here are the whole user
//! surface; the interpreter only ever sees the untyped `Action` trees
//! they build. Values cross the untyped boundary as `Rc<dyn Any>`
//! snapshots, so cell element types need `Clone` (and `'static`) where a
//! value is read back out.

pub mod stm;

pub use stm::{StmProgram, TVar};

use crate::action::{downcast, value, Action, Cont, Exception, Umask, Value};
use crate::exec::memory::Ticket;
use crate::types::{CRefId, Failure, MVarId, MaskingState, ThreadId};
use std::any::Any;
use std::marker::PhantomData;

/// The payload of the exception thrown when a cell's stored value does
/// not match the type the program expects. Seeing it means two handles
/// with different element types were made for the same cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeMismatch {
    /// The expected element type.
    pub expected: &'static str,
}

/// A composable simulated computation producing a `T`.
pub struct Program<T> {
    build: Box<dyn FnOnce(Cont<T>) -> Action>,
}

impl<T: 'static> Program<T> {
    pub(crate) fn new(build: impl FnOnce(Cont<T>) -> Action + 'static) -> Self {
        Self {
            build: Box::new(build),
        }
    }

    /// Builds the action tree, terminating in the continuation.
    pub(crate) fn run(self, k: Cont<T>) -> Action {
        (self.build)(k)
    }

    /// Sequences a dependent computation after this one.
    #[must_use]
    pub fn and_then<U: 'static>(self, f: impl FnOnce(T) -> Program<U> + 'static) -> Program<U> {
        Program::new(move |k| self.run(Box::new(move |t| f(t).run(k))))
    }

    /// Applies a function to the result.
    #[must_use]
    pub fn map<U: 'static>(self, f: impl FnOnce(T) -> U + 'static) -> Program<U> {
        Program::new(move |k| self.run(Box::new(move |t| k(f(t)))))
    }

    /// Sequences an independent computation after this one.
    #[must_use]
    pub fn then<U: 'static>(self, next: Program<U>) -> Program<U> {
        self.and_then(move |_| next)
    }
}

impl<T: Any> Program<T> {
    /// Closes the program into a root action builder for the run loop.
    pub(crate) fn into_root(self) -> Box<dyn FnOnce(Cont<Value>) -> Action> {
        Box::new(move |k| self.run(Box::new(move |t| k(value(t)))))
    }
}

/// A computation producing the value without taking a step.
#[must_use]
pub fn pure<T: 'static>(t: T) -> Program<T> {
    Program::new(move |k| k(t))
}

/// A pure no-op step; useful to give the scheduler a decision point.
#[must_use]
pub fn no_op() -> Program<()> {
    Program::new(|k| Action::Return(Box::new(move || k(()))))
}

/// Forks a computation onto a fresh thread.
#[must_use]
pub fn fork(body: Program<()>) -> Program<ThreadId> {
    fork_inner(None, body)
}

/// Forks a computation onto a fresh thread with a diagnostic name.
#[must_use]
pub fn fork_named(name: &str, body: Program<()>) -> Program<ThreadId> {
    fork_inner(Some(name.to_string()), body)
}

fn fork_inner(name: Option<String>, body: Program<()>) -> Program<ThreadId> {
    Program::new(move |k| Action::Fork {
        name,
        body: Box::new(move || body.run(Box::new(|()| Action::Stop))),
        k,
    })
}

/// Reads the current thread's id.
#[must_use]
pub fn my_tid() -> Program<ThreadId> {
    Program::new(|k| Action::MyTid(k))
}

/// Yields the rest of this step's quantum.
#[must_use]
pub fn yield_now() -> Program<()> {
    Program::new(|k| Action::Yield(Box::new(move || k(()))))
}

/// Reads the simulated capability count.
#[must_use]
pub fn get_caps() -> Program<u32> {
    Program::new(|k| Action::GetCaps(k))
}

/// Replaces the simulated capability count.
#[must_use]
pub fn set_caps(n: u32) -> Program<()> {
    Program::new(move |k| Action::SetCaps(n, Box::new(move || k(()))))
}

/// Emits an opaque payload into the trace.
#[must_use]
pub fn message<T: Any>(payload: T) -> Program<()> {
    Program::new(move |k| Action::Message(value(payload), Box::new(move || k(()))))
}

/// Runs a host effect inline. The effect must be deterministically
/// replayable: it runs once per execution encounter, and exploration runs
/// the program many times.
#[must_use]
pub fn external<T: Any + Clone>(effect: impl FnOnce() -> T + 'static) -> Program<T> {
    Program::new(move |k| Action::LiftExternal(Box::new(move || value(effect())), typed(k)))
}

/// Terminates the current thread without producing a value.
#[must_use]
pub fn stop<T: 'static>() -> Program<T> {
    Program::new(|_k| Action::Stop)
}

// ---------------------------------------------------------------------------
// MVar operations

/// A typed handle to a rendezvous variable.
pub struct MVar<T> {
    pub(crate) id: MVarId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> MVar<T> {
    const fn from_id(id: MVarId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    /// The raw identifier of this variable.
    #[must_use]
    pub const fn id(&self) -> MVarId {
        self.id
    }
}

impl<T> Clone for MVar<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for MVar<T> {}

impl<T> std::fmt::Debug for MVar<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MVar({})", self.id)
    }
}

/// Allocates an empty rendezvous variable.
#[must_use]
pub fn new_mvar<T: 'static>() -> Program<MVar<T>> {
    Program::new(|k| Action::NewMVar(None, Box::new(move |id| k(MVar::from_id(id)))))
}

/// Allocates an empty rendezvous variable with a diagnostic name.
#[must_use]
pub fn new_mvar_named<T: 'static>(name: &str) -> Program<MVar<T>> {
    let name = name.to_string();
    Program::new(move |k| Action::NewMVar(Some(name), Box::new(move |id| k(MVar::from_id(id)))))
}

/// Fills the variable, blocking while it is full.
#[must_use]
pub fn put_mvar<T: Any>(mvar: MVar<T>, v: T) -> Program<()> {
    Program::new(move |k| Action::PutMVar(mvar.id, value(v), Box::new(move || k(()))))
}

/// Fills the variable if it is empty; never blocks.
#[must_use]
pub fn try_put_mvar<T: Any>(mvar: MVar<T>, v: T) -> Program<bool> {
    Program::new(move |k| Action::TryPutMVar(mvar.id, value(v), k))
}

/// Drains the variable, blocking while it is empty.
#[must_use]
pub fn take_mvar<T: Any + Clone>(mvar: MVar<T>) -> Program<T> {
    Program::new(move |k| Action::TakeMVar(mvar.id, typed(k)))
}

/// Drains the variable if it is full; never blocks.
#[must_use]
pub fn try_take_mvar<T: Any + Clone>(mvar: MVar<T>) -> Program<Option<T>> {
    Program::new(move |k| Action::TryTakeMVar(mvar.id, typed_option(k)))
}

/// Reads the variable without draining it, blocking while it is empty.
#[must_use]
pub fn read_mvar<T: Any + Clone>(mvar: MVar<T>) -> Program<T> {
    Program::new(move |k| Action::ReadMVar(mvar.id, typed(k)))
}

/// Reads the variable if it is full; never blocks.
#[must_use]
pub fn try_read_mvar<T: Any + Clone>(mvar: MVar<T>) -> Program<Option<T>> {
    Program::new(move |k| Action::TryReadMVar(mvar.id, typed_option(k)))
}

// ---------------------------------------------------------------------------
// CRef operations

/// A typed handle to a shared mutable cell.
pub struct CRef<T> {
    pub(crate) id: CRefId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> CRef<T> {
    const fn from_id(id: CRefId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    /// The raw identifier of this cell.
    #[must_use]
    pub const fn id(&self) -> CRefId {
        self.id
    }
}

impl<T> Clone for CRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for CRef<T> {}

impl<T> std::fmt::Debug for CRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CRef({})", self.id)
    }
}

/// A typed compare-and-swap ticket.
pub struct CasTicket<T> {
    pub(crate) ticket: Ticket,
    _marker: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for CasTicket<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.ticket.fmt(f)
    }
}

impl<T: Any + Clone> CasTicket<T> {
    /// The value observed when the ticket was taken.
    #[must_use]
    pub fn observed(&self) -> Option<T> {
        downcast::<T>(&self.ticket.value())
    }
}

/// Allocates a shared cell holding the value.
#[must_use]
pub fn new_cref<T: Any>(init: T) -> Program<CRef<T>> {
    Program::new(move |k| {
        Action::NewCRef(None, value(init), Box::new(move |id| k(CRef::from_id(id))))
    })
}

/// Allocates a named shared cell holding the value.
#[must_use]
pub fn new_cref_named<T: Any>(name: &str, init: T) -> Program<CRef<T>> {
    let name = name.to_string();
    Program::new(move |k| {
        Action::NewCRef(Some(name), value(init), Box::new(move |id| k(CRef::from_id(id))))
    })
}

/// Reads the cell through this thread's view.
#[must_use]
pub fn read_cref<T: Any + Clone>(cref: CRef<T>) -> Program<T> {
    Program::new(move |k| Action::ReadCRef(cref.id, typed(k)))
}

/// Writes the cell; the write may buffer under relaxed memory models.
#[must_use]
pub fn write_cref<T: Any>(cref: CRef<T>, v: T) -> Program<()> {
    Program::new(move |k| Action::WriteCRef(cref.id, value(v), Box::new(move || k(()))))
}

/// Atomically modifies the cell, returning the previous value.
#[must_use]
pub fn mod_cref<T: Any + Clone>(cref: CRef<T>, f: impl FnOnce(T) -> T + 'static) -> Program<T> {
    Program::new(move |k| {
        Action::ModCRef(
            cref.id,
            Box::new(move |old| match downcast::<T>(&old) {
                Some(t) => (value(f(t.clone())), value(t)),
                None => (Value::clone(&old), old),
            }),
            typed(k),
        )
    })
}

/// Atomically modifies the cell through its CAS interface, returning the
/// previous value.
#[must_use]
pub fn mod_cref_cas<T: Any + Clone>(
    cref: CRef<T>,
    f: impl FnOnce(T) -> T + 'static,
) -> Program<T> {
    Program::new(move |k| {
        Action::ModCRefCas(
            cref.id,
            Box::new(move |old| match downcast::<T>(&old) {
                Some(t) => (value(f(t.clone())), value(t)),
                None => (Value::clone(&old), old),
            }),
            typed(k),
        )
    })
}

/// Takes a compare-and-swap ticket for the cell.
#[must_use]
pub fn read_for_cas<T: 'static>(cref: CRef<T>) -> Program<CasTicket<T>> {
    Program::new(move |k| {
        Action::ReadCRefCas(
            cref.id,
            Box::new(move |ticket| {
                k(CasTicket {
                    ticket,
                    _marker: PhantomData,
                })
            }),
        )
    })
}

/// Compare-and-swaps the cell against a ticket. Returns the success flag
/// and a fresh ticket for the cell after the attempt.
#[must_use]
pub fn cas_cref<T: Any>(
    cref: CRef<T>,
    ticket: CasTicket<T>,
    v: T,
) -> Program<(bool, CasTicket<T>)> {
    Program::new(move |k| {
        Action::CasCRef(
            cref.id,
            ticket.ticket,
            value(v),
            Box::new(move |(ok, after)| {
                k((
                    ok,
                    CasTicket {
                        ticket: after,
                        _marker: PhantomData,
                    },
                ))
            }),
        )
    })
}

// ---------------------------------------------------------------------------
// STM, exceptions, masking, nesting

/// Runs a transaction as one atomic step.
#[must_use]
pub fn atomically<T: Any + Clone>(tx: StmProgram<T>) -> Program<T> {
    Program::new(move |k| {
        Action::Atomically(
            Box::new(move || tx.run(Box::new(|t| crate::action::Stm::Done(value(t))))),
            typed(k),
        )
    })
}

/// Raises an exception on the current thread.
#[must_use]
pub fn throw<T: 'static, E: Any>(e: E) -> Program<T> {
    Program::new(move |_k| Action::Throw(Exception::new(e)))
}

/// Delivers an exception to another thread, blocking while the target is
/// masked.
#[must_use]
pub fn throw_to<E: Any>(target: ThreadId, e: E) -> Program<()> {
    Program::new(move |k| Action::ThrowTo(target, Exception::new(e), Box::new(move || k(()))))
}

/// Guards a computation with a typed handler. Exceptions of other types
/// propagate past it.
#[must_use]
pub fn catch<T, E>(body: Program<T>, handler: impl FnOnce(E) -> Program<T> + 'static) -> Program<T>
where
    T: Any + Clone,
    E: Any + Clone,
{
    Program::new(move |k| Action::Catching {
        body: Box::new(move |kb| body.run(Box::new(move |t| kb(value(t))))),
        handler: Box::new(move |exc, kh| {
            exc.downcast::<E>()
                .map(move |e| handler(e).run(Box::new(move |t| kh(value(t)))))
        }),
        k: typed(k),
    })
}

/// Runs a computation under a masking state. The body receives an
/// [`Umask`] capability restoring the caller's state for nested regions.
#[must_use]
pub fn mask<T: Any + Clone>(
    state: MaskingState,
    body: impl FnOnce(Umask) -> Program<T> + 'static,
) -> Program<T> {
    Program::new(move |k| Action::Masking {
        state,
        body: Box::new(move |umask, kb| body(umask).run(Box::new(move |t| kb(value(t))))),
        k: typed(k),
    })
}

impl Umask {
    /// Runs a program with the saved (pre-mask) state temporarily
    /// restored, then reinstates the mask.
    #[must_use]
    pub fn restore<T: Any + Clone>(self, inner: Program<T>) -> Program<T> {
        let entered = self.entered;
        let saved = self.saved;
        reset_mask(true, saved)
            .then(inner)
            .and_then(move |t| reset_mask(false, entered).map(move |()| t))
    }
}

fn reset_mask(set: bool, state: MaskingState) -> Program<()> {
    Program::new(move |k| Action::ResetMask {
        set,
        explicit: true,
        state,
        k: Box::new(move || k(())),
    })
}

/// Runs a nested execution of `inner` as a single observable region,
/// resuming with its result. Illegal while more than one thread is alive.
#[must_use]
pub fn subconcurrency<T: Any + Clone>(inner: Program<T>) -> Program<Result<T, Failure>> {
    Program::new(move |k| Action::Subconcurrency {
        inner: Box::new(move |ki| inner.run(Box::new(move |t| ki(value(t))))),
        k: Box::new(move |res| {
            k(res.and_then(|v| downcast::<T>(&v).ok_or(Failure::InternalError)))
        }),
    })
}

/// Adapts a typed continuation to the untyped `Action` boundary. A
/// mismatch surfaces as a simulated exception rather than a host panic.
fn typed<T: Any + Clone>(k: Cont<T>) -> Cont<Value> {
    Box::new(move |v| match downcast::<T>(&v) {
        Some(t) => k(t),
        None => Action::Throw(Exception::new(TypeMismatch {
            expected: std::any::type_name::<T>(),
        })),
    })
}

fn typed_option<T: Any + Clone>(k: Cont<Option<T>>) -> Cont<Option<Value>> {
    Box::new(move |v| match v {
        None => k(None),
        Some(v) => match downcast::<T>(&v) {
            Some(t) => k(Some(t)),
            None => Action::Throw(Exception::new(TypeMismatch {
                expected: std::any::type_name::<T>(),
            })),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{run_concurrency, MemoryModel, DEFAULT_CAPABILITIES};
    use crate::sched::RoundRobinScheduler;

    fn run<T: Any + Clone>(program: Program<T>) -> Result<T, Failure> {
        let mut sched = RoundRobinScheduler::new();
        run_concurrency(
            &mut sched,
            MemoryModel::SequentialConsistency,
            DEFAULT_CAPABILITIES,
            program,
        )
        .0
    }

    #[test]
    fn mvar_roundtrip() {
        let program = new_mvar::<u32>().and_then(|m| {
            put_mvar(m, 5)
                .then(take_mvar(m))
                .and_then(move |v| try_take_mvar(m).map(move |rest| (v, rest)))
        });
        assert_eq!(run(program), Ok((5, None)));
    }

    #[test]
    fn cref_modify_returns_old() {
        let program = new_cref(10_u32)
            .and_then(|r| mod_cref(r, |v| v + 1).and_then(move |old| read_cref(r).map(move |new| (old, new))));
        assert_eq!(run(program), Ok((10, 11)));
    }

    #[test]
    fn catch_recovers_typed_exception() {
        let program = catch(
            throw::<u32, _>("boom".to_string()),
            |e: String| pure(e.len() as u32),
        );
        assert_eq!(run(program), Ok(4));
    }

    #[test]
    fn catch_declines_other_types() {
        let program: Program<u32> = catch(throw::<u32, _>(7_i32), |_e: String| pure(0));
        assert_eq!(run(program), Err(Failure::UncaughtException));
    }

    #[test]
    fn atomically_pure_is_single_step() {
        let mut sched = RoundRobinScheduler::new();
        let (result, trace) = run_concurrency(
            &mut sched,
            MemoryModel::SequentialConsistency,
            DEFAULT_CAPABILITIES,
            atomically(stm::pure(3_u32)),
        );
        assert_eq!(result, Ok(3));
        let stm_steps: Vec<_> = trace
            .iter()
            .filter(|e| matches!(e.action, crate::action::ThreadAction::Stm(..)))
            .collect();
        assert_eq!(stm_steps.len(), 1);
        match &stm_steps[0].action {
            crate::action::ThreadAction::Stm(ttrace, woken) => {
                assert!(ttrace.is_empty(), "pure transaction touches no cells");
                assert!(woken.is_empty());
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn masking_restores_on_exit() {
        // Inside the mask the thread is uninterruptible; the trace must
        // end with a reset back to unmasked.
        let program = mask(MaskingState::MaskedUninterruptible, |_umask| pure(1_u8));
        let mut sched = RoundRobinScheduler::new();
        let (result, trace) = run_concurrency(
            &mut sched,
            MemoryModel::SequentialConsistency,
            DEFAULT_CAPABILITIES,
            program,
        );
        assert_eq!(result, Ok(1));
        assert!(trace.iter().any(|e| {
            e.action
                == crate::action::ThreadAction::ResetMasking(false, MaskingState::Unmasked)
        }));
    }

    #[test]
    fn capability_roundtrip() {
        let program = set_caps(8).then(get_caps());
        assert_eq!(run(program), Ok(8));
    }

    #[test]
    fn external_effects_run_inline() {
        let program = external(|| 6_u32).and_then(|n| external(move || n * 7));
        assert_eq!(run(program), Ok(42));
    }

    #[test]
    fn try_operations_never_block() {
        let program = new_mvar::<u32>().and_then(|m| {
            try_take_mvar(m).and_then(move |empty| {
                try_put_mvar(m, 3)
                    .and_then(move |first| try_put_mvar(m, 4).map(move |second| (empty, first, second)))
                    .and_then(move |flags| try_read_mvar(m).map(move |v| (flags, v)))
            })
        });
        assert_eq!(run(program), Ok(((None, true, false), Some(3))));
    }

    #[test]
    fn stopping_early_aborts_the_result() {
        let program: Program<u32> = stop();
        assert_eq!(run(program), Err(Failure::Abort));
    }

    #[test]
    fn message_and_no_op_are_plain_steps() {
        let mut sched = RoundRobinScheduler::new();
        let (result, trace) = run_concurrency(
            &mut sched,
            MemoryModel::SequentialConsistency,
            DEFAULT_CAPABILITIES,
            message("marker").then(no_op()).map(|()| 5_u8),
        );
        assert_eq!(result, Ok(5));
        let actions: Vec<_> = trace.iter().map(|e| &e.action).collect();
        assert!(actions.contains(&&crate::action::ThreadAction::Message));
        assert!(actions.contains(&&crate::action::ThreadAction::Return));
    }

    #[test]
    fn umask_brackets_the_restored_region() {
        let program = mask(MaskingState::MaskedUninterruptible, |umask| {
            umask.restore(yield_now()).map(|()| 1_u8)
        });
        let mut sched = RoundRobinScheduler::new();
        let (result, trace) = run_concurrency(
            &mut sched,
            MemoryModel::SequentialConsistency,
            DEFAULT_CAPABILITIES,
            program,
        );
        assert_eq!(result, Ok(1));

        let actions: Vec<_> = trace.iter().map(|e| e.action.clone()).collect();
        let opened = actions
            .iter()
            .position(|a| *a == crate::action::ThreadAction::SetMasking(true, MaskingState::Unmasked));
        let closed = actions.iter().position(|a| {
            *a == crate::action::ThreadAction::ResetMasking(
                true,
                MaskingState::MaskedUninterruptible,
            )
        });
        assert!(opened.is_some(), "umask restores the saved state: {actions:?}");
        assert!(closed.is_some(), "umask reinstates the mask: {actions:?}");
        assert!(opened < closed);
    }

    #[test]
    fn named_allocations_are_tagged_in_traces() {
        // Names only affect diagnostics; behaviour is unchanged.
        let program = fork_named("helper", yield_now())
            .then(new_mvar_named::<u32>("inbox").and_then(|m| try_put_mvar(m, 1)))
            .and_then(|ok| new_cref_named("counter", 0_u32).map(move |_| ok));
        assert_eq!(run(program), Ok(true));
    }

    #[test]
    fn subconcurrency_returns_inner_result() {
        let program = subconcurrency(pure(41_u32)).map(|r| r.map(|v| v + 1));
        assert_eq!(run(program), Ok(Ok(42)));
    }

    #[test]
    fn subconcurrency_rejected_with_extra_threads() {
        let program = fork(yield_now().then(yield_now()).then(yield_now()))
            .then(subconcurrency(pure(0_u32)));
        assert_eq!(run(program), Err(Failure::IllegalSubconcurrency));
    }
}
