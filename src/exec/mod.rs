//! The interpreter context and run loop.
//!
//! One [`run_concurrency`] invocation executes a simulated program to
//! completion under a caller-supplied scheduler. The loop classifies the
//! context (terminated, deadlocked, STM-locked), turns pending buffered
//! writes into commit pseudo-threads, consults the scheduler, reduces one
//! step, and records the trace entry, then repeats. All simulated state
//! lives behind this module; user code reaches it only through `Action`
//! trees built by [`crate::program`].

pub mod memory;
pub mod mvar;
pub mod step;
pub mod stm;
pub mod thread;

pub use memory::{MemoryModel, Ticket};
pub use thread::BlockReason;

use crate::action::{downcast, Action, Cont, ThreadAction, Value};
use crate::program::Program;
use crate::sched::Scheduler;
use crate::trace::{decision_of, Trace, TraceEntry};
use crate::tracing_compat::trace;
use crate::types::{commit_thread_id, Failure, IdSource, MVarId, TVarId, ThreadId};
use memory::Memory;
use mvar::MVarState;
use step::{step, Act};
use thread::Threads;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

/// The default simulated capability count.
pub const DEFAULT_CAPABILITIES: u32 = 2;

/// State that survives across nested executions: cells, ids and
/// capabilities are shared between an outer execution and any
/// `subconcurrency` region it runs.
pub(crate) struct Shared {
    pub(crate) memory: Memory,
    pub(crate) mvars: BTreeMap<MVarId, MVarState>,
    pub(crate) tvars: BTreeMap<TVarId, Value>,
    pub(crate) ids: IdSource,
    pub(crate) caps: u32,
    pub(crate) check_invariants: bool,
}

impl Shared {
    pub(crate) fn new(model: MemoryModel, caps: u32, check_invariants: bool) -> Self {
        Self {
            memory: Memory::new(model),
            mvars: BTreeMap::new(),
            tvars: BTreeMap::new(),
            ids: IdSource::new(),
            caps,
            check_invariants,
        }
    }
}

/// The mutable state of one (possibly nested) execution.
pub(crate) struct Context<'a> {
    pub(crate) threads: Threads,
    pub(crate) shared: &'a mut Shared,
}

/// Runs a program under the scheduler, returning its typed result and the
/// trace.
///
/// An `Err` result is either a program outcome (deadlock, uncaught
/// exception), a bound-driven abort, or an engine error; see
/// [`Failure`]. Invariant checking is enabled; use
/// [`run_concurrency_with`] to control it.
pub fn run_concurrency<S, T>(
    sched: &mut S,
    model: MemoryModel,
    caps: u32,
    program: Program<T>,
) -> (Result<T, Failure>, Trace)
where
    S: Scheduler,
    T: std::any::Any + Clone,
{
    run_concurrency_with(sched, model, caps, true, program)
}

/// [`run_concurrency`] with explicit control over per-step invariant
/// checking.
pub fn run_concurrency_with<S, T>(
    sched: &mut S,
    model: MemoryModel,
    caps: u32,
    check_invariants: bool,
    program: Program<T>,
) -> (Result<T, Failure>, Trace)
where
    S: Scheduler,
    T: std::any::Any + Clone,
{
    let mut shared = Shared::new(model, caps, check_invariants);
    let (result, trace) = run_with_shared(sched, &mut shared, program.into_root());
    let result = result.and_then(|v| downcast::<T>(&v).ok_or(Failure::InternalError));
    (result, trace)
}

/// Runs a root action against shared state, used for both the top-level
/// execution and nested `subconcurrency` regions.
pub(crate) fn run_with_shared<S: Scheduler>(
    sched: &mut S,
    shared: &mut Shared,
    root: Box<dyn FnOnce(Cont<Value>) -> Action>,
) -> (Result<Value, Failure>, Trace) {
    let slot: Rc<RefCell<Option<Value>>> = Rc::new(RefCell::new(None));
    let writer = Rc::clone(&slot);
    let final_k: Cont<Value> = Box::new(move |v| {
        *writer.borrow_mut() = Some(v);
        Action::Stop
    });
    let mut ctx = Context {
        threads: Threads::new(root(final_k)),
        shared,
    };
    let (result, trace) = run_loop(sched, &mut ctx, &slot);
    (result, trace)
}

fn run_loop<S: Scheduler>(
    sched: &mut S,
    ctx: &mut Context<'_>,
    slot: &Rc<RefCell<Option<Value>>>,
) -> (Result<Value, Failure>, Trace) {
    let mut trace_entries: Trace = Vec::new();
    let mut prior: Option<(ThreadId, ThreadAction)> = None;

    loop {
        // Termination: the initial thread has disappeared.
        if !ctx.threads.contains(ThreadId::initial()) {
            let result = slot.borrow_mut().take().ok_or(Failure::Abort);
            return (result, trace_entries);
        }

        // Give every pending buffered write a commit pseudo-thread.
        let pending = ctx.shared.memory.pending();
        for ((writer, key), cell) in &pending {
            ctx.threads.fork(
                commit_thread_id(*writer, *key),
                Action::CommitCRef {
                    writer: *writer,
                    key: *key,
                    cell: *cell,
                },
                crate::types::MaskingState::Unmasked,
            );
        }

        let runnable_ids = ctx.threads.runnable();
        if runnable_ids.is_empty() {
            let failure = match ctx.threads.get(ThreadId::initial()).and_then(|r| r.blocking.as_ref())
            {
                Some(BlockReason::OnTVar(_)) => Failure::STMDeadlock,
                Some(_) => Failure::Deadlock,
                None => Failure::InternalError,
            };
            trace!(?failure, steps = trace_entries.len(), "execution stuck");
            return (Err(failure), trace_entries);
        }

        let runnable: Vec<_> = runnable_ids
            .iter()
            .map(|tid| {
                let lookahead = ctx
                    .threads
                    .get(*tid)
                    .map_or(crate::action::Lookahead::WillStop, |r| {
                        r.continuation.lookahead()
                    });
                (*tid, lookahead)
            })
            .collect();

        let chosen = sched.schedule(
            &trace_entries,
            prior.as_ref().map(|(t, a)| (*t, a)),
            &runnable,
        );
        let Some(chosen) = chosen else {
            strip_commits(ctx, &pending);
            return (Err(Failure::Abort), trace_entries);
        };
        if !runnable_ids.contains(&chosen) {
            strip_commits(ctx, &pending);
            return (Err(Failure::InternalError), trace_entries);
        }

        let prior_still_runnable = prior
            .as_ref()
            .is_some_and(|(p, _)| runnable_ids.contains(p));
        let decision = decision_of(prior.as_ref().map(|(p, _)| *p), prior_still_runnable, chosen);

        let outcome = match step(sched, ctx, chosen) {
            Ok(outcome) => outcome,
            Err(failure) => {
                strip_commits(ctx, &pending);
                return (Err(failure), trace_entries);
            }
        };

        match outcome.act {
            Act::Single(action) => {
                trace_entries.push(TraceEntry {
                    decision,
                    runnable,
                    action: action.clone(),
                });
                prior = Some((chosen, action));
            }
            Act::Subc(inner) => {
                trace_entries.push(TraceEntry {
                    decision,
                    runnable,
                    action: ThreadAction::Subconcurrency,
                });
                // Decision labels are resolved against the previous trace
                // entry, so the prior thread must be the last actor of
                // the spliced nested trace.
                let last_actor = crate::trace::acting_threads(&inner)
                    .last()
                    .copied()
                    .unwrap_or(chosen);
                trace_entries.extend(inner);
                prior = Some((last_actor, ThreadAction::Subconcurrency));
            }
        }

        if let Some(failure) = outcome.failure {
            strip_commits(ctx, &pending);
            return (Err(failure), trace_entries);
        }

        // A thread that became interruptible (or died) releases anyone
        // blocked on its mask. Same predicate as ThrowTo delivery.
        let open_to_interrupt = ctx
            .threads
            .get(chosen)
            .map_or(true, thread::ThreadRecord::is_interruptible);
        if open_to_interrupt {
            ctx.threads.wake_on_mask(chosen);
        }

        strip_commits(ctx, &pending);

        if ctx.shared.check_invariants {
            if let Some((p, action)) = &prior {
                if !step_invariants_hold(ctx, *p, action) {
                    return (Err(Failure::InvariantFailure), trace_entries);
                }
            }
        }
    }
}

fn strip_commits(ctx: &mut Context<'_>, pending: &[((ThreadId, Option<crate::types::CRefId>), crate::types::CRefId)]) {
    for ((writer, key), _) in pending {
        ctx.threads.remove(commit_thread_id(*writer, *key));
    }
}

/// Per-step engine invariants: a synchronising action leaves the actor's
/// buffer empty, sequential consistency never buffers, and no blocked
/// thread holds an empty wait-set entry.
fn step_invariants_hold(ctx: &Context<'_>, actor: ThreadId, action: &ThreadAction) -> bool {
    if action.is_barrier() && !actor.is_commit() && !ctx.shared.memory.buffer_empty_for(actor) {
        return false;
    }
    if ctx.shared.memory.model() == MemoryModel::SequentialConsistency
        && !ctx.shared.memory.buffer_empty()
    {
        return false;
    }
    // Wait-set consistency: every waiter recorded on an MVar is blocked
    // on that MVar, and has touched it.
    for (id, mvar) in &ctx.shared.mvars {
        for waiter in mvar.waiting_full.iter().chain(&mvar.waiting_empty) {
            let consistent = ctx.threads.get(*waiter).is_some_and(|r| {
                let blocked_here = matches!(
                    r.blocking,
                    Some(BlockReason::OnMVarFull(m) | BlockReason::OnMVarEmpty(m)) if m == *id
                );
                blocked_here && r.known.contains(&thread::KnownRef::MVar(*id))
            });
            if !consistent {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program;
    use crate::sched::RoundRobinScheduler;

    #[test]
    fn pure_program_terminates() {
        let mut sched = RoundRobinScheduler::new();
        let (result, trace) = run_concurrency(
            &mut sched,
            MemoryModel::SequentialConsistency,
            DEFAULT_CAPABILITIES,
            program::pure(99_u32),
        );
        assert_eq!(result, Ok(99));
        // A pure program's only visible step is its thread finishing.
        assert_eq!(trace.len(), 1);
        assert_eq!(trace[0].action, ThreadAction::Stop);
    }

    #[test]
    fn yield_appears_in_trace() {
        let mut sched = RoundRobinScheduler::new();
        let (result, trace) = run_concurrency(
            &mut sched,
            MemoryModel::SequentialConsistency,
            DEFAULT_CAPABILITIES,
            program::yield_now().map(|()| 1_u8),
        );
        assert_eq!(result, Ok(1));
        assert_eq!(trace.len(), 2);
        assert_eq!(trace[0].action, ThreadAction::Yield);
        assert_eq!(trace[1].action, ThreadAction::Stop);
    }
}
