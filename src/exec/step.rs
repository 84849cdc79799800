//! The single-step executor.
//!
//! `step` consumes the chosen thread's head action and reduces exactly one
//! step, mutating the context and reporting the observed [`ThreadAction`].
//! Operations that cannot complete reconstruct their action, so the thread
//! re-attempts them when next woken. Failures split two ways: a failure in
//! the returned [`StepOutcome`] ends the execution *after* its step is
//! recorded in the trace; an `Err` is an engine-invariant breach recorded
//! without a step.

use crate::action::{Action, Cont, Exception, ThreadAction, Value};
use crate::exec::mvar::MVarState;
use crate::exec::stm::{run_transaction, TxOutcome};
use crate::exec::thread::{BlockReason, KnownRef};
use crate::exec::{run_with_shared, Context};
use crate::sched::Scheduler;
use crate::trace::Trace;
use crate::types::{Failure, ThreadId};
use std::cell::RefCell;
use std::rc::Rc;

/// What one step contributed to the trace.
pub(crate) enum Act {
    /// A single observed action.
    Single(ThreadAction),
    /// A nested execution: a `Subconcurrency` marker followed by the
    /// nested trace.
    Subc(Trace),
}

/// The result of one successful dispatch.
pub(crate) struct StepOutcome {
    pub(crate) act: Act,
    /// A failure that ends the execution after this step is recorded.
    pub(crate) failure: Option<Failure>,
}

impl StepOutcome {
    fn single(action: ThreadAction) -> Self {
        Self {
            act: Act::Single(action),
            failure: None,
        }
    }

    fn failing(action: ThreadAction, failure: Failure) -> Self {
        Self {
            act: Act::Single(action),
            failure: Some(failure),
        }
    }
}

/// Reduces one step of the chosen thread.
///
/// The caller guarantees `chosen` is runnable; anything else is an engine
/// error.
pub(crate) fn step<S: Scheduler>(
    sched: &mut S,
    ctx: &mut Context<'_>,
    chosen: ThreadId,
) -> Result<StepOutcome, Failure> {
    let action = {
        let record = ctx.threads.get_mut(chosen).ok_or(Failure::InternalError)?;
        if record.blocking.is_some() {
            return Err(Failure::InternalError);
        }
        std::mem::replace(&mut record.continuation, Action::Stop)
    };

    match action {
        Action::Fork { name, body, k } => {
            let masking = ctx
                .threads
                .get(chosen)
                .map(|r| r.masking)
                .ok_or(Failure::InternalError)?;
            let new = ctx.shared.ids.next_thread_id(name);
            ctx.threads.fork(new, body(), masking);
            goto(ctx, chosen, k(new));
            Ok(StepOutcome::single(ThreadAction::Fork(new)))
        }

        Action::MyTid(k) => {
            goto(ctx, chosen, k(chosen));
            Ok(StepOutcome::single(ThreadAction::MyThreadId))
        }

        Action::GetCaps(k) => {
            let caps = ctx.shared.caps;
            goto(ctx, chosen, k(caps));
            Ok(StepOutcome::single(ThreadAction::GetNumCapabilities(caps)))
        }

        Action::SetCaps(n, k) => {
            ctx.shared.caps = n;
            goto(ctx, chosen, k());
            Ok(StepOutcome::single(ThreadAction::SetNumCapabilities(n)))
        }

        Action::Yield(k) => {
            goto(ctx, chosen, k());
            Ok(StepOutcome::single(ThreadAction::Yield))
        }

        Action::Return(k) => {
            goto(ctx, chosen, k());
            Ok(StepOutcome::single(ThreadAction::Return))
        }

        Action::Message(_payload, k) => {
            goto(ctx, chosen, k());
            Ok(StepOutcome::single(ThreadAction::Message))
        }

        Action::LiftExternal(effect, k) => {
            let result = effect();
            goto(ctx, chosen, k(result));
            Ok(StepOutcome::single(ThreadAction::External))
        }

        Action::Stop => {
            ctx.threads.remove(chosen);
            Ok(StepOutcome::single(ThreadAction::Stop))
        }

        Action::NewMVar(name, k) => {
            let id = ctx.shared.ids.next_mvar_id(name);
            ctx.shared.mvars.insert(id, MVarState::new());
            know(ctx, chosen, KnownRef::MVar(id));
            goto(ctx, chosen, k(id));
            Ok(StepOutcome::single(ThreadAction::NewMVar(id)))
        }

        Action::PutMVar(m, value, k) => {
            ctx.shared.memory.barrier(chosen)?;
            know(ctx, chosen, KnownRef::MVar(m));
            let mvar = ctx.shared.mvars.get_mut(&m).ok_or(Failure::InternalError)?;
            if mvar.value.is_none() {
                mvar.value = Some(value);
                let woken = std::mem::take(&mut mvar.waiting_empty);
                wake_all(ctx, &woken);
                goto(ctx, chosen, k());
                Ok(StepOutcome::single(ThreadAction::PutMVar(m, woken)))
            } else {
                mvar.waiting_full.push(chosen);
                block(ctx, chosen, Action::PutMVar(m, value, k), BlockReason::OnMVarFull(m));
                Ok(StepOutcome::single(ThreadAction::BlockedPutMVar(m)))
            }
        }

        Action::TryPutMVar(m, value, k) => {
            ctx.shared.memory.barrier(chosen)?;
            know(ctx, chosen, KnownRef::MVar(m));
            let mvar = ctx.shared.mvars.get_mut(&m).ok_or(Failure::InternalError)?;
            if mvar.value.is_none() {
                mvar.value = Some(value);
                let woken = std::mem::take(&mut mvar.waiting_empty);
                wake_all(ctx, &woken);
                goto(ctx, chosen, k(true));
                Ok(StepOutcome::single(ThreadAction::TryPutMVar(m, true, woken)))
            } else {
                goto(ctx, chosen, k(false));
                Ok(StepOutcome::single(ThreadAction::TryPutMVar(m, false, vec![])))
            }
        }

        Action::ReadMVar(m, k) => {
            ctx.shared.memory.barrier(chosen)?;
            know(ctx, chosen, KnownRef::MVar(m));
            let mvar = ctx.shared.mvars.get_mut(&m).ok_or(Failure::InternalError)?;
            if let Some(value) = &mvar.value {
                let value = Value::clone(value);
                goto(ctx, chosen, k(value));
                Ok(StepOutcome::single(ThreadAction::ReadMVar(m)))
            } else {
                mvar.waiting_empty.push(chosen);
                block(ctx, chosen, Action::ReadMVar(m, k), BlockReason::OnMVarEmpty(m));
                Ok(StepOutcome::single(ThreadAction::BlockedReadMVar(m)))
            }
        }

        Action::TryReadMVar(m, k) => {
            ctx.shared.memory.barrier(chosen)?;
            know(ctx, chosen, KnownRef::MVar(m));
            let mvar = ctx.shared.mvars.get(&m).ok_or(Failure::InternalError)?;
            let value = mvar.value.as_ref().map(Value::clone);
            let success = value.is_some();
            goto(ctx, chosen, k(value));
            Ok(StepOutcome::single(ThreadAction::TryReadMVar(m, success)))
        }

        Action::TakeMVar(m, k) => {
            ctx.shared.memory.barrier(chosen)?;
            know(ctx, chosen, KnownRef::MVar(m));
            let mvar = ctx.shared.mvars.get_mut(&m).ok_or(Failure::InternalError)?;
            if let Some(value) = mvar.value.take() {
                let woken = std::mem::take(&mut mvar.waiting_full);
                wake_all(ctx, &woken);
                goto(ctx, chosen, k(value));
                Ok(StepOutcome::single(ThreadAction::TakeMVar(m, woken)))
            } else {
                mvar.waiting_empty.push(chosen);
                block(ctx, chosen, Action::TakeMVar(m, k), BlockReason::OnMVarEmpty(m));
                Ok(StepOutcome::single(ThreadAction::BlockedTakeMVar(m)))
            }
        }

        Action::TryTakeMVar(m, k) => {
            ctx.shared.memory.barrier(chosen)?;
            know(ctx, chosen, KnownRef::MVar(m));
            let mvar = ctx.shared.mvars.get_mut(&m).ok_or(Failure::InternalError)?;
            if let Some(value) = mvar.value.take() {
                let woken = std::mem::take(&mut mvar.waiting_full);
                wake_all(ctx, &woken);
                goto(ctx, chosen, k(Some(value)));
                Ok(StepOutcome::single(ThreadAction::TryTakeMVar(m, true, woken)))
            } else {
                goto(ctx, chosen, k(None));
                Ok(StepOutcome::single(ThreadAction::TryTakeMVar(m, false, vec![])))
            }
        }

        Action::NewCRef(name, value, k) => {
            let id = ctx.shared.ids.next_cref_id(name);
            ctx.shared.memory.alloc(id, value);
            know(ctx, chosen, KnownRef::CRef(id));
            goto(ctx, chosen, k(id));
            Ok(StepOutcome::single(ThreadAction::NewCRef(id)))
        }

        Action::ReadCRef(r, k) => {
            let value = ctx.shared.memory.read(chosen, r)?;
            know(ctx, chosen, KnownRef::CRef(r));
            goto(ctx, chosen, k(value));
            Ok(StepOutcome::single(ThreadAction::ReadCRef(r)))
        }

        Action::ReadCRefCas(r, k) => {
            let ticket = ctx.shared.memory.ticket(chosen, r)?;
            know(ctx, chosen, KnownRef::CRef(r));
            goto(ctx, chosen, k(ticket));
            Ok(StepOutcome::single(ThreadAction::ReadForCas(r)))
        }

        Action::ModCRef(r, f, k) => {
            ctx.shared.memory.barrier(chosen)?;
            know(ctx, chosen, KnownRef::CRef(r));
            let old = ctx.shared.memory.read(chosen, r)?;
            let (new, result) = f(old);
            ctx.shared.memory.write_immediate(r, new)?;
            goto(ctx, chosen, k(result));
            Ok(StepOutcome::single(ThreadAction::ModCRef(r)))
        }

        Action::ModCRefCas(r, f, k) => {
            ctx.shared.memory.barrier(chosen)?;
            know(ctx, chosen, KnownRef::CRef(r));
            let old = ctx.shared.memory.read(chosen, r)?;
            let (new, result) = f(old);
            ctx.shared.memory.write_immediate(r, new)?;
            goto(ctx, chosen, k(result));
            Ok(StepOutcome::single(ThreadAction::ModCRefCas(r)))
        }

        Action::WriteCRef(r, value, k) => {
            ctx.shared.memory.write(chosen, r, value)?;
            know(ctx, chosen, KnownRef::CRef(r));
            goto(ctx, chosen, k());
            Ok(StepOutcome::single(ThreadAction::WriteCRef(r)))
        }

        Action::CasCRef(r, ticket, value, k) => {
            ctx.shared.memory.barrier(chosen)?;
            know(ctx, chosen, KnownRef::CRef(r));
            let (success, after) = ctx.shared.memory.cas(chosen, r, &ticket, value)?;
            goto(ctx, chosen, k((success, after)));
            Ok(StepOutcome::single(ThreadAction::CasCRef(r, success)))
        }

        Action::CommitCRef { writer, key, cell } => {
            let committed = ctx.shared.memory.commit((writer, key))?;
            if committed != cell {
                return Err(Failure::InternalError);
            }
            Ok(StepOutcome::single(ThreadAction::CommitCRef(writer, cell)))
        }

        Action::Atomically(mut tx, k) => {
            ctx.shared.memory.barrier(chosen)?;
            let outcome = run_transaction(tx(), &mut ctx.shared.ids, &ctx.shared.tvars)?;
            match outcome {
                TxOutcome::Success { value, log, trace } => {
                    let written = crate::action::stm::written_tvars(&trace);
                    for (id, value) in log {
                        ctx.shared.tvars.insert(id, value);
                    }
                    let woken = ctx.threads.wake_on_tvars(&written);
                    goto(ctx, chosen, k(value));
                    Ok(StepOutcome::single(ThreadAction::Stm(trace, woken)))
                }
                TxOutcome::Retry { watched, trace } => {
                    block(
                        ctx,
                        chosen,
                        Action::Atomically(tx, k),
                        BlockReason::OnTVar(watched),
                    );
                    Ok(StepOutcome::single(ThreadAction::BlockedStm(trace)))
                }
                TxOutcome::Exception { exc, trace } => {
                    let fails = propagate(ctx, chosen, &exc)?;
                    let action = ThreadAction::ThrownStm(trace);
                    if fails {
                        Ok(StepOutcome::failing(action, Failure::UncaughtException))
                    } else {
                        Ok(StepOutcome::single(action))
                    }
                }
            }
        }

        Action::Throw(exc) => {
            let fails = propagate(ctx, chosen, &exc)?;
            if fails {
                Ok(StepOutcome::failing(ThreadAction::Throw, Failure::UncaughtException))
            } else {
                Ok(StepOutcome::single(ThreadAction::Throw))
            }
        }

        Action::ThrowTo(target, exc, k) => {
            ctx.shared.memory.barrier(chosen)?;
            enum Target {
                Gone,
                Open,
                Masked,
            }
            let state = match ctx.threads.get(target) {
                None => Target::Gone,
                Some(record) if record.is_interruptible() => Target::Open,
                Some(_) => Target::Masked,
            };
            match state {
                Target::Gone => {
                    // The target already finished; delivery trivially
                    // succeeds.
                    goto(ctx, chosen, k());
                    Ok(StepOutcome::single(ThreadAction::ThrowTo(target)))
                }
                Target::Open => {
                    unblock(ctx, target);
                    let fails = propagate(ctx, target, &exc)?;
                    goto(ctx, chosen, k());
                    let action = ThreadAction::ThrowTo(target);
                    if fails {
                        Ok(StepOutcome::failing(action, Failure::UncaughtException))
                    } else {
                        Ok(StepOutcome::single(action))
                    }
                }
                Target::Masked => {
                    block(
                        ctx,
                        chosen,
                        Action::ThrowTo(target, exc, k),
                        BlockReason::OnMask(target),
                    );
                    Ok(StepOutcome::single(ThreadAction::BlockedThrowTo(target)))
                }
            }
        }

        Action::Catching { body, handler, k } => {
            let saved_mask = ctx
                .threads
                .get(chosen)
                .map(|r| r.masking)
                .ok_or(Failure::InternalError)?;

            // Exactly one of the body continuation and the handler runs,
            // so they share the outer continuation through a cell.
            let shared_k = Rc::new(RefCell::new(Some(k)));
            let body_cell = Rc::clone(&shared_k);
            let body_k: Cont<Value> = Box::new(move |v| {
                body_cell.borrow_mut().take().map_or(Action::Stop, |k| {
                    Action::PopCatching(Box::new(move || k(v)))
                })
            });

            let accept = Box::new(move |exc: Exception| {
                let handler_k: Cont<Value> = Box::new(move |v| {
                    shared_k.borrow_mut().take().map_or(Action::Stop, |k| k(v))
                });
                handler(exc, handler_k)
            });

            let record = ctx.threads.get_mut(chosen).ok_or(Failure::InternalError)?;
            record.handlers.push(crate::exec::thread::Handler {
                accept,
                saved_mask,
            });
            record.continuation = body(body_k);
            Ok(StepOutcome::single(ThreadAction::Catching))
        }

        Action::PopCatching(k) => {
            let record = ctx.threads.get_mut(chosen).ok_or(Failure::InternalError)?;
            record.handlers.pop().ok_or(Failure::InternalError)?;
            goto(ctx, chosen, k());
            Ok(StepOutcome::single(ThreadAction::PopCatching))
        }

        Action::Masking { state, body, k } => {
            let record = ctx.threads.get_mut(chosen).ok_or(Failure::InternalError)?;
            let saved = record.masking;
            record.masking = state;
            let umask = crate::action::Umask {
                entered: state,
                saved,
            };
            let body_k: Cont<Value> = Box::new(move |v| Action::ResetMask {
                set: false,
                explicit: false,
                state: saved,
                k: Box::new(move || k(v)),
            });
            record.continuation = body(umask, body_k);
            Ok(StepOutcome::single(ThreadAction::SetMasking(false, state)))
        }

        Action::ResetMask {
            set,
            explicit,
            state,
            k,
        } => {
            let record = ctx.threads.get_mut(chosen).ok_or(Failure::InternalError)?;
            record.masking = state;
            record.continuation = k();
            let action = if set {
                ThreadAction::SetMasking(explicit, state)
            } else {
                ThreadAction::ResetMasking(explicit, state)
            };
            Ok(StepOutcome::single(action))
        }

        Action::Subconcurrency { inner, k } => {
            // Commit pseudo-threads do not count as live threads.
            let live = ctx.threads.iter().filter(|(id, _)| !id.is_commit()).count();
            if live > 1 {
                return Ok(StepOutcome::failing(
                    ThreadAction::Subconcurrency,
                    Failure::IllegalSubconcurrency,
                ));
            }
            let (result, inner_trace) = run_with_shared(sched, ctx.shared, inner);
            goto(
                ctx,
                chosen,
                Action::StopSubconcurrency(Box::new(move || k(result))),
            );
            Ok(StepOutcome {
                act: Act::Subc(inner_trace),
                failure: None,
            })
        }

        Action::StopSubconcurrency(k) => {
            goto(ctx, chosen, k());
            Ok(StepOutcome::single(ThreadAction::StopSubconcurrency))
        }
    }
}

/// Sets the thread's next action.
fn goto(ctx: &mut Context<'_>, tid: ThreadId, action: Action) {
    if let Some(record) = ctx.threads.get_mut(tid) {
        record.continuation = action;
    }
}

/// Reinstates an incomplete action and suspends the thread.
fn block(ctx: &mut Context<'_>, tid: ThreadId, action: Action, reason: BlockReason) {
    if let Some(record) = ctx.threads.get_mut(tid) {
        record.continuation = action;
        record.blocking = Some(reason);
    }
}

/// Records a touched cell on the thread.
fn know(ctx: &mut Context<'_>, tid: ThreadId, cell: KnownRef) {
    if let Some(record) = ctx.threads.get_mut(tid) {
        record.known.insert(cell);
    }
}

fn wake_all(ctx: &mut Context<'_>, woken: &[ThreadId]) {
    for tid in woken {
        ctx.threads.wake(*tid);
    }
}

/// Clears a thread's blocked state, removing it from any wait-set.
fn unblock(ctx: &mut Context<'_>, tid: ThreadId) {
    let reason = ctx.threads.get(tid).and_then(|r| r.blocking.clone());
    match reason {
        Some(BlockReason::OnMVarFull(m) | BlockReason::OnMVarEmpty(m)) => {
            if let Some(mvar) = ctx.shared.mvars.get_mut(&m) {
                mvar.forget_waiter(tid);
            }
        }
        Some(BlockReason::OnTVar(_) | BlockReason::OnMask(_)) | None => {}
    }
    ctx.threads.wake(tid);
}

/// Delivers an exception along the thread's handler stack.
///
/// Declining handlers are popped and discarded. Returns true when the
/// exception escaped the initial thread's stack, which fails the whole
/// execution; an escape on any other thread just kills that thread.
fn propagate(ctx: &mut Context<'_>, tid: ThreadId, exc: &Exception) -> Result<bool, Failure> {
    loop {
        let handler = match ctx.threads.get_mut(tid) {
            Some(record) => record.handlers.pop(),
            None => return Err(Failure::InternalError),
        };
        match handler {
            Some(handler) => {
                if let Some(action) = (handler.accept)(exc.clone()) {
                    let record = ctx.threads.get_mut(tid).ok_or(Failure::InternalError)?;
                    record.masking = handler.saved_mask;
                    record.continuation = action;
                    record.blocking = None;
                    return Ok(false);
                }
            }
            None => {
                if tid == ThreadId::initial() {
                    return Ok(true);
                }
                ctx.threads.remove(tid);
                return Ok(false);
            }
        }
    }
}
