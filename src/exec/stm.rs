//! The transaction runner.
//!
//! A whole transaction executes inside a single scheduling step. The
//! runner reduces the [`Stm`] tree against a local write log; the log is
//! only applied to the global store by the caller on success. `or_else`
//! and `catch` snapshot the log on entry so the aborted branch's writes
//! can be rolled back; read and trace information deliberately survives
//! rollback, because a retry's watch set must cover everything the
//! transaction looked at on any attempted path.

use crate::action::stm::{read_tvars, StmCont, TAction, TTrace};
use crate::action::{Exception, Stm, Value};
use crate::types::{Failure, IdSource, TVarId};
use std::collections::{BTreeMap, BTreeSet};

/// What a transaction attempt produced.
pub(crate) enum TxOutcome {
    /// The transaction committed: apply `log`, wake watchers of its keys.
    Success {
        /// The transaction's result value.
        value: Value,
        /// The writes to apply, including freshly created cells.
        log: BTreeMap<TVarId, Value>,
        /// The observed operation record.
        trace: TTrace,
    },
    /// The transaction retried: block watching `watched`.
    Retry {
        /// The cells whose change can wake the transaction.
        watched: BTreeSet<TVarId>,
        /// The observed operation record.
        trace: TTrace,
    },
    /// The transaction aborted with an exception; no writes apply.
    Exception {
        /// The uncaught exception.
        exc: Exception,
        /// The observed operation record.
        trace: TTrace,
    },
}

enum Frame {
    OrElse {
        alt: Box<Stm>,
        snapshot: BTreeMap<TVarId, Value>,
        k: StmCont<Value>,
    },
    Catch {
        handler: Box<dyn FnOnce(Exception) -> Option<Stm>>,
        snapshot: BTreeMap<TVarId, Value>,
        k: StmCont<Value>,
    },
    Cont {
        k: StmCont<Value>,
    },
}

/// Runs one transaction attempt to completion.
pub(crate) fn run_transaction(
    tx: Stm,
    ids: &mut IdSource,
    global: &BTreeMap<TVarId, Value>,
) -> Result<TxOutcome, Failure> {
    let mut log: BTreeMap<TVarId, Value> = BTreeMap::new();
    let mut trace: TTrace = Vec::new();
    let mut frames: Vec<Frame> = Vec::new();
    let mut current = tx;

    loop {
        current = match current {
            Stm::Done(value) => match frames.pop() {
                None => {
                    return Ok(TxOutcome::Success { value, log, trace });
                }
                Some(Frame::OrElse { k, .. } | Frame::Catch { k, .. } | Frame::Cont { k }) => {
                    k(value)
                }
            },
            Stm::New(value, k) => {
                let id = ids.next_tvar_id(None);
                trace.push(TAction::New(id));
                log.insert(id, value);
                k(id)
            }
            Stm::Read(id, k) => {
                trace.push(TAction::Read(id));
                let value = log
                    .get(&id)
                    .or_else(|| global.get(&id))
                    .map(Value::clone)
                    .ok_or(Failure::InternalError)?;
                k(value)
            }
            Stm::Write(id, value, k) => {
                trace.push(TAction::Write(id));
                log.insert(id, value);
                k()
            }
            Stm::OrElse(first, alt, k) => {
                trace.push(TAction::OrElse);
                frames.push(Frame::OrElse {
                    alt,
                    snapshot: log.clone(),
                    k,
                });
                *first
            }
            Stm::Catch { body, handler, k } => {
                trace.push(TAction::Catch);
                frames.push(Frame::Catch {
                    handler,
                    snapshot: log.clone(),
                    k,
                });
                *body
            }
            Stm::Retry => {
                trace.push(TAction::Retry);
                match unwind_to_or_else(&mut frames) {
                    Some((alt, snapshot, k)) => {
                        log = snapshot;
                        frames.push(Frame::Cont { k });
                        *alt
                    }
                    None => {
                        return Ok(TxOutcome::Retry {
                            watched: read_tvars(&trace),
                            trace,
                        });
                    }
                }
            }
            Stm::Throw(exc) => {
                trace.push(TAction::Throw);
                match unwind_to_catch(&mut frames, exc) {
                    Ok((handler_stm, snapshot, k)) => {
                        log = snapshot;
                        frames.push(Frame::Cont { k });
                        handler_stm
                    }
                    Err(exc) => {
                        return Ok(TxOutcome::Exception { exc, trace });
                    }
                }
            }
        };
    }
}

type OrElseResume = (Box<Stm>, BTreeMap<TVarId, Value>, StmCont<Value>);

/// Pops frames until the nearest `or_else`; `catch` does not stop a retry.
fn unwind_to_or_else(frames: &mut Vec<Frame>) -> Option<OrElseResume> {
    while let Some(frame) = frames.pop() {
        if let Frame::OrElse { alt, snapshot, k } = frame {
            return Some((alt, snapshot, k));
        }
    }
    None
}

type CatchResume = (Stm, BTreeMap<TVarId, Value>, StmCont<Value>);

/// Pops frames until a `catch` accepts the exception. Declining handlers
/// are consumed; `or_else` choices do not stop an exception.
fn unwind_to_catch(frames: &mut Vec<Frame>, exc: Exception) -> Result<CatchResume, Exception> {
    while let Some(frame) = frames.pop() {
        if let Frame::Catch {
            handler,
            snapshot,
            k,
        } = frame
        {
            if let Some(stm) = handler(exc.clone()) {
                return Ok((stm, snapshot, k));
            }
        }
    }
    Err(exc)
}
