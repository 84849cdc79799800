//! The transactional sub-language.
//!
//! [`Stm`] is the suspended form of a transaction: a tree of primitive
//! transactional operations, each carrying a continuation, terminated by
//! [`Stm::Done`]. The STM sub-interpreter reduces this tree inside a
//! single scheduling step, producing a write log to commit (or discard)
//! and a [`TTrace`] recording what the transaction touched.

use crate::action::{Exception, Value};
use crate::types::TVarId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A continuation within a transaction.
pub type StmCont<T> = Box<dyn FnOnce(T) -> Stm>;

/// A suspended transactional computation.
pub enum Stm {
    /// The transaction finished with this result.
    Done(Value),
    /// Allocate a fresh transactional cell holding the value.
    New(Value, StmCont<TVarId>),
    /// Read a transactional cell.
    Read(TVarId, StmCont<Value>),
    /// Write a transactional cell.
    Write(TVarId, Value, Box<dyn FnOnce() -> Stm>),
    /// Abandon the transaction and block until a read cell changes.
    Retry,
    /// Run the first branch; on `Retry`, roll its writes back and run the
    /// second. Either branch's result feeds the continuation.
    OrElse(Box<Stm>, Box<Stm>, StmCont<Value>),
    /// Run the body; on an exception it accepts, roll the body's writes
    /// back and run the handler. `Retry` is never caught.
    Catch {
        /// The guarded computation.
        body: Box<Stm>,
        /// Returns `None` to decline an exception it cannot handle.
        handler: Box<dyn FnOnce(Exception) -> Option<Stm>>,
        /// Receives the body's (or handler's) result.
        k: StmCont<Value>,
    },
    /// Abort the transaction with an exception.
    Throw(Exception),
}

impl std::fmt::Debug for Stm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Done(_) => "Done",
            Self::New(..) => "New",
            Self::Read(..) => "Read",
            Self::Write(..) => "Write",
            Self::Retry => "Retry",
            Self::OrElse(..) => "OrElse",
            Self::Catch { .. } => "Catch",
            Self::Throw(_) => "Throw",
        };
        f.write_str(name)
    }
}

/// One observed transactional operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TAction {
    /// Allocated a transactional cell.
    New(TVarId),
    /// Read a transactional cell.
    Read(TVarId),
    /// Wrote a transactional cell.
    Write(TVarId),
    /// Hit `retry`.
    Retry,
    /// Entered an `or_else` choice.
    OrElse,
    /// Entered a `catch` region.
    Catch,
    /// Aborted with an exception.
    Throw,
}

/// The observed record of one transaction attempt.
pub type TTrace = Vec<TAction>;

/// All transactional cells a transaction touched.
#[must_use]
pub fn touched_tvars(trace: &[TAction]) -> BTreeSet<TVarId> {
    trace
        .iter()
        .filter_map(|t| match t {
            TAction::New(v) | TAction::Read(v) | TAction::Write(v) => Some(*v),
            _ => None,
        })
        .collect()
}

/// The transactional cells a transaction wrote or created.
#[must_use]
pub fn written_tvars(trace: &[TAction]) -> BTreeSet<TVarId> {
    trace
        .iter()
        .filter_map(|t| match t {
            TAction::New(v) | TAction::Write(v) => Some(*v),
            _ => None,
        })
        .collect()
}

/// The transactional cells a transaction read: its retry watch set.
#[must_use]
pub fn read_tvars(trace: &[TAction]) -> BTreeSet<TVarId> {
    trace
        .iter()
        .filter_map(|t| match t {
            TAction::Read(v) => Some(*v),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(n: u64) -> TVarId {
        TVarId::new_for_test(n)
    }

    #[test]
    fn tvar_set_extraction() {
        let trace = vec![
            TAction::New(v(0)),
            TAction::Read(v(1)),
            TAction::Write(v(2)),
            TAction::OrElse,
            TAction::Read(v(2)),
        ];
        assert_eq!(touched_tvars(&trace).len(), 3);
        assert_eq!(written_tvars(&trace), [v(0), v(2)].into_iter().collect());
        assert_eq!(read_tvars(&trace), [v(1), v(2)].into_iter().collect());
    }

    #[test]
    fn control_actions_touch_nothing() {
        let trace = vec![TAction::Retry, TAction::Catch, TAction::Throw];
        assert!(touched_tvars(&trace).is_empty());
    }
}
