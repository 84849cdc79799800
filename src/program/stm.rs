//! Typed builders for transactions.
//!
//! An [`StmProgram`] is the transactional sibling of
//! [`crate::program::Program`]: continuation-passing over [`Stm`] trees.
//! Unlike `Program`, a transaction must be re-runnable, since a `retry` wakes
//! up by executing the whole transaction again, so the builders close
//! over `Fn` (not `FnOnce`) and captured values must be `Clone`.

use crate::action::stm::StmCont;
use crate::action::{downcast, value, Exception, Stm, Value};
use crate::types::TVarId;
use std::any::Any;
use std::marker::PhantomData;
use std::rc::Rc;

/// A typed handle to a transactional cell.
pub struct TVar<T> {
    pub(crate) id: TVarId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> TVar<T> {
    pub(crate) const fn from_id(id: TVarId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    /// The raw identifier of this cell.
    #[must_use]
    pub const fn id(&self) -> TVarId {
        self.id
    }
}

impl<T> Clone for TVar<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for TVar<T> {}

impl<T> std::fmt::Debug for TVar<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TVar({})", self.id)
    }
}

/// A composable, re-runnable transactional computation.
pub struct StmProgram<T> {
    build: Rc<dyn Fn(StmCont<T>) -> Stm>,
}

impl<T> Clone for StmProgram<T> {
    fn clone(&self) -> Self {
        Self {
            build: Rc::clone(&self.build),
        }
    }
}

impl<T: 'static> StmProgram<T> {
    pub(crate) fn new(build: impl Fn(StmCont<T>) -> Stm + 'static) -> Self {
        Self {
            build: Rc::new(build),
        }
    }

    /// Builds one attempt's `Stm` tree, terminating in the continuation.
    pub(crate) fn run(&self, k: StmCont<T>) -> Stm {
        (self.build)(k)
    }

    /// Sequences a dependent transaction after this one.
    #[must_use]
    pub fn and_then<U: 'static>(
        self,
        f: impl Fn(T) -> StmProgram<U> + 'static,
    ) -> StmProgram<U> {
        let f = Rc::new(f);
        StmProgram::new(move |k| {
            let f = Rc::clone(&f);
            self.run(Box::new(move |t| f(t).run(k)))
        })
    }

    /// Applies a function to the result.
    #[must_use]
    pub fn map<U: 'static>(self, f: impl Fn(T) -> U + 'static) -> StmProgram<U> {
        let f = Rc::new(f);
        StmProgram::new(move |k| {
            let f = Rc::clone(&f);
            self.run(Box::new(move |t| k(f(t))))
        })
    }

    /// Sequences an independent transaction after this one.
    #[must_use]
    pub fn then<U: 'static>(self, next: StmProgram<U>) -> StmProgram<U> {
        self.and_then(move |_| next.clone())
    }
}

/// A transaction producing the value without touching any cell.
#[must_use]
pub fn pure<T: Any + Clone>(t: T) -> StmProgram<T> {
    StmProgram::new(move |k| k(t.clone()))
}

/// Allocates a transactional cell.
#[must_use]
pub fn new_tvar<T: Any + Clone>(init: T) -> StmProgram<TVar<T>> {
    StmProgram::new(move |k| {
        Stm::New(
            value(init.clone()),
            Box::new(move |id| k(TVar::from_id(id))),
        )
    })
}

/// Reads a transactional cell.
#[must_use]
pub fn read_tvar<T: Any + Clone>(tvar: TVar<T>) -> StmProgram<T> {
    StmProgram::new(move |k| Stm::Read(tvar.id, typed(k)))
}

/// Writes a transactional cell.
#[must_use]
pub fn write_tvar<T: Any + Clone>(tvar: TVar<T>, v: T) -> StmProgram<()> {
    StmProgram::new(move |k| {
        Stm::Write(tvar.id, value(v.clone()), Box::new(move || k(())))
    })
}

/// Abandons the attempt and blocks until a read cell changes.
#[must_use]
pub fn retry<T: 'static>() -> StmProgram<T> {
    StmProgram::new(|_k| Stm::Retry)
}

/// Tries `first`; if it retries, rolls back and tries `second`.
#[must_use]
pub fn or_else<T: Any + Clone>(first: StmProgram<T>, second: StmProgram<T>) -> StmProgram<T> {
    StmProgram::new(move |k| {
        Stm::OrElse(
            Box::new(first.run(Box::new(|t| Stm::Done(value(t))))),
            Box::new(second.run(Box::new(|t| Stm::Done(value(t))))),
            typed(k),
        )
    })
}

/// Aborts the transaction with an exception.
#[must_use]
pub fn throw_stm<T: 'static, E: Any + Clone>(e: E) -> StmProgram<T> {
    StmProgram::new(move |_k| Stm::Throw(Exception::new(e.clone())))
}

/// Guards a transaction with a typed handler. Exceptions of other types
/// pass through; `retry` is never caught.
#[must_use]
pub fn catch_stm<T, E>(
    body: StmProgram<T>,
    handler: impl Fn(E) -> StmProgram<T> + 'static,
) -> StmProgram<T>
where
    T: Any + Clone,
    E: Any + Clone,
{
    let handler = Rc::new(handler);
    StmProgram::new(move |k| {
        let handler = Rc::clone(&handler);
        Stm::Catch {
            body: Box::new(body.run(Box::new(|t| Stm::Done(value(t))))),
            handler: Box::new(move |exc| {
                exc.downcast::<E>()
                    .map(|e| handler(e).run(Box::new(|t| Stm::Done(value(t)))))
            }),
            k: typed(k),
        }
    })
}

/// Adapts a typed continuation to the untyped `Stm` boundary. A mismatch
/// surfaces as a simulated exception rather than a host panic.
fn typed<T: Any + Clone>(k: StmCont<T>) -> StmCont<Value> {
    Box::new(move |v| match downcast::<T>(&v) {
        Some(t) => k(t),
        None => Stm::Throw(Exception::new(crate::program::TypeMismatch {
            expected: std::any::type_name::<T>(),
        })),
    })
}
