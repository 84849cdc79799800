//! Identifier types for simulated entities.
//!
//! These types provide type-safe identifiers for the entities a simulated
//! program can touch: threads, rendezvous variables (`MVar`), shared cells
//! (`CRef`) and transactional cells (`TVar`). All identifiers are issued by
//! an [`IdSource`] and are totally ordered by issue order, which keeps
//! runnable lists and exploration maps deterministic.
//!
//! Commit pseudo-threads (the synthetic scheduler entries representing a
//! buffered write's settling) are encoded as negative thread ids, so they
//! sort before every issued id and can never collide with one.

use core::fmt;
use serde::{Deserialize, Serialize};

/// A unique identifier for a simulated thread.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ThreadId(pub(crate) i64);

impl ThreadId {
    /// The root thread of every execution.
    #[must_use]
    pub const fn initial() -> Self {
        Self(0)
    }

    /// True if this id names a commit pseudo-thread rather than a real
    /// simulated thread.
    #[must_use]
    pub const fn is_commit(self) -> bool {
        self.0 < 0
    }

    /// Creates a thread id for testing purposes.
    #[doc(hidden)]
    #[must_use]
    pub const fn new_for_test(id: i64) -> Self {
        Self(id)
    }
}

impl fmt::Debug for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ThreadId({})", self.0)
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_commit() {
            write!(f, "C{}", -self.0)
        } else {
            write!(f, "T{}", self.0)
        }
    }
}

macro_rules! cell_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub(crate) u64);

        impl $name {
            /// Creates an id for testing purposes.
            #[doc(hidden)]
            #[must_use]
            pub const fn new_for_test(id: u64) -> Self {
                Self(id)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

cell_id! {
    /// A unique identifier for a rendezvous variable.
    MVarId, "M"
}

cell_id! {
    /// A unique identifier for a shared mutable cell.
    CRefId, "R"
}

cell_id! {
    /// A unique identifier for a transactional cell.
    TVarId, "V"
}

/// Issues fresh identifiers for one execution.
///
/// Each kind of identifier has its own monotonically-incrementing counter.
/// Thread ids start at 1 because id 0 is reserved for
/// [`ThreadId::initial`]. Every issuing method accepts an optional
/// diagnostic tag, retrievable afterwards with the `*_tag` accessors; tags
/// never participate in identity or ordering.
#[derive(Debug, Default)]
pub struct IdSource {
    next_thread: i64,
    next_mvar: u64,
    next_cref: u64,
    next_tvar: u64,
    thread_tags: Vec<(ThreadId, String)>,
    mvar_tags: Vec<(MVarId, String)>,
    cref_tags: Vec<(CRefId, String)>,
    tvar_tags: Vec<(TVarId, String)>,
}

impl IdSource {
    /// Creates a fresh id source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues the next thread id.
    pub fn next_thread_id(&mut self, tag: Option<String>) -> ThreadId {
        self.next_thread += 1;
        let id = ThreadId(self.next_thread);
        if let Some(tag) = tag {
            self.thread_tags.push((id, tag));
        }
        id
    }

    /// Issues the next `MVar` id.
    pub fn next_mvar_id(&mut self, tag: Option<String>) -> MVarId {
        let id = MVarId(self.next_mvar);
        self.next_mvar += 1;
        if let Some(tag) = tag {
            self.mvar_tags.push((id, tag));
        }
        id
    }

    /// Issues the next `CRef` id.
    pub fn next_cref_id(&mut self, tag: Option<String>) -> CRefId {
        let id = CRefId(self.next_cref);
        self.next_cref += 1;
        if let Some(tag) = tag {
            self.cref_tags.push((id, tag));
        }
        id
    }

    /// Issues the next `TVar` id.
    pub fn next_tvar_id(&mut self, tag: Option<String>) -> TVarId {
        let id = TVarId(self.next_tvar);
        self.next_tvar += 1;
        if let Some(tag) = tag {
            self.tvar_tags.push((id, tag));
        }
        id
    }

    /// Returns the diagnostic tag of a thread id, if one was supplied.
    #[must_use]
    pub fn thread_tag(&self, id: ThreadId) -> Option<&str> {
        self.thread_tags
            .iter()
            .find(|(i, _)| *i == id)
            .map(|(_, t)| t.as_str())
    }

    /// Returns the diagnostic tag of an `MVar` id, if one was supplied.
    #[must_use]
    pub fn mvar_tag(&self, id: MVarId) -> Option<&str> {
        self.mvar_tags
            .iter()
            .find(|(i, _)| *i == id)
            .map(|(_, t)| t.as_str())
    }

    /// Returns the diagnostic tag of a `CRef` id, if one was supplied.
    #[must_use]
    pub fn cref_tag(&self, id: CRefId) -> Option<&str> {
        self.cref_tags
            .iter()
            .find(|(i, _)| *i == id)
            .map(|(_, t)| t.as_str())
    }

    /// Returns the diagnostic tag of a `TVar` id, if one was supplied.
    #[must_use]
    pub fn tvar_tag(&self, id: TVarId) -> Option<&str> {
        self.tvar_tags
            .iter()
            .find(|(i, _)| *i == id)
            .map(|(_, t)| t.as_str())
    }
}

/// Encodes the commit pseudo-thread id for a write-buffer key.
///
/// The key is `(writer, None)` under total store order and
/// `(writer, Some(cell))` under partial store order; the two key shapes
/// never coexist within one execution, so the encodings cannot collide.
#[must_use]
pub(crate) fn commit_thread_id(writer: ThreadId, cell: Option<CRefId>) -> ThreadId {
    let base = writer.0 * 100_000;
    match cell {
        None => ThreadId(-(base + 1)),
        Some(CRefId(c)) => ThreadId(-(base + i64::try_from(c).unwrap_or(0) + 2)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_ids_are_monotonic() {
        let mut ids = IdSource::new();
        let a = ids.next_thread_id(None);
        let b = ids.next_thread_id(None);
        assert!(ThreadId::initial() < a);
        assert!(a < b);
    }

    #[test]
    fn tags_are_retrievable() {
        let mut ids = IdSource::new();
        let t = ids.next_thread_id(Some("worker".to_string()));
        let m = ids.next_mvar_id(Some("inbox".to_string()));
        assert_eq!(ids.thread_tag(t), Some("worker"));
        assert_eq!(ids.mvar_tag(m), Some("inbox"));
        assert_eq!(ids.thread_tag(ThreadId::initial()), None);
    }

    #[test]
    fn commit_ids_sort_before_real_ids() {
        let commit = commit_thread_id(ThreadId(3), Some(CRefId(1)));
        assert!(commit.is_commit());
        assert!(commit < ThreadId::initial());
    }

    #[test]
    fn commit_ids_distinct_per_key() {
        let a = commit_thread_id(ThreadId(1), Some(CRefId(0)));
        let b = commit_thread_id(ThreadId(1), Some(CRefId(1)));
        let c = commit_thread_id(ThreadId(2), Some(CRefId(0)));
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
    }

    #[test]
    fn display_forms() {
        assert_eq!(ThreadId::initial().to_string(), "T0");
        assert_eq!(MVarId(0).to_string(), "M0");
        assert_eq!(CRefId(2).to_string(), "R2");
        assert_eq!(TVarId(7).to_string(), "V7");
    }
}
