//! Rendezvous variable state.

use crate::action::Value;
use crate::types::ThreadId;

/// One rendezvous variable: an optional value plus the threads waiting on
/// each side of it.
///
/// Wait-sets and the owning threads' `blocking` fields are kept in sync by
/// the executor: a thread appears in a wait-set iff it is blocked on this
/// cell.
#[derive(Default)]
pub(crate) struct MVarState {
    /// The held value, if the variable is full.
    pub(crate) value: Option<Value>,
    /// Putters waiting for the variable to empty.
    pub(crate) waiting_full: Vec<ThreadId>,
    /// Readers and takers waiting for the variable to fill.
    pub(crate) waiting_empty: Vec<ThreadId>,
}

impl MVarState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Removes a thread from both wait-sets, used when an asynchronous
    /// exception unblocks it.
    pub(crate) fn forget_waiter(&mut self, tid: ThreadId) {
        self.waiting_full.retain(|t| *t != tid);
        self.waiting_empty.retain(|t| *t != tid);
    }
}

impl std::fmt::Debug for MVarState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MVarState")
            .field("full", &self.value.is_some())
            .field("waiting_full", &self.waiting_full)
            .field("waiting_empty", &self.waiting_empty)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::value;

    #[test]
    fn forget_waiter_clears_both_sides() {
        let t1 = ThreadId::new_for_test(1);
        let t2 = ThreadId::new_for_test(2);
        let mut mvar = MVarState::new();
        mvar.waiting_full.push(t1);
        mvar.waiting_empty.push(t1);
        mvar.waiting_empty.push(t2);

        mvar.forget_waiter(t1);
        assert!(mvar.waiting_full.is_empty());
        assert_eq!(mvar.waiting_empty, vec![t2]);
    }

    #[test]
    fn starts_empty() {
        let mut mvar = MVarState::new();
        assert!(mvar.value.is_none());
        mvar.value = Some(value(1_u8));
        assert!(mvar.value.is_some());
    }
}
