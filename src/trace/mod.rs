//! Execution traces.
//!
//! A trace totally orders the steps of one execution. Each entry records
//! the scheduling [`Decision`] that chose the acting thread, a snapshot of
//! every runnable thread with its [`Lookahead`] at that point, and the
//! [`ThreadAction`] that actually occurred. The DPOR machinery consumes
//! traces entry-by-entry, so the entries carry everything it needs: no
//! side tables.

use crate::action::{Lookahead, ThreadAction};
use crate::types::ThreadId;
use serde::{Deserialize, Serialize};

/// How the chosen thread at a step related to the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    /// The previous thread was no longer runnable; this one was started.
    Start(ThreadId),
    /// The same thread continued.
    Continue,
    /// The previous thread was still runnable but this one pre-empted it.
    SwitchTo(ThreadId),
}

impl Decision {
    /// The thread this decision chose, given the previously chosen one.
    #[must_use]
    pub const fn tid_of(self, prior: ThreadId) -> ThreadId {
        match self {
            Self::Start(t) | Self::SwitchTo(t) => t,
            Self::Continue => prior,
        }
    }
}

/// Computes the decision label for choosing `chosen` after `prior`.
#[must_use]
pub fn decision_of(
    prior: Option<ThreadId>,
    prior_still_runnable: bool,
    chosen: ThreadId,
) -> Decision {
    match prior {
        Some(p) if p == chosen => Decision::Continue,
        Some(_) if prior_still_runnable => Decision::SwitchTo(chosen),
        _ => Decision::Start(chosen),
    }
}

/// One step of an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEntry {
    /// How the acting thread was chosen.
    pub decision: Decision,
    /// Every runnable thread at this point, sorted by id, with its
    /// predicted next step.
    pub runnable: Vec<(ThreadId, Lookahead)>,
    /// What the acting thread did.
    pub action: ThreadAction,
}

/// The ordered steps of one execution.
pub type Trace = Vec<TraceEntry>;

/// Resolves each entry's acting thread, in order.
///
/// `Continue` decisions inherit the previous entry's thread; the first
/// entry is always a `Start`.
#[must_use]
pub fn acting_threads(trace: &[TraceEntry]) -> Vec<ThreadId> {
    let mut out = Vec::with_capacity(trace.len());
    let mut prior = ThreadId::initial();
    for entry in trace {
        prior = entry.decision.tid_of(prior);
        out.push(prior);
    }
    out
}
