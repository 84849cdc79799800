//! Terminal outcomes of a single execution.

use serde::{Deserialize, Serialize};

/// The ways a single execution can end without producing a value.
///
/// The first four are *program* outcomes: legitimate results of running the
/// computation under some schedule. `Abort` is a bound-driven cutoff and
/// not a bug in the program. The remaining two indicate misuse of the
/// engine and should never occur under a conforming scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error, Serialize, Deserialize)]
pub enum Failure {
    /// Every thread is blocked on an `MVar` or a masked throw, including
    /// the initial thread.
    #[error("every thread is blocked on an MVar or a masked throw")]
    Deadlock,

    /// Every thread is blocked, and the initial thread is blocked in an
    /// STM retry that nothing can wake.
    #[error("every thread is blocked inside an STM transaction")]
    STMDeadlock,

    /// An exception reached the top of the initial thread's handler stack.
    #[error("uncaught exception on the initial thread")]
    UncaughtException,

    /// The scheduler gave up on this execution, typically because every
    /// remaining choice was outside the exploration bound.
    #[error("execution aborted by the scheduler")]
    Abort,

    /// `subconcurrency` was used while more than one thread was alive.
    #[error("subconcurrency used while multiple threads were alive")]
    IllegalSubconcurrency,

    /// A per-step engine invariant check failed.
    #[error("an engine invariant was violated during execution")]
    InvariantFailure,

    /// The engine reached a state that should be unreachable, e.g. the
    /// scheduler chose a thread that was not runnable.
    #[error("the engine reached an impossible state")]
    InternalError,
}

impl Failure {
    /// True if this failure is a legitimate program outcome rather than a
    /// bound cutoff or an engine defect.
    #[must_use]
    pub const fn is_program_outcome(self) -> bool {
        matches!(
            self,
            Self::Deadlock | Self::STMDeadlock | Self::UncaughtException | Self::InvariantFailure
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(Failure::Deadlock.is_program_outcome());
        assert!(Failure::UncaughtException.is_program_outcome());
        assert!(!Failure::Abort.is_program_outcome());
        assert!(!Failure::InternalError.is_program_outcome());
    }

    #[test]
    fn display_is_stable() {
        assert_eq!(
            Failure::Abort.to_string(),
            "execution aborted by the scheduler"
        );
    }
}
