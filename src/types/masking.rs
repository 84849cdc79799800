//! Asynchronous-exception masking states.

use serde::{Deserialize, Serialize};

/// The masking state of a simulated thread.
///
/// Masking controls whether an asynchronous throw (`throw_to`) can
/// interrupt the thread. `MaskedInterruptible` threads can still be
/// interrupted while blocked on an interruptible primitive;
/// `MaskedUninterruptible` threads never can.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MaskingState {
    /// Asynchronous exceptions are delivered immediately.
    #[default]
    Unmasked,
    /// Delivery is deferred unless the thread is blocked interruptibly.
    MaskedInterruptible,
    /// Delivery is deferred unconditionally.
    MaskedUninterruptible,
}

impl MaskingState {
    /// True unless the state is `MaskedUninterruptible`.
    #[must_use]
    pub const fn allows_interrupt_while_blocked(self) -> bool {
        !matches!(self, Self::MaskedUninterruptible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_unmasked() {
        assert_eq!(MaskingState::default(), MaskingState::Unmasked);
    }

    #[test]
    fn uninterruptible_blocks_delivery() {
        assert!(MaskingState::Unmasked.allows_interrupt_while_blocked());
        assert!(MaskingState::MaskedInterruptible.allows_interrupt_while_blocked());
        assert!(!MaskingState::MaskedUninterruptible.allows_interrupt_while_blocked());
    }
}
