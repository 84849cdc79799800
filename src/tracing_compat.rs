//! Tracing compatibility layer.
//!
//! Structured logging is gated behind the `tracing-integration` feature:
//! with it enabled this module re-exports the `tracing` macros, without it
//! the same names compile to nothing. Engine code imports from here so it
//! never references `tracing` directly.

#[cfg(feature = "tracing-integration")]
pub(crate) use tracing::{debug, trace};

#[cfg(not(feature = "tracing-integration"))]
mod noop {
    /// No-op debug-level logging macro.
    macro_rules! debug {
        ($($arg:tt)*) => {};
    }

    /// No-op trace-level logging macro.
    macro_rules! trace {
        ($($arg:tt)*) => {};
    }

    pub(crate) use {debug, trace};
}

#[cfg(not(feature = "tracing-integration"))]
pub(crate) use noop::{debug, trace};
