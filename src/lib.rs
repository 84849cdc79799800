//! Weft: a systematic concurrency testing engine.
//!
//! # Overview
//!
//! Weft interprets a simulated concurrent program (shared cells,
//! rendezvous variables, software transactional memory, masked
//! asynchronous exceptions, relaxed memory) one step at a time under an
//! externally-driven scheduler, and systematically explores every
//! materially-distinct interleaving with bounded dynamic partial-order
//! reduction. The answer it produces is the full set of reachable
//! outcomes: values, deadlocks, uncaught exceptions, and bound-driven
//! aborts.
//!
//! # Core Guarantees
//!
//! - **Determinism**: the same scheduler decisions always produce the
//!   same execution; there is no host-level concurrency anywhere
//! - **One representative per class**: interleavings that differ only in
//!   the order of independent steps are explored once
//! - **Bounded termination**: pre-emption and fairness bounds make
//!   exploration finish even for non-terminating programs
//! - **Failures are data**: a deadlock is a result, not a panic
//!
//! # Module Structure
//!
//! - [`types`]: identifiers, failures, masking states
//! - [`action`]: the suspended-action program representation
//! - [`program`]: typed combinators that build action trees
//! - [`exec`]: the interpreter context, memory model and run loop
//! - [`sched`]: the scheduler interface and seed-driven schedulers
//! - [`trace`]: execution traces
//! - [`explore`]: bounded DPOR exploration
//! - [`util`]: internal utilities (deterministic RNG)
//!
//! # Example
//!
//! ```
//! use weft::explore::{sct_bounded, Bounds};
//! use weft::exec::MemoryModel;
//! use weft::program;
//!
//! // Two forked writers race on a shared cell; both final values are
//! // reachable, and exploration finds each of them.
//! let executions = sct_bounded(
//!     MemoryModel::SequentialConsistency,
//!     Bounds::default(),
//!     || {
//!         program::new_cref(0_u32).and_then(|cell| {
//!             program::new_mvar::<()>().and_then(move |done| {
//!                 program::fork(program::write_cref(cell, 1).then(program::put_mvar(done, ())))
//!                     .then(program::write_cref(cell, 2))
//!                     .then(program::take_mvar(done))
//!                     .then(program::read_cref(cell))
//!             })
//!         })
//!     },
//! );
//!
//! let outcomes: std::collections::BTreeSet<u32> = executions
//!     .iter()
//!     .filter_map(|e| e.result.clone().ok())
//!     .collect();
//! assert_eq!(outcomes, [1, 2].into_iter().collect());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::module_name_repetitions)]

pub mod action;
pub mod exec;
pub mod explore;
pub mod program;
pub mod sched;
pub mod trace;
pub mod types;
pub mod util;

pub(crate) mod tracing_compat;

// Re-exports for convenient access to the core surface.
pub use action::{Lookahead, ThreadAction};
pub use exec::{run_concurrency, run_concurrency_with, MemoryModel, Ticket};
pub use explore::{explore, sct_bounded, Bounds, Execution, Explorer, Report, Settings};
pub use program::Program;
pub use sched::{RandomScheduler, RoundRobinScheduler, Scheduler};
pub use trace::{Decision, Trace, TraceEntry};
pub use types::{CRefId, Failure, IdSource, MVarId, MaskingState, TVarId, ThreadId};
