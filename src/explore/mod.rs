//! Bounded systematic exploration.
//!
//! This module is the engine's second half: it drives the interpreter in
//! [`crate::exec`] through every materially-distinct interleaving of a
//! program, within configurable bounds.
//!
//! - [`dependency`]: the dependence relation between steps
//! - [`bounds`]: pre-emption and fairness bounds
//! - [`dpor`]: the exploration tree and prefix extraction
//! - [`backtrack`]: backtracking-point computation over finished traces
//! - [`scheduler`]: the prefix-replaying, sleep-set-aware scheduler
//! - [`explorer`]: the driving iterator and summary report

pub mod backtrack;
pub mod bounds;
pub mod dependency;
pub mod dpor;
pub mod explorer;
pub mod scheduler;

pub use backtrack::{find_backtrack_steps, BacktrackStep};
pub use bounds::Bounds;
pub use dependency::{dependent, dependent_lookahead, DepState};
pub use dpor::{DporTree, SchedulePrefix};
pub use explorer::{explore, sct_bounded, Execution, Explorer, Report, Settings};
pub use scheduler::DporScheduler;
