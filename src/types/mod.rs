//! Core types shared across the engine.
//!
//! - [`id`]: identifier types and the [`IdSource`] that issues them
//! - [`failure`]: terminal outcomes of a single execution
//! - [`masking`]: asynchronous-exception masking states

pub mod failure;
pub mod id;
pub mod masking;

pub use failure::Failure;
pub use id::{CRefId, IdSource, MVarId, TVarId, ThreadId};
pub use masking::MaskingState;

pub(crate) use id::commit_thread_id;
