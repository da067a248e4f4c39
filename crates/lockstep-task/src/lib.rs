//! Lockstep Task
//!
//! This crate provides the execution-ready task representation for lockstep.
//! A registered task is a validated tree of typed nodes plus the strategy
//! metadata (conditions, retries, compensation) the engine consults while
//! walking it.
//!
//! It also owns the wire-facing progress types: every observable effect of a
//! run is a [`ProgressData`] record on the session's progress stream, and
//! every failure, whatever its origin, is normalized into an [`ErrorInfo`]
//! carried by a `NODE_ERROR` event.

mod definition;
mod error;
mod progress;

pub use definition::{
  ErrorStrategy, FLOW_KIND, NodeKind, NodeStrategy, RetryPolicy, TaskDefinition, TaskNode,
};
pub use error::TaskError;
pub use progress::{ErrorInfo, ProgressData, ProgressKind, TaskState, codes, unix_millis};
