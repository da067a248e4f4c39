//! Lockstep Engine
//!
//! The orchestration core: registers [`lockstep_task::TaskDefinition`]s,
//! starts runs, and walks each definition's node tree against a
//! request-scoped shared context, streaming [`lockstep_task::ProgressData`]
//! events instead of returning a single result.
//!
//! A run tolerates partial failure: a failed node withholds its context key
//! and the walk continues, so every run terminates in exactly one
//! `TASK_COMPLETE` (possibly `PARTIAL_FAILED`) or `TASK_CANCEL` event.
//! Cancellation is cooperative: adapters stop observing and release their
//! subscriptions, but side effects already dispatched stay dispatched.

mod context;
mod error;
mod events;
mod executor;
mod session;

pub use context::{ContextBag, RunContext};
pub use error::EngineError;
pub use events::{ChannelNotifier, NoopNotifier, ProgressNotifier};
pub use session::{TaskEngine, TaskHandle, TaskSession};
