//! Engine error types.
//!
//! These are the only hard failures the engine ever returns to a caller.
//! Everything that happens inside a run is normalized into `NODE_ERROR`
//! progress events instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
  #[error("task already registered: {key}")]
  DuplicateTask { key: String },

  #[error("unknown task: {key}")]
  UnknownTask { key: String },

  #[error("task is disabled: {key}")]
  TaskDisabled { key: String },

  #[error(transparent)]
  InvalidDefinition(#[from] lockstep_task::TaskError),
}
