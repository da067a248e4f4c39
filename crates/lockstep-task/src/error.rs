//! Definition validation errors.

use thiserror::Error;

/// Errors raised while validating a task definition.
#[derive(Debug, Error)]
pub enum TaskError {
  #[error("duplicate node key: {key}")]
  DuplicateNodeKey { key: String },

  #[error("node '{node}' has children but is not a flow")]
  NonFlowChildren { node: String },

  #[error("node '{node}' references unknown compensation target '{target}'")]
  UnknownCompensationTarget { node: String, target: String },

  #[error("node '{node}' uses the retry strategy without a retry policy")]
  MissingRetryPolicy { node: String },
}
