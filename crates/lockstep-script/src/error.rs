//! Script evaluation errors.

use thiserror::Error;

/// Errors raised while evaluating a node script.
#[derive(Debug, Error)]
pub enum ScriptError {
  /// The chunk failed to compile.
  #[error("script '{name}' failed to compile: {message}")]
  Compile { name: String, message: String },

  /// The chunk raised at runtime.
  #[error("script '{name}' raised: {message}")]
  Eval {
    name: String,
    message: String,
    traceback: Option<String>,
  },

  /// The chunk exceeded its memory or instruction budget.
  #[error("script '{name}' exceeded its {resource} budget")]
  BudgetExceeded { name: String, resource: &'static str },

  /// The chunk returned a value that has no JSON representation.
  #[error("script '{name}' returned a non-JSON value: {message}")]
  Convert { name: String, message: String },
}

impl ScriptError {
  /// The traceback, when the Lua runtime captured one.
  pub fn traceback(&self) -> Option<&str> {
    match self {
      ScriptError::Eval { traceback, .. } => traceback.as_deref(),
      _ => None,
    }
  }
}
