//! Progress events, the only thing a run ever emits to its caller.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
  Init,
  Running,
  Completed,
  Cancelled,
  PartialFailed,
}

impl TaskState {
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      TaskState::Completed | TaskState::Cancelled | TaskState::PartialFailed
    )
  }
}

/// Discriminant of a progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgressKind {
  TaskInit,
  NodeStart,
  NodeProgress,
  NodeComplete,
  NodeSkip,
  NodeError,
  NodeRetry,
  ConditionCheck,
  Compensation,
  TaskComplete,
  TaskCancel,
}

/// Well-known error codes carried by [`ErrorInfo`].
pub mod codes {
  pub const SCRIPT_ERROR: &str = "SCRIPT_ERROR";
  pub const ADAPTER_NOT_FOUND: &str = "ADAPTER_NOT_FOUND";
  pub const ADAPTER_ERROR: &str = "ADAPTER_ERROR";
  pub const NODE_TIMEOUT: &str = "NODE_TIMEOUT";
  pub const TASK_TIMEOUT: &str = "TASK_TIMEOUT";
  pub const CHANNEL_ERROR: &str = "CHANNEL_ERROR";
  pub const COMMAND_ERROR: &str = "COMMAND_ERROR";
}

/// The normalized shape every failure takes before it reaches the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
  pub code: String,
  pub message: String,
  pub retryable: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub stack: Option<String>,
}

impl ErrorInfo {
  pub fn new(code: &str, message: impl Into<String>, retryable: bool) -> Self {
    Self {
      code: code.to_string(),
      message: message.into(),
      retryable,
      stack: None,
    }
  }

  pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
    self.stack = Some(stack.into());
    self
  }

  pub fn adapter_not_found(kind: &str) -> Self {
    Self::new(
      codes::ADAPTER_NOT_FOUND,
      format!("no adapter registered for kind '{kind}'"),
      false,
    )
  }

  pub fn node_timeout(node_key: &str, timeout_ms: u64) -> Self {
    Self::new(
      codes::NODE_TIMEOUT,
      format!("node '{node_key}' exceeded its {timeout_ms}ms timeout"),
      true,
    )
  }

  pub fn task_timeout(task_key: &str, timeout_ms: u64) -> Self {
    Self::new(
      codes::TASK_TIMEOUT,
      format!("task '{task_key}' exceeded its {timeout_ms}ms timeout"),
      false,
    )
  }
}

/// One record on a session's progress stream.
///
/// `progress` is the task-level percentage (`node_index / total_nodes`,
/// monotonic non-decreasing); adapter-reported per-node progress travels in
/// `payload`. `context` is a snapshot of the shared bag at emission time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressData {
  pub request_id: String,
  pub task_key: String,
  pub node_key: String,
  #[serde(rename = "type")]
  pub kind: ProgressKind,
  pub state: TaskState,
  pub node_index: u32,
  pub total_nodes: u32,
  pub progress: u8,
  pub timestamp: u64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub payload: Option<Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<ErrorInfo>,
  pub context: serde_json::Map<String, Value>,
}

/// Milliseconds since the unix epoch.
pub fn unix_millis() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_millis() as u64)
    .unwrap_or(0)
}
