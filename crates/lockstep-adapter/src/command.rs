//! Command-bus adapter.
//!
//! Bridges a node to an external actor/command bus: dispatch a named command
//! keyed by `(request_id, session_id)`, then follow the bus's merged status
//! side until it reaches a terminal state, forwarding each change as
//! progress.

use std::sync::Arc;

use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::adapter::{AdapterContext, AdapterEvent, TaskAdapter, failed, until_terminal};
use lockstep_task::{ErrorInfo, codes};

/// A command value dispatched onto the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
  #[serde(alias = "command", rename = "commandName")]
  pub name: String,
  #[serde(default)]
  pub payload: Value,
}

/// Merged request status exposed by the bus's read side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandStatus {
  pub request_id: String,
  pub state: CommandState,
  pub start_at: u64,
  pub updated_at: u64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub results: Option<Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub errors: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandState {
  Started,
  Complete,
  Error,
}

/// The external command bus this adapter consumes. Not implemented here;
/// hosts bring their own, and [`crate::LoopbackBus`] is the in-process
/// stand-in.
pub trait CommandBus: Send + Sync {
  fn dispatch(
    &self,
    request_id: &str,
    session_id: &str,
    command: Command,
  ) -> Result<(), ErrorInfo>;

  /// Subscribe to the merged status of a request. The stream re-emits on
  /// every change; consumers stop at the first terminal state.
  fn watch(&self, request_id: &str) -> BoxStream<'static, CommandStatus>;
}

/// Adapter for the `command` node kind.
pub struct CommandAdapter {
  bus: Arc<dyn CommandBus>,
}

impl CommandAdapter {
  pub fn new(bus: Arc<dyn CommandBus>) -> Self {
    Self { bus }
  }
}

impl TaskAdapter for CommandAdapter {
  fn kind(&self) -> &str {
    "command"
  }

  fn execute(&self, args: Value, ctx: AdapterContext) -> BoxStream<'static, AdapterEvent> {
    let command: Command = match serde_json::from_value(args) {
      Ok(command) => command,
      Err(e) => {
        return failed(ErrorInfo::new(
          codes::COMMAND_ERROR,
          format!("invalid command args: {e}"),
          false,
        ));
      }
    };

    debug!(
      request_id = %ctx.request_id,
      command = %command.name,
      "dispatching command"
    );

    if let Err(info) = self.bus.dispatch(&ctx.request_id, &ctx.session_id, command) {
      return failed(info);
    }

    let statuses = self.bus.watch(&ctx.request_id);
    until_terminal(statuses.map(status_to_event))
      .take_until(ctx.cancel.clone().cancelled_owned())
      .boxed()
  }
}

fn status_to_event(status: CommandStatus) -> AdapterEvent {
  match status.state {
    CommandState::Started => AdapterEvent::Progress {
      progress: None,
      payload: serde_json::to_value(&status).unwrap_or(Value::Null),
    },
    CommandState::Complete => AdapterEvent::Completed(status.results.unwrap_or(Value::Null)),
    CommandState::Error => {
      let detail = status
        .errors
        .map(|e| e.to_string())
        .unwrap_or_else(|| "command failed".to_string());
      AdapterEvent::Failed(ErrorInfo::new(codes::COMMAND_ERROR, detail, true))
    }
  }
}
