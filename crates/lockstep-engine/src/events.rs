//! Progress notification.
//!
//! Sessions emit every observable effect of a run as a
//! [`ProgressData`] record through a [`ProgressNotifier`]. The engine ships
//! a channel-backed notifier (the progress bus a session hands its caller)
//! and a no-op for tests; hosts can plug their own.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::context::RunContext;
use lockstep_task::{ErrorInfo, ProgressData, ProgressKind, unix_millis};

/// Trait for receiving progress events.
pub trait ProgressNotifier: Send + Sync {
  fn notify(&self, event: ProgressData);
}

/// Discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl ProgressNotifier for NoopNotifier {
  fn notify(&self, _event: ProgressData) {}
}

/// Sends events to an unbounded channel.
///
/// Unbounded so the engine never blocks on a slow consumer; volume is one
/// event per node transition, so growth is bounded by the definition size.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  sender: mpsc::UnboundedSender<ProgressData>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<ProgressData>) -> Self {
    Self { sender }
  }
}

impl ProgressNotifier for ChannelNotifier {
  fn notify(&self, event: ProgressData) {
    // Receiver may be gone; the run still finishes.
    let _ = self.sender.send(event);
  }
}

/// Builds fully-populated events from the run context and forwards them.
#[derive(Clone)]
pub(crate) struct Emitter {
  ctx: Arc<RunContext>,
  notifier: Arc<dyn ProgressNotifier>,
}

impl Emitter {
  pub fn new(ctx: Arc<RunContext>, notifier: Arc<dyn ProgressNotifier>) -> Self {
    Self { ctx, notifier }
  }

  pub fn emit(&self, node_key: &str, kind: ProgressKind, payload: Option<Value>) {
    self.emit_full(node_key, kind, payload, None);
  }

  pub fn emit_error(&self, node_key: &str, error: ErrorInfo) {
    self.emit_full(node_key, ProgressKind::NodeError, None, Some(error));
  }

  fn emit_full(
    &self,
    node_key: &str,
    kind: ProgressKind,
    payload: Option<Value>,
    error: Option<ErrorInfo>,
  ) {
    self.notifier.notify(ProgressData {
      request_id: self.ctx.request_id.clone(),
      task_key: self.ctx.task_key.clone(),
      node_key: node_key.to_string(),
      kind,
      state: self.ctx.state(),
      node_index: self.ctx.node_index(),
      total_nodes: self.ctx.total_nodes(),
      progress: self.ctx.progress(),
      timestamp: unix_millis(),
      payload,
      error,
      context: self.ctx.bag.snapshot(),
    });
  }
}
