//! In-process collaborator implementations.
//!
//! These stand where the real command bus, call channel, and hardware
//! connector would stand in production. Demos and integration tests script
//! them with canned outcomes per command/target.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;

use crate::call::{CallRequest, CallResponse, ExternalChannel};
use crate::command::{Command, CommandBus, CommandState, CommandStatus};
use crate::subscribe::{ChannelConnector, ChannelDescriptor, ChannelEvent, ChannelSubscription};
use lockstep_task::{ErrorInfo, codes, unix_millis};

/// Scripted outcome for a dispatched command.
#[derive(Debug, Clone)]
pub enum CommandOutcome {
  Complete(Value),
  Error(Value),
}

/// A command bus that resolves every dispatched command from a scripted
/// outcome table, replaying `started → terminal` on the watch side.
#[derive(Default)]
pub struct LoopbackBus {
  outcomes: Mutex<HashMap<String, CommandOutcome>>,
  dispatched: Mutex<HashMap<String, CommandOutcome>>,
}

impl LoopbackBus {
  pub fn new() -> Self {
    Self::default()
  }

  /// Script the outcome for a command name.
  pub fn on_command(&self, name: &str, outcome: CommandOutcome) {
    self
      .outcomes
      .lock()
      .expect("loopback bus poisoned")
      .insert(name.to_string(), outcome);
  }
}

impl CommandBus for LoopbackBus {
  fn dispatch(
    &self,
    request_id: &str,
    _session_id: &str,
    command: Command,
  ) -> Result<(), ErrorInfo> {
    let outcome = self
      .outcomes
      .lock()
      .expect("loopback bus poisoned")
      .get(&command.name)
      .cloned()
      .ok_or_else(|| {
        ErrorInfo::new(
          codes::COMMAND_ERROR,
          format!("no handler for command '{}'", command.name),
          false,
        )
      })?;

    self
      .dispatched
      .lock()
      .expect("loopback bus poisoned")
      .insert(request_id.to_string(), outcome);
    Ok(())
  }

  fn watch(&self, request_id: &str) -> BoxStream<'static, CommandStatus> {
    let outcome = self
      .dispatched
      .lock()
      .expect("loopback bus poisoned")
      .get(request_id)
      .cloned();

    let now = unix_millis();
    let started = CommandStatus {
      request_id: request_id.to_string(),
      state: CommandState::Started,
      start_at: now,
      updated_at: now,
      results: None,
      errors: None,
    };

    let terminal = match outcome {
      Some(CommandOutcome::Complete(results)) => CommandStatus {
        state: CommandState::Complete,
        results: Some(results),
        ..started.clone()
      },
      Some(CommandOutcome::Error(errors)) => CommandStatus {
        state: CommandState::Error,
        errors: Some(errors),
        ..started.clone()
      },
      None => CommandStatus {
        state: CommandState::Error,
        errors: Some(Value::String("nothing dispatched for request".to_string())),
        ..started.clone()
      },
    };

    stream::iter(vec![started, terminal]).boxed()
  }
}

/// A call channel that answers from a `(target, action)` response table.
#[derive(Debug, Clone)]
pub enum CallOutcome {
  Success(Value),
  Failure { code: String, message: String },
}

#[derive(Default)]
pub struct LoopbackChannel {
  responses: Mutex<HashMap<(String, String), CallOutcome>>,
}

impl LoopbackChannel {
  pub fn new() -> Self {
    Self::default()
  }

  /// Script the response for a `(target, action)` pair.
  pub fn respond(&self, target: &str, action: &str, outcome: CallOutcome) {
    self
      .responses
      .lock()
      .expect("loopback channel poisoned")
      .insert((target.to_string(), action.to_string()), outcome);
  }
}

impl ExternalChannel for LoopbackChannel {
  fn call(&self, request: CallRequest) -> BoxFuture<'static, CallResponse> {
    let outcome = self
      .responses
      .lock()
      .expect("loopback channel poisoned")
      .get(&(request.target.clone(), request.action.clone()))
      .cloned();

    Box::pin(async move {
      let timestamp = unix_millis();
      match outcome {
        Some(CallOutcome::Success(data)) => CallResponse {
          success: true,
          code: "OK".to_string(),
          message: String::new(),
          data: Some(data),
          duration_ms: 0,
          timestamp,
        },
        Some(CallOutcome::Failure { code, message }) => CallResponse {
          success: false,
          code,
          message,
          data: None,
          duration_ms: 0,
          timestamp,
        },
        None => CallResponse {
          success: false,
          code: "NOT_FOUND".to_string(),
          message: format!("no response for {}/{}", request.target, request.action),
          data: None,
          duration_ms: 0,
          timestamp,
        },
      }
    })
  }
}

/// A connector that replays scripted events per target, or hands out live
/// push channels whose streams stay open until the sender is dropped.
#[derive(Default)]
pub struct LoopbackConnector {
  scripted: Mutex<HashMap<String, Vec<ChannelEvent>>>,
  live: Mutex<HashMap<String, mpsc::UnboundedReceiver<ChannelEvent>>>,
  active: Mutex<HashSet<String>>,
  next_id: AtomicU64,
}

impl LoopbackConnector {
  pub fn new() -> Self {
    Self::default()
  }

  /// Script a finite replay for a target; the stream ends after the last
  /// event.
  pub fn script(&self, target: &str, events: Vec<ChannelEvent>) {
    self
      .scripted
      .lock()
      .expect("loopback connector poisoned")
      .insert(target.to_string(), events);
  }

  /// Open a live push channel for a target. The subscription stream stays
  /// open until the returned sender is dropped.
  pub fn push_channel(&self, target: &str) -> mpsc::UnboundedSender<ChannelEvent> {
    let (sender, receiver) = mpsc::unbounded();
    self
      .live
      .lock()
      .expect("loopback connector poisoned")
      .insert(target.to_string(), receiver);
    sender
  }

  /// Subscriptions not yet released. Tests use this to assert teardown.
  pub fn active_subscriptions(&self) -> usize {
    self.active.lock().expect("loopback connector poisoned").len()
  }
}

impl ChannelConnector for LoopbackConnector {
  fn subscribe(&self, descriptor: ChannelDescriptor) -> Result<ChannelSubscription, ErrorInfo> {
    let channel_id = format!("chan-{}", self.next_id.fetch_add(1, Ordering::Relaxed));

    let events: BoxStream<'static, ChannelEvent> = if let Some(receiver) = self
      .live
      .lock()
      .expect("loopback connector poisoned")
      .remove(&descriptor.target)
    {
      receiver.boxed()
    } else if let Some(scripted) = self
      .scripted
      .lock()
      .expect("loopback connector poisoned")
      .get(&descriptor.target)
      .cloned()
    {
      let id = channel_id.clone();
      stream::iter(scripted)
        .map(move |mut event| {
          event.channel_id = id.clone();
          event
        })
        .boxed()
    } else {
      return Err(ErrorInfo::new(
        codes::CHANNEL_ERROR,
        format!("no channel scripted for target '{}'", descriptor.target),
        false,
      ));
    };

    self
      .active
      .lock()
      .expect("loopback connector poisoned")
      .insert(channel_id.clone());

    Ok(ChannelSubscription { channel_id, events })
  }

  fn unsubscribe(&self, channel_id: &str) {
    self
      .active
      .lock()
      .expect("loopback connector poisoned")
      .remove(channel_id);
  }
}

/// A pushed event carrying data.
pub fn data_event(target: &str, event_type: &str, data: Value) -> ChannelEvent {
  ChannelEvent {
    channel_id: String::new(),
    event_type: event_type.to_string(),
    target: target.to_string(),
    data: Some(data),
    timestamp: unix_millis(),
    raw: None,
  }
}
