//! Push-channel adapter: subscribe to an external channel and forward every
//! pushed event until the channel closes, an in-band error arrives, or the
//! run is cancelled.

use std::sync::Arc;

use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::adapter::{AdapterContext, AdapterEvent, TaskAdapter, failed, until_terminal};
use lockstep_task::{ErrorInfo, codes};

/// What to subscribe to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelDescriptor {
  #[serde(rename = "type")]
  pub channel_type: String,
  pub target: String,
  pub mode: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub options: Option<Value>,
}

/// An event pushed by the channel. A `data` of `None` is an in-band error
/// reported by the device, not a protocol-level fault.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelEvent {
  pub channel_id: String,
  #[serde(rename = "type")]
  pub event_type: String,
  pub target: String,
  pub data: Option<Value>,
  pub timestamp: u64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub raw: Option<Value>,
}

/// An open subscription: its id plus the pushed-event stream.
pub struct ChannelSubscription {
  pub channel_id: String,
  pub events: BoxStream<'static, ChannelEvent>,
}

/// The connector collaborator. `unsubscribe` must be idempotent; the
/// adapter may call it more than once. [`crate::LoopbackConnector`] is the
/// in-process stand-in.
pub trait ChannelConnector: Send + Sync {
  fn subscribe(&self, descriptor: ChannelDescriptor) -> Result<ChannelSubscription, ErrorInfo>;

  fn unsubscribe(&self, channel_id: &str);
}

/// Adapter for the `externalSubscribe` node kind.
pub struct ExternalSubscribeAdapter {
  connector: Arc<dyn ChannelConnector>,
}

impl ExternalSubscribeAdapter {
  pub fn new(connector: Arc<dyn ChannelConnector>) -> Self {
    Self { connector }
  }
}

/// Unsubscribes when the adapter's stream is dropped, however it ends.
struct SubscriptionGuard {
  connector: Arc<dyn ChannelConnector>,
  channel_id: String,
}

impl Drop for SubscriptionGuard {
  fn drop(&mut self) {
    debug!(channel_id = %self.channel_id, "releasing channel subscription");
    self.connector.unsubscribe(&self.channel_id);
  }
}

impl TaskAdapter for ExternalSubscribeAdapter {
  fn kind(&self) -> &str {
    "externalSubscribe"
  }

  fn execute(&self, args: Value, ctx: AdapterContext) -> BoxStream<'static, AdapterEvent> {
    let descriptor: ChannelDescriptor = match serde_json::from_value(args) {
      Ok(descriptor) => descriptor,
      Err(e) => {
        return failed(ErrorInfo::new(
          codes::CHANNEL_ERROR,
          format!("invalid subscribe args: {e}"),
          false,
        ));
      }
    };

    let subscription = match self.connector.subscribe(descriptor) {
      Ok(subscription) => subscription,
      Err(info) => return failed(info),
    };

    let guard = SubscriptionGuard {
      connector: self.connector.clone(),
      channel_id: subscription.channel_id,
    };

    let mapped = subscription.events.map(move |event| {
      let _ = &guard;
      event_to_adapter_event(event)
    });

    until_terminal(mapped)
      .take_until(ctx.cancel.clone().cancelled_owned())
      .boxed()
  }
}

fn event_to_adapter_event(event: ChannelEvent) -> AdapterEvent {
  match &event.data {
    Some(_) => AdapterEvent::Progress {
      progress: None,
      payload: serde_json::to_value(&event).unwrap_or(Value::Null),
    },
    None => AdapterEvent::Failed(ErrorInfo::new(
      codes::CHANNEL_ERROR,
      format!(
        "channel '{}' reported an in-band error on '{}'",
        event.channel_id, event.target
      ),
      true,
    )),
  }
}
