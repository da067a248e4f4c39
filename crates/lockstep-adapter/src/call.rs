//! External-call adapter: one-shot request/response against a hardware or
//! service channel.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::adapter::{AdapterContext, AdapterEvent, TaskAdapter, failed};
use lockstep_task::{ErrorInfo, codes};

const DEFAULT_CALL_TIMEOUT_MS: u64 = 10_000;

/// A synchronous one-shot interaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRequest {
  #[serde(rename = "type")]
  pub call_type: String,
  pub method: String,
  pub target: String,
  pub action: String,
  #[serde(default)]
  pub params: Value,
  #[serde(default = "default_call_timeout")]
  pub timeout_ms: u64,
}

fn default_call_timeout() -> u64 {
  DEFAULT_CALL_TIMEOUT_MS
}

/// The channel's response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallResponse {
  pub success: bool,
  pub code: String,
  pub message: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub data: Option<Value>,
  pub duration_ms: u64,
  pub timestamp: u64,
}

/// The request/response collaborator. [`crate::LoopbackChannel`] is the
/// in-process stand-in.
pub trait ExternalChannel: Send + Sync {
  fn call(&self, request: CallRequest) -> BoxFuture<'static, CallResponse>;
}

/// Adapter for the `externalCall` node kind.
pub struct ExternalCallAdapter {
  channel: Arc<dyn ExternalChannel>,
}

impl ExternalCallAdapter {
  pub fn new(channel: Arc<dyn ExternalChannel>) -> Self {
    Self { channel }
  }
}

impl TaskAdapter for ExternalCallAdapter {
  fn kind(&self) -> &str {
    "externalCall"
  }

  fn execute(&self, args: Value, _ctx: AdapterContext) -> BoxStream<'static, AdapterEvent> {
    let request: CallRequest = match serde_json::from_value(args) {
      Ok(request) => request,
      Err(e) => {
        return failed(ErrorInfo::new(
          codes::CHANNEL_ERROR,
          format!("invalid call args: {e}"),
          false,
        ));
      }
    };

    let call = self.channel.call(request);
    stream::once(async move {
      let response = call.await;
      if response.success {
        AdapterEvent::Completed(response.data.unwrap_or(Value::Null))
      } else {
        AdapterEvent::Failed(
          ErrorInfo::new(
            codes::CHANNEL_ERROR,
            format!("{}: {}", response.code, response.message),
            true,
          ),
        )
      }
    })
    .boxed()
  }
}
