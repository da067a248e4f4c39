//! The adapter contract.

use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use lockstep_task::ErrorInfo;

/// The slice of a run an adapter is allowed to see.
#[derive(Debug, Clone)]
pub struct AdapterContext {
  pub request_id: String,
  pub task_key: String,
  /// Identifies this session on collaborator buses keyed by
  /// `(request_id, session_id)`.
  pub session_id: String,
  /// Soft cancellation: stop observing, release subscriptions. Never an
  /// instruction to undo dispatched side effects.
  pub cancel: CancellationToken,
}

/// One item on an adapter's event stream.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
  /// Intermediate progress; surfaced as `NODE_PROGRESS`.
  Progress {
    progress: Option<u8>,
    payload: Value,
  },
  /// Terminal success carrying the raw output.
  Completed(Value),
  /// Terminal failure, already normalized.
  Failed(ErrorInfo),
}

impl AdapterEvent {
  pub fn is_terminal(&self) -> bool {
    matches!(self, AdapterEvent::Completed(_) | AdapterEvent::Failed(_))
  }
}

/// A leaf executor bound to a node kind.
///
/// `execute` is synchronous and must not panic: the returned stream is lazy,
/// and anything that can go wrong, bad args included, becomes a `Failed`
/// item once the stream is polled.
pub trait TaskAdapter: Send + Sync {
  /// The kind tag this adapter serves.
  fn kind(&self) -> &str;

  fn execute(&self, args: Value, ctx: AdapterContext) -> BoxStream<'static, AdapterEvent>;
}

/// A stream that yields a single failure.
pub(crate) fn failed(info: ErrorInfo) -> BoxStream<'static, AdapterEvent> {
  stream::iter(vec![AdapterEvent::Failed(info)]).boxed()
}

/// Fuse a mapped stream after its first terminal item.
pub(crate) fn until_terminal<S>(events: S) -> impl futures::Stream<Item = AdapterEvent>
where
  S: futures::Stream<Item = AdapterEvent>,
{
  events.scan(false, |done, event| {
    if *done {
      return futures::future::ready(None);
    }
    *done = event.is_terminal();
    futures::future::ready(Some(event))
  })
}
