//! Task registry and sessions.
//!
//! [`TaskEngine`] holds registered definitions; `task(key).run(...)` starts
//! an isolated session that walks the definition's node tree and streams
//! progress over its own bus. Independent sessions share nothing: each has
//! its own context bag, cancellation token, and counters.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::context::RunContext;
use crate::error::EngineError;
use crate::events::{ChannelNotifier, Emitter, ProgressNotifier};
use crate::executor::{NodeExecutor, NodeOutcome};
use lockstep_adapter::AdapterRegistry;
use lockstep_script::ScriptEvaluator;
use lockstep_task::{ErrorInfo, ProgressData, ProgressKind, TaskDefinition, TaskState};

/// The registry and entry point for runs.
pub struct TaskEngine {
  definitions: RwLock<HashMap<String, Arc<TaskDefinition>>>,
  adapters: Arc<AdapterRegistry>,
  evaluator: Arc<ScriptEvaluator>,
}

impl TaskEngine {
  pub fn new(adapters: Arc<AdapterRegistry>) -> Self {
    Self::with_evaluator(adapters, ScriptEvaluator::new())
  }

  pub fn with_evaluator(adapters: Arc<AdapterRegistry>, evaluator: ScriptEvaluator) -> Self {
    Self {
      definitions: RwLock::new(HashMap::new()),
      adapters,
      evaluator: Arc::new(evaluator),
    }
  }

  /// Register a definition. Definitions are immutable once registered;
  /// duplicate keys are rejected.
  pub fn register(&self, definition: TaskDefinition) -> Result<(), EngineError> {
    definition.validate()?;

    let mut definitions = self.definitions.write().expect("task registry poisoned");
    if definitions.contains_key(&definition.key) {
      return Err(EngineError::DuplicateTask {
        key: definition.key.clone(),
      });
    }

    info!(task_key = %definition.key, nodes = definition.node_count(), "task registered");
    definitions.insert(definition.key.clone(), Arc::new(definition));
    Ok(())
  }

  /// Handle for starting runs of a registered task.
  pub fn task(&self, key: &str) -> TaskHandle<'_> {
    TaskHandle {
      engine: self,
      key: key.to_string(),
    }
  }

  pub fn task_keys(&self) -> Vec<String> {
    let mut keys: Vec<String> = self
      .definitions
      .read()
      .expect("task registry poisoned")
      .keys()
      .cloned()
      .collect();
    keys.sort();
    keys
  }

  fn definition(&self, key: &str) -> Option<Arc<TaskDefinition>> {
    self
      .definitions
      .read()
      .expect("task registry poisoned")
      .get(key)
      .cloned()
  }
}

/// A handle to one registered task.
pub struct TaskHandle<'a> {
  engine: &'a TaskEngine,
  key: String,
}

impl TaskHandle<'_> {
  /// Start a run.
  ///
  /// Fails fast (without producing a stream) only for an unknown or
  /// disabled task key. Everything else surfaces on the session's progress
  /// stream. An empty `request_id` gets a generated one.
  #[instrument(name = "task_run", skip(self, initial_context, debug), fields(task_key = %self.key))]
  pub fn run(
    &self,
    request_id: &str,
    initial_context: serde_json::Map<String, Value>,
    debug: bool,
  ) -> Result<TaskSession, EngineError> {
    let definition = self
      .engine
      .definition(&self.key)
      .ok_or_else(|| EngineError::UnknownTask {
        key: self.key.clone(),
      })?;

    if !definition.enabled {
      return Err(EngineError::TaskDisabled {
        key: self.key.clone(),
      });
    }

    let request_id = if request_id.is_empty() {
      uuid::Uuid::new_v4().to_string()
    } else {
      request_id.to_string()
    };

    let ctx = Arc::new(RunContext::new(
      request_id.clone(),
      definition.key.clone(),
      initial_context,
      definition.node_count(),
    ));

    let (sender, receiver) = mpsc::unbounded_channel();
    let mut notifier: Arc<dyn ProgressNotifier> = Arc::new(ChannelNotifier::new(sender));
    if debug {
      notifier = Arc::new(DebugNotifier { inner: notifier });
    }
    let emitter = Emitter::new(ctx.clone(), notifier);

    info!(request_id = %request_id, "task run started");

    let cancel = ctx.cancel.clone();
    let adapters = self.engine.adapters.clone();
    let evaluator = self.engine.evaluator.clone();
    tokio::spawn(run_session(definition, ctx, emitter, adapters, evaluator));

    Ok(TaskSession {
      request_id,
      cancel,
      progress: receiver,
    })
  }
}

/// One in-flight run: its progress bus and cancellation control.
#[derive(Debug)]
pub struct TaskSession {
  pub request_id: String,
  cancel: CancellationToken,
  progress: mpsc::UnboundedReceiver<ProgressData>,
}

impl TaskSession {
  /// Soft-cancel the run. Idempotent; the signal fires at most once.
  /// Adapters stop observing and release their subscriptions, the session
  /// emits `TASK_CANCEL` and closes the bus. Side effects already
  /// dispatched are not undone.
  pub fn cancel(&self) {
    self.cancel.cancel();
  }

  /// Next progress event; `None` once the bus has closed after the terminal
  /// event.
  pub async fn next_event(&mut self) -> Option<ProgressData> {
    self.progress.recv().await
  }

  /// Drain the bus to completion.
  pub async fn collect_events(mut self) -> Vec<ProgressData> {
    let mut events = Vec::new();
    while let Some(event) = self.progress.recv().await {
      events.push(event);
    }
    events
  }
}

/// Per-event debug logging, layered over the real notifier for debug runs.
struct DebugNotifier {
  inner: Arc<dyn ProgressNotifier>,
}

impl ProgressNotifier for DebugNotifier {
  fn notify(&self, event: ProgressData) {
    debug!(
      node_key = %event.node_key,
      kind = ?event.kind,
      progress = event.progress,
      "progress event"
    );
    self.inner.notify(event);
  }
}

async fn run_session(
  definition: Arc<TaskDefinition>,
  ctx: Arc<RunContext>,
  emitter: Emitter,
  adapters: Arc<AdapterRegistry>,
  evaluator: Arc<ScriptEvaluator>,
) {
  ctx.set_state(TaskState::Running);
  emitter.emit(&definition.root_node.key, ProgressKind::TaskInit, None);

  let executor = NodeExecutor::new(
    definition.clone(),
    adapters,
    evaluator,
    ctx.clone(),
    emitter.clone(),
  );
  let input = Value::Object(ctx.bag.snapshot());
  let run = executor.run_node(&definition.root_node, &input, true);

  let outcome = match definition.timeout_ms {
    Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), run).await {
      Ok(outcome) => outcome,
      Err(_) => {
        warn!(request_id = %ctx.request_id, timeout_ms = ms, "task timed out");
        ctx.mark_error();
        emitter.emit_error(
          &definition.root_node.key,
          ErrorInfo::task_timeout(&definition.key, ms),
        );
        NodeOutcome::Failed
      }
    },
    None => run.await,
  };

  match outcome {
    NodeOutcome::Cancelled => {
      ctx.set_state(TaskState::Cancelled);
      info!(request_id = %ctx.request_id, "task run cancelled");
      emitter.emit(&definition.root_node.key, ProgressKind::TaskCancel, None);
    }
    _ => {
      let state = if ctx.has_error() {
        TaskState::PartialFailed
      } else {
        TaskState::Completed
      };
      ctx.set_state(state);
      info!(request_id = %ctx.request_id, state = ?state, "task run completed");
      let payload = ctx.bag.get(&definition.root_node.key);
      emitter.emit(&definition.root_node.key, ProgressKind::TaskComplete, payload);
    }
  }
  // Dropping the emitter drops the bus sender, which ends the stream.
}
