//! Node execution.
//!
//! [`NodeExecutor`] drives one run's node tree: condition check, args
//! script, adapter dispatch (or flow walk), result script, and the
//! retry/skip/compensate policy. Failures never propagate out as errors;
//! they surface as `NODE_ERROR` events and the walk continues.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::context::RunContext;
use crate::events::Emitter;
use lockstep_adapter::{AdapterEvent, AdapterRegistry};
use lockstep_script::{ScriptError, ScriptEvaluator, truthy};
use lockstep_task::{ErrorInfo, ErrorStrategy, ProgressKind, TaskDefinition, TaskNode, codes};

/// How one node ended, as seen by its parent.
pub(crate) enum NodeOutcome {
  Completed(Value),
  Skipped,
  Failed,
  Cancelled,
}

/// How a single execution attempt (args + adapter/flow) ended.
enum AttemptOutcome {
  Success(Value),
  Failure(ErrorInfo),
  Cancelled,
}

pub(crate) struct NodeExecutor {
  definition: Arc<TaskDefinition>,
  adapters: Arc<AdapterRegistry>,
  evaluator: Arc<ScriptEvaluator>,
  ctx: Arc<RunContext>,
  emitter: Emitter,
}

impl NodeExecutor {
  pub fn new(
    definition: Arc<TaskDefinition>,
    adapters: Arc<AdapterRegistry>,
    evaluator: Arc<ScriptEvaluator>,
    ctx: Arc<RunContext>,
    emitter: Emitter,
  ) -> Self {
    Self {
      definition,
      adapters,
      evaluator,
      ctx,
      emitter,
    }
  }

  /// Execute one node. `input` is the previous sibling's output (or the
  /// initial context for the root). `allow_compensation` is false when the
  /// node itself runs as a compensation, capping the depth at one.
  pub fn run_node<'a>(
    &'a self,
    node: &'a TaskNode,
    input: &'a Value,
    allow_compensation: bool,
  ) -> BoxFuture<'a, NodeOutcome> {
    Box::pin(self.run_node_inner(node, input, allow_compensation))
  }

  async fn run_node_inner(
    &self,
    node: &TaskNode,
    input: &Value,
    allow_compensation: bool,
  ) -> NodeOutcome {
    if self.ctx.cancel.is_cancelled() {
      return NodeOutcome::Cancelled;
    }

    debug!(node_key = %node.key, kind = %node.kind.as_str(), "node started");
    self.emitter.emit(&node.key, ProgressKind::NodeStart, None);

    if let Some(condition) = &node.strategy.condition {
      let globals = self.ctx.bag.snapshot();
      let verdict = self.evaluator.evaluate(
        &format!("{}#condition", node.key),
        condition,
        &Value::Null,
        &globals,
      );
      match verdict {
        Ok(value) => {
          let passed = truthy(&value);
          self.emitter.emit(
            &node.key,
            ProgressKind::ConditionCheck,
            Some(json!({ "passed": passed })),
          );
          if !passed {
            self.ctx.count_node();
            let payload = node.strategy.skip_message.clone().map(Value::String);
            self.emitter.emit(&node.key, ProgressKind::NodeSkip, payload);
            return NodeOutcome::Skipped;
          }
        }
        // A raising condition is an execution failure, not a skip.
        Err(e) => {
          return self
            .fail_node(node, input, script_failure(e), allow_compensation)
            .await;
        }
      }
    }

    let retry = match node.strategy.error_strategy {
      ErrorStrategy::Retry => node.strategy.retry,
      _ => None,
    };
    let attempts = 1 + retry.map(|r| r.times).unwrap_or(0);
    let mut last_failure = None;

    for attempt in 0..attempts {
      if attempt > 0 {
        let interval = retry.map(|r| r.interval_ms).unwrap_or(0);
        tokio::select! {
          _ = self.ctx.cancel.cancelled() => return NodeOutcome::Cancelled,
          _ = tokio::time::sleep(Duration::from_millis(interval)) => {}
        }
        self.emitter.emit(
          &node.key,
          ProgressKind::NodeRetry,
          Some(json!({ "attempt": attempt })),
        );
      }

      match self.attempt(node, input).await {
        AttemptOutcome::Success(raw) => {
          return self
            .complete_node(node, input, raw, allow_compensation)
            .await;
        }
        AttemptOutcome::Cancelled => return NodeOutcome::Cancelled,
        AttemptOutcome::Failure(info) => {
          warn!(node_key = %node.key, attempt, error = %info.message, "node attempt failed");
          last_failure = Some(info);
        }
      }
    }

    // All attempts exhausted; retry falls through to skip-style handling.
    let failure = last_failure
      .unwrap_or_else(|| ErrorInfo::new(codes::ADAPTER_ERROR, "node execution failed", false));
    self
      .fail_node(node, input, failure, allow_compensation)
      .await
  }

  /// One attempt: args script, then adapter dispatch or flow walk.
  async fn attempt(&self, node: &TaskNode, input: &Value) -> AttemptOutcome {
    if self.ctx.cancel.is_cancelled() {
      return AttemptOutcome::Cancelled;
    }

    let args = match &node.args_script {
      Some(script) => {
        let globals = self.ctx.bag.snapshot();
        match self
          .evaluator
          .evaluate(&format!("{}#args", node.key), script, input, &globals)
        {
          Ok(value) => value,
          Err(e) => return AttemptOutcome::Failure(script_failure(e)),
        }
      }
      None => input.clone(),
    };

    if node.is_flow() {
      return self.walk_flow(node, args).await;
    }

    let kind = node.kind.as_str();
    let Some(adapter) = self.adapters.get(kind) else {
      return AttemptOutcome::Failure(ErrorInfo::adapter_not_found(kind));
    };

    let stream = adapter.execute(args, self.ctx.adapter_context());
    self.observe(node, stream).await
  }

  /// Walk a flow's children strictly in array order. A child's failure never
  /// short-circuits the walk; each remaining child's own condition decides
  /// whether it meaningfully runs. The previous completed child's output is
  /// threaded as the next child's input.
  async fn walk_flow(&self, flow: &TaskNode, input: Value) -> AttemptOutcome {
    let mut carried = input;
    let mut last_completed = Value::Null;

    for child in &flow.nodes {
      if self.ctx.cancel.is_cancelled() {
        return AttemptOutcome::Cancelled;
      }
      match self.run_node(child, &carried, true).await {
        NodeOutcome::Completed(value) => {
          last_completed = value.clone();
          carried = value;
        }
        NodeOutcome::Skipped | NodeOutcome::Failed => {}
        NodeOutcome::Cancelled => return AttemptOutcome::Cancelled,
      }
    }

    AttemptOutcome::Success(last_completed)
  }

  /// Drive an adapter's event stream under the node's timeout.
  async fn observe(
    &self,
    node: &TaskNode,
    mut stream: BoxStream<'static, AdapterEvent>,
  ) -> AttemptOutcome {
    let observe = async {
      loop {
        match stream.next().await {
          Some(AdapterEvent::Progress { progress, payload }) => {
            let payload = match progress {
              Some(pct) => json!({ "progress": pct, "data": payload }),
              None => payload,
            };
            self
              .emitter
              .emit(&node.key, ProgressKind::NodeProgress, Some(payload));
          }
          Some(AdapterEvent::Completed(value)) => return AttemptOutcome::Success(value),
          Some(AdapterEvent::Failed(info)) => return AttemptOutcome::Failure(info),
          // An adapter whose stream ends on cancellation must not read as
          // success.
          None if self.ctx.cancel.is_cancelled() => return AttemptOutcome::Cancelled,
          None => return AttemptOutcome::Success(Value::Null),
        }
      }
    };

    let timed = async {
      match node.timeout_ms {
        Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), observe).await {
          Ok(outcome) => outcome,
          Err(_) => AttemptOutcome::Failure(ErrorInfo::node_timeout(&node.key, ms)),
        },
        None => observe.await,
      }
    };

    tokio::select! {
      _ = self.ctx.cancel.cancelled() => AttemptOutcome::Cancelled,
      outcome = timed => outcome,
    }
  }

  /// Success tail: result script, bag write, `NODE_COMPLETE`.
  async fn complete_node(
    &self,
    node: &TaskNode,
    input: &Value,
    raw: Value,
    allow_compensation: bool,
  ) -> NodeOutcome {
    let value = match &node.result_script {
      Some(script) => {
        let globals = self.ctx.bag.snapshot();
        match self
          .evaluator
          .evaluate(&format!("{}#result", node.key), script, &raw, &globals)
        {
          Ok(value) => value,
          Err(e) => {
            return self
              .fail_node(node, input, script_failure(e), allow_compensation)
              .await;
          }
        }
      }
      None => raw,
    };

    self.ctx.bag.insert(&node.key, value.clone());
    self.ctx.count_node();
    self
      .emitter
      .emit(&node.key, ProgressKind::NodeComplete, Some(value.clone()));
    NodeOutcome::Completed(value)
  }

  /// Failure tail: `NODE_ERROR`, error flag, and (under the compensate
  /// strategy) a single-depth compensation run. The failed node's key stays
  /// unset, which is the engine's only failure-propagation mechanism.
  async fn fail_node(
    &self,
    node: &TaskNode,
    input: &Value,
    failure: ErrorInfo,
    allow_compensation: bool,
  ) -> NodeOutcome {
    self.ctx.mark_error();
    self.ctx.count_node();
    self.emitter.emit_error(&node.key, failure);

    if allow_compensation && node.strategy.error_strategy == ErrorStrategy::Compensate {
      if let Some(target) = &node.strategy.compensation_node {
        match self.definition.find_node(target) {
          Some(compensation) => {
            self.emitter.emit(
              &node.key,
              ProgressKind::Compensation,
              Some(json!({ "failed": node.key, "compensation": target })),
            );
            if let NodeOutcome::Cancelled = self.run_node(compensation, input, false).await {
              return NodeOutcome::Cancelled;
            }
          }
          // Unreachable for validated definitions.
          None => warn!(node_key = %node.key, target = %target, "compensation target missing"),
        }
      }
    }

    NodeOutcome::Failed
  }
}

fn script_failure(error: ScriptError) -> ErrorInfo {
  let mut info = ErrorInfo::new(codes::SCRIPT_ERROR, error.to_string(), false);
  if let Some(traceback) = error.traceback() {
    info = info.with_stack(traceback);
  }
  info
}
