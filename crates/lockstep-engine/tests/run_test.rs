//! Integration tests for the engine's run semantics: event ordering,
//! conditions, retries, error strategies, timeouts, and cancellation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{Value, json};

use lockstep_adapter::{AdapterContext, AdapterEvent, AdapterRegistry, TaskAdapter};
use lockstep_engine::{EngineError, TaskEngine};
use lockstep_task::{
  ErrorInfo, ErrorStrategy, NodeKind, NodeStrategy, ProgressData, ProgressKind, RetryPolicy,
  TaskDefinition, TaskNode, TaskState, codes,
};

/// Completes immediately with its args, counting invocations.
struct EchoAdapter {
  invocations: AtomicU32,
}

impl EchoAdapter {
  fn new() -> Self {
    Self {
      invocations: AtomicU32::new(0),
    }
  }
}

impl TaskAdapter for EchoAdapter {
  fn kind(&self) -> &str {
    "echo"
  }

  fn execute(&self, args: Value, _ctx: AdapterContext) -> BoxStream<'static, AdapterEvent> {
    self.invocations.fetch_add(1, Ordering::Relaxed);
    stream::iter(vec![AdapterEvent::Completed(args)]).boxed()
  }
}

/// Fails until `succeed_after` invocations have happened, recording the
/// instant of each attempt.
struct FlakyAdapter {
  calls: Mutex<Vec<Instant>>,
  succeed_after: Option<u32>,
}

impl FlakyAdapter {
  fn always_failing() -> Self {
    Self {
      calls: Mutex::new(Vec::new()),
      succeed_after: None,
    }
  }

  fn failing_times(times: u32) -> Self {
    Self {
      calls: Mutex::new(Vec::new()),
      succeed_after: Some(times),
    }
  }

  fn call_instants(&self) -> Vec<Instant> {
    self.calls.lock().unwrap().clone()
  }
}

impl TaskAdapter for FlakyAdapter {
  fn kind(&self) -> &str {
    "flaky"
  }

  fn execute(&self, args: Value, _ctx: AdapterContext) -> BoxStream<'static, AdapterEvent> {
    let mut calls = self.calls.lock().unwrap();
    calls.push(Instant::now());
    let attempt = calls.len() as u32;

    let event = match self.succeed_after {
      Some(after) if attempt > after => AdapterEvent::Completed(args),
      _ => AdapterEvent::Failed(ErrorInfo::new(codes::ADAPTER_ERROR, "induced failure", true)),
    };
    stream::iter(vec![event]).boxed()
  }
}

/// Never completes; ends its stream only on cancellation.
struct BlockingAdapter;

impl TaskAdapter for BlockingAdapter {
  fn kind(&self) -> &str {
    "blocking"
  }

  fn execute(&self, _args: Value, ctx: AdapterContext) -> BoxStream<'static, AdapterEvent> {
    stream::pending()
      .take_until(ctx.cancel.clone().cancelled_owned())
      .boxed()
  }
}

fn leaf(key: &str, kind: &str) -> TaskNode {
  TaskNode {
    key: key.to_string(),
    name: key.to_string(),
    kind: NodeKind::from(kind),
    strategy: NodeStrategy::default(),
    args_script: None,
    result_script: None,
    nodes: Vec::new(),
    timeout_ms: None,
  }
}

fn flow(key: &str, nodes: Vec<TaskNode>) -> TaskNode {
  TaskNode {
    key: key.to_string(),
    name: key.to_string(),
    kind: NodeKind::Flow,
    strategy: NodeStrategy::default(),
    args_script: None,
    result_script: None,
    nodes,
    timeout_ms: None,
  }
}

fn definition(key: &str, root: TaskNode) -> TaskDefinition {
  TaskDefinition {
    key: key.to_string(),
    name: key.to_string(),
    root_node: root,
    timeout_ms: None,
    enabled: true,
  }
}

fn engine_with(adapters: Vec<Arc<dyn TaskAdapter>>) -> TaskEngine {
  let registry = Arc::new(AdapterRegistry::new());
  for adapter in adapters {
    registry.register(adapter).unwrap();
  }
  TaskEngine::new(registry)
}

fn node_events<'a>(events: &'a [ProgressData], node: &str) -> Vec<&'a ProgressData> {
  events.iter().filter(|e| e.node_key == node).collect()
}

fn kinds(events: &[ProgressData]) -> Vec<ProgressKind> {
  events.iter().map(|e| e.kind).collect()
}

#[tokio::test]
async fn unknown_and_disabled_tasks_fail_fast() {
  let engine = engine_with(vec![Arc::new(EchoAdapter::new())]);

  let err = engine
    .task("missing")
    .run("req", serde_json::Map::new(), false)
    .unwrap_err();
  assert!(matches!(err, EngineError::UnknownTask { .. }));

  let mut disabled = definition("off", flow("root", vec![leaf("a", "echo")]));
  disabled.enabled = false;
  engine.register(disabled).unwrap();
  let err = engine
    .task("off")
    .run("req", serde_json::Map::new(), false)
    .unwrap_err();
  assert!(matches!(err, EngineError::TaskDisabled { .. }));
}

#[tokio::test]
async fn duplicate_registration_is_rejected() {
  let engine = engine_with(vec![Arc::new(EchoAdapter::new())]);
  engine
    .register(definition("dup", flow("root", vec![leaf("a", "echo")])))
    .unwrap();
  let err = engine
    .register(definition("dup", flow("root", vec![leaf("a", "echo")])))
    .unwrap_err();
  assert!(matches!(err, EngineError::DuplicateTask { .. }));
}

#[tokio::test]
async fn run_emits_exactly_one_terminal_event_last() {
  let engine = engine_with(vec![Arc::new(EchoAdapter::new())]);
  engine
    .register(definition(
      "simple",
      flow("root", vec![leaf("a", "echo"), leaf("b", "echo")]),
    ))
    .unwrap();

  let session = engine
    .task("simple")
    .run("req-1", serde_json::Map::new(), false)
    .unwrap();
  let events = session.collect_events().await;

  assert_eq!(events[0].kind, ProgressKind::TaskInit);
  let terminals: Vec<_> = events
    .iter()
    .filter(|e| matches!(e.kind, ProgressKind::TaskComplete | ProgressKind::TaskCancel))
    .collect();
  assert_eq!(terminals.len(), 1);
  assert_eq!(events.last().unwrap().kind, ProgressKind::TaskComplete);
  assert_eq!(events.last().unwrap().state, TaskState::Completed);
}

#[tokio::test]
async fn flow_children_start_in_array_order() {
  let engine = engine_with(vec![Arc::new(EchoAdapter::new())]);
  engine
    .register(definition(
      "ordered",
      flow(
        "root",
        vec![leaf("first", "echo"), leaf("second", "echo"), leaf("third", "echo")],
      ),
    ))
    .unwrap();

  let session = engine
    .task("ordered")
    .run("req-1", serde_json::Map::new(), false)
    .unwrap();
  let events = session.collect_events().await;

  let starts: Vec<&str> = events
    .iter()
    .filter(|e| e.kind == ProgressKind::NodeStart && e.node_key != "root")
    .map(|e| e.node_key.as_str())
    .collect();
  assert_eq!(starts, vec!["first", "second", "third"]);

  // Progress never regresses.
  let mut last = 0;
  for event in &events {
    assert!(event.progress >= last);
    last = event.progress;
  }
}

#[tokio::test]
async fn falsy_condition_skips_without_invoking_the_adapter() {
  let echo = Arc::new(EchoAdapter::new());
  let engine = engine_with(vec![echo.clone()]);

  let mut guarded = leaf("guarded", "echo");
  guarded.strategy.condition = Some("return open ~= nil".to_string());
  guarded.strategy.skip_message = Some("door never opened".to_string());

  engine
    .register(definition("skippy", flow("root", vec![guarded])))
    .unwrap();

  let session = engine
    .task("skippy")
    .run("req-1", serde_json::Map::new(), false)
    .unwrap();
  let events = session.collect_events().await;

  assert_eq!(echo.invocations.load(Ordering::Relaxed), 0);
  let guarded_kinds = kinds(
    &node_events(&events, "guarded")
      .into_iter()
      .cloned()
      .collect::<Vec<_>>(),
  );
  assert_eq!(
    guarded_kinds,
    vec![
      ProgressKind::NodeStart,
      ProgressKind::ConditionCheck,
      ProgressKind::NodeSkip
    ]
  );
  let skip = events
    .iter()
    .find(|e| e.kind == ProgressKind::NodeSkip)
    .unwrap();
  assert_eq!(skip.payload, Some(json!("door never opened")));

  // A skip is not an error.
  assert_eq!(events.last().unwrap().state, TaskState::Completed);
}

#[tokio::test]
async fn retry_makes_n_plus_one_attempts_spaced_by_interval() {
  let flaky = Arc::new(FlakyAdapter::always_failing());
  let engine = engine_with(vec![flaky.clone()]);

  let mut unstable = leaf("unstable", "flaky");
  unstable.strategy.error_strategy = ErrorStrategy::Retry;
  unstable.strategy.retry = Some(RetryPolicy {
    times: 2,
    interval_ms: 50,
  });

  engine
    .register(definition("retrying", flow("root", vec![unstable])))
    .unwrap();

  let session = engine
    .task("retrying")
    .run("req-1", serde_json::Map::new(), false)
    .unwrap();
  let events = session.collect_events().await;

  let instants = flaky.call_instants();
  assert_eq!(instants.len(), 3);
  for pair in instants.windows(2) {
    assert!(pair[1].duration_since(pair[0]).as_millis() >= 50);
  }

  let retries = events
    .iter()
    .filter(|e| e.kind == ProgressKind::NodeRetry)
    .count();
  assert_eq!(retries, 2);

  // Exhausted retries terminate like a skip-style error.
  let errors = node_events(&events, "unstable")
    .into_iter()
    .filter(|e| e.kind == ProgressKind::NodeError)
    .count();
  assert_eq!(errors, 1);
  assert_eq!(events.last().unwrap().state, TaskState::PartialFailed);
}

#[tokio::test]
async fn retry_can_recover_before_exhaustion() {
  let flaky = Arc::new(FlakyAdapter::failing_times(1));
  let engine = engine_with(vec![flaky.clone()]);

  let mut unstable = leaf("unstable", "flaky");
  unstable.strategy.error_strategy = ErrorStrategy::Retry;
  unstable.strategy.retry = Some(RetryPolicy {
    times: 3,
    interval_ms: 10,
  });

  engine
    .register(definition("recovers", flow("root", vec![unstable])))
    .unwrap();

  let session = engine
    .task("recovers")
    .run("req-1", serde_json::Map::new(), false)
    .unwrap();
  let events = session.collect_events().await;

  assert_eq!(flaky.call_instants().len(), 2);
  assert!(events.iter().any(|e| {
    e.node_key == "unstable" && e.kind == ProgressKind::NodeComplete
  }));
  assert_eq!(events.last().unwrap().state, TaskState::Completed);
}

#[tokio::test]
async fn failed_node_withholds_its_key_and_later_conditions_skip() {
  let engine = engine_with(vec![
    Arc::new(FlakyAdapter::always_failing()),
    Arc::new(EchoAdapter::new()),
  ]);

  let broken = leaf("open", "flaky");
  let mut dependent = leaf("take", "echo");
  dependent.strategy.condition = Some("return open ~= nil".to_string());

  engine
    .register(definition("cascade", flow("root", vec![broken, dependent])))
    .unwrap();

  let session = engine
    .task("cascade")
    .run("req-1", serde_json::Map::new(), false)
    .unwrap();
  let events = session.collect_events().await;

  assert!(events.iter().any(|e| {
    e.node_key == "open" && e.kind == ProgressKind::NodeError
  }));
  assert!(events.iter().any(|e| {
    e.node_key == "take" && e.kind == ProgressKind::NodeSkip
  }));

  let last = events.last().unwrap();
  assert_eq!(last.state, TaskState::PartialFailed);
  assert!(!last.context.contains_key("open"));
}

#[tokio::test]
async fn context_round_trips_between_siblings() {
  let engine = engine_with(vec![Arc::new(EchoAdapter::new())]);

  let mut producer = leaf("open", "echo");
  producer.result_script = Some("return { door = 'open', attempt = 1 }".to_string());

  let mut consumer = leaf("reader", "echo");
  consumer.strategy.condition = Some("return open ~= nil".to_string());
  consumer.args_script = Some("return open".to_string());

  engine
    .register(definition("roundtrip", flow("root", vec![producer, consumer])))
    .unwrap();

  let session = engine
    .task("roundtrip")
    .run("req-1", serde_json::Map::new(), false)
    .unwrap();
  let events = session.collect_events().await;

  let reader_complete = events
    .iter()
    .find(|e| e.node_key == "reader" && e.kind == ProgressKind::NodeComplete)
    .unwrap();
  assert_eq!(
    reader_complete.payload,
    Some(json!({ "door": "open", "attempt": 1 }))
  );
}

#[tokio::test]
async fn cancellation_stops_scheduling_and_terminates_with_task_cancel() {
  let engine = engine_with(vec![Arc::new(BlockingAdapter), Arc::new(EchoAdapter::new())]);

  engine
    .register(definition(
      "cancellable",
      flow("root", vec![leaf("stuck", "blocking"), leaf("after", "echo")]),
    ))
    .unwrap();

  let mut session = engine
    .task("cancellable")
    .run("req-1", serde_json::Map::new(), false)
    .unwrap();

  let mut seen = Vec::new();
  while let Some(event) = session.next_event().await {
    let is_stuck_start = event.node_key == "stuck" && event.kind == ProgressKind::NodeStart;
    seen.push(event);
    if is_stuck_start {
      session.cancel();
      break;
    }
  }
  while let Some(event) = session.next_event().await {
    seen.push(event);
  }

  let last = seen.last().unwrap();
  assert_eq!(last.kind, ProgressKind::TaskCancel);
  assert_eq!(last.state, TaskState::Cancelled);
  assert!(!seen.iter().any(|e| e.node_key == "after"));
}

#[tokio::test]
async fn compensation_runs_once_and_writes_its_own_key() {
  let engine = engine_with(vec![
    Arc::new(FlakyAdapter::always_failing()),
    Arc::new(EchoAdapter::new()),
  ]);

  let mut burn = leaf("burn", "flaky");
  burn.strategy.error_strategy = ErrorStrategy::Compensate;
  burn.strategy.compensation_node = Some("cleanup".to_string());

  let mut cleanup = leaf("cleanup", "echo");
  // Runs as compensation; skips on the later normal walk once its key is set.
  cleanup.strategy.condition = Some("return cleanup == nil".to_string());
  cleanup.result_script = Some("return { rolled_back = true }".to_string());

  engine
    .register(definition("compensated", flow("root", vec![burn, cleanup])))
    .unwrap();

  let session = engine
    .task("compensated")
    .run("req-1", serde_json::Map::new(), false)
    .unwrap();
  let events = session.collect_events().await;

  let compensations = events
    .iter()
    .filter(|e| e.kind == ProgressKind::Compensation)
    .count();
  assert_eq!(compensations, 1);

  let completions = events
    .iter()
    .filter(|e| e.node_key == "cleanup" && e.kind == ProgressKind::NodeComplete)
    .count();
  assert_eq!(completions, 1);

  let last = events.last().unwrap();
  assert_eq!(last.state, TaskState::PartialFailed);
  assert_eq!(last.context.get("cleanup"), Some(&json!({ "rolled_back": true })));
  assert!(!last.context.contains_key("burn"));
}

#[tokio::test]
async fn failing_compensation_never_compensates_again() {
  let engine = engine_with(vec![Arc::new(FlakyAdapter::always_failing())]);

  let mut burn = leaf("burn", "flaky");
  burn.strategy.error_strategy = ErrorStrategy::Compensate;
  burn.strategy.compensation_node = Some("rollback".to_string());

  let mut rollback = leaf("rollback", "flaky");
  rollback.strategy.error_strategy = ErrorStrategy::Compensate;
  rollback.strategy.compensation_node = Some("burn".to_string());

  engine
    .register(definition("capped", flow("root", vec![burn, rollback])))
    .unwrap();

  let session = engine
    .task("capped")
    .run("req-1", serde_json::Map::new(), false)
    .unwrap();
  let events = session.collect_events().await;

  // burn and rollback reference each other; without the depth cap this run
  // would never terminate. Each of the two walked failures opens exactly one
  // compensation, and the compensation's own failure opens none.
  let compensations = events
    .iter()
    .filter(|e| e.kind == ProgressKind::Compensation)
    .count();
  assert_eq!(compensations, 2);
  let errors = events
    .iter()
    .filter(|e| e.kind == ProgressKind::NodeError)
    .count();
  assert_eq!(errors, 4);
  assert_eq!(events.last().unwrap().state, TaskState::PartialFailed);
}

#[tokio::test]
async fn node_timeout_fails_the_node_with_a_timeout_code() {
  let engine = engine_with(vec![Arc::new(BlockingAdapter)]);

  let mut slow = leaf("slow", "blocking");
  slow.timeout_ms = Some(50);

  engine
    .register(definition("node-timeout", flow("root", vec![slow])))
    .unwrap();

  let session = engine
    .task("node-timeout")
    .run("req-1", serde_json::Map::new(), false)
    .unwrap();
  let events = session.collect_events().await;

  let error = events
    .iter()
    .find(|e| e.node_key == "slow" && e.kind == ProgressKind::NodeError)
    .unwrap();
  assert_eq!(error.error.as_ref().unwrap().code, codes::NODE_TIMEOUT);
  assert!(error.error.as_ref().unwrap().retryable);
  assert_eq!(events.last().unwrap().kind, ProgressKind::TaskComplete);
  assert_eq!(events.last().unwrap().state, TaskState::PartialFailed);
}

#[tokio::test]
async fn task_timeout_forces_a_terminal_state() {
  let engine = engine_with(vec![Arc::new(BlockingAdapter)]);

  let mut def = definition("task-timeout", flow("root", vec![leaf("stuck", "blocking")]));
  def.timeout_ms = Some(100);
  engine.register(def).unwrap();

  let session = engine
    .task("task-timeout")
    .run("req-1", serde_json::Map::new(), false)
    .unwrap();
  let events = session.collect_events().await;

  let error = events
    .iter()
    .find(|e| e.kind == ProgressKind::NodeError)
    .unwrap();
  assert_eq!(error.error.as_ref().unwrap().code, codes::TASK_TIMEOUT);
  assert_eq!(events.last().unwrap().kind, ProgressKind::TaskComplete);
  assert_eq!(events.last().unwrap().state, TaskState::PartialFailed);
}

#[tokio::test]
async fn unknown_adapter_kind_fails_the_node_not_the_run() {
  let engine = engine_with(vec![Arc::new(EchoAdapter::new())]);

  engine
    .register(definition(
      "unwired",
      flow("root", vec![leaf("ghost", "notRegistered"), leaf("after", "echo")]),
    ))
    .unwrap();

  let session = engine
    .task("unwired")
    .run("req-1", serde_json::Map::new(), false)
    .unwrap();
  let events = session.collect_events().await;

  let error = events
    .iter()
    .find(|e| e.node_key == "ghost" && e.kind == ProgressKind::NodeError)
    .unwrap();
  assert_eq!(error.error.as_ref().unwrap().code, codes::ADAPTER_NOT_FOUND);

  // The walk continued past the failure.
  assert!(events.iter().any(|e| {
    e.node_key == "after" && e.kind == ProgressKind::NodeComplete
  }));
}

#[tokio::test]
async fn concurrent_sessions_are_isolated() {
  let engine = engine_with(vec![Arc::new(EchoAdapter::new())]);

  let mut node = leaf("echo_seed", "echo");
  node.args_script = Some("return seed".to_string());

  engine
    .register(definition("isolated", flow("root", vec![node])))
    .unwrap();

  let mut ctx_a = serde_json::Map::new();
  ctx_a.insert("seed".to_string(), json!("alpha"));
  let mut ctx_b = serde_json::Map::new();
  ctx_b.insert("seed".to_string(), json!("beta"));

  let session_a = engine.task("isolated").run("req-a", ctx_a, false).unwrap();
  let session_b = engine.task("isolated").run("req-b", ctx_b, false).unwrap();

  let (events_a, events_b) =
    tokio::join!(session_a.collect_events(), session_b.collect_events());

  let final_a = events_a.last().unwrap();
  let final_b = events_b.last().unwrap();
  assert_eq!(final_a.request_id, "req-a");
  assert_eq!(final_b.request_id, "req-b");
  assert_eq!(final_a.context.get("echo_seed"), Some(&json!("alpha")));
  assert_eq!(final_b.context.get("echo_seed"), Some(&json!("beta")));
}
