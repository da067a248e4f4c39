//! The request-scoped run context and its shared bag.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use lockstep_adapter::AdapterContext;
use lockstep_task::TaskState;

/// The shared, mutable key→value bag threaded through a run.
///
/// Append-only in spirit: nodes write under their own key and never replace
/// the bag. Each mutation bumps a version counter; snapshots are cheap
/// clones taken at event-emission time. Execution within a session is
/// sequential, so the lock is uncontended; it exists to keep the bag
/// shareable with adapter streams.
#[derive(Debug, Default)]
pub struct ContextBag {
  inner: Mutex<BagInner>,
}

#[derive(Debug, Default)]
struct BagInner {
  values: serde_json::Map<String, Value>,
  version: u64,
}

impl ContextBag {
  pub fn seeded(initial: serde_json::Map<String, Value>) -> Self {
    Self {
      inner: Mutex::new(BagInner {
        values: initial,
        version: 0,
      }),
    }
  }

  pub fn get(&self, key: &str) -> Option<Value> {
    self.lock().values.get(key).cloned()
  }

  pub fn insert(&self, key: &str, value: Value) {
    let mut inner = self.lock();
    inner.values.insert(key.to_string(), value);
    inner.version += 1;
  }

  pub fn snapshot(&self) -> serde_json::Map<String, Value> {
    self.lock().values.clone()
  }

  pub fn version(&self) -> u64 {
    self.lock().version
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, BagInner> {
    self.inner.lock().expect("context bag poisoned")
  }
}

/// One run's execution state, owned by the session that created it.
#[derive(Debug)]
pub struct RunContext {
  pub request_id: String,
  pub task_key: String,
  pub session_id: String,
  pub bag: ContextBag,
  pub cancel: CancellationToken,
  state: Mutex<TaskState>,
  node_counter: AtomicU32,
  total_nodes: u32,
  has_error: AtomicBool,
}

impl RunContext {
  pub fn new(
    request_id: String,
    task_key: String,
    initial: serde_json::Map<String, Value>,
    total_nodes: u32,
  ) -> Self {
    Self {
      request_id,
      task_key,
      session_id: uuid::Uuid::new_v4().to_string(),
      bag: ContextBag::seeded(initial),
      cancel: CancellationToken::new(),
      state: Mutex::new(TaskState::Init),
      node_counter: AtomicU32::new(0),
      total_nodes,
      has_error: AtomicBool::new(false),
    }
  }

  pub fn state(&self) -> TaskState {
    *self.state.lock().expect("run state poisoned")
  }

  pub fn set_state(&self, state: TaskState) {
    *self.state.lock().expect("run state poisoned") = state;
  }

  pub fn mark_error(&self) {
    self.has_error.store(true, Ordering::Relaxed);
  }

  pub fn has_error(&self) -> bool {
    self.has_error.load(Ordering::Relaxed)
  }

  /// Count a node reaching a terminal per-node state; returns the new index.
  pub fn count_node(&self) -> u32 {
    self.node_counter.fetch_add(1, Ordering::Relaxed) + 1
  }

  pub fn node_index(&self) -> u32 {
    self.node_counter.load(Ordering::Relaxed)
  }

  pub fn total_nodes(&self) -> u32 {
    self.total_nodes
  }

  /// Task-level percentage, clamped so a compensation re-run can never
  /// regress it past 100.
  pub fn progress(&self) -> u8 {
    if self.total_nodes == 0 {
      return 100;
    }
    let pct = (self.node_index() as u64 * 100) / self.total_nodes as u64;
    pct.min(100) as u8
  }

  /// The slice of this context adapters are allowed to see.
  pub fn adapter_context(&self) -> AdapterContext {
    AdapterContext {
      request_id: self.request_id.clone(),
      task_key: self.task_key.clone(),
      session_id: self.session_id.clone(),
      cancel: self.cancel.clone(),
    }
  }
}
