use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::TaskError;

/// The reserved node kind handled by the engine itself rather than an adapter.
pub const FLOW_KIND: &str = "flow";

/// A registered, named unit of orchestration.
///
/// Definitions are immutable once registered; the registry rejects duplicate
/// keys. `timeout_ms` caps the whole run's wall clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
  pub key: String,
  pub name: String,
  pub root_node: TaskNode,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub timeout_ms: Option<u64>,
  #[serde(default = "default_enabled")]
  pub enabled: bool,
}

fn default_enabled() -> bool {
  true
}

impl TaskDefinition {
  /// Validate the node tree: unique keys, children only under flow nodes,
  /// compensation targets that actually exist, retry strategies with a policy.
  pub fn validate(&self) -> Result<(), TaskError> {
    let mut keys = HashSet::new();
    let mut compensation_refs = Vec::new();
    validate_node(&self.root_node, &mut keys, &mut compensation_refs)?;

    for (node, target) in compensation_refs {
      if !keys.contains(target.as_str()) {
        return Err(TaskError::UnknownCompensationTarget { node, target });
      }
    }

    Ok(())
  }

  /// Total number of nodes in the tree, flows included.
  pub fn node_count(&self) -> u32 {
    self.root_node.count()
  }

  /// Find a node anywhere in the tree by key.
  pub fn find_node(&self, key: &str) -> Option<&TaskNode> {
    self.root_node.find(key)
  }
}

fn validate_node<'a>(
  node: &'a TaskNode,
  keys: &mut HashSet<&'a str>,
  compensation_refs: &mut Vec<(String, String)>,
) -> Result<(), TaskError> {
  if !keys.insert(node.key.as_str()) {
    return Err(TaskError::DuplicateNodeKey {
      key: node.key.clone(),
    });
  }

  if !node.is_flow() && !node.nodes.is_empty() {
    return Err(TaskError::NonFlowChildren {
      node: node.key.clone(),
    });
  }

  if node.strategy.error_strategy == ErrorStrategy::Retry && node.strategy.retry.is_none() {
    return Err(TaskError::MissingRetryPolicy {
      node: node.key.clone(),
    });
  }

  if let Some(target) = &node.strategy.compensation_node {
    compensation_refs.push((node.key.clone(), target.clone()));
  }

  for child in &node.nodes {
    validate_node(child, keys, compensation_refs)?;
  }

  Ok(())
}

/// The smallest schedulable unit: an adapter-backed leaf, or a flow of
/// ordered children.
///
/// Nodes are read-only during execution. The `args_script` and
/// `result_script` fields hold Lua source; an absent script passes its input
/// through unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
  pub key: String,
  pub name: String,
  #[serde(rename = "type")]
  pub kind: NodeKind,
  #[serde(default)]
  pub strategy: NodeStrategy,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub args_script: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub result_script: Option<String>,
  /// Ordered children; only meaningful when `kind` is flow.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub nodes: Vec<TaskNode>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub timeout_ms: Option<u64>,
}

impl TaskNode {
  pub fn is_flow(&self) -> bool {
    self.kind == NodeKind::Flow
  }

  fn count(&self) -> u32 {
    1 + self.nodes.iter().map(TaskNode::count).sum::<u32>()
  }

  fn find(&self, key: &str) -> Option<&TaskNode> {
    if self.key == key {
      return Some(self);
    }
    self.nodes.iter().find_map(|child| child.find(key))
  }
}

/// The kind tag selecting how a node executes.
///
/// `Flow` is the only built-in; every other tag is an open, string-keyed
/// extension point resolved through the adapter registry at execution time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeKind {
  Flow,
  Adapter(String),
}

impl NodeKind {
  pub fn as_str(&self) -> &str {
    match self {
      NodeKind::Flow => FLOW_KIND,
      NodeKind::Adapter(kind) => kind,
    }
  }
}

impl From<&str> for NodeKind {
  fn from(tag: &str) -> Self {
    if tag == FLOW_KIND {
      NodeKind::Flow
    } else {
      NodeKind::Adapter(tag.to_string())
    }
  }
}

impl Serialize for NodeKind {
  fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(self.as_str())
  }
}

impl<'de> Deserialize<'de> for NodeKind {
  fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let tag = String::deserialize(deserializer)?;
    Ok(NodeKind::from(tag.as_str()))
  }
}

/// Per-node execution strategy: an optional guard condition and the policy
/// applied when execution fails.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStrategy {
  /// Lua condition; truthy executes the node, falsy skips it.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub condition: Option<String>,
  /// Message attached to the `NODE_SKIP` event when the condition is falsy.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub skip_message: Option<String>,
  #[serde(default)]
  pub error_strategy: ErrorStrategy,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub retry: Option<RetryPolicy>,
  /// Key of the node to run after a failure when the strategy is compensate.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub compensation_node: Option<String>,
}

/// What to do when a node's execution fails.
///
/// There is deliberately no abort variant: a failed node never terminates
/// the run, it only withholds its context key from later siblings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorStrategy {
  Retry,
  #[default]
  Skip,
  Compensate,
}

/// Retry schedule for the retry strategy: `times` additional attempts,
/// `interval_ms` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
  pub times: u32,
  pub interval_ms: u64,
}

#[cfg(test)]
mod tests {
  use super::*;

  fn leaf(key: &str) -> TaskNode {
    TaskNode {
      key: key.to_string(),
      name: key.to_string(),
      kind: NodeKind::Adapter("command".to_string()),
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

  fn definition(root: TaskNode) -> TaskDefinition {
    TaskDefinition {
      key: "test".to_string(),
      name: "Test".to_string(),
      root_node: root,
      timeout_ms: None,
      enabled: true,
    }
  }

  #[test]
  fn node_kind_round_trips_through_its_tag() {
    let json = serde_json::to_string(&NodeKind::Flow).unwrap();
    assert_eq!(json, "\"flow\"");

    let kind: NodeKind = serde_json::from_str("\"externalSubscribe\"").unwrap();
    assert_eq!(kind, NodeKind::Adapter("externalSubscribe".to_string()));
  }

  #[test]
  fn validate_rejects_duplicate_keys() {
    let def = definition(flow("root", vec![leaf("a"), leaf("a")]));
    assert!(matches!(
      def.validate(),
      Err(TaskError::DuplicateNodeKey { key }) if key == "a"
    ));
  }

  #[test]
  fn validate_rejects_children_on_leaf_nodes() {
    let mut bad = leaf("a");
    bad.nodes.push(leaf("b"));
    let def = definition(flow("root", vec![bad]));
    assert!(matches!(
      def.validate(),
      Err(TaskError::NonFlowChildren { node }) if node == "a"
    ));
  }

  #[test]
  fn validate_rejects_dangling_compensation_target() {
    let mut node = leaf("a");
    node.strategy.error_strategy = ErrorStrategy::Compensate;
    node.strategy.compensation_node = Some("missing".to_string());
    let def = definition(flow("root", vec![node]));
    assert!(matches!(
      def.validate(),
      Err(TaskError::UnknownCompensationTarget { target, .. }) if target == "missing"
    ));
  }

  #[test]
  fn validate_requires_retry_policy_for_retry_strategy() {
    let mut node = leaf("a");
    node.strategy.error_strategy = ErrorStrategy::Retry;
    let def = definition(flow("root", vec![node]));
    assert!(matches!(
      def.validate(),
      Err(TaskError::MissingRetryPolicy { node }) if node == "a"
    ));
  }

  #[test]
  fn node_count_includes_flows_and_leaves() {
    let def = definition(flow("root", vec![leaf("a"), flow("inner", vec![leaf("b")])]));
    assert_eq!(def.node_count(), 4);
    assert!(def.find_node("b").is_some());
    assert!(def.find_node("nope").is_none());
  }
}
