//! String-keyed adapter lookup.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;

use crate::adapter::TaskAdapter;
use lockstep_task::FLOW_KIND;

/// Errors raised while registering adapters.
#[derive(Debug, Error)]
pub enum RegistryError {
  #[error("adapter kind already registered: {kind}")]
  Duplicate { kind: String },

  #[error("'{FLOW_KIND}' is reserved for the engine")]
  ReservedKind,
}

/// Holds the adapters a task engine can dispatch to, keyed by kind tag.
///
/// The kind space is open: any string except the reserved `flow` tag can be
/// registered, so hosts can extend the engine with their own leaf kinds.
#[derive(Default)]
pub struct AdapterRegistry {
  adapters: RwLock<HashMap<String, Arc<dyn TaskAdapter>>>,
}

impl AdapterRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&self, adapter: Arc<dyn TaskAdapter>) -> Result<(), RegistryError> {
    let kind = adapter.kind().to_string();
    if kind == FLOW_KIND {
      return Err(RegistryError::ReservedKind);
    }

    let mut adapters = self.adapters.write().expect("adapter registry poisoned");
    if adapters.contains_key(&kind) {
      return Err(RegistryError::Duplicate { kind });
    }
    adapters.insert(kind, adapter);
    Ok(())
  }

  pub fn get(&self, kind: &str) -> Option<Arc<dyn TaskAdapter>> {
    self
      .adapters
      .read()
      .expect("adapter registry poisoned")
      .get(kind)
      .cloned()
  }

  pub fn kinds(&self) -> Vec<String> {
    let mut kinds: Vec<String> = self
      .adapters
      .read()
      .expect("adapter registry poisoned")
      .keys()
      .cloned()
      .collect();
    kinds.sort();
    kinds
  }
}
