//! The sandboxed evaluator.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use mlua::{HookTriggers, Lua, LuaOptions, LuaSerdeExt, StdLib, VmState};
use serde_json::Value;

use crate::error::ScriptError;

/// How many instructions execute between budget checks.
const INSTRUCTION_QUANTUM: u32 = 1_000;

/// Hard resource ceiling for a single evaluation.
#[derive(Debug, Clone, Copy)]
pub struct ScriptBudget {
  /// Maximum VM heap in bytes.
  pub max_memory: usize,
  /// Maximum executed instructions.
  pub max_instructions: u64,
}

impl Default for ScriptBudget {
  fn default() -> Self {
    Self {
      max_memory: 4 * 1024 * 1024,
      max_instructions: 1_000_000,
    }
  }
}

/// Base-library globals that reach into the host; removed from every VM.
const BLOCKED_GLOBALS: &[&str] = &["load", "dofile", "loadfile", "print"];

/// Evaluates Lua chunks with injected bindings.
///
/// Every call builds a fresh VM restricted to the pure stdlib subset
/// (`table`, `string`, `math` plus the implicit base library, scrubbed of
/// its host-facing entry points): no `os`, `io` or `package`, and no state
/// carried between evaluations.
#[derive(Debug, Clone, Default)]
pub struct ScriptEvaluator {
  budget: ScriptBudget,
}

impl ScriptEvaluator {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_budget(budget: ScriptBudget) -> Self {
    Self { budget }
  }

  /// Run `script` with `params` bound as a global and each `globals` entry
  /// bound under its own name, returning the chunk's value as JSON.
  ///
  /// `name` labels the chunk in diagnostics (typically the node key plus the
  /// script role). Any Lua raise propagates as [`ScriptError::Eval`], never
  /// swallowed.
  pub fn evaluate(
    &self,
    name: &str,
    script: &str,
    params: &Value,
    globals: &serde_json::Map<String, Value>,
  ) -> Result<Value, ScriptError> {
    let lua = Lua::new_with(
      StdLib::TABLE | StdLib::STRING | StdLib::MATH,
      LuaOptions::default(),
    )
    .map_err(|e| internal(name, e))?;

    lua
      .set_memory_limit(self.budget.max_memory)
      .map_err(|e| internal(name, e))?;

    let spent = Arc::new(AtomicU64::new(0));
    let counter = spent.clone();
    let max_instructions = self.budget.max_instructions;
    lua.set_hook(
      HookTriggers::new().every_nth_instruction(INSTRUCTION_QUANTUM),
      move |_lua, _debug| {
        let total =
          counter.fetch_add(INSTRUCTION_QUANTUM as u64, Ordering::Relaxed) + INSTRUCTION_QUANTUM as u64;
        if total > max_instructions {
          Err(mlua::Error::RuntimeError(
            "instruction budget exceeded".to_string(),
          ))
        } else {
          Ok(VmState::Continue)
        }
      },
    );

    let bindings = lua.globals();
    for blocked in BLOCKED_GLOBALS {
      bindings
        .set(*blocked, mlua::Value::Nil)
        .map_err(|e| internal(name, e))?;
    }
    bindings
      .set("params", lua.to_value(params).map_err(|e| internal(name, e))?)
      .map_err(|e| internal(name, e))?;
    for (key, value) in globals {
      bindings
        .set(
          key.as_str(),
          lua.to_value(value).map_err(|e| internal(name, e))?,
        )
        .map_err(|e| internal(name, e))?;
    }

    let result: mlua::Value = lua
      .load(script)
      .set_name(format!("@{name}"))
      .eval()
      .map_err(|e| classify(name, e, spent.load(Ordering::Relaxed), max_instructions))?;

    lua.from_value(result).map_err(|e| ScriptError::Convert {
      name: name.to_string(),
      message: e.to_string(),
    })
  }
}

/// Condition verdict: Lua truthiness mapped onto JSON values.
pub fn truthy(value: &Value) -> bool {
  !matches!(value, Value::Null | Value::Bool(false))
}

fn internal(name: &str, error: mlua::Error) -> ScriptError {
  ScriptError::Eval {
    name: name.to_string(),
    message: error.to_string(),
    traceback: None,
  }
}

fn classify(name: &str, error: mlua::Error, spent: u64, max_instructions: u64) -> ScriptError {
  match error {
    mlua::Error::SyntaxError { message, .. } => ScriptError::Compile {
      name: name.to_string(),
      message,
    },
    mlua::Error::MemoryError(_) => ScriptError::BudgetExceeded {
      name: name.to_string(),
      resource: "memory",
    },
    other => {
      if spent >= max_instructions {
        ScriptError::BudgetExceeded {
          name: name.to_string(),
          resource: "instruction",
        }
      } else {
        let traceback = match &other {
          mlua::Error::CallbackError { traceback, .. } => Some(traceback.clone()),
          _ => None,
        };
        ScriptError::Eval {
          name: name.to_string(),
          message: other.to_string(),
          traceback,
        }
      }
    }
  }
}
