//! Lockstep Script
//!
//! Sandboxed evaluation of per-node Lua scripts. Each evaluation runs in a
//! fresh VM with a fixed, enumerated binding set (`params` plus each shared
//! context key as a top-level global) under a hard memory and instruction
//! budget. Nothing leaks from one evaluation into the next, and the VM has
//! no ambient access to the host process.

mod error;
mod evaluator;

pub use error::ScriptError;
pub use evaluator::{ScriptBudget, ScriptEvaluator, truthy};
