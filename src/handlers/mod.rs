//! In-tree block handlers (spec §4.9). `goto` is handled inline by the
//! Interpreter (spec §4.5) rather than through the registry, since it needs
//! to mutate control flow, not just produce deltas; it is still listed here
//! as a recognized type so validation can name it.

pub mod agent;
pub mod array;
pub mod code;
pub mod date;
pub mod fetch;
pub mod location;
pub mod math;
pub mod normalize;
pub mod object;
pub mod sleep;
pub mod string;

use std::sync::Arc;

use crate::registry::BlockRegistry;
use crate::sandbox::Sandbox;

/// Block-type tag recognized by the Interpreter as a control-flow
/// primitive rather than a registry-dispatched handler.
pub const GOTO_BLOCK_TYPE: &str = "goto";

/// Lexical prefix identifying a UI block (spec §4.5, "UI block detection").
/// Any block whose type begins with this prefix never executes; its
/// presence signals "pause".
pub const UI_BLOCK_PREFIX: &str = "ui_";

pub fn is_ui_block(block_type: &str) -> bool {
    block_type.starts_with(UI_BLOCK_PREFIX)
}

/// Build the registry shipped in-tree: `code`, `fetch`, `math`, `date`,
/// `string`, `array`, `object`, `sleep`, `agent`, `location`, `normalize`.
pub fn default_registry(sandbox: Arc<Sandbox>, http: reqwest::Client) -> BlockRegistry {
    let mut registry = BlockRegistry::new();
    registry.register("code", Arc::new(code::CodeHandler::new(sandbox)));
    registry.register("fetch", Arc::new(fetch::FetchHandler::new(http)));
    registry.register("math", Arc::new(math::MathHandler));
    registry.register("date", Arc::new(date::DateHandler));
    registry.register("string", Arc::new(string::StringHandler));
    registry.register("array", Arc::new(array::ArrayHandler));
    registry.register("object", Arc::new(object::ObjectHandler));
    registry.register("sleep", Arc::new(sleep::SleepHandler));
    registry.register("agent", Arc::new(agent::AgentHandler));
    registry.register("location", Arc::new(location::LocationHandler));
    registry.register("normalize", Arc::new(normalize::NormalizeHandler));
    registry
}

/// Read `<prefix>_bind_value` from a block's logic, if present.
pub fn bind_value_key(block: &crate::model::Block, prefix: &str) -> Option<String> {
    block.logic_str(&format!("{prefix}_bind_value")).map(str::to_string)
}

/// Resolve an operations list (`<prefix>_operations`) if chained, otherwise
/// wrap the single `<prefix>_operation` field into a one-element list.
pub fn operations_of(block: &crate::model::Block, prefix: &str) -> Vec<serde_json::Value> {
    if let Some(serde_json::Value::Array(ops)) = block.logic.get(&format!("{prefix}_operations")) {
        return ops.clone();
    }
    if let Some(op) = block.logic.get(&format!("{prefix}_operation")) {
        return vec![op.clone()];
    }
    Vec::new()
}
