//! Shared scaffolding for the black-box scenario tests: block builders, a
//! network-free stand-in for the `fetch` handler, and small polling helpers
//! over the orchestrator's async, store-backed lifecycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use workflow_engine::context::WorkflowContext;
use workflow_engine::error::WorkflowResult;
use workflow_engine::handlers::{self, bind_value_key};
use workflow_engine::model::{Block, BlockId, Condition, Run, RunId, RunStatus, TriggerType, VersionStatus, WorkflowId, WorkflowVersion};
use workflow_engine::registry::{BlockHandler, BlockRegistry, BlockResult};
use workflow_engine::sandbox::Sandbox;
use workflow_engine::{EventBroadcaster, Interpreter, InterpreterConfig, Orchestrator, StateStore};

/// Stands in for the real, network-backed `fetch` handler in scenarios that
/// need a fetch step to succeed. The real `FetchHandler` can never be
/// exercised against a local mock server here: its SSRF policy always
/// rejects loopback addresses, and that's exactly the address every local
/// mock server binds. So this handler echoes a literal response placed on
/// the block itself under `fetch_stub_response`, following the same
/// `fetch_bind_value` convention as the real handler, while the rest of the
/// pipeline (array/math/code/ui/orchestrator/storage) runs unmodified.
pub struct StubFetchHandler;

#[async_trait]
impl BlockHandler for StubFetchHandler {
    async fn execute(&self, block: &Block, _ctx: &mut WorkflowContext) -> WorkflowResult<BlockResult> {
        let payload = block.logic.get("fetch_stub_response").cloned().unwrap_or(Value::Null);
        let mut result = BlockResult::default();
        if let Some(bind) = bind_value_key(block, "fetch") {
            result = result.with_state(bind, payload);
        }
        Ok(result)
    }
}

/// The full in-tree registry with `fetch` swapped for `StubFetchHandler`.
pub fn stub_fetch_registry() -> BlockRegistry {
    let http = reqwest::Client::new();
    let sandbox = Arc::new(Sandbox::new(http.clone()));
    let mut registry = handlers::default_registry(sandbox, http);
    registry.register("fetch", Arc::new(StubFetchHandler));
    registry
}

/// The unmodified in-tree registry, real `FetchHandler` included.
pub fn real_registry() -> BlockRegistry {
    let http = reqwest::Client::new();
    let sandbox = Arc::new(Sandbox::new(http.clone()));
    handlers::default_registry(sandbox, http)
}

pub fn block(name: &str, block_type: &str, order: u32, logic: Vec<(&str, Value)>) -> Block {
    let logic: HashMap<String, Value> = logic.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
    Block { id: BlockId::new(), name: name.to_string(), block_type: block_type.to_string(), logic, conditions: vec![], order }
}

pub fn guarded_block(name: &str, block_type: &str, order: u32, logic: Vec<(&str, Value)>, conditions: Vec<Condition>) -> Block {
    let mut b = block(name, block_type, order, logic);
    b.conditions = conditions;
    b
}

pub fn published_version(workflow_id: WorkflowId, blocks: Vec<Block>) -> WorkflowVersion {
    WorkflowVersion {
        workflow_id,
        version: 1,
        status: VersionStatus::Published,
        trigger_type: TriggerType::Api,
        trigger_config: Default::default(),
        blocks,
    }
}

pub fn orchestrator_with(registry: BlockRegistry) -> (Orchestrator, Arc<StateStore>) {
    let store = Arc::new(StateStore::temporary().expect("temporary store"));
    let interpreter = Arc::new(Interpreter::new(registry, InterpreterConfig::default()));
    let broadcaster = EventBroadcaster::new(64);
    let orchestrator = Orchestrator::new(store.clone(), interpreter, broadcaster);
    (orchestrator, store)
}

/// Poll the store until a run reaches any terminal-or-pausing status, or panic.
pub async fn wait_for_terminal(store: &StateStore, run_id: RunId) -> Run {
    for _ in 0..200 {
        if let Some(run) = store.load_run(run_id).expect("load_run") {
            if matches!(run.status, RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled | RunStatus::AwaitingAction) {
                return run;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {run_id} did not reach a terminal state in time");
}
