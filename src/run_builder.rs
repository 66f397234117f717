//! Run Builder: owns the step ledger for a single run. Stateless of
//! scheduling — the Interpreter decides *when* to call these, this module
//! decides *how* a step transitions.

use chrono::Utc;
use serde_json::{Map, Value};

use crate::context::{calculate_delta, WorkflowContext};
use crate::error::StepError;
use crate::model::{Block, Step, StepStatus};
use crate::registry::BlockResult;

#[derive(Debug, Default)]
pub struct RunBuilder {
    steps: Vec<Step>,
    execution_count: u64,
}

impl RunBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume a step ledger already persisted up to a pause point: the
    /// execution counter continues from where it left off so
    /// `execution_order` stays monotonic and dense across the pause/resume
    /// boundary.
    pub fn resume_from(steps: Vec<Step>) -> Self {
        let execution_count = steps.len() as u64;
        Self { steps, execution_count }
    }

    /// Append a `pending -> running` step for `block`, snapshotting its
    /// logic and incrementing the execution counter.
    pub fn create_step(&mut self, run_id: crate::model::RunId, block: &Block) -> usize {
        let step = Step {
            id: crate::model::StepId::new(),
            run_id,
            block_id: block.id,
            block_name: block.name.clone(),
            block_type: block.block_type.clone(),
            block_order: block.order,
            execution_order: self.execution_count,
            status: StepStatus::Running,
            logic_snapshot: block.logic.clone(),
            state_delta: Value::Object(Map::new()),
            cache_delta: Value::Object(Map::new()),
            artifacts_delta: Value::Array(Vec::new()),
            event_delta: Value::Object(Map::new()),
            started_at: Utc::now(),
            ended_at: None,
            error: None,
            deferred_iteration_id: None,
        };
        self.execution_count += 1;
        self.steps.push(step);
        self.steps.len() - 1
    }

    /// Like `create_step`, but tagged as produced inside a deferred iteration.
    pub fn create_deferred_step(&mut self, run_id: crate::model::RunId, block: &Block, iteration_id: &str) -> usize {
        let idx = self.create_step(run_id, block);
        self.steps[idx].deferred_iteration_id = Some(iteration_id.to_string());
        idx
    }

    pub fn complete_step(&mut self, idx: usize, result: &BlockResult) {
        let step = &mut self.steps[idx];
        step.status = StepStatus::Completed;
        step.ended_at = Some(Utc::now());
        step.state_delta = Value::Object(result.state_delta.clone());
        step.cache_delta = Value::Object(result.cache_delta.clone());
        step.artifacts_delta = Value::Array(result.artifacts_delta.clone());
        step.event_delta = Value::Object(result.event_delta.clone());
    }

    pub fn fail_step(&mut self, idx: usize, error: StepError) {
        let step = &mut self.steps[idx];
        step.status = StepStatus::Failed;
        step.ended_at = Some(Utc::now());
        step.error = Some(error);
    }

    pub fn skip_step(&mut self, idx: usize) {
        let step = &mut self.steps[idx];
        step.status = StepStatus::Skipped;
        step.ended_at = Some(Utc::now());
    }

    /// Append a step that is already in its terminal `status` (used when a
    /// UI block's appearance is itself the "completion" of that step, per
    /// spec §4.5 step 6).
    pub fn mark_running_step_status(&mut self, idx: usize, status: StepStatus) {
        let step = &mut self.steps[idx];
        step.status = status;
        step.ended_at = Some(Utc::now());
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn into_steps(self) -> Vec<Step> {
        self.steps
    }

    pub fn execution_count(&self) -> u64 {
        self.execution_count
    }

    /// Keys in `after` that are new or differ from `before` by deep
    /// equality. Deletions are not tracked (spec §4.3).
    pub fn calculate_delta(before: &Map<String, Value>, after: &Map<String, Value>) -> Map<String, Value> {
        calculate_delta(before, after)
    }

    /// Merge a handler's reported deltas into the live context. `state`
    /// merges are additive (last write wins per key); each cache delta
    /// entry is applied individually so ordering in `OrderedCache` reflects
    /// first-insert-wins-position / last-write-wins-value.
    pub fn apply_deltas(ctx: &mut WorkflowContext, result: &BlockResult) {
        for (k, v) in result.state_delta.iter() {
            // Value::Null is the deletion tombstone the code sandbox's
            // `diff_state` uses for a key removed from `state` (e.g. a JS
            // `delete state.foo;`), mirroring the cache loop below.
            if v.is_null() {
                ctx.state.remove(k);
            } else {
                ctx.state.insert(k.clone(), v.clone());
            }
        }
        for (k, v) in result.cache_delta.iter() {
            // Value::Null is the deletion tombstone a handler (the code
            // sandbox's `cache.delete`) uses to remove a key rather than
            // set it to null.
            if v.is_null() {
                ctx.cache.delete(k);
            } else {
                ctx.cache.set(k.clone(), v.clone());
            }
        }
        for artifact in &result.artifacts_delta {
            ctx.artifacts.push(artifact.clone());
        }
        for (k, v) in result.event_delta.iter() {
            ctx.event.insert(k.clone(), v.clone());
        }
    }
}
