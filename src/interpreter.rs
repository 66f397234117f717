//! Interpreter: the sequential block processor (spec §4.5) plus deferred
//! iteration (§4.6).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tracing::instrument;

use crate::condition::evaluate_all;
use crate::context::{calculate_delta, LoopState, WorkflowContext};
use crate::error::{StepError, WorkflowError, WorkflowResult};
use crate::handlers::{is_ui_block, GOTO_BLOCK_TYPE};
use crate::model::{Block, BlockId, OnError, RunId, Step, StepStatus};
use crate::registry::BlockRegistry;
use crate::run_builder::RunBuilder;

#[derive(Debug, Clone)]
pub struct InterpreterConfig {
    pub max_steps: u64,
    pub max_duration_ms: u64,
    /// Bounds how many deferred iterations may run concurrently through one
    /// `Interpreter` instance — see DESIGN.md for how this realizes the
    /// `deferConcurrency` open question, since a single `goto_defer` site
    /// only ever produces one iteration at a time by itself.
    pub defer_concurrency: usize,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self { max_steps: 10_000, max_duration_ms: 300_000, defer_concurrency: 3 }
    }
}

#[derive(Debug)]
pub enum RunOutcome {
    Completed,
    AwaitingAction { block_id: BlockId, block_type: String, step_index: usize, ui_config: Map<String, serde_json::Value> },
    Failed(WorkflowError),
    Cancelled,
}

pub struct RunResult {
    pub outcome: RunOutcome,
    pub steps: Vec<Step>,
    pub final_context: WorkflowContext,
}

pub struct Interpreter {
    registry: BlockRegistry,
    config: InterpreterConfig,
    defer_semaphore: Arc<Semaphore>,
}

impl Interpreter {
    pub fn new(registry: BlockRegistry, config: InterpreterConfig) -> Self {
        let defer_semaphore = Arc::new(Semaphore::new(config.defer_concurrency.max(1)));
        Self { registry, config, defer_semaphore }
    }

    /// Drive the main loop starting at `start_index` (0 for a fresh run,
    /// `paused_index + 1` on resume).
    #[instrument(skip_all, fields(run_id = %run_id, start_index))]
    pub async fn run(
        &self,
        run_id: RunId,
        blocks: &[Block],
        mut ctx: WorkflowContext,
        mut builder: RunBuilder,
        start_index: usize,
        cancelled: &AtomicBool,
    ) -> WorkflowResult<RunResult> {
        let by_name = index_by_name(blocks);
        let start_time = Instant::now();
        let mut index = start_index;

        loop {
            if index >= blocks.len() {
                return Ok(RunResult { outcome: RunOutcome::Completed, steps: builder.into_steps(), final_context: ctx });
            }

            if let Some(outcome) = self.check_budgets(&builder, &start_time, cancelled) {
                return Ok(RunResult { outcome, steps: builder.into_steps(), final_context: ctx });
            }

            let block = &blocks[index];
            set_run_meta(&mut ctx, index, block);

            if !evaluate_all(&block.conditions, &ctx)? {
                let step_idx = builder.create_step(run_id, block);
                builder.skip_step(step_idx);
                index += 1;
                continue;
            }

            if is_ui_block(&block.block_type) {
                let ui_config = block.logic.iter().map(|(k, v)| (k.clone(), v.clone())).collect::<Map<_, _>>();
                let step_idx = builder.create_step(run_id, block);
                builder.mark_running_step_status(step_idx, StepStatus::Completed);
                return Ok(RunResult {
                    outcome: RunOutcome::AwaitingAction {
                        block_id: block.id,
                        block_type: block.block_type.clone(),
                        step_index: index,
                        ui_config,
                    },
                    steps: builder.into_steps(),
                    final_context: ctx,
                });
            }

            if block.block_type == GOTO_BLOCK_TYPE {
                let (target_index, defer) = resolve_goto(block, &by_name)?;
                if defer {
                    match self.run_deferred_iteration(run_id, blocks, &ctx, &mut builder, target_index, &start_time, cancelled).await {
                        Ok(merged) => ctx.merge_state_from(&merged),
                        Err(e) => return Ok(RunResult { outcome: RunOutcome::Failed(e), steps: builder.into_steps(), final_context: ctx }),
                    }
                    index += 1;
                } else {
                    index = target_index;
                }
                continue;
            }

            match self.dispatch(run_id, block, &mut ctx, &mut builder, false, None).await {
                Ok(()) => {}
                Err(e) => return Ok(RunResult { outcome: RunOutcome::Failed(e), steps: builder.into_steps(), final_context: ctx }),
            }
            index += 1;
        }
    }

    fn check_budgets(&self, builder: &RunBuilder, start_time: &Instant, cancelled: &AtomicBool) -> Option<RunOutcome> {
        if cancelled.load(Ordering::SeqCst) {
            return Some(RunOutcome::Cancelled);
        }
        if builder.execution_count() >= self.config.max_steps {
            return Some(RunOutcome::Failed(WorkflowError::Resource(format!(
                "Step limit reached ({}). Possible infinite loop.",
                self.config.max_steps
            ))));
        }
        if start_time.elapsed().as_millis() as u64 > self.config.max_duration_ms {
            return Some(RunOutcome::Failed(WorkflowError::Resource(format!(
                "Duration limit reached ({}ms). Possible infinite loop.",
                self.config.max_duration_ms
            ))));
        }
        None
    }

    /// Invoke the handler for a single non-UI, non-goto block: snapshot
    /// state, run it, apply deltas, record the step. `Err` means abort (the
    /// caller decides whether that propagates as a run failure).
    async fn dispatch(
        &self,
        run_id: RunId,
        block: &Block,
        ctx: &mut WorkflowContext,
        builder: &mut RunBuilder,
        deferred: bool,
        iteration_id: Option<&str>,
    ) -> WorkflowResult<()> {
        let handler = self
            .registry
            .get(&block.block_type)
            .ok_or_else(|| WorkflowError::Configuration(format!("no handler registered for block type: {}", block.block_type)))?;

        let state_before = ctx.state.clone();
        let step_idx = match iteration_id {
            Some(id) if deferred => builder.create_deferred_step(run_id, block, id),
            _ => builder.create_step(run_id, block),
        };

        match handler.execute(block, ctx).await {
            Ok(mut result) => {
                RunBuilder::apply_deltas(ctx, &result);
                let actual_delta = calculate_delta(&state_before, &ctx.state);
                if !actual_delta.is_empty() {
                    result.state_delta = actual_delta;
                }
                builder.complete_step(step_idx, &result);
                ctx.last_error = Map::new();
                Ok(())
            }
            Err(e) => {
                let step_error = StepError::new(e.to_string(), block.id.to_string(), block.name.clone());
                builder.fail_step(step_idx, step_error.clone());
                ctx.last_error = serde_json::to_value(&step_error).ok().and_then(|v| v.as_object().cloned()).unwrap_or_default();
                if block.on_error() == OnError::Abort {
                    Err(e)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// One isolated pass (spec §4.6) over `blocks` starting at
    /// `target_index`, against a forked context. Bounded by
    /// `defer_semaphore`; the caller merges `state` back on success.
    #[allow(clippy::too_many_arguments)]
    async fn run_deferred_iteration(
        &self,
        run_id: RunId,
        blocks: &[Block],
        parent_ctx: &WorkflowContext,
        builder: &mut RunBuilder,
        target_index: usize,
        start_time: &Instant,
        cancelled: &AtomicBool,
    ) -> WorkflowResult<WorkflowContext> {
        let _permit = self
            .defer_semaphore
            .acquire()
            .await
            .map_err(|_| WorkflowError::Internal("defer concurrency semaphore closed".to_string()))?;

        let by_name = index_by_name(blocks);
        let iteration_id = uuid::Uuid::new_v4().to_string();
        let mut iter_ctx = parent_ctx.fork_for_defer();
        iter_ctx.active_loop = Some(iteration_id.clone());
        iter_ctx.loops.insert(iteration_id.clone(), LoopState { index: 0, artifact: Value::Null });
        let mut index = target_index;

        while index < blocks.len() {
            if let Some(outcome) = self.check_budgets(builder, start_time, cancelled) {
                return match outcome {
                    RunOutcome::Cancelled => Err(WorkflowError::Cancelled),
                    RunOutcome::Failed(e) => Err(e),
                    _ => unreachable!("check_budgets only ever returns Cancelled or Failed"),
                };
            }

            let block = &blocks[index];

            // UI blocks inside a deferred pass are skipped entirely: no
            // pause, no step (spec §4.6).
            if is_ui_block(&block.block_type) {
                index += 1;
                touch_loop_state(&mut iter_ctx, &iteration_id, index);
                continue;
            }

            set_run_meta(&mut iter_ctx, index, block);

            if !evaluate_all(&block.conditions, &iter_ctx)? {
                let step_idx = builder.create_deferred_step(run_id, block, &iteration_id);
                builder.skip_step(step_idx);
                index += 1;
                touch_loop_state(&mut iter_ctx, &iteration_id, index);
                continue;
            }

            if block.block_type == GOTO_BLOCK_TYPE {
                let (nested_target, defer) = resolve_goto(block, &by_name)?;
                if defer {
                    let nested = Box::pin(self.run_deferred_iteration(
                        run_id,
                        blocks,
                        &iter_ctx,
                        builder,
                        nested_target,
                        start_time,
                        cancelled,
                    ))
                    .await?;
                    iter_ctx.merge_state_from(&nested);
                    index += 1;
                } else {
                    index = nested_target;
                }
                touch_loop_state(&mut iter_ctx, &iteration_id, index);
                continue;
            }

            self.dispatch(run_id, block, &mut iter_ctx, builder, true, Some(iteration_id.as_str())).await?;
            index += 1;
            touch_loop_state(&mut iter_ctx, &iteration_id, index);
        }

        Ok(iter_ctx)
    }
}

fn index_by_name(blocks: &[Block]) -> HashMap<&str, usize> {
    blocks.iter().enumerate().map(|(i, b)| (b.name.as_str(), i)).collect()
}

/// Advances `$loop.<iteration_id>`'s `index`/`artifact` as a deferred pass
/// moves through the block list: `index` tracks the pass's current block
/// position, `artifact` mirrors the most recently pushed artifact (or
/// `null` if none has been produced yet), exposed to blocks inside the
/// iteration as `$row`/`$item`/`$index`.
fn touch_loop_state(ctx: &mut WorkflowContext, iteration_id: &str, position: usize) {
    let artifact = ctx.artifacts.last().cloned().unwrap_or(Value::Null);
    if let Some(state) = ctx.loops.get_mut(iteration_id) {
        state.index = position as u64;
        state.artifact = artifact;
    }
}

fn set_run_meta(ctx: &mut WorkflowContext, index: usize, block: &Block) {
    ctx.run.step_index = index;
    ctx.run.block_id = block.id.to_string();
    ctx.run.block_name = block.name.clone();
    ctx.run.block_type = block.block_type.clone();
}

/// Resolve `goto_target`/`goto_defer`; target-not-found or missing target is
/// fatal (spec §4.5).
fn resolve_goto(block: &Block, by_name: &HashMap<&str, usize>) -> WorkflowResult<(usize, bool)> {
    let target_name = block.logic_str("goto_target").ok_or_else(|| WorkflowError::Validation("goto_target is required".to_string()))?;
    let defer = block.logic.get("goto_defer").and_then(|v| v.as_bool()).unwrap_or(false);
    let target_index = *by_name.get(target_name).ok_or_else(|| WorkflowError::Validation(format!("goto target not found: {target_name}")))?;
    Ok((target_index, defer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunMeta;
    use crate::model::{Condition, ConditionOperator};
    use crate::registry::{BlockHandler, BlockResult};
    use async_trait::async_trait;
    use serde_json::json;

    struct IncrementHandler;

    #[async_trait]
    impl BlockHandler for IncrementHandler {
        async fn execute(&self, _block: &Block, ctx: &mut WorkflowContext) -> WorkflowResult<BlockResult> {
            let current = ctx.state.get("count").and_then(|v| v.as_i64()).unwrap_or(0);
            Ok(BlockResult::default().with_state("count", json!(current + 1)))
        }
    }

    fn block(name: &str, block_type: &str, order: u32, logic: serde_json::Map<String, serde_json::Value>) -> Block {
        Block { id: BlockId::new(), name: name.to_string(), block_type: block_type.to_string(), logic: logic.into_iter().collect(), conditions: vec![], order }
    }

    fn registry() -> BlockRegistry {
        let mut r = BlockRegistry::new();
        r.register("increment", std::sync::Arc::new(IncrementHandler));
        r
    }

    #[tokio::test]
    async fn runs_blocks_in_order_and_completes() {
        let blocks = vec![block("a", "increment", 0, Default::default()), block("b", "increment", 1, Default::default())];
        let interpreter = Interpreter::new(registry(), InterpreterConfig::default());
        let ctx = WorkflowContext::new(RunMeta::default(), Default::default(), Default::default(), Default::default());
        let cancelled = AtomicBool::new(false);
        let result = interpreter.run(RunId::new(), &blocks, ctx, RunBuilder::new(), 0, &cancelled).await.unwrap();
        assert!(matches!(result.outcome, RunOutcome::Completed));
        assert_eq!(result.final_context.state.get("count"), Some(&json!(2)));
        assert_eq!(result.steps.len(), 2);
    }

    #[tokio::test]
    async fn skip_on_false_guard_condition() {
        let mut logic = serde_json::Map::new();
        logic.insert("x".to_string(), json!(1));
        let mut guarded = block("a", "increment", 0, logic);
        guarded.conditions = vec![Condition { left: json!(1), operator: ConditionOperator::Eq, right: json!(2) }];
        let blocks = vec![guarded];
        let interpreter = Interpreter::new(registry(), InterpreterConfig::default());
        let ctx = WorkflowContext::new(RunMeta::default(), Default::default(), Default::default(), Default::default());
        let cancelled = AtomicBool::new(false);
        let result = interpreter.run(RunId::new(), &blocks, ctx, RunBuilder::new(), 0, &cancelled).await.unwrap();
        assert!(matches!(result.outcome, RunOutcome::Completed));
        assert_eq!(result.steps[0].status, StepStatus::Skipped);
        assert!(result.final_context.state.get("count").is_none());
    }

    #[tokio::test]
    async fn ui_block_pauses_with_awaiting_action() {
        let blocks = vec![block("form", "ui_form", 0, Default::default())];
        let interpreter = Interpreter::new(registry(), InterpreterConfig::default());
        let ctx = WorkflowContext::new(RunMeta::default(), Default::default(), Default::default(), Default::default());
        let cancelled = AtomicBool::new(false);
        let result = interpreter.run(RunId::new(), &blocks, ctx, RunBuilder::new(), 0, &cancelled).await.unwrap();
        assert!(matches!(result.outcome, RunOutcome::AwaitingAction { step_index: 0, .. }));
    }

    #[tokio::test]
    async fn goto_immediate_loops_until_condition_flips() {
        let mut goto_logic = serde_json::Map::new();
        goto_logic.insert("goto_target".to_string(), json!("start"));
        let mut looping_goto = block("loop", "goto", 1, goto_logic);
        looping_goto.conditions = vec![Condition { left: "$state.count".to_string().into(), operator: ConditionOperator::Lt, right: json!(3) }];
        let blocks = vec![block("start", "increment", 0, Default::default()), looping_goto];
        let interpreter = Interpreter::new(registry(), InterpreterConfig::default());
        let ctx = WorkflowContext::new(RunMeta::default(), Default::default(), Default::default(), Default::default());
        let cancelled = AtomicBool::new(false);
        let result = interpreter.run(RunId::new(), &blocks, ctx, RunBuilder::new(), 0, &cancelled).await.unwrap();
        assert!(matches!(result.outcome, RunOutcome::Completed));
        assert_eq!(result.final_context.state.get("count"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn step_budget_failure() {
        let mut goto_logic = serde_json::Map::new();
        goto_logic.insert("goto_target".to_string(), json!("start"));
        let blocks = vec![block("start", "increment", 0, Default::default()), block("loop", "goto", 1, goto_logic)];
        let interpreter = Interpreter::new(registry(), InterpreterConfig { max_steps: 5, ..Default::default() });
        let ctx = WorkflowContext::new(RunMeta::default(), Default::default(), Default::default(), Default::default());
        let cancelled = AtomicBool::new(false);
        let result = interpreter.run(RunId::new(), &blocks, ctx, RunBuilder::new(), 0, &cancelled).await.unwrap();
        assert!(matches!(result.outcome, RunOutcome::Failed(WorkflowError::Resource(_))));
    }

    #[tokio::test]
    async fn deferred_goto_runs_one_isolated_pass_then_continues_main_loop() {
        let mut goto_logic = serde_json::Map::new();
        goto_logic.insert("goto_target".to_string(), json!("body"));
        goto_logic.insert("goto_defer".to_string(), json!(true));
        let blocks = vec![
            block("caller", "goto", 0, goto_logic),
            block("body", "increment", 1, Default::default()),
            block("after", "increment", 2, Default::default()),
        ];
        let interpreter = Interpreter::new(registry(), InterpreterConfig::default());
        let ctx = WorkflowContext::new(RunMeta::default(), Default::default(), Default::default(), Default::default());
        let cancelled = AtomicBool::new(false);
        let result = interpreter.run(RunId::new(), &blocks, ctx, RunBuilder::new(), 0, &cancelled).await.unwrap();
        assert!(matches!(result.outcome, RunOutcome::Completed));
        // deferred pass (forked context) runs body+after once and merges count=2
        // back into the parent; the main loop then advances to "body" and runs
        // body+after again for real, reaching count=4.
        assert_eq!(result.final_context.state.get("count"), Some(&json!(4)));
        assert!(result.steps.iter().any(|s| s.deferred_iteration_id.is_some()));
    }
}
