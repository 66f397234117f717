//! Run Orchestration Service (spec §4.10): bridges persistence with the
//! Interpreter, broadcasts lifecycle events, serializes paused state for
//! durable resumption, and exposes cooperative cancellation.
//!
//! Structurally grounded on the teacher's `WorkflowEngine`
//! (`src/executor/engine.rs`): a `Clone` facade over `Arc`-wrapped shared
//! state, with a lock-free `DashMap` for the one piece of genuinely
//! process-wide mutable state (there, active `Case`s; here, per-run
//! cancellation flags).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{Map, Value};
use tracing::instrument;

use crate::broadcaster::{EngineEvent, EventBroadcaster};
use crate::context::{ContextSnapshot, KeyResolver, PausedRunState, RunMeta, WorkflowContext};
use crate::error::{WorkflowError, WorkflowResult};
use crate::interpreter::{Interpreter, RunOutcome};
use crate::model::{OrgId, Run, RunId, RunStatus, Step, TriggerType, VersionNumber, WorkflowId};
use crate::run_builder::RunBuilder;
use crate::storage::StateStore;

/// `{workflowId, version, triggerType, eventData, orgId, runId}` (spec §6).
/// `run_id` lets a caller supply an idempotency key; a fresh one is
/// generated if absent.
#[derive(Debug, Clone)]
pub struct TriggerRequest {
    pub workflow_id: WorkflowId,
    pub version: VersionNumber,
    pub trigger_type: TriggerType,
    pub event_data: Map<String, Value>,
    pub org_id: OrgId,
    pub run_id: Option<RunId>,
    pub device_id: Option<String>,
}

/// `{actionType, payload}` (spec §6), merged into the resumed `state`.
#[derive(Debug, Clone)]
pub struct ActionSubmission {
    pub action_type: String,
    pub payload: Value,
}

/// `(run id, org id, device id, version metadata, blocks, event payload, key
/// resolver)` per spec §4.10 — assembled once per execution/resume and
/// handed to the Interpreter.
pub struct RunConfig {
    pub run: Run,
    pub blocks: Vec<crate::model::Block>,
    pub event: Map<String, Value>,
    pub key_resolver: Option<KeyResolver>,
}

/// Run Orchestration Service.
#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<StateStore>,
    interpreter: Arc<Interpreter>,
    broadcaster: EventBroadcaster,
    cancellations: Arc<DashMap<RunId, Arc<AtomicBool>>>,
    /// `$secrets`/`$paths` are org-scoped and read-only to a run; the
    /// embedding application supplies them per org via this table rather
    /// than the engine inventing a secrets store (out of scope, spec §1).
    secrets_by_org: Arc<DashMap<OrgId, Map<String, Value>>>,
    paths_by_org: Arc<DashMap<OrgId, Map<String, Value>>>,
}

impl Orchestrator {
    pub fn new(store: Arc<StateStore>, interpreter: Arc<Interpreter>, broadcaster: EventBroadcaster) -> Self {
        Self {
            store,
            interpreter,
            broadcaster,
            cancellations: Arc::new(DashMap::new()),
            secrets_by_org: Arc::new(DashMap::new()),
            paths_by_org: Arc::new(DashMap::new()),
        }
    }

    pub fn broadcaster(&self) -> &EventBroadcaster {
        &self.broadcaster
    }

    pub fn set_org_secrets(&self, org_id: OrgId, secrets: Map<String, Value>) {
        self.secrets_by_org.insert(org_id, secrets);
    }

    pub fn set_org_paths(&self, org_id: OrgId, paths: Map<String, Value>) {
        self.paths_by_org.insert(org_id, paths);
    }

    /// Default `$keys.<name>` resolver: the reference implementation's
    /// placeholder echo (spec §9 Open Question), preserved here and
    /// documented in DESIGN.md. An embedder that wants real secret lookup
    /// passes its own resolver into `RunConfig` by constructing one instead
    /// of relying on this default.
    fn default_key_resolver() -> KeyResolver {
        Arc::new(|name: &str| Some(format!("$keys.{name}")))
    }

    /// Persist a new `Run` in `pending` and spawn background execution.
    /// Returns immediately with the run id, mirroring an HTTP trigger
    /// endpoint that replies before the run completes.
    #[instrument(skip_all, fields(workflow_id = %req.workflow_id, version = req.version))]
    pub async fn trigger(&self, req: TriggerRequest) -> WorkflowResult<RunId> {
        let version = self
            .store
            .load_version(req.workflow_id, req.version)?
            .ok_or_else(|| WorkflowError::NotFound(format!("workflow version {}@{}", req.workflow_id, req.version)))?;

        let mut run = Run::new(req.workflow_id, req.version, req.org_id, req.trigger_type);
        if let Some(id) = req.run_id {
            run.id = id;
        }
        self.store.save_run(&run)?;

        let run_id = run.id;
        self.cancellations.insert(run_id, Arc::new(AtomicBool::new(false)));

        let this = self.clone();
        let blocks = version.sorted_blocks();
        let event = req.event_data;
        let device_id = req.device_id;
        tokio::spawn(async move {
            let config = RunConfig { run, blocks, event, key_resolver: Some(Self::default_key_resolver()) };
            if let Err(e) = this.execute(config, device_id).await {
                tracing::error!(run_id = %run_id, error = %e, "run execution failed before producing a terminal outcome");
            }
        });

        Ok(run_id)
    }

    /// Drive a fresh run from block index 0.
    #[instrument(skip_all, fields(run_id = %config.run.id))]
    async fn execute(&self, mut config: RunConfig, device_id: Option<String>) -> WorkflowResult<()> {
        let run_id = config.run.id;
        config.run.status = RunStatus::Running;
        config.run.started_at = Some(chrono::Utc::now());
        self.store.save_run(&config.run)?;

        self.broadcaster.publish_run(
            run_id,
            Some(config.run.org_id),
            EngineEvent::RunStarted {
                run_id,
                workflow_id: config.run.workflow_id.to_string(),
                version: config.run.version,
                trigger_type: format!("{:?}", config.run.trigger_type).to_lowercase(),
                started_at: config.run.started_at.unwrap(),
                resumed: false,
            },
        );

        let secrets = self.secrets_by_org.get(&config.run.org_id).map(|m| m.clone()).unwrap_or_default();
        let paths = self.paths_by_org.get(&config.run.org_id).map(|m| m.clone()).unwrap_or_default();
        let run_meta = RunMeta {
            run_id: run_id.to_string(),
            workflow_id: config.run.workflow_id.to_string(),
            version: config.run.version,
            step_index: 0,
            block_id: String::new(),
            block_name: String::new(),
            block_type: String::new(),
        };
        let mut ctx = WorkflowContext::new(run_meta, config.event.clone(), secrets, paths);
        ctx.key_resolver = config.key_resolver.clone();
        if let Some(device_id) = device_id {
            ctx.event.insert("__deviceId".to_string(), Value::String(device_id));
        }

        let cancelled = self.cancellation_flag(run_id);
        let result = self.interpreter.run(run_id, &config.blocks, ctx, RunBuilder::new(), 0, cancelled.as_ref()).await?;

        self.finalize(config.run, result.outcome, result.steps, &result.final_context).await
    }

    /// Reject unless `status == awaiting_action`; rehydrate context, merge
    /// the action payload into `state`, and re-enter the interpreter at
    /// `paused_index + 1` (spec §4.10).
    #[instrument(skip_all, fields(run_id = %run_id))]
    pub async fn resume(&self, run_id: RunId, action: ActionSubmission) -> WorkflowResult<()> {
        let mut run = self.store.load_run(run_id)?.ok_or_else(|| WorkflowError::NotFound(format!("run {run_id}")))?;
        if run.status != RunStatus::AwaitingAction {
            return Err(WorkflowError::InvalidStateTransition { from: format!("{:?}", run.status), to: "running".to_string() });
        }

        let paused = self
            .store
            .load_paused_state(run_id)?
            .ok_or_else(|| WorkflowError::Internal(format!("run {run_id} is awaiting_action but has no paused state")))?;

        let version = self
            .store
            .load_version(run.workflow_id, run.version)?
            .ok_or_else(|| WorkflowError::NotFound(format!("workflow version {}@{}", run.workflow_id, run.version)))?;
        let blocks = version.sorted_blocks();

        let secrets = self.secrets_by_org.get(&run.org_id).map(|m| m.clone()).unwrap_or_default();
        let paths = self.paths_by_org.get(&run.org_id).map(|m| m.clone()).unwrap_or_default();
        let run_meta = RunMeta {
            run_id: run_id.to_string(),
            workflow_id: run.workflow_id.to_string(),
            version: run.version,
            step_index: paused.current_block_index,
            block_id: paused.paused_block_id.to_string(),
            block_name: String::new(),
            block_type: String::new(),
        };
        let mut ctx = paused.context_snapshot.into_context(run_meta, secrets, paths, Some(Self::default_key_resolver()));
        merge_action_into_state(&mut ctx.state, &action);

        run.status = RunStatus::Running;
        self.store.save_run(&run)?;
        self.store.clear_paused_state(run_id)?;
        self.cancellations.entry(run_id).or_insert_with(|| Arc::new(AtomicBool::new(false))).store(false, Ordering::SeqCst);

        self.broadcaster.publish_run(
            run_id,
            Some(run.org_id),
            EngineEvent::RunStarted {
                run_id,
                workflow_id: run.workflow_id.to_string(),
                version: run.version,
                trigger_type: format!("{:?}", run.trigger_type).to_lowercase(),
                started_at: chrono::Utc::now(),
                resumed: true,
            },
        );

        let existing_steps = self.store.load_steps(run_id)?;
        let builder = RunBuilder::resume_from(existing_steps);
        let start_index = paused.current_block_index + 1;

        let cancelled = self.cancellation_flag(run_id);
        let result = self.interpreter.run(run_id, &blocks, ctx, builder, start_index, cancelled.as_ref()).await?;

        self.finalize(run, result.outcome, result.steps, &result.final_context).await
    }

    /// Cooperative: flips the per-run flag, checked by the Interpreter
    /// between blocks; never pre-empts an in-flight handler.
    pub fn cancel(&self, run_id: RunId) {
        if let Some(flag) = self.cancellations.get(&run_id) {
            flag.store(true, Ordering::SeqCst);
        }
    }

    fn cancellation_flag(&self, run_id: RunId) -> Arc<AtomicBool> {
        self.cancellations.entry(run_id).or_insert_with(|| Arc::new(AtomicBool::new(false))).clone()
    }

    /// Translate a `RunOutcome` into persisted state and broadcasts: batch
    /// `run_step` events for the segment just executed, then the one
    /// terminal or pausing event.
    async fn finalize(&self, mut run: Run, outcome: RunOutcome, steps: Vec<Step>, final_ctx: &WorkflowContext) -> WorkflowResult<()> {
        let run_id = run.id;
        self.store.save_steps(run_id, &steps)?;
        self.emit_step_events(&run, &steps);

        match outcome {
            RunOutcome::Completed => {
                run.status = RunStatus::Completed;
                run.completed_at = Some(chrono::Utc::now());
                run.duration_ms = duration_ms(&run);
                self.store.save_run(&run)?;
                self.store.clear_paused_state(run_id)?;
                self.cancellations.remove(&run_id);
                self.broadcaster.publish_run(
                    run_id,
                    Some(run.org_id),
                    EngineEvent::RunCompleted {
                        run_id,
                        duration_ms: run.duration_ms.unwrap_or(0),
                        total_steps: steps.len(),
                        total_duration_ms: run.duration_ms.unwrap_or(0),
                        artifact_count: final_ctx.artifacts.len(),
                    },
                );
            }
            RunOutcome::AwaitingAction { block_id, block_type, step_index, ui_config } => {
                run.status = RunStatus::AwaitingAction;
                self.store.save_run(&run)?;
                let paused = PausedRunState {
                    current_block_index: step_index,
                    context_snapshot: ContextSnapshot::from(final_ctx),
                    paused_block_id: block_id,
                    paused_ui_config: ui_config.clone(),
                };
                self.store.save_paused_state(run_id, &paused)?;
                self.broadcaster.publish_run(
                    run_id,
                    Some(run.org_id),
                    EngineEvent::RunAwaitingAction { run_id, block_id, block_type, step_index, ui_config },
                );
            }
            RunOutcome::Failed(err) => {
                run.status = RunStatus::Failed;
                run.completed_at = Some(chrono::Utc::now());
                run.duration_ms = duration_ms(&run);
                run.error = Some(err.to_string());
                self.store.save_run(&run)?;
                self.store.clear_paused_state(run_id)?;
                self.cancellations.remove(&run_id);
                let (failed_at_step, block_id, block_type) = last_failed_step_info(&steps);
                self.broadcaster.publish_run(
                    run_id,
                    Some(run.org_id),
                    EngineEvent::RunFailed { run_id, message: err.to_string(), failed_at_step, block_id, block_type },
                );
            }
            RunOutcome::Cancelled => {
                run.status = RunStatus::Cancelled;
                run.completed_at = Some(chrono::Utc::now());
                run.duration_ms = duration_ms(&run);
                run.error = Some("cancelled".to_string());
                self.store.save_run(&run)?;
                self.store.clear_paused_state(run_id)?;
                self.cancellations.remove(&run_id);
                self.broadcaster.publish_run(
                    run_id,
                    Some(run.org_id),
                    EngineEvent::RunFailed { run_id, message: "cancelled".to_string(), failed_at_step: None, block_id: None, block_type: None },
                );
            }
        }

        Ok(())
    }

    fn emit_step_events(&self, run: &Run, steps: &[Step]) {
        for step in steps {
            let output_keys = match &step.state_delta {
                Value::Object(map) => map.keys().cloned().collect(),
                _ => Vec::new(),
            };
            self.broadcaster.publish_run(
                run.id,
                Some(run.org_id),
                EngineEvent::RunStep {
                    run_id: run.id,
                    step_id: step.id,
                    block_id: step.block_id,
                    status: step.status,
                    step_index: step.execution_order,
                    block_type: step.block_type.clone(),
                    block_name: step.block_name.clone(),
                    output_keys,
                    error: step.error.as_ref().map(|e| e.message.clone()),
                },
            );
        }
    }
}

fn duration_ms(run: &Run) -> Option<u64> {
    match (run.started_at, run.completed_at) {
        (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
        _ => None,
    }
}

fn last_failed_step_info(steps: &[Step]) -> (Option<u64>, Option<crate::model::BlockId>, Option<String>) {
    steps
        .iter()
        .rev()
        .find(|s| s.status == crate::model::StepStatus::Failed)
        .map(|s| (Some(s.execution_order), Some(s.block_id), Some(s.block_type.clone())))
        .unwrap_or((None, None, None))
}

fn merge_action_into_state(state: &mut Map<String, Value>, action: &ActionSubmission) {
    match &action.payload {
        Value::Object(map) => {
            for (k, v) in map {
                state.insert(k.clone(), v.clone());
            }
        }
        other => {
            state.insert(action.action_type.clone(), other.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers;
    use crate::interpreter::InterpreterConfig;
    use crate::model::{Block, BlockId, VersionStatus, WorkflowVersion};
    use crate::sandbox::Sandbox;
    use serde_json::json;

    fn test_orchestrator() -> Orchestrator {
        let store = Arc::new(StateStore::temporary().unwrap());
        let http = reqwest::Client::new();
        let sandbox = Arc::new(Sandbox::new(http.clone()));
        let registry = handlers::default_registry(sandbox, http);
        let interpreter = Arc::new(Interpreter::new(registry, InterpreterConfig::default()));
        Orchestrator::new(store, interpreter, EventBroadcaster::new(64))
    }

    fn math_block(name: &str, order: u32, bind: &str, op: Value) -> Block {
        let mut logic = HashMap::new();
        logic.insert("math_operation".to_string(), op);
        logic.insert("math_bind_value".to_string(), json!(bind));
        Block { id: BlockId::new(), name: name.to_string(), block_type: "math".to_string(), logic, conditions: vec![], order }
    }

    #[tokio::test]
    async fn trigger_runs_to_completion_and_persists_steps() {
        let orch = test_orchestrator();
        let workflow_id = WorkflowId::new();
        let org_id = OrgId::new();
        let version = WorkflowVersion {
            workflow_id,
            version: 1,
            status: VersionStatus::Published,
            trigger_type: TriggerType::Api,
            trigger_config: Default::default(),
            blocks: vec![math_block("double", 0, "result", json!({"op": "add", "input": 2, "operand": 2}))],
        };
        orch.store.save_version(&version).unwrap();

        let run_id = orch
            .trigger(TriggerRequest {
                workflow_id,
                version: 1,
                trigger_type: TriggerType::Api,
                event_data: Default::default(),
                org_id,
                run_id: None,
                device_id: None,
            })
            .await
            .unwrap();

        // Background execution is spawned; give it a moment to complete.
        for _ in 0..50 {
            if matches!(orch.store.load_run(run_id).unwrap().map(|r| r.status), Some(RunStatus::Completed)) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let run = orch.store.load_run(run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        let steps = orch.store.load_steps(run_id).unwrap();
        assert_eq!(steps.len(), 1);
    }

    #[tokio::test]
    async fn resume_rejects_when_not_awaiting_action() {
        let orch = test_orchestrator();
        let run = Run::new(WorkflowId::new(), 1, OrgId::new(), TriggerType::Api);
        orch.store.save_run(&run).unwrap();
        let err = orch.resume(run.id, ActionSubmission { action_type: "submit".to_string(), payload: json!({}) }).await;
        assert!(matches!(err, Err(WorkflowError::InvalidStateTransition { .. })));
    }
}
