//! Event Broadcaster (spec §4.11): fans out run lifecycle/step events to
//! per-run (`run:<id>`) and per-organization (`org:<id>`) subscriber
//! channels. Delivery is best-effort; a slow subscriber's bounded buffer
//! fills and the subscriber is dropped rather than blocking the
//! orchestrator, mirroring the teacher's `EventSidecar` (`mpsc`-based,
//! `src/events.rs`) generalized to multiple topics and many subscribers per
//! topic via `dashmap::DashMap`.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::model::{BlockId, RunId, StepId, StepStatus};

/// Event-specific payload, tagged so the wire form is `{"type": "...", ...}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    RunStarted {
        run_id: RunId,
        workflow_id: String,
        version: u32,
        trigger_type: String,
        started_at: DateTime<Utc>,
        resumed: bool,
    },
    RunStep {
        run_id: RunId,
        step_id: StepId,
        block_id: BlockId,
        status: StepStatus,
        step_index: u64,
        block_type: String,
        block_name: String,
        output_keys: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    RunCompleted {
        run_id: RunId,
        duration_ms: u64,
        total_steps: usize,
        total_duration_ms: u64,
        artifact_count: usize,
    },
    RunFailed {
        run_id: RunId,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        failed_at_step: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        block_id: Option<BlockId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        block_type: Option<String>,
    },
    RunAwaitingAction {
        run_id: RunId,
        block_id: BlockId,
        block_type: String,
        step_index: usize,
        ui_config: Map<String, Value>,
    },
}

impl EngineEvent {
    pub fn run_id(&self) -> RunId {
        match self {
            EngineEvent::RunStarted { run_id, .. }
            | EngineEvent::RunStep { run_id, .. }
            | EngineEvent::RunCompleted { run_id, .. }
            | EngineEvent::RunFailed { run_id, .. }
            | EngineEvent::RunAwaitingAction { run_id, .. } => *run_id,
        }
    }
}

/// The wire envelope: `{type, runId, timestamp, ...}` (spec §4.11/§6), via
/// `#[serde(flatten)]` over the tagged `EngineEvent`.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: EngineEvent,
}

impl EventEnvelope {
    pub fn new(event: EngineEvent) -> Self {
        Self { timestamp: Utc::now(), event }
    }
}

/// Fan-out broadcaster. Two topic families share one subscriber table,
/// keyed by the topic string (`run:<id>` / `org:<id>`).
#[derive(Clone)]
pub struct EventBroadcaster {
    channels: std::sync::Arc<DashMap<String, Vec<mpsc::Sender<EventEnvelope>>>>,
    buffer_size: usize,
}

impl EventBroadcaster {
    pub fn new(buffer_size: usize) -> Self {
        Self { channels: std::sync::Arc::new(DashMap::new()), buffer_size: buffer_size.max(1) }
    }

    pub fn subscribe_run(&self, run_id: RunId) -> mpsc::Receiver<EventEnvelope> {
        self.subscribe(format!("run:{run_id}"))
    }

    pub fn subscribe_org(&self, org_id: impl std::fmt::Display) -> mpsc::Receiver<EventEnvelope> {
        self.subscribe(format!("org:{org_id}"))
    }

    fn subscribe(&self, topic: String) -> mpsc::Receiver<EventEnvelope> {
        let (tx, rx) = mpsc::channel(self.buffer_size);
        self.channels.entry(topic).or_default().push(tx);
        rx
    }

    /// Publish to a run's channel and, when `org_id` is given, to the
    /// organization firehose too. Delivery order within `run:<id>` is
    /// preserved because each send goes through the same per-subscriber
    /// `mpsc::Sender` in call order.
    pub fn publish_run(&self, run_id: RunId, org_id: Option<impl std::fmt::Display>, event: EngineEvent) {
        let envelope = EventEnvelope::new(event);
        self.deliver(&format!("run:{run_id}"), &envelope);
        if let Some(org_id) = org_id {
            self.deliver(&format!("org:{org_id}"), &envelope);
        }
    }

    /// Best-effort delivery: a full buffer means the subscriber is too slow
    /// and is dropped (its sender removed) rather than blocking the caller.
    fn deliver(&self, topic: &str, envelope: &EventEnvelope) {
        let Some(mut subscribers) = self.channels.get_mut(topic) else { return };
        subscribers.retain(|tx| match tx.try_send(envelope.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => false,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.channels.get(topic).map(|v| v.len()).unwrap_or(0)
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}
