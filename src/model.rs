//! Core data model: Workflow, WorkflowVersion, Block, Condition, Run, Step.
//!
//! Entities mirror spec §3 exactly; newtype identifiers follow the
//! teacher's `CaseId`/`WorkflowSpecId` convention (a `Uuid` wrapper with
//! `Display`/`parse_str`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{WorkflowError, WorkflowResult};

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(#[serde(with = "uuid::serde::compact")] pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn parse_str(s: &str) -> WorkflowResult<Self> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| WorkflowError::Validation(format!("invalid {}: {e}", stringify!($name))))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(WorkflowId);
uuid_id!(RunId);
uuid_id!(StepId);
uuid_id!(BlockId);
uuid_id!(OrgId);

/// Workflow version numbers are monotonic per workflow, not globally unique.
pub type VersionNumber = u32;

/// How a run was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Interactive,
    Api,
    Schedule,
    Hook,
    Vision,
}

/// Publication state of a workflow version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    Draft,
    Published,
}

/// Workflow identity + metadata. Mutated only by the API layer; the engine
/// treats it as read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub org_id: OrgId,
    pub name: String,
    pub active_version: VersionNumber,
    pub created_at: DateTime<Utc>,
}

/// An immutable snapshot of a workflow's blocks and trigger configuration.
/// `(workflow_id, version)` is unique; once published, never edited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowVersion {
    pub workflow_id: WorkflowId,
    pub version: VersionNumber,
    pub status: VersionStatus,
    pub trigger_type: TriggerType,
    pub trigger_config: HashMap<String, serde_json::Value>,
    pub blocks: Vec<Block>,
}

impl WorkflowVersion {
    /// Blocks sorted by `order`, the ordering the Interpreter drives over.
    pub fn sorted_blocks(&self) -> Vec<Block> {
        let mut blocks = self.blocks.clone();
        blocks.sort_by_key(|b| b.order);
        blocks
    }
}

/// Comparison operators available to a `Condition`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConditionOperator {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Contains,
    StartsWith,
    EndsWith,
    In,
    IsEmpty,
    IsFalsy,
    IsNull,
    Regex,
}

/// `{left, operator, right}`; operands may be literals or `$`/`{{}}` expressions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub left: serde_json::Value,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub right: serde_json::Value,
}

/// What a block does when its handler fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    #[default]
    Abort,
    Continue,
}

/// A single executable unit within a workflow version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub name: String,
    /// Type tag (e.g. "fetch", "code", "ui_form"). UI blocks are recognized
    /// lexically by the `ui_` prefix — see `interpreter::is_ui_block`.
    #[serde(rename = "type")]
    pub block_type: String,
    /// Block-type-prefixed keys (`fetch_url`, `code_source`, ...); values
    /// are literals, `$`-expressions, or `{{...}}` templates.
    pub logic: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Non-negative, unique within a version. Blocks are executed in this order.
    pub order: u32,
}

impl Block {
    pub fn on_error(&self) -> OnError {
        match self.logic.get("on_error").and_then(|v| v.as_str()) {
            Some("continue") => OnError::Continue,
            _ => OnError::Abort,
        }
    }

    pub fn logic_str(&self, key: &str) -> Option<&str> {
        self.logic.get(key).and_then(|v| v.as_str())
    }
}

/// Lifecycle status of a `Run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    AwaitingAction,
    Completed,
    Failed,
    Cancelled,
}

/// A single execution of a workflow version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub workflow_id: WorkflowId,
    pub version: VersionNumber,
    pub org_id: OrgId,
    pub status: RunStatus,
    pub trigger_type: TriggerType,
    pub trigger_source: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

impl Run {
    pub fn new(workflow_id: WorkflowId, version: VersionNumber, org_id: OrgId, trigger_type: TriggerType) -> Self {
        Self {
            id: RunId::new(),
            workflow_id,
            version,
            org_id,
            status: RunStatus::Pending,
            trigger_type,
            trigger_source: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
            error: None,
        }
    }
}

/// Execution status of a single `Step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// One block's execution attempt inside a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub run_id: RunId,
    pub block_id: BlockId,
    pub block_name: String,
    pub block_type: String,
    pub block_order: u32,
    /// Monotonic across the run, dense (no gaps) including skips/failures.
    pub execution_order: u64,
    pub status: StepStatus,
    pub logic_snapshot: HashMap<String, serde_json::Value>,
    pub state_delta: serde_json::Value,
    pub cache_delta: serde_json::Value,
    pub artifacts_delta: serde_json::Value,
    pub event_delta: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<crate::error::StepError>,
    /// Set when this step was produced inside a deferred (`goto_defer`) iteration.
    pub deferred_iteration_id: Option<String>,
}
