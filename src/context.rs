//! `WorkflowContext`: the in-memory scope of a single run, and the
//! `PausedRunState` shape used to durably resume a paused run.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::model::{BlockId, RunId};

/// Capability the orchestrator hands the engine to resolve `$keys.<name>`.
/// Tolerates synchronous results and absence (the reference resolver never
/// treats `None` as an error).
pub type KeyResolver = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Snapshot of the current block under execution, exposed as `$run`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunMeta {
    pub run_id: String,
    pub workflow_id: String,
    pub version: u32,
    pub step_index: usize,
    pub block_id: String,
    pub block_name: String,
    pub block_type: String,
}

/// State of a single loop table entry, exposed as `$loop.<id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopState {
    pub index: u64,
    pub artifact: Value,
}

/// The in-memory scope of a single run.
///
/// `cache` is stored as an ordered map (`indexmap`-less: a `Vec<(String,
/// Value)>` paired with a lookup `HashMap`) so insertion order survives a
/// pause/resume round trip, per the persisted-cache invariant in spec §3/§9.
#[derive(Debug, Clone, Default)]
pub struct WorkflowContext {
    pub state: Map<String, Value>,
    pub cache: OrderedCache,
    pub artifacts: Vec<Value>,
    pub secrets: Map<String, Value>,
    pub paths: Map<String, Value>,
    pub run: RunMeta,
    pub event: Map<String, Value>,
    pub loops: HashMap<String, LoopState>,
    /// Name of the most recently opened loop, for the `$row`/`$item`/`$index` aliases.
    pub active_loop: Option<String>,
    pub key_resolver: Option<KeyResolver>,
    /// The error recorded by the most recent failed step, exposed as `$error`.
    pub last_error: Map<String, Value>,
}

/// Insertion-ordered key/value cache. Backed by a paired-sequence
/// representation so it can be persisted and rehydrated without losing
/// order (spec §9, "Cache ordering across pause/resume").
#[derive(Debug, Clone, Default)]
pub struct OrderedCache {
    entries: Vec<(String, Value)>,
}

impl OrderedCache {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    pub fn delete(&mut self, key: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| k != key);
        self.entries.len() != before
    }

    pub fn has(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, Value)> {
        self.entries.iter()
    }

    pub fn to_pairs(&self) -> Vec<(String, Value)> {
        self.entries.clone()
    }

    pub fn from_pairs(pairs: Vec<(String, Value)>) -> Self {
        Self { entries: pairs }
    }

    pub fn as_json_map(&self) -> Map<String, Value> {
        self.entries.iter().cloned().collect()
    }
}

impl WorkflowContext {
    pub fn new(run_meta: RunMeta, event: Map<String, Value>, secrets: Map<String, Value>, paths: Map<String, Value>) -> Self {
        Self {
            state: Map::new(),
            cache: OrderedCache::default(),
            artifacts: Vec::new(),
            secrets,
            paths,
            run: run_meta,
            event,
            loops: HashMap::new(),
            active_loop: None,
            key_resolver: None,
            last_error: Map::new(),
        }
    }

    /// A shallow-ish clone used for deferred iterations: fresh `state`
    /// (copy), fresh `cache` (copy of entries), fresh `artifacts` (copy).
    /// Everything else (secrets, paths, run metadata template, key
    /// resolver) is shared by value since it is read-only / small.
    pub fn fork_for_defer(&self) -> WorkflowContext {
        WorkflowContext {
            state: self.state.clone(),
            cache: OrderedCache::from_pairs(self.cache.to_pairs()),
            artifacts: self.artifacts.clone(),
            secrets: self.secrets.clone(),
            paths: self.paths.clone(),
            run: self.run.clone(),
            event: self.event.clone(),
            loops: self.loops.clone(),
            active_loop: self.active_loop.clone(),
            key_resolver: self.key_resolver.clone(),
            last_error: self.last_error.clone(),
        }
    }

    /// Merge a deferred iteration's final state back into this context,
    /// key-wise overwrite (spec §4.6).
    pub fn merge_state_from(&mut self, other: &WorkflowContext) {
        for (k, v) in other.state.iter() {
            self.state.insert(k.clone(), v.clone());
        }
    }
}

/// Durable record sufficient to resume a run that suspended on a UI block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PausedRunState {
    pub current_block_index: usize,
    pub context_snapshot: ContextSnapshot,
    pub paused_block_id: BlockId,
    pub paused_ui_config: Map<String, Value>,
}

/// The JSON-serializable projection of `WorkflowContext` persisted inside
/// `PausedRunState`. Cache is a paired sequence, not a map, so key order
/// survives the round trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub state: Map<String, Value>,
    pub cache: Vec<(String, Value)>,
    pub artifacts: Vec<Value>,
    pub event: Map<String, Value>,
    pub loops: HashMap<String, LoopStateSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopStateSnapshot {
    pub index: u64,
    pub artifact: Value,
}

impl From<&WorkflowContext> for ContextSnapshot {
    fn from(ctx: &WorkflowContext) -> Self {
        Self {
            state: ctx.state.clone(),
            cache: ctx.cache.to_pairs(),
            artifacts: ctx.artifacts.clone(),
            event: ctx.event.clone(),
            loops: ctx
                .loops
                .iter()
                .map(|(k, v)| (k.clone(), LoopStateSnapshot { index: v.index, artifact: v.artifact.clone() }))
                .collect(),
        }
    }
}

impl ContextSnapshot {
    /// Rehydrate into a full `WorkflowContext`, re-attaching the run-scoped
    /// fields (secrets, paths, run meta, key resolver) that are not part of
    /// the persisted snapshot because they are reconstructed by the
    /// orchestrator at resume time, not stored.
    pub fn into_context(
        self,
        run_meta: RunMeta,
        secrets: Map<String, Value>,
        paths: Map<String, Value>,
        key_resolver: Option<KeyResolver>,
    ) -> WorkflowContext {
        WorkflowContext {
            state: self.state,
            cache: OrderedCache::from_pairs(self.cache),
            artifacts: self.artifacts,
            secrets,
            paths,
            run: run_meta,
            event: self.event,
            loops: self
                .loops
                .into_iter()
                .map(|(k, v)| (k, LoopState { index: v.index, artifact: v.artifact }))
                .collect(),
            active_loop: None,
            key_resolver,
            last_error: Map::new(),
        }
    }
}

/// Deep-equality based delta between two JSON objects: keys that are new in
/// `after` or whose value differs from `before`. Deletions are not tracked
/// here (per spec §4.3); the sandbox diff (crate::sandbox) is the one place
/// deletions are tracked, using `Value::Null` as a tombstone marker.
pub fn calculate_delta(before: &Map<String, Value>, after: &Map<String, Value>) -> Map<String, Value> {
    let mut delta = Map::new();
    for (k, v) in after.iter() {
        match before.get(k) {
            Some(old) if old == v => {}
            _ => {
                delta.insert(k.clone(), v.clone());
            }
        }
    }
    delta
}
