//! Persistence: `sled`-backed store for runs, steps, and paused state.
//! Shape follows the teacher's `StateStore` (namespaced string keys,
//! `serde_json` byte encoding, `scan_prefix` for listing).

use std::path::Path;

use sled::Db;

use crate::context::PausedRunState;
use crate::crypto;
use crate::error::{WorkflowError, WorkflowResult};
use crate::model::{Run, RunId, Step, VersionNumber, WorkflowId, WorkflowVersion};

const SEAL_KEY_ENTRY: &[u8] = b"config:paused_state_seal_key";
const SEAL_KEY_LEN: usize = 32;

pub struct StateStore {
    db: Db,
    seal_key: Vec<u8>,
}

impl StateStore {
    pub fn new<P: AsRef<Path>>(path: P) -> WorkflowResult<Self> {
        let db = sled::open(path)?;
        let seal_key = Self::load_or_create_seal_key(&db)?;
        Ok(Self { db, seal_key })
    }

    /// An ephemeral in-memory store, for tests and the CLI demo.
    pub fn temporary() -> WorkflowResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        let seal_key = Self::load_or_create_seal_key(&db)?;
        Ok(Self { db, seal_key })
    }

    /// The key material paused-state sealing is derived from lives inside
    /// the same `sled` tree it protects, generated once on first open so it
    /// survives process restarts (without this, a run paused before a
    /// restart could never be unsealed again).
    fn load_or_create_seal_key(db: &Db) -> WorkflowResult<Vec<u8>> {
        if let Some(existing) = db.get(SEAL_KEY_ENTRY)? {
            return Ok(existing.to_vec());
        }
        let mut key = vec![0u8; SEAL_KEY_LEN];
        for byte in key.iter_mut() {
            *byte = fastrand::u8(..);
        }
        db.insert(SEAL_KEY_ENTRY, key.as_slice())?;
        Ok(key)
    }

    pub fn save_run(&self, run: &Run) -> WorkflowResult<()> {
        let key = format!("run:{}", run.id);
        let value = serde_json::to_vec(run)?;
        self.db.insert(key.as_bytes(), value)?;
        Ok(())
    }

    pub fn load_run(&self, run_id: RunId) -> WorkflowResult<Option<Run>> {
        let key = format!("run:{run_id}");
        match self.db.get(key.as_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    pub fn save_steps(&self, run_id: RunId, steps: &[Step]) -> WorkflowResult<()> {
        let key = format!("steps:{run_id}");
        let value = serde_json::to_vec(steps)?;
        self.db.insert(key.as_bytes(), value)?;
        Ok(())
    }

    pub fn load_steps(&self, run_id: RunId) -> WorkflowResult<Vec<Step>> {
        let key = format!("steps:{run_id}");
        match self.db.get(key.as_bytes())? {
            Some(value) => Ok(serde_json::from_slice(&value)?),
            None => Ok(Vec::new()),
        }
    }

    /// A paused run's context snapshot may carry values derived from
    /// `secrets`; sealed (not plaintext) before it touches disk.
    pub fn save_paused_state(&self, run_id: RunId, state: &PausedRunState) -> WorkflowResult<()> {
        let key = format!("paused:{run_id}");
        let plaintext = serde_json::to_vec(state)?;
        let sealed = crypto::seal(&plaintext, &self.seal_key);
        self.db.insert(key.as_bytes(), sealed.as_bytes())?;
        Ok(())
    }

    pub fn load_paused_state(&self, run_id: RunId) -> WorkflowResult<Option<PausedRunState>> {
        let key = format!("paused:{run_id}");
        match self.db.get(key.as_bytes())? {
            Some(value) => {
                let sealed = std::str::from_utf8(&value).map_err(|e| WorkflowError::Persistence(format!("non-utf8 sealed paused state: {e}")))?;
                let plaintext = crypto::open(sealed, &self.seal_key)?;
                Ok(Some(serde_json::from_slice(&plaintext)?))
            }
            None => Ok(None),
        }
    }

    pub fn clear_paused_state(&self, run_id: RunId) -> WorkflowResult<()> {
        let key = format!("paused:{run_id}");
        self.db.remove(key.as_bytes())?;
        Ok(())
    }

    /// Immutable snapshot; publishing the same `(workflow_id, version)` pair
    /// twice overwrites (validation that a version is never republished is
    /// the API layer's job, out of scope here — spec §1).
    pub fn save_version(&self, version: &WorkflowVersion) -> WorkflowResult<()> {
        let key = format!("version:{}:{}", version.workflow_id, version.version);
        let value = serde_json::to_vec(version)?;
        self.db.insert(key.as_bytes(), value)?;
        Ok(())
    }

    pub fn load_version(&self, workflow_id: WorkflowId, version: VersionNumber) -> WorkflowResult<Option<WorkflowVersion>> {
        let key = format!("version:{workflow_id}:{version}");
        match self.db.get(key.as_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// Every run id with a persisted row, regardless of status.
    pub fn list_run_ids(&self) -> WorkflowResult<Vec<RunId>> {
        let mut ids = Vec::new();
        for entry in self.db.scan_prefix(b"run:") {
            let (key, _) = entry.map_err(WorkflowError::from)?;
            if let Ok(key_str) = std::str::from_utf8(&key) {
                if let Some(id_str) = key_str.strip_prefix("run:") {
                    if let Ok(id) = RunId::parse_str(id_str) {
                        ids.push(id);
                    }
                }
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OrgId, TriggerType, WorkflowId};

    #[test]
    fn round_trips_a_run() {
        let store = StateStore::temporary().unwrap();
        let run = Run::new(WorkflowId::new(), 1, OrgId::new(), TriggerType::Api);
        store.save_run(&run).unwrap();
        let loaded = store.load_run(run.id).unwrap().unwrap();
        assert_eq!(loaded.id, run.id);
    }

    #[test]
    fn round_trips_a_version() {
        use crate::model::{TriggerType as Tt, VersionStatus};
        let store = StateStore::temporary().unwrap();
        let workflow_id = WorkflowId::new();
        let version = WorkflowVersion {
            workflow_id,
            version: 1,
            status: VersionStatus::Published,
            trigger_type: Tt::Api,
            trigger_config: Default::default(),
            blocks: vec![],
        };
        store.save_version(&version).unwrap();
        let loaded = store.load_version(workflow_id, 1).unwrap().unwrap();
        assert_eq!(loaded.workflow_id, workflow_id);
        assert!(store.load_version(workflow_id, 2).unwrap().is_none());
    }

    #[test]
    fn missing_run_is_none() {
        let store = StateStore::temporary().unwrap();
        assert!(store.load_run(RunId::new()).unwrap().is_none());
    }

    #[test]
    fn paused_state_round_trips_and_is_sealed_on_disk() {
        use crate::context::ContextSnapshot;
        use crate::model::BlockId;
        use std::collections::HashMap;

        let store = StateStore::temporary().unwrap();
        let run_id = RunId::new();
        let mut state = serde_json::Map::new();
        state.insert("api_key".to_string(), serde_json::json!("super-secret"));
        let paused = PausedRunState {
            current_block_index: 2,
            context_snapshot: ContextSnapshot { state, cache: vec![], artifacts: vec![], event: Default::default(), loops: HashMap::new() },
            paused_block_id: BlockId::new(),
            paused_ui_config: Default::default(),
        };

        store.save_paused_state(run_id, &paused).unwrap();

        let raw = store.db.get(format!("paused:{run_id}").as_bytes()).unwrap().unwrap();
        assert!(!String::from_utf8_lossy(&raw).contains("super-secret"), "paused state must not be stored as plaintext");

        let loaded = store.load_paused_state(run_id).unwrap().unwrap();
        assert_eq!(loaded.current_block_index, 2);
        assert_eq!(loaded.context_snapshot.state.get("api_key"), Some(&serde_json::json!("super-secret")));

        store.clear_paused_state(run_id).unwrap();
        assert!(store.load_paused_state(run_id).unwrap().is_none());
    }
}
