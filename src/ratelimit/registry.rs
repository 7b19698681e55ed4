//! Table of limit states and the rule for applying definition updates.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::debug;

use super::types::{LimitDefinition, LimitKey, LimitState};
use crate::error::{AdmissionError, Result};

/// Limit states keyed by limit key.
#[derive(Debug, Default)]
pub struct Registry {
    states: RwLock<HashMap<LimitKey, LimitState>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &LimitKey) -> Option<LimitState> {
        self.states.read().get(key).cloned()
    }

    /// Insert or replace the state for its definition's key.
    pub fn put(&self, state: LimitState) {
        self.states.write().insert(state.key().clone(), state);
    }

    /// All states sorted by key.
    pub fn list(&self) -> Vec<LimitState> {
        let mut snapshot: Vec<LimitState> = self.states.read().values().cloned().collect();
        snapshot.sort_by(|a, b| a.key().cmp(b.key()));
        snapshot
    }

    /// The state `def` would produce, without mutating the registry.
    pub fn next_state(&self, def: &LimitDefinition) -> LimitState {
        let prev = self.states.read().get(&def.key).cloned();
        next_state(prev.as_ref(), def)
    }

    /// Replace the contents with the states stored at `path`.
    ///
    /// A missing file leaves the registry untouched.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(AdmissionError::Registry("registry path is required".into()));
        }
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let states: Vec<LimitState> = serde_json::from_slice(&data)?;
        let mut table = self.states.write();
        table.clear();
        for state in states {
            table.insert(state.key().clone(), state);
        }
        debug!(path = %path.display(), count = table.len(), "Registry loaded");
        Ok(())
    }

    /// Persist every state to `path` via temp file, fsync and rename.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(AdmissionError::Registry("registry path is required".into()));
        }
        let payload = serde_json::to_vec_pretty(&self.list())?;
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }

        let mut tmp = PathBuf::from(path);
        tmp.as_mut_os_string().push(".tmp");

        let written = (|| -> std::io::Result<()> {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(&payload)?;
            file.sync_all()?;
            fs::rename(&tmp, path)
        })();

        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}

/// An increase (or a new key) applies immediately. A decrease keeps the old
/// definition and records the target.
pub fn next_state(prev: Option<&LimitState>, def: &LimitDefinition) -> LimitState {
    match prev {
        Some(prev) if def.capacity < prev.definition.capacity => {
            LimitState::decreasing(prev.definition.clone(), def.capacity)
        }
        _ => LimitState::active(def.clone()),
    }
}
