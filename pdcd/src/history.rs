//! Deployment history tracking.
//!
//! Bounded, most-recent-first record of previously deployed versions,
//! used to pick rollback targets and to record rollout outcomes. Every
//! mutation persists the full `{current, history}` document; writes are
//! rare (one per deployment or rollback event), so read-modify-write of
//! the whole document is acceptable and last successful write wins.

use pdc_common::types::{DeploymentVersion, VersionId};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default maximum number of history entries to retain.
const DEFAULT_LIMIT: usize = 10;

/// Persisted document shape.
#[derive(Debug, Default, Serialize, Deserialize)]
struct HistoryDocument {
    current: Option<DeploymentVersion>,
    history: Vec<DeploymentVersion>,
}

#[derive(Debug, Default)]
struct StoreState {
    current: Option<DeploymentVersion>,
    /// Most recent first.
    history: VecDeque<DeploymentVersion>,
}

/// Bounded, ordered store of deployed versions with file persistence.
pub struct DeploymentHistoryStore {
    state: RwLock<StoreState>,
    limit: usize,
    persistence_path: Option<PathBuf>,
}

impl DeploymentHistoryStore {
    /// Create an empty in-memory store with the given history limit.
    pub fn new(limit: usize) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            limit: limit.max(1),
            persistence_path: None,
        }
    }

    /// Create an empty store with the default limit.
    pub fn with_default_limit() -> Self {
        Self::new(DEFAULT_LIMIT)
    }

    /// Enable persistence to the given path.
    pub fn with_persistence(mut self, path: PathBuf) -> Self {
        self.persistence_path = Some(path);
        self
    }

    /// Load a store from disk. A missing file yields an empty store that
    /// will persist to the same path.
    pub fn load_from_file(path: &Path, limit: usize) -> anyhow::Result<Self> {
        let store = Self::new(limit).with_persistence(path.to_path_buf());
        if !path.exists() {
            debug!(path = %path.display(), "no deployment history on disk, starting empty");
            return Ok(store);
        }

        let content = fs::read_to_string(path)?;
        let doc: HistoryDocument = serde_json::from_str(&content)?;
        {
            let mut state = store.state.write().unwrap_or_else(|e| e.into_inner());
            state.current = doc.current;
            state.history = doc.history.into_iter().take(limit).collect();
        }
        debug!(
            path = %path.display(),
            entries = store.len(),
            "loaded deployment history"
        );
        Ok(store)
    }

    /// Record a newly deployed version as current, pushing the previous
    /// current into history and evicting the oldest entry past the limit.
    pub fn record_deployment(&self, version: DeploymentVersion) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = state.current.take() {
            state.history.push_front(previous);
            state.history.truncate(self.limit);
        }
        debug!(version = %version.version, image = %version.image, "deployment recorded");
        state.current = Some(version);
        self.persist(&state);
    }

    /// Candidate rollback targets, most recent first.
    pub fn rollback_targets(&self) -> Vec<DeploymentVersion> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.history.iter().cloned().collect()
    }

    /// The currently deployed version, if one has been recorded.
    pub fn current(&self) -> Option<DeploymentVersion> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.current.clone()
    }

    /// Look up a history entry by version id.
    pub fn find(&self, version: &VersionId) -> Option<DeploymentVersion> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state
            .history
            .iter()
            .find(|v| &v.version == version)
            .cloned()
    }

    /// Swap the current version with a history entry after a successful
    /// rollback switch: the target leaves history and becomes current,
    /// the old current becomes the newest history entry.
    ///
    /// Returns the displaced current version, or `None` (with no
    /// mutation) when the target is not present in history.
    pub fn swap_for_rollback(
        &self,
        target: &VersionId,
    ) -> Option<(Option<DeploymentVersion>, DeploymentVersion)> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let pos = state.history.iter().position(|v| &v.version == target)?;
        let target_version = state.history.remove(pos)?;

        let displaced = state.current.take();
        if let Some(old) = displaced.clone() {
            state.history.push_front(old);
            state.history.truncate(self.limit);
        }
        state.current = Some(target_version.clone());
        self.persist(&state);
        Some((displaced, target_version))
    }

    /// Number of history entries (excluding current).
    pub fn len(&self) -> usize {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the full document; failures are logged, not propagated,
    /// since the in-memory state remains authoritative for this process.
    fn persist(&self, state: &StoreState) {
        let Some(path) = &self.persistence_path else {
            return;
        };
        let doc = HistoryDocument {
            current: state.current.clone(),
            history: state.history.iter().cloned().collect(),
        };
        match serde_json::to_vec_pretty(&doc) {
            Ok(bytes) => {
                if let Err(e) = atomic_write(path, &bytes) {
                    warn!(path = %path.display(), "failed to persist deployment history: {e}");
                }
            }
            Err(e) => warn!("failed to serialize deployment history: {e}"),
        }
    }
}

impl Default for DeploymentHistoryStore {
    fn default() -> Self {
        Self::with_default_limit()
    }
}

/// Write content to a file atomically via a temporary file and rename.
fn atomic_write(path: &Path, content: &[u8]) -> anyhow::Result<()> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    let temp_path = match parent {
        Some(dir) => dir.join(format!(".{}.tmp", Uuid::new_v4())),
        None => PathBuf::from(format!(".{}.tmp", Uuid::new_v4())),
    };

    let mut file = fs::File::create(&temp_path)?;
    file.write_all(content)?;
    file.sync_all()?;
    fs::rename(&temp_path, path)?;
    Ok(())
}
