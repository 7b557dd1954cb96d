//! Durable persistence of `RunState`, the worklist, and the worktree
//! registry (§4.6).
//!
//! All writes are atomic: serialize, write to a temp file in the same
//! directory, fsync, then rename over the target — the same recipe the
//! teacher uses for its own merge-state file.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::ids::RunId;
use crate::model::{RunState, WorkItem, WorktreeInfo};

/// A [`RunStore`] operation failed.
#[derive(Debug)]
pub enum StoreError {
    Io(String),
    Deserialize(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(msg) => write!(f, "run store I/O error: {msg}"),
            Self::Deserialize(msg) => write!(f, "run store deserialize error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Current on-disk schema version for [`Worklist`].
pub const WORKLIST_SCHEMA_VERSION: u32 = 1;

/// Plan-mode decomposition, persisted so it can be re-shown or resumed
/// without re-invoking the planner.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worklist {
    pub version: u32,
    pub items: Vec<WorkItem>,
}

impl Default for Worklist {
    fn default() -> Self {
        Self { version: WORKLIST_SCHEMA_VERSION, items: Vec::new() }
    }
}

/// Durable state under `<state-dir>/` (§4.6):
/// ```text
/// <state>/
///   runs/<runId>.json
///   worklist.json
///   worktrees.json
/// ```
pub struct RunStore {
    state_dir: PathBuf,
}

impl RunStore {
    /// Open a store rooted at `state_dir`. Does not touch the filesystem —
    /// directories are created lazily on first write.
    #[must_use]
    pub fn new(state_dir: PathBuf) -> Self {
        Self { state_dir }
    }

    #[must_use]
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn runs_dir(&self) -> PathBuf {
        self.state_dir.join("runs")
    }

    fn run_path(&self, id: &RunId) -> PathBuf {
        self.runs_dir().join(format!("{id}.json"))
    }

    fn worklist_path(&self) -> PathBuf {
        self.state_dir.join("worklist.json")
    }

    fn worktrees_path(&self) -> PathBuf {
        self.state_dir.join("worktrees.json")
    }

    /// Persist `run` atomically.
    ///
    /// # Errors
    /// Returns [`StoreError`] on I/O or serialization failure. Callers
    /// retry once per §7 before treating this as terminal.
    pub fn save_run(&self, run: &RunState) -> Result<(), StoreError> {
        let dir = self.runs_dir();
        fs::create_dir_all(&dir).map_err(|e| StoreError::Io(e.to_string()))?;
        write_atomic(&self.run_path(&run.id), run)
    }

    /// Load a persisted run by id.
    ///
    /// # Errors
    /// Returns [`StoreError`] if the file is missing, unreadable, or
    /// malformed.
    pub fn load_run(&self, id: &RunId) -> Result<RunState, StoreError> {
        read_required(&self.run_path(id))
    }

    /// Load a run if present, `None` if absent — used by `status` to probe
    /// without failing.
    ///
    /// # Errors
    /// Returns [`StoreError`] if the file exists but is unreadable or
    /// malformed.
    pub fn load_run_opt(&self, id: &RunId) -> Result<Option<RunState>, StoreError> {
        if self.run_path(id).exists() {
            Ok(Some(self.load_run(id)?))
        } else {
            Ok(None)
        }
    }

    /// List every persisted run id, most-recently-created last (by file
    /// name, which sorts with `RunId`'s timestamp-prefixed encoding).
    ///
    /// # Errors
    /// Returns [`StoreError`] if the runs directory cannot be read.
    pub fn list_run_ids(&self) -> Result<Vec<RunId>, StoreError> {
        let dir = self.runs_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids: Vec<RunId> = fs::read_dir(&dir)
            .map_err(|e| StoreError::Io(e.to_string()))?
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                let stem = name.strip_suffix(".json")?;
                RunId::new(stem).ok()
            })
            .collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(ids)
    }

    /// The most recently created run, if any.
    ///
    /// # Errors
    /// Returns [`StoreError`] if the runs directory cannot be read or the
    /// latest run cannot be loaded.
    pub fn latest_run(&self) -> Result<Option<RunState>, StoreError> {
        match self.list_run_ids()?.last() {
            Some(id) => Ok(Some(self.load_run(id)?)),
            None => Ok(None),
        }
    }

    /// Persist the plan-mode decomposition.
    ///
    /// # Errors
    /// Returns [`StoreError`] on I/O or serialization failure.
    pub fn save_worklist(&self, worklist: &Worklist) -> Result<(), StoreError> {
        fs::create_dir_all(&self.state_dir).map_err(|e| StoreError::Io(e.to_string()))?;
        write_atomic(&self.worklist_path(), worklist)
    }

    /// Load the plan-mode decomposition. Absent is a valid empty state.
    ///
    /// # Errors
    /// Returns [`StoreError`] if the file exists but is malformed.
    pub fn load_worklist(&self) -> Result<Worklist, StoreError> {
        read_or_default(&self.worklist_path())
    }

    /// Persist the full set of active worktrees.
    ///
    /// # Errors
    /// Returns [`StoreError`] on I/O or serialization failure.
    pub fn save_worktrees(&self, worktrees: &[WorktreeInfo]) -> Result<(), StoreError> {
        fs::create_dir_all(&self.state_dir).map_err(|e| StoreError::Io(e.to_string()))?;
        write_atomic(&self.worktrees_path(), &worktrees.to_vec())
    }

    /// Load the worktree registry. Absent is a valid empty registry.
    ///
    /// # Errors
    /// Returns [`StoreError`] if the file exists but is malformed.
    pub fn load_worktrees(&self) -> Result<Vec<WorktreeInfo>, StoreError> {
        read_or_default(&self.worktrees_path())
    }

    /// Remove a worktree registry entry for `(run_id, item_id)`, if present.
    ///
    /// # Errors
    /// Returns [`StoreError`] on I/O or serialization failure.
    pub fn deregister_worktree(
        &self,
        run_id: &RunId,
        item_id: crate::ids::ItemId,
    ) -> Result<(), StoreError> {
        let mut worktrees = self.load_worktrees()?;
        worktrees.retain(|w| !(w.run_id == *run_id && w.item_id == item_id));
        self.save_worktrees(&worktrees)
    }

    /// Add or replace a worktree registry entry.
    ///
    /// # Errors
    /// Returns [`StoreError`] on I/O or serialization failure.
    pub fn register_worktree(&self, info: WorktreeInfo) -> Result<(), StoreError> {
        let mut worktrees = self.load_worktrees()?;
        worktrees.retain(|w| !(w.run_id == info.run_id && w.item_id == info.item_id));
        worktrees.push(info);
        self.save_worktrees(&worktrees)
    }

    /// Remove every file under the state directory — used by `clean`.
    ///
    /// # Errors
    /// Returns [`StoreError`] if the directory exists but cannot be removed.
    pub fn wipe(&self) -> Result<(), StoreError> {
        if self.state_dir.exists() {
            fs::remove_dir_all(&self.state_dir).map_err(|e| StoreError::Io(e.to_string()))?;
        }
        Ok(())
    }
}

fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let json = serde_json::to_string_pretty(value).map_err(|e| StoreError::Io(e.to_string()))?;
    let dir = path
        .parent()
        .ok_or_else(|| StoreError::Io(format!("no parent directory for {}", path.display())))?;
    let tmp_path = dir.join(format!(
        ".{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("write")
    ));

    let mut file =
        fs::File::create(&tmp_path).map_err(|e| StoreError::Io(format!("create {}: {e}", tmp_path.display())))?;
    file.write_all(json.as_bytes())
        .map_err(|e| StoreError::Io(format!("write {}: {e}", tmp_path.display())))?;
    file.sync_all()
        .map_err(|e| StoreError::Io(format!("fsync {}: {e}", tmp_path.display())))?;
    drop(file);

    fs::rename(&tmp_path, path)
        .map_err(|e| StoreError::Io(format!("rename {} -> {}: {e}", tmp_path.display(), path.display())))
}

fn read_required<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, StoreError> {
    let contents = fs::read_to_string(path)
        .map_err(|e| StoreError::Io(format!("read {}: {e}", path.display())))?;
    serde_json::from_str(&contents)
        .map_err(|e| StoreError::Deserialize(format!("{}: {e}", path.display())))
}

fn read_or_default<T: for<'de> Deserialize<'de> + Default>(path: &Path) -> Result<T, StoreError> {
    match fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents)
            .map_err(|e| StoreError::Deserialize(format!("{}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(StoreError::Io(format!("read {}: {e}", path.display()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RunMode, RunState};
    use std::collections::BTreeSet;

    fn item(id: u32) -> WorkItem {
        let iid = crate::ids::ItemId::new(id).unwrap();
        WorkItem::new(iid, "t", "b", [], [], false, None, &BTreeSet::from([iid]))
    }

    #[test]
    fn save_then_load_is_deep_equal() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path().to_owned());
        let run = RunState::new(
            RunId::generate(),
            RunMode::Plan,
            "main",
            "dagwork/run-x",
            vec![item(1)],
        );
        store.save_run(&run).unwrap();
        let loaded = store.load_run(&run.id).unwrap();
        assert_eq!(run, loaded);
    }

    #[test]
    fn load_missing_run_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path().to_owned());
        let id = RunId::new("missing1").unwrap();
        assert!(store.load_run(&id).is_err());
        assert!(store.load_run_opt(&id).unwrap().is_none());
    }

    #[test]
    fn worklist_absent_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path().to_owned());
        assert_eq!(store.load_worklist().unwrap(), Worklist::default());
    }

    #[test]
    fn worktree_registry_roundtrips_and_deregisters() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path().to_owned());
        let run_id = RunId::generate();
        let item_id = crate::ids::ItemId::new(1).unwrap();
        let info = WorktreeInfo {
            item_id,
            run_id: run_id.clone(),
            path: PathBuf::from("/tmp/x"),
            branch: "dagwork/run-x-item-1".to_owned(),
            created_at: crate::time::now_iso8601(),
        };
        store.register_worktree(info).unwrap();
        assert_eq!(store.load_worktrees().unwrap().len(), 1);

        store.deregister_worktree(&run_id, item_id).unwrap();
        assert!(store.load_worktrees().unwrap().is_empty());
    }

    #[test]
    fn list_run_ids_sorted_and_latest_matches() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path().to_owned());
        let a = RunState::new(RunId::new("000a").unwrap(), RunMode::Plan, "main", "dagwork/run-000a", vec![]);
        let b = RunState::new(RunId::new("000b").unwrap(), RunMode::Plan, "main", "dagwork/run-000b", vec![]);
        store.save_run(&a).unwrap();
        store.save_run(&b).unwrap();
        assert_eq!(store.list_run_ids().unwrap(), vec![a.id.clone(), b.id.clone()]);
        assert_eq!(store.latest_run().unwrap().unwrap().id, b.id);
    }

    #[test]
    fn wipe_removes_state_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path().join("state"));
        store.save_worklist(&Worklist::default()).unwrap();
        assert!(store.state_dir().exists());
        store.wipe().unwrap();
        assert!(!store.state_dir().exists());
        store.wipe().unwrap();
    }
}
