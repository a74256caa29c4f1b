//! Workspace & snapshot manager.
//!
//! Per-agent working directory lifecycle, atomic-copy snapshots taken at every
//! `new_answer` commit, and the temporary read-only peer views materialised for a
//! restarted agent. The two safety predicates (absolute path, lexically under a
//! configured parent) are enforced once, in the [`WorkspacePath`] smart
//! constructor, rather than re-checked at each call site.

use crate::error::CoordinationError;
use std::path::{Path, PathBuf};
use tokio::fs;

/// A filesystem path that has passed the workspace safety predicates: it is
/// absolute and, when a `temporary_workspace_parent` is configured, lexically
/// nested under it. Constructing one is the only way any workspace operation in
/// this module accepts a path.
#[derive(Debug, Clone)]
pub struct WorkspacePath(PathBuf);

impl WorkspacePath {
    /// Validate `path` against the safety predicates. Fails with
    /// [`CoordinationError::WorkspaceSafetyViolation`] if `path` is not absolute,
    /// or (when `parent` is `Some`) is not lexically under `parent`.
    pub fn new(path: PathBuf, parent: Option<&Path>) -> Result<Self, CoordinationError> {
        if !path.is_absolute() {
            return Err(CoordinationError::WorkspaceSafetyViolation(format!(
                "workspace path '{}' is not absolute",
                path.display()
            )));
        }
        if let Some(parent) = parent {
            if !path.starts_with(parent) {
                return Err(CoordinationError::WorkspaceSafetyViolation(format!(
                    "workspace path '{}' escapes configured parent '{}'",
                    path.display(),
                    parent.display()
                )));
            }
        }
        Ok(Self(path))
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

/// Manages the per-agent working directory (`W_a`), snapshot directory (`S_a`),
/// and temporary peer views (`T_a`).
pub struct WorkspaceManager {
    root: PathBuf,
    session_log_dir: PathBuf,
}

impl WorkspaceManager {
    /// `root` is the `temporary_workspace_parent` every agent path must nest
    /// under; `session_log_dir` is where snapshot tees land for offline
    /// inspection.
    pub fn new(root: impl Into<PathBuf>, session_log_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            session_log_dir: session_log_dir.into(),
        }
    }

    fn working_dir(&self, anon_id: &str) -> Result<WorkspacePath, CoordinationError> {
        WorkspacePath::new(self.root.join(anon_id).join("workspace"), Some(&self.root))
    }

    fn snapshot_dir(&self, anon_id: &str) -> Result<WorkspacePath, CoordinationError> {
        WorkspacePath::new(self.root.join(anon_id).join("snapshot"), Some(&self.root))
    }

    fn peer_view_dir(&self, anon_id: &str) -> Result<WorkspacePath, CoordinationError> {
        WorkspacePath::new(self.root.join(anon_id).join("peer_view"), Some(&self.root))
    }

    /// `prepare_workspace(anon_id)`: create `W_a` if absent, clear it
    /// otherwise. Called at the start of every attempt so no residue from a prior
    /// attempt survives.
    pub async fn prepare_workspace(&self, anon_id: &str) -> Result<PathBuf, CoordinationError> {
        let dir = self.working_dir(anon_id)?;
        clear_dir(dir.as_path()).await?;
        Ok(dir.as_path().to_path_buf())
    }

    /// `snapshot(anon_id)`: atomically copy `W_a` into `S_a`,
    /// replacing any prior snapshot, then tee a timestamped copy into the
    /// session log directory. Must complete before any restarted peer starts its
    /// next attempt (the orchestrator enforces that ordering, not this method).
    pub async fn snapshot(&self, anon_id: &str, timestamp: &str) -> Result<PathBuf, CoordinationError> {
        let working = self.working_dir(anon_id)?;
        let snapshot = self.snapshot_dir(anon_id)?;

        clear_dir(snapshot.as_path()).await?;
        copy_dir_recursive(working.as_path(), snapshot.as_path()).await?;

        let tee_dir = self.session_log_dir.join("snapshots").join(anon_id).join(timestamp);
        if let Some(parent) = tee_dir.parent() {
            let _ = fs::create_dir_all(parent).await;
        }
        let _ = copy_dir_recursive(working.as_path(), &tee_dir).await;

        Ok(snapshot.as_path().to_path_buf())
    }

    /// `materialise_peer_view(anon_id, snapshots)`: clear `T_a`, then
    /// copy each peer's snapshot directory into `T_a/<peer_anon_id>/`. Only used
    /// when the agent's backend has native or MCP filesystem support.
    pub async fn materialise_peer_view(
        &self,
        anon_id: &str,
        snapshots: &[(String, PathBuf)],
    ) -> Result<PathBuf, CoordinationError> {
        let view = self.peer_view_dir(anon_id)?;
        clear_dir(view.as_path()).await?;

        for (peer_anon_id, snapshot_path) in snapshots {
            let dest = view.as_path().join(peer_anon_id);
            copy_dir_recursive(snapshot_path, &dest).await?;
        }

        Ok(view.as_path().to_path_buf())
    }

    /// `cleanup()`: best-effort removal of every agent's `T_a`. `W_a`
    /// and `S_a` are left intact for inspection.
    pub async fn cleanup(&self, anon_ids: &[String]) {
        for anon_id in anon_ids {
            if let Ok(view) = self.peer_view_dir(anon_id) {
                let _ = fs::remove_dir_all(view.as_path()).await;
            }
        }
    }
}

/// Remove `dir` if present, then recreate it empty.
async fn clear_dir(dir: &Path) -> Result<(), CoordinationError> {
    if fs::try_exists(dir).await.unwrap_or(false) {
        fs::remove_dir_all(dir)
            .await
            .map_err(|e| CoordinationError::WorkspaceSafetyViolation(e.to_string()))?;
    }
    fs::create_dir_all(dir)
        .await
        .map_err(|e| CoordinationError::WorkspaceSafetyViolation(e.to_string()))?;
    Ok(())
}

/// Copy every file and subtree from `src` to `dst` by value (no hardlinks/symlinks),
/// so a later mutation of `src` can never be observed through `dst` — this is the
/// invariant that makes a "snapshot" immutable while it's referenced by a `T_a`.
fn copy_dir_recursive<'a>(
    src: &'a Path,
    dst: &'a Path,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), CoordinationError>> + Send + 'a>> {
    Box::pin(async move {
        if !fs::try_exists(src).await.unwrap_or(false) {
            return Ok(());
        }

        fs::create_dir_all(dst)
            .await
            .map_err(|e| CoordinationError::WorkspaceSafetyViolation(e.to_string()))?;

        let mut entries = fs::read_dir(src)
            .await
            .map_err(|e| CoordinationError::WorkspaceSafetyViolation(e.to_string()))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CoordinationError::WorkspaceSafetyViolation(e.to_string()))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| CoordinationError::WorkspaceSafetyViolation(e.to_string()))?;
            let dest_path = dst.join(entry.file_name());

            if file_type.is_dir() {
                copy_dir_recursive(&entry.path(), &dest_path).await?;
            } else if file_type.is_file() {
                fs::copy(entry.path(), &dest_path)
                    .await
                    .map_err(|e| CoordinationError::WorkspaceSafetyViolation(e.to_string()))?;
            }
            // Symlinks are deliberately skipped: a snapshot must be a copy-by-value,
            // not something that can be repointed after the fact.
        }

        Ok(())
    })
}
