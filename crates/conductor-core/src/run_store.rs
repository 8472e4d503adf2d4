//! Run persistence: `.conductor/runs/<uuid>.yaml`.
//!
//! Runs are written after every `drive`, so a run parked in
//! `AwaitingInput` can be resumed by a later process and finished runs stay
//! around for audit.

use crate::error::{ConductorError, Result};
use crate::io;
use crate::paths;
use crate::run::WorkflowRun;
use std::path::Path;

pub fn save(root: &Path, run: &WorkflowRun) -> Result<()> {
    let data = serde_yaml::to_string(run)?;
    io::atomic_write(&paths::run_path(root, &run.id.to_string()), data.as_bytes())
}

/// Load a run by full id or unique id prefix.
pub fn load(root: &Path, id: &str) -> Result<WorkflowRun> {
    let exact = paths::run_path(root, id);
    if exact.exists() {
        return read(&exact);
    }
    if id.is_empty() {
        return Err(ConductorError::RunNotFound(id.to_string()));
    }
    let mut matches: Vec<_> = run_files(root)?
        .into_iter()
        .filter(|p| {
            p.file_stem()
                .and_then(|s| s.to_str())
                .is_some_and(|s| s.starts_with(id))
        })
        .collect();
    match matches.len() {
        1 => read(&matches.remove(0)),
        0 => Err(ConductorError::RunNotFound(id.to_string())),
        n => Err(ConductorError::RunNotFound(format!(
            "{id} (prefix matches {n} runs)"
        ))),
    }
}

/// All stored runs, oldest first.
pub fn list(root: &Path) -> Result<Vec<WorkflowRun>> {
    let mut runs = Vec::new();
    for path in run_files(root)? {
        match read(&path) {
            Ok(run) => runs.push(run),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable run"),
        }
    }
    runs.sort_by_key(|r| r.started_at);
    Ok(runs)
}

fn read(path: &Path) -> Result<WorkflowRun> {
    let data = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&data)?)
}

fn run_files(root: &Path) -> Result<Vec<std::path::PathBuf>> {
    let dir = paths::runs_dir(root);
    if !dir.exists() {
        return Ok(Vec::new());
    }
    Ok(std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "yaml"))
        .collect())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
