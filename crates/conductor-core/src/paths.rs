use crate::error::{ConductorError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const CONDUCTOR_DIR: &str = ".conductor";
pub const WORKFLOWS_DIR: &str = ".conductor/workflows";
pub const RUNS_DIR: &str = ".conductor/runs";

pub const CONFIG_FILE: &str = ".conductor/config.yaml";
pub const ESCALATIONS_FILE: &str = ".conductor/escalations.yaml";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn conductor_dir(root: &Path) -> PathBuf {
    root.join(CONDUCTOR_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn escalations_path(root: &Path) -> PathBuf {
    root.join(ESCALATIONS_FILE)
}

pub fn workflows_dir(root: &Path) -> PathBuf {
    root.join(WORKFLOWS_DIR)
}

pub fn workflow_path(root: &Path, name: &str) -> PathBuf {
    workflows_dir(root).join(format!("{name}.yaml"))
}

pub fn runs_dir(root: &Path) -> PathBuf {
    root.join(RUNS_DIR)
}

pub fn run_path(root: &Path, id: &str) -> PathBuf {
    runs_dir(root).join(format!("{id}.yaml"))
}

// ---------------------------------------------------------------------------
// Name validation
// ---------------------------------------------------------------------------

static NAME_RE: OnceLock<Regex> = OnceLock::new();

fn name_re() -> &'static Regex {
    NAME_RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9\-]*[a-z0-9]$|^[a-z0-9]$").unwrap())
}

/// Workflow names, step ids, loop tags and delegate names share one shape:
/// lowercase alphanumerics with inner hyphens.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 64 || !name_re().is_match(name) {
        return Err(ConductorError::InvalidName(name.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
