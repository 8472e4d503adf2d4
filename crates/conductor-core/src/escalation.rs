//! Human escalation queue for runs that stopped in `Escalated`.
//!
//! Layout:
//!   .conductor/escalations.yaml   list of all escalations, open and resolved
//!
//! IDs are sequential: E1, E2, E3, …
//! Each item carries the run's full report so the operator can act without
//! opening the run file.

use crate::error::{ConductorError, Result};
use crate::io;
use crate::paths;
use crate::run::{HaltReason, RunState, WorkflowRun};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationKind {
    /// A loop ceiling or the spawn budget was hit.
    RetryLimit,
    DelegateUnavailable,
    /// The definition could not route the run (unknown step or outcome,
    /// unmet precondition).
    WorkflowDefect,
}

impl EscalationKind {
    pub fn for_reason(reason: &HaltReason) -> Self {
        match reason {
            HaltReason::LimitExceeded { .. } => EscalationKind::RetryLimit,
            HaltReason::DelegateUnavailable { .. } => EscalationKind::DelegateUnavailable,
            _ => EscalationKind::WorkflowDefect,
        }
    }
}

impl std::fmt::Display for EscalationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EscalationKind::RetryLimit => "retry_limit",
            EscalationKind::DelegateUnavailable => "delegate_unavailable",
            EscalationKind::WorkflowDefect => "workflow_defect",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStatus {
    Open,
    Resolved,
}

impl std::fmt::Display for EscalationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EscalationStatus::Open => f.write_str("open"),
            EscalationStatus::Resolved => f.write_str("resolved"),
        }
    }
}

/// Which escalations `list` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusFilter {
    #[default]
    Open,
    Resolved,
    All,
}

impl std::str::FromStr for StatusFilter {
    type Err = ConductorError;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(StatusFilter::Open),
            "resolved" => Ok(StatusFilter::Resolved),
            "all" => Ok(StatusFilter::All),
            _ => Err(ConductorError::InvalidValue(format!(
                "unknown escalation status '{s}': must be open, resolved, or all"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationItem {
    pub id: String,
    pub kind: EscalationKind,
    pub run_id: String,
    pub workflow: String,
    /// Step the run stopped at.
    pub step: String,
    pub title: String,
    /// The run report at the time of escalation.
    pub context: String,
    pub status: EscalationStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
}

// ---------------------------------------------------------------------------
// Internal file I/O
// ---------------------------------------------------------------------------

fn load_all(root: &Path) -> Result<Vec<EscalationItem>> {
    let path = paths::escalations_path(root);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(&path)?;
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_yaml::from_str(&content)?)
}

fn save_all(root: &Path, items: &[EscalationItem]) -> Result<()> {
    let content = serde_yaml::to_string(items)?;
    io::atomic_write(&paths::escalations_path(root), content.as_bytes())
}

fn next_id(items: &[EscalationItem]) -> String {
    format!("E{}", items.len() + 1)
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// File an escalation for a run that ended `Escalated`.
///
/// Filing twice for the same run returns the existing item.
pub fn create_from_run(root: &Path, run: &WorkflowRun) -> Result<EscalationItem> {
    let RunState::Escalated { reason } = &run.state else {
        return Err(ConductorError::InvalidRunState {
            run: run.id.to_string(),
            state: run.state.to_string(),
            expected: "escalated".into(),
        });
    };

    let mut items = load_all(root)?;
    let run_id = run.id.to_string();
    if let Some(existing) = items.iter().find(|e| e.run_id == run_id) {
        return Ok(existing.clone());
    }

    let item = EscalationItem {
        id: next_id(&items),
        kind: EscalationKind::for_reason(reason),
        run_id,
        workflow: run.workflow.clone(),
        step: run.cursor.clone(),
        title: format!("{} stopped at '{}': {reason}", run.workflow, run.cursor),
        context: run.report().to_string(),
        status: EscalationStatus::Open,
        created_at: Utc::now(),
        resolved_at: None,
        resolution: None,
    };

    items.push(item.clone());
    save_all(root, &items)?;
    tracing::info!(id = %item.id, run = %item.run_id, kind = %item.kind, "escalation filed");
    Ok(item)
}

pub fn list(root: &Path, filter: StatusFilter) -> Result<Vec<EscalationItem>> {
    let items = load_all(root)?;
    Ok(items
        .into_iter()
        .filter(|e| match filter {
            StatusFilter::All => true,
            StatusFilter::Open => e.status == EscalationStatus::Open,
            StatusFilter::Resolved => e.status == EscalationStatus::Resolved,
        })
        .collect())
}

pub fn get(root: &Path, id: &str) -> Result<EscalationItem> {
    load_all(root)?
        .into_iter()
        .find(|e| e.id == id)
        .ok_or_else(|| ConductorError::EscalationNotFound(id.to_string()))
}

pub fn resolve(root: &Path, id: &str, resolution: impl Into<String>) -> Result<EscalationItem> {
    let mut items = load_all(root)?;
    let item = items
        .iter_mut()
        .find(|e| e.id == id)
        .ok_or_else(|| ConductorError::EscalationNotFound(id.to_string()))?;

    item.status = EscalationStatus::Resolved;
    item.resolved_at = Some(Utc::now());
    item.resolution = Some(resolution.into());
    let resolved = item.clone();

    save_all(root, &items)?;
    Ok(resolved)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::IterationGuard;
    use crate::types::StepResult;
    use std::collections::BTreeMap;

    fn escalated_run(reason: HaltReason) -> WorkflowRun {
        let mut run = WorkflowRun::new("fix", "reproduce", IterationGuard::new(BTreeMap::new(), 12));
        run.record("reproduce", None, 1, StepResult::failed("no crash"));
        run.transition(RunState::Escalated { reason });
        run
    }

    fn limit() -> HaltReason {
        HaltReason::LimitExceeded {
            tag: "reproduction".into(),
            ceiling: 2,
        }
    }

    #[test]
    fn create_from_escalated_run() {
        let dir = tempfile::TempDir::new().unwrap();
        let run = escalated_run(limit());
        let item = create_from_run(dir.path(), &run).unwrap();

        assert_eq!(item.id, "E1");
        assert_eq!(item.kind, EscalationKind::RetryLimit);
        assert_eq!(item.step, "reproduce");
        assert_eq!(item.status, EscalationStatus::Open);
        assert!(item.context.contains("reproduce #1: failed: no crash"));
    }

    #[test]
    fn filing_twice_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let run = escalated_run(limit());
        create_from_run(dir.path(), &run).unwrap();
        let again = create_from_run(dir.path(), &run).unwrap();
        assert_eq!(again.id, "E1");
        assert_eq!(list(dir.path(), StatusFilter::All).unwrap().len(), 1);
    }

    #[test]
    fn sequential_ids_and_kinds() {
        let dir = tempfile::TempDir::new().unwrap();
        create_from_run(dir.path(), &escalated_run(limit())).unwrap();
        let e2 = create_from_run(
            dir.path(),
            &escalated_run(HaltReason::DelegateUnavailable {
                delegate: "reproducer".into(),
                reason: "offline".into(),
            }),
        )
        .unwrap();
        assert_eq!(e2.id, "E2");
        assert_eq!(e2.kind, EscalationKind::DelegateUnavailable);
    }

    #[test]
    fn non_escalated_run_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let run = WorkflowRun::new("fix", "reproduce", IterationGuard::new(BTreeMap::new(), 12));
        assert!(create_from_run(dir.path(), &run).is_err());
    }

    #[test]
    fn resolve_removes_from_open() {
        let dir = tempfile::TempDir::new().unwrap();
        create_from_run(dir.path(), &escalated_run(limit())).unwrap();

        resolve(dir.path(), "E1", "raised the ceiling").unwrap();

        assert!(list(dir.path(), StatusFilter::Open).unwrap().is_empty());
        let resolved = list(dir.path(), StatusFilter::Resolved).unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].resolution.as_deref(), Some("raised the ceiling"));
    }

    #[test]
    fn missing_escalation_returns_not_found() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(matches!(
            get(dir.path(), "E99").unwrap_err(),
            ConductorError::EscalationNotFound(_)
        ));
        assert!(matches!(
            resolve(dir.path(), "E99", "x").unwrap_err(),
            ConductorError::EscalationNotFound(_)
        ));
    }

    #[test]
    fn status_filter_parses() {
        assert_eq!("all".parse::<StatusFilter>().unwrap(), StatusFilter::All);
        assert!("closed".parse::<StatusFilter>().is_err());
    }
}
