//! The mutable value a coordinator threads through one workflow execution.

use crate::error::ConductorError;
use crate::guard::IterationGuard;
use crate::types::StepResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// HaltReason
// ---------------------------------------------------------------------------

/// The specific condition that escalated a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HaltReason {
    LimitExceeded { tag: String, ceiling: u32 },
    DelegateUnavailable { delegate: String, reason: String },
    UnknownStep { step: String },
    UnknownOutcome { step: String, outcome: String },
    PreconditionUnmet { step: String, missing: Vec<String> },
    Internal { message: String },
}

impl From<ConductorError> for HaltReason {
    fn from(err: ConductorError) -> Self {
        match err {
            ConductorError::LimitExceeded { tag, ceiling } => HaltReason::LimitExceeded { tag, ceiling },
            ConductorError::DelegateUnavailable { delegate, reason } => {
                HaltReason::DelegateUnavailable { delegate, reason }
            }
            ConductorError::UnknownStep { step, .. } => HaltReason::UnknownStep { step },
            ConductorError::UnknownOutcome { step, outcome } => {
                HaltReason::UnknownOutcome { step, outcome }
            }
            other => HaltReason::Internal {
                message: other.to_string(),
            },
        }
    }
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HaltReason::LimitExceeded { tag, ceiling } => {
                write!(f, "loop '{tag}' hit its ceiling of {ceiling} attempt(s)")
            }
            HaltReason::DelegateUnavailable { delegate, reason } => {
                write!(f, "delegate '{delegate}' unavailable: {reason}")
            }
            HaltReason::UnknownStep { step } => write!(f, "workflow has no step '{step}'"),
            HaltReason::UnknownOutcome { step, outcome } => {
                write!(f, "step '{step}' has no branch for outcome '{outcome}'")
            }
            HaltReason::PreconditionUnmet { step, missing } => write!(
                f,
                "step '{step}' needs completed results from: {}",
                missing.join(", ")
            ),
            HaltReason::Internal { message } => f.write_str(message),
        }
    }
}

// ---------------------------------------------------------------------------
// RunState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Running,
    AwaitingInput {
        step: String,
        /// Fan-out member that asked; `None` for single-delegate steps.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branch: Option<String>,
        question: String,
    },
    Escalated { reason: HaltReason },
    Completed,
    Aborted { reason: String },
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Escalated { .. } | RunState::Completed | RunState::Aborted { .. }
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Running => "running",
            RunState::AwaitingInput { .. } => "awaiting_input",
            RunState::Escalated { .. } => "escalated",
            RunState::Completed => "completed",
            RunState::Aborted { .. } => "aborted",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// LogEntry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u32,
    pub step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub attempt: u32,
    pub result: StepResult,
    pub at: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(
        seq: u32,
        step: impl Into<String>,
        branch: Option<String>,
        attempt: u32,
        result: StepResult,
    ) -> Self {
        Self {
            seq,
            step: step.into(),
            branch,
            attempt,
            result,
            at: Utc::now(),
        }
    }

    /// `step` or `step/branch`.
    pub fn key(&self) -> String {
        match &self.branch {
            Some(b) => format!("{}/{b}", self.step),
            None => self.step.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowRun
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub workflow: String,
    pub state: RunState,
    /// Step the run is at (or stopped at, once terminal).
    pub cursor: String,
    pub guard: IterationGuard,
    #[serde(default)]
    pub log: Vec<LogEntry>,
    /// Operator answer waiting to be handed to the resumed step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_answer: Option<String>,
    /// Fan-out member the pending answer is for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_for: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    pub fn new(workflow: impl Into<String>, first_step: impl Into<String>, guard: IterationGuard) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workflow: workflow.into(),
            state: RunState::Running,
            cursor: first_step.into(),
            guard,
            log: Vec::new(),
            pending_answer: None,
            answer_for: None,
            started_at: now,
            updated_at: now,
            ended_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn record(&mut self, step: &str, branch: Option<String>, attempt: u32, result: StepResult) {
        let seq = self.log.len() as u32 + 1;
        self.log.push(LogEntry::new(seq, step, branch, attempt, result));
        self.updated_at = Utc::now();
    }

    /// Move to `state`, stamping `ended_at` when it is terminal.
    pub fn transition(&mut self, state: RunState) {
        let now = Utc::now();
        if state.is_terminal() {
            self.ended_at = Some(now);
            self.pending_answer = None;
            self.answer_for = None;
        }
        self.state = state;
        self.updated_at = now;
    }

    /// Number of log entries recorded for `step` (all parallel members included).
    pub fn entries_for(&self, step: &str) -> usize {
        self.log.iter().filter(|e| e.step == step).count()
    }

    /// Distinct attempts made at `step`.
    pub fn attempts_at(&self, step: &str) -> u32 {
        self.log
            .iter()
            .filter(|e| e.step == step)
            .map(|e| e.attempt)
            .max()
            .unwrap_or(0)
    }

    /// Step ids in visiting order. Parallel members of one attempt collapse
    /// into a single visit.
    pub fn visited(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        let mut last: Option<(&str, u32)> = None;
        for e in &self.log {
            let here = (e.step.as_str(), e.attempt);
            if e.branch.is_none() || last != Some(here) {
                out.push(e.step.as_str());
            }
            last = Some(here);
        }
        out
    }

    /// Latest result per log key.
    pub fn latest_results(&self) -> BTreeMap<String, StepResult> {
        let mut out = BTreeMap::new();
        for e in &self.log {
            out.insert(e.key(), e.result.clone());
        }
        out
    }

    /// Latest result of each member within one attempt at `step`, keyed by
    /// branch id (`None` for single-delegate steps).
    pub fn attempt_results(&self, step: &str, attempt: u32) -> BTreeMap<Option<String>, StepResult> {
        let mut latest = BTreeMap::new();
        for e in self
            .log
            .iter()
            .filter(|e| e.step == step && e.attempt == attempt)
        {
            latest.insert(e.branch.clone(), e.result.clone());
        }
        latest
    }

    /// True when the most recent attempt at `step` completed on every member.
    pub fn step_completed(&self, step: &str) -> bool {
        let last_attempt = self.attempts_at(step);
        if last_attempt == 0 {
            return false;
        }
        let latest = self.attempt_results(step, last_attempt);
        !latest.is_empty() && latest.values().all(|r| r.is_completed())
    }

    pub fn report(&self) -> RunReport {
        let condition = match &self.state {
            RunState::Escalated { reason } => Some(reason.to_string()),
            RunState::Aborted { reason } => Some(reason.clone()),
            RunState::AwaitingInput { question, .. } => Some(question.clone()),
            _ => None,
        };
        RunReport {
            run_id: self.id.to_string(),
            workflow: self.workflow.clone(),
            state: self.state.as_str().to_string(),
            cursor: self.cursor.clone(),
            condition,
            spawns: self.guard.spawns(),
            spawn_budget: self.guard.spawn_budget(),
            history: self.log.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// RunReport
// ---------------------------------------------------------------------------

/// Operator-facing summary: the full history plus the ending condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub workflow: String,
    pub state: String,
    pub cursor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    pub spawns: u32,
    pub spawn_budget: u32,
    pub history: Vec<LogEntry>,
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "run {} ({}): {}", self.run_id, self.workflow, self.state)?;
        if let Some(condition) = &self.condition {
            writeln!(f, "  at step '{}': {condition}", self.cursor)?;
        }
        writeln!(f, "  spawns: {}/{}", self.spawns, self.spawn_budget)?;
        if self.history.is_empty() {
            return writeln!(f, "  (no steps ran)");
        }
        for e in &self.history {
            writeln!(
                f,
                "  {:>3}. {} #{}: {}",
                e.seq,
                e.key(),
                e.attempt,
                e.result.summary()
            )?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn run() -> WorkflowRun {
        WorkflowRun::new("fix", "reproduce", IterationGuard::new(BTreeMap::new(), 10))
    }

    #[test]
    fn visited_collapses_parallel_members() {
        let mut r = run();
        r.record("frame", None, 1, StepResult::completed("q"));
        r.record("arguments", Some("for".into()), 1, StepResult::completed("a"));
        r.record("arguments", Some("against".into()), 1, StepResult::completed("b"));
        r.record("judge", None, 1, StepResult::failed("tie"));
        r.record("arguments", Some("for".into()), 2, StepResult::completed("c"));
        r.record("arguments", Some("against".into()), 2, StepResult::completed("d"));
        assert_eq!(r.visited(), vec!["frame", "arguments", "judge", "arguments"]);
    }

    #[test]
    fn visited_keeps_consecutive_single_retries() {
        let mut r = run();
        r.record("reproduce", None, 1, StepResult::failed("x"));
        r.record("reproduce", None, 2, StepResult::failed("y"));
        assert_eq!(r.visited(), vec!["reproduce", "reproduce"]);
    }

    #[test]
    fn step_completed_uses_latest_attempt() {
        let mut r = run();
        r.record("fix-tests", Some("unit".into()), 1, StepResult::completed("ok"));
        r.record("fix-tests", Some("e2e".into()), 1, StepResult::failed("flaky"));
        assert!(!r.step_completed("fix-tests"));
        r.record("fix-tests", Some("unit".into()), 2, StepResult::completed("ok"));
        r.record("fix-tests", Some("e2e".into()), 2, StepResult::completed("ok"));
        assert!(r.step_completed("fix-tests"));
        assert!(!r.step_completed("never-ran"));
    }

    #[test]
    fn attempt_results_keep_latest_per_member() {
        let mut r = run();
        r.record("arguments", Some("for".into()), 1, StepResult::needs_input("which side?"));
        r.record("arguments", Some("against".into()), 1, StepResult::completed("no"));
        r.record("arguments", Some("for".into()), 1, StepResult::completed("yes"));
        let latest = r.attempt_results("arguments", 1);
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[&Some("for".to_string())], StepResult::completed("yes"));
        assert!(r.attempt_results("arguments", 2).is_empty());
    }

    #[test]
    fn terminal_transition_stamps_end_and_drops_answer() {
        let mut r = run();
        r.pending_answer = Some("v2".into());
        r.transition(RunState::Aborted {
            reason: "operator".into(),
        });
        assert!(r.is_terminal());
        assert!(r.ended_at.is_some());
        assert!(r.pending_answer.is_none());
    }

    #[test]
    fn report_lists_history_and_condition() {
        let mut r = run();
        r.record("reproduce", None, 1, StepResult::failed("no crash"));
        r.transition(RunState::Escalated {
            reason: HaltReason::LimitExceeded {
                tag: "reproduction".into(),
                ceiling: 2,
            },
        });
        let text = r.report().to_string();
        assert!(text.contains("escalated"));
        assert!(text.contains("loop 'reproduction' hit its ceiling of 2"));
        assert!(text.contains("reproduce #1: failed: no crash"));
    }

    #[test]
    fn run_yaml_roundtrip() {
        let mut r = run();
        r.record("reproduce", None, 1, StepResult::needs_input("which build?"));
        r.transition(RunState::AwaitingInput {
            step: "reproduce".into(),
            branch: None,
            question: "which build?".into(),
        });
        let yaml = serde_yaml::to_string(&r).unwrap();
        assert!(yaml.contains("state: awaiting_input"));
        let back: WorkflowRun = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.id, r.id);
        assert_eq!(back.state, r.state);
        assert_eq!(back.log, r.log);
    }

    #[test]
    fn halt_reason_from_errors() {
        let reason: HaltReason = ConductorError::UnknownOutcome {
            step: "clarify".into(),
            outcome: "complex".into(),
        }
        .into();
        assert_eq!(
            reason,
            HaltReason::UnknownOutcome {
                step: "clarify".into(),
                outcome: "complex".into()
            }
        );
    }
}
