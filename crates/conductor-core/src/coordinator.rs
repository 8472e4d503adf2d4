//! The workflow state machine.
//!
//! ```text
//!            ┌──────── Completed / Failed (guard ok) ────────┐
//!            ▼                                                │
//!   start → Running ──invoke delegate(s)──► interpret ────────┘
//!            │  ▲                             │
//!  NeedsInput│  │resume(answer)               ├─ successor = done ──► Completed
//!            ▼  │                             ├─ LimitExceeded ─────► Escalated
//!        AwaitingInput                        ├─ unavailable / integrity ► Escalated
//!            │                                └─ abort observed ────► Aborted
//!            └──── abort ──► Aborted
//! ```
//!
//! The coordinator owns no run state. Every operation takes the
//! `WorkflowRun` explicitly, and it is the only place errors from the
//! definition, the guard and the delegates are turned into transitions.

use crate::delegate::{DelegateRegistry, DelegateRequest};
use crate::error::{ConductorError, Result};
use crate::guard::IterationGuard;
use crate::run::{HaltReason, RunReport, RunState, WorkflowRun};
use crate::types::{StepResult, Target};
use crate::workflow::{Step, WorkflowDefinition};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// AbortSignal
// ---------------------------------------------------------------------------

/// Cooperative abort flag, observed at every suspension point.
///
/// Raising it never interrupts an in-flight delegate; the results it returns
/// are discarded and the run moves to `Aborted`.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub const ABORT_SIGNAL_REASON: &str = "abort signal received";

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct Coordinator<'a> {
    definition: &'a WorkflowDefinition,
    delegates: &'a DelegateRegistry,
    abort: AbortSignal,
}

impl<'a> Coordinator<'a> {
    pub fn new(definition: &'a WorkflowDefinition, delegates: &'a DelegateRegistry) -> Self {
        Self {
            definition,
            delegates,
            abort: AbortSignal::new(),
        }
    }

    pub fn with_abort_signal(mut self, signal: AbortSignal) -> Self {
        self.abort = signal;
        self
    }

    pub fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }

    /// Create a run positioned at the workflow's first step.
    pub fn start(&self, guard: IterationGuard) -> Result<WorkflowRun> {
        let first = self.definition.first_step()?;
        let run = WorkflowRun::new(&self.definition.name, &first.id, guard);
        tracing::info!(run = %run.id, workflow = %run.workflow, step = %run.cursor, "run started");
        Ok(run)
    }

    /// Drive `run` until it suspends for input or reaches a terminal state.
    pub async fn drive<'r>(&self, run: &'r mut WorkflowRun) -> &'r RunState {
        while run.state == RunState::Running {
            if self.abort.is_raised() {
                abort_run(run, ABORT_SIGNAL_REASON);
                break;
            }
            if let Err(reason) = self.step_once(run).await {
                escalate(run, reason);
            }
        }
        &run.state
    }

    /// Hand the operator's answer to the step that asked for it.
    pub fn resume(&self, run: &mut WorkflowRun, answer: impl Into<String>) -> Result<()> {
        let RunState::AwaitingInput { step, branch, .. } = &run.state else {
            return Err(ConductorError::InvalidRunState {
                run: run.id.to_string(),
                state: run.state.to_string(),
                expected: "awaiting_input".into(),
            });
        };
        // The cursor never moves while suspended; resume exactly where we stopped.
        run.cursor = step.clone();
        run.answer_for = branch.clone();
        run.pending_answer = Some(answer.into());
        run.transition(RunState::Running);
        tracing::info!(run = %run.id, step = %run.cursor, "run resumed");
        Ok(())
    }

    /// Abort a run that has not finished. A pending question is discarded.
    pub fn abort(&self, run: &mut WorkflowRun, reason: impl Into<String>) -> Result<()> {
        if run.is_terminal() {
            return Err(ConductorError::InvalidRunState {
                run: run.id.to_string(),
                state: run.state.to_string(),
                expected: "running or awaiting_input".into(),
            });
        }
        abort_run(run, &reason.into());
        Ok(())
    }

    pub fn report(&self, run: &WorkflowRun) -> RunReport {
        run.report()
    }

    // -----------------------------------------------------------------------
    // One step
    // -----------------------------------------------------------------------

    async fn step_once(&self, run: &mut WorkflowRun) -> std::result::Result<(), HaltReason> {
        let step = self.definition.step(&run.cursor)?;

        let missing: Vec<String> = step
            .needs
            .iter()
            .filter(|n| !run.step_completed(n))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(HaltReason::PreconditionUnmet {
                step: step.id.clone(),
                missing,
            });
        }

        let answer = run.pending_answer.take();
        let answer_for = run.answer_for.take();
        let resuming = answer.is_some();
        let attempt = if resuming {
            // Resuming continues the suspended attempt rather than starting a new one.
            run.attempts_at(&step.id).max(1)
        } else {
            if let Some(tag) = &step.loop_tag {
                let n = run.guard.record_attempt(tag)?;
                tracing::debug!(run = %run.id, loop_tag = %tag, attempt = n, "loop attempt recorded");
            }
            run.attempts_at(&step.id) + 1
        };

        // A resumed fan-out re-invokes only the member that asked; the others
        // keep their results from this attempt.
        let invocations: Vec<(Option<&str>, &str)> = step
            .invocations()
            .into_iter()
            .filter(|(branch, _)| match &answer_for {
                Some(asker) if resuming => *branch == Some(asker.as_str()),
                _ => true,
            })
            .collect();
        // The suspended attempt already paid for its invocations.
        if !resuming {
            run.guard.record_spawns(invocations.len() as u32)?;
        }

        let context = context_for(step, run);
        let requests: Vec<DelegateRequest> = invocations
            .iter()
            .map(|(branch, delegate)| DelegateRequest {
                run_id: run.id.to_string(),
                workflow: run.workflow.clone(),
                step: step.id.clone(),
                branch: branch.map(str::to_string),
                delegate: delegate.to_string(),
                intent: step.intent.clone(),
                attempt,
                context: context.clone(),
                answer: answer.clone(),
            })
            .collect();

        tracing::info!(
            run = %run.id,
            step = %step.id,
            attempt,
            invocations = requests.len(),
            "invoking delegates"
        );
        let outcomes = join_all(requests.iter().map(|req| self.invoke(req))).await;

        if self.abort.is_raised() {
            tracing::warn!(run = %run.id, step = %step.id, "abort observed, discarding results");
            abort_run(run, ABORT_SIGNAL_REASON);
            return Ok(());
        }

        let mut fresh = Vec::with_capacity(outcomes.len());
        for (req, outcome) in requests.iter().zip(outcomes) {
            fresh.push((req.branch.clone(), outcome?));
        }
        for (branch, result) in fresh {
            run.record(&step.id, branch, attempt, result);
        }

        let latest = run.attempt_results(&step.id, attempt);
        let results: Vec<(Option<String>, StepResult)> = step
            .invocations()
            .into_iter()
            .filter_map(|(branch, _)| {
                let branch = branch.map(str::to_string);
                latest.get(&branch).cloned().map(|r| (branch, r))
            })
            .collect();
        let asking = results
            .iter()
            .find(|(_, r)| matches!(r, StepResult::NeedsInput { .. }))
            .and_then(|(branch, _)| branch.clone());

        let joined = join_results(step, results);
        self.interpret(run, step, joined, asking)
    }

    async fn invoke(&self, request: &DelegateRequest) -> Result<StepResult> {
        let delegate = self.delegates.resolve(&request.delegate)?;
        delegate.invoke(request).await.map_err(|e| match e {
            unavailable @ ConductorError::DelegateUnavailable { .. } => unavailable,
            other => ConductorError::unavailable(&request.delegate, other.to_string()),
        })
    }

    fn interpret(
        &self,
        run: &mut WorkflowRun,
        step: &Step,
        result: StepResult,
        asking: Option<String>,
    ) -> std::result::Result<(), HaltReason> {
        let outcome = match &result {
            StepResult::NeedsInput { question } => {
                tracing::info!(run = %run.id, step = %step.id, branch = ?asking, "awaiting input");
                run.transition(RunState::AwaitingInput {
                    step: step.id.clone(),
                    branch: asking,
                    question: question.clone(),
                });
                return Ok(());
            }
            other => other.outcome().unwrap_or_default(),
        };

        match self.definition.successor(&step.id, outcome)? {
            Target::Done => {
                tracing::info!(run = %run.id, step = %step.id, "run completed");
                run.transition(RunState::Completed);
            }
            Target::Step(next) => {
                tracing::debug!(run = %run.id, from = %step.id, to = %next, outcome, "advancing");
                run.cursor = next;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn escalate(run: &mut WorkflowRun, reason: HaltReason) {
    tracing::warn!(run = %run.id, step = %run.cursor, %reason, "run escalated");
    run.transition(RunState::Escalated { reason });
}

fn abort_run(run: &mut WorkflowRun, reason: &str) {
    tracing::warn!(run = %run.id, step = %run.cursor, reason, "run aborted");
    run.transition(RunState::Aborted {
        reason: reason.to_string(),
    });
}

/// Latest results handed to a step: those of its `needs` when declared,
/// otherwise every step visited so far.
fn context_for(step: &Step, run: &WorkflowRun) -> BTreeMap<String, StepResult> {
    let latest = run.latest_results();
    if step.needs.is_empty() {
        return latest;
    }
    latest
        .into_iter()
        .filter(|(key, _)| {
            let owner = key.split('/').next().unwrap_or(key);
            step.needs.iter().any(|n| n == owner)
        })
        .collect()
}

/// Fold the results of one step's invocations into a single outcome.
///
/// The first open question (in declaration order) suspends the whole step;
/// otherwise any failure fails it; otherwise outputs are combined as a JSON
/// object keyed by member id.
fn join_results(step: &Step, results: Vec<(Option<String>, StepResult)>) -> StepResult {
    if !step.is_fan_out() {
        if let Some((_, only)) = results.into_iter().next() {
            return only;
        }
        return StepResult::failed("step produced no result");
    }

    if let Some((_, asked)) = results
        .iter()
        .find(|(_, r)| matches!(r, StepResult::NeedsInput { .. }))
    {
        return asked.clone();
    }

    let failures: Vec<String> = results
        .iter()
        .filter_map(|(branch, r)| match r {
            StepResult::Failed { reason } => {
                Some(format!("{}: {reason}", branch.as_deref().unwrap_or("?")))
            }
            _ => None,
        })
        .collect();
    if !failures.is_empty() {
        return StepResult::failed(failures.join("; "));
    }

    let mut outputs = serde_json::Map::new();
    let mut labels = Vec::new();
    for (branch, r) in results {
        if let StepResult::Completed { output, branch: label } = r {
            outputs.insert(branch.unwrap_or_default(), serde_json::Value::String(output));
            labels.push(label);
        }
    }
    // Members agreeing on a branch label carry it through; disagreement is
    // treated as no label.
    let label = match labels.split_first() {
        Some((first, rest)) if rest.iter().all(|l| l == first) => first.clone(),
        _ => None,
    };
    StepResult::Completed {
        output: serde_json::Value::Object(outputs).to_string(),
        branch: label,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
