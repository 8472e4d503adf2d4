//! `run`, `resume` and `abort`: the commands that move a run through its
//! states, plus the terminal side of the human-in-the-loop boundary.

use crate::output::print_json;
use anyhow::Context;
use conductor_core::catalog::Catalog;
use conductor_core::config::Config;
use conductor_core::coordinator::{AbortSignal, Coordinator, ABORT_SIGNAL_REASON};
use conductor_core::delegate::{DelegateRegistry, ScriptedDelegate};
use conductor_core::escalation::{self, EscalationItem};
use conductor_core::run::{RunState, WorkflowRun};
use conductor_core::run_store;
use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::Arc;

pub const EXIT_ESCALATED: i32 = 2;
pub const EXIT_AWAITING_INPUT: i32 = 3;
pub const EXIT_ABORTED: i32 = 4;

pub fn exit_code(state: &RunState) -> i32 {
    match state {
        RunState::Running | RunState::Completed => 0,
        RunState::Escalated { .. } => EXIT_ESCALATED,
        RunState::AwaitingInput { .. } => EXIT_AWAITING_INPUT,
        RunState::Aborted { .. } => EXIT_ABORTED,
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

pub fn start(
    root: &Path,
    workflow: &str,
    script: Option<&Path>,
    allow_input: bool,
    json: bool,
) -> anyhow::Result<i32> {
    let config = Config::load_or_default(root).context("failed to load config")?;
    let catalog = Catalog::load(root).context("failed to load workflows")?;
    let definition = catalog.get(workflow)?;
    let registry = registry(root, &config, script, None)?;

    let coordinator = Coordinator::new(definition, &registry);
    let mut run = coordinator.start(config.guard_for(definition))?;
    run_store::save(root, &run).context("failed to save run")?;
    if !json {
        println!("run {} started ({})", run.id, run.workflow);
    }

    drive(root, coordinator, &mut run, allow_input)?;
    finish(root, &run, json)
}

pub fn resume(
    root: &Path,
    id: &str,
    answer: &str,
    script: Option<&Path>,
    allow_input: bool,
    json: bool,
) -> anyhow::Result<i32> {
    let mut run = run_store::load(root, id)?;
    let config = Config::load_or_default(root).context("failed to load config")?;
    let catalog = Catalog::load(root).context("failed to load workflows")?;
    let definition = catalog.get(&run.workflow)?;
    let registry = registry(root, &config, script, Some(&run))?;

    let coordinator = Coordinator::new(definition, &registry);
    coordinator.resume(&mut run, answer)?;
    run_store::save(root, &run).context("failed to save run")?;

    drive(root, coordinator, &mut run, allow_input)?;
    finish(root, &run, json)
}

pub fn abort(root: &Path, id: &str, reason: &str, json: bool) -> anyhow::Result<i32> {
    let mut run = run_store::load(root, id)?;
    let catalog = Catalog::load(root).context("failed to load workflows")?;
    let definition = catalog.get(&run.workflow)?;
    let registry = DelegateRegistry::new();

    Coordinator::new(definition, &registry).abort(&mut run, reason)?;
    run_store::save(root, &run).context("failed to save run")?;
    finish(root, &run, json)
}

// ---------------------------------------------------------------------------
// Driving
// ---------------------------------------------------------------------------

/// Delegates for this invocation: a replay script when given, otherwise the
/// configured backends. A resumed script skips what the run already consumed.
fn registry(
    root: &Path,
    config: &Config,
    script: Option<&Path>,
    resumed: Option<&WorkflowRun>,
) -> anyhow::Result<DelegateRegistry> {
    let Some(path) = script else {
        return DelegateRegistry::from_config(config, root).context("failed to build delegates");
    };
    let scripted = ScriptedDelegate::load(path)
        .with_context(|| format!("failed to load script {}", path.display()))?;
    if let Some(run) = resumed {
        scripted.fast_forward(&run.log);
    }
    Ok(DelegateRegistry::new().with_fallback(Arc::new(scripted)))
}

enum Prompt {
    Answer(String),
    Closed,
    Interrupted,
}

fn drive(
    root: &Path,
    coordinator: Coordinator<'_>,
    run: &mut WorkflowRun,
    allow_input: bool,
) -> anyhow::Result<()> {
    let signal = AbortSignal::new();
    let coordinator = coordinator.with_abort_signal(signal.clone());
    let rt = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    let result = rt.block_on(drive_until_parked(root, &coordinator, run, allow_input, signal));
    // A prompt thread may still be blocked on stdin; don't wait for it.
    rt.shutdown_background();
    result
}

async fn drive_until_parked(
    root: &Path,
    coordinator: &Coordinator<'_>,
    run: &mut WorkflowRun,
    allow_input: bool,
    signal: AbortSignal,
) -> anyhow::Result<()> {
    let watcher = signal.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, aborting after the current step");
            watcher.raise();
        }
    });

    loop {
        coordinator.drive(run).await;
        run_store::save(root, run).context("failed to save run")?;

        let RunState::AwaitingInput { question, .. } = &run.state else {
            return Ok(());
        };
        if !allow_input {
            return Ok(());
        }
        match prompt(question.clone(), &signal).await? {
            Prompt::Answer(answer) => coordinator.resume(run, answer)?,
            Prompt::Closed => return Ok(()),
            Prompt::Interrupted => {
                coordinator.abort(run, ABORT_SIGNAL_REASON)?;
                run_store::save(root, run).context("failed to save run")?;
                return Ok(());
            }
        }
    }
}

async fn prompt(question: String, signal: &AbortSignal) -> anyhow::Result<Prompt> {
    let read = tokio::task::spawn_blocking(move || -> std::io::Result<Option<String>> {
        let mut stderr = std::io::stderr();
        writeln!(stderr, "\n? {question}")?;
        write!(stderr, "> ")?;
        stderr.flush()?;
        let mut line = String::new();
        let n = std::io::stdin().lock().read_line(&mut line)?;
        Ok((n > 0).then(|| line.trim().to_string()))
    });

    tokio::select! {
        line = read => {
            if signal.is_raised() {
                return Ok(Prompt::Interrupted);
            }
            Ok(match line.context("prompt task failed")?? {
                Some(answer) => Prompt::Answer(answer),
                None => Prompt::Closed,
            })
        }
        _ = tokio::signal::ctrl_c() => Ok(Prompt::Interrupted),
    }
}

// ---------------------------------------------------------------------------
// Reporting
// ---------------------------------------------------------------------------

fn finish(root: &Path, run: &WorkflowRun, json: bool) -> anyhow::Result<i32> {
    let escalation: Option<EscalationItem> = match run.state {
        RunState::Escalated { .. } => {
            Some(escalation::create_from_run(root, run).context("failed to file escalation")?)
        }
        _ => None,
    };

    if json {
        print_json(&serde_json::json!({
            "report": run.report(),
            "escalation": escalation,
        }))?;
        return Ok(exit_code(&run.state));
    }

    print!("{}", run.report());
    match &run.state {
        RunState::AwaitingInput { .. } => {
            println!(
                "\nrun parked: conductor resume {} --answer \"...\"",
                run.id
            );
        }
        RunState::Escalated { .. } => {
            if let Some(item) = &escalation {
                println!("\nescalation {} filed: {}", item.id, item.title);
            }
        }
        _ => {}
    }
    Ok(exit_code(&run.state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::run::HaltReason;

    #[test]
    fn exit_codes_by_state() {
        assert_eq!(exit_code(&RunState::Completed), 0);
        assert_eq!(
            exit_code(&RunState::Escalated {
                reason: HaltReason::Internal {
                    message: "x".into()
                }
            }),
            EXIT_ESCALATED
        );
        assert_eq!(
            exit_code(&RunState::AwaitingInput {
                step: "s".into(),
                branch: None,
                question: "q".into()
            }),
            EXIT_AWAITING_INPUT
        );
        assert_eq!(
            exit_code(&RunState::Aborted {
                reason: "r".into()
            }),
            EXIT_ABORTED
        );
    }
}
