use crate::output::{print_json, print_table};
use clap::Subcommand;
use conductor_core::run_store;
use std::path::Path;

#[derive(Subcommand)]
pub enum RunsSubcommand {
    /// List stored runs, oldest first
    List,

    /// Show a run's report (full history and ending condition)
    Show {
        /// Run id (or unique prefix)
        id: String,
    },
}

pub fn run(root: &Path, subcommand: RunsSubcommand, json: bool) -> anyhow::Result<()> {
    match subcommand {
        RunsSubcommand::List => list(root, json),
        RunsSubcommand::Show { id } => show(root, &id, json),
    }
}

fn list(root: &Path, json: bool) -> anyhow::Result<()> {
    let runs = run_store::list(root)?;
    if json {
        let reports: Vec<_> = runs.iter().map(|r| r.report()).collect();
        return print_json(&reports);
    }
    if runs.is_empty() {
        println!("no runs");
        return Ok(());
    }
    print_table(
        &["ID", "WORKFLOW", "STATE", "STEP", "STARTED"],
        runs.iter()
            .map(|r| {
                let id = r.id.to_string();
                vec![
                    id[..8].to_string(),
                    r.workflow.clone(),
                    r.state.to_string(),
                    r.cursor.clone(),
                    r.started_at.format("%Y-%m-%d %H:%M UTC").to_string(),
                ]
            })
            .collect(),
    );
    Ok(())
}

fn show(root: &Path, id: &str, json: bool) -> anyhow::Result<()> {
    let run = run_store::load(root, id)?;
    if json {
        return print_json(&run.report());
    }
    print!("{}", run.report());
    for (tag, used, ceiling) in run.guard.usage() {
        println!("  loop {tag}: {used}/{ceiling}");
    }
    if let Some(ended) = run.ended_at {
        println!("  ended: {}", ended.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    Ok(())
}
