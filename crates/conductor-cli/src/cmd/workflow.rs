use crate::output::{print_json, print_table, truncate};
use anyhow::Context;
use clap::Subcommand;
use conductor_core::catalog::Catalog;
use conductor_core::workflow::WorkflowDefinition;
use std::path::{Path, PathBuf};

#[derive(Subcommand)]
pub enum WorkflowSubcommand {
    /// List built-in and project workflows
    List,

    /// Print a workflow definition as YAML
    Show { name: String },

    /// Check a workflow file without installing it
    Validate { file: PathBuf },
}

pub fn run(root: &Path, subcommand: WorkflowSubcommand, json: bool) -> anyhow::Result<()> {
    match subcommand {
        WorkflowSubcommand::List => list(root, json),
        WorkflowSubcommand::Show { name } => show(root, &name, json),
        WorkflowSubcommand::Validate { file } => validate(&file, json),
    }
}

fn list(root: &Path, json: bool) -> anyhow::Result<()> {
    let catalog = Catalog::load(root).context("failed to load workflows")?;
    if json {
        let entries: Vec<_> = catalog
            .iter()
            .map(|(d, source)| {
                serde_json::json!({
                    "name": d.name,
                    "source": source.to_string(),
                    "steps": d.steps.len(),
                    "description": d.description,
                })
            })
            .collect();
        return print_json(&entries);
    }
    print_table(
        &["NAME", "SOURCE", "STEPS", "DESCRIPTION"],
        catalog
            .iter()
            .map(|(d, source)| {
                vec![
                    d.name.clone(),
                    source.to_string(),
                    d.steps.len().to_string(),
                    truncate(&d.description, 60),
                ]
            })
            .collect(),
    );
    Ok(())
}

fn show(root: &Path, name: &str, json: bool) -> anyhow::Result<()> {
    let catalog = Catalog::load(root).context("failed to load workflows")?;
    let definition = catalog.get(name)?;
    if json {
        print_json(definition)
    } else {
        print!("{}", definition.to_yaml()?);
        Ok(())
    }
}

fn validate(file: &Path, json: bool) -> anyhow::Result<()> {
    let definition = WorkflowDefinition::load(file)
        .with_context(|| format!("{} is not a valid workflow", file.display()))?;
    if json {
        print_json(&serde_json::json!({
            "name": definition.name,
            "steps": definition.steps.len(),
            "valid": true,
        }))
    } else {
        println!(
            "workflow '{}' is valid ({} steps)",
            definition.name,
            definition.steps.len()
        );
        Ok(())
    }
}
