use crate::output::print_json;
use anyhow::Context;
use clap::Subcommand;
use conductor_core::catalog::Catalog;
use conductor_core::config::{Config, DelegateBackend, WarnLevel};
use std::path::Path;

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Print the effective configuration
    Show,

    /// Validate the config for common mistakes
    Validate,
}

pub fn run(root: &Path, subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ConfigSubcommand::Show => show(root, json),
        ConfigSubcommand::Validate => validate(root, json),
    }
}

// ---------------------------------------------------------------------------
// show
// ---------------------------------------------------------------------------

fn show(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load_or_default(root).context("failed to load config")?;
    if json {
        return print_json(&config);
    }

    println!("Project:       {}", config.project.name);
    println!("Spawn budget:  {}", config.limits.spawn_budget);
    println!("Loop ceilings:");
    for (tag, ceiling) in &config.limits.loops {
        println!("  {tag:<20} {ceiling}");
    }
    for (name, over) in &config.workflows {
        println!("Workflow '{name}':");
        if let Some(budget) = over.spawn_budget {
            println!("  spawn budget         {budget}");
        }
        for (tag, ceiling) in &over.loops {
            println!("  {tag:<20} {ceiling}");
        }
    }
    println!("Default delegate:  {}", backend_display(&config.delegates.default));
    for (name, backend) in &config.delegates.named {
        println!("  {name:<20} {}", backend_display(backend));
    }
    Ok(())
}

fn backend_display(backend: &DelegateBackend) -> String {
    match backend {
        DelegateBackend::Command {
            program,
            args,
            timeout_secs,
            ..
        } => {
            let timeout = timeout_secs
                .map(|t| format!(", timeout: {t}s"))
                .unwrap_or_default();
            let line: Vec<&str> = std::iter::once(program.as_str())
                .chain(args.iter().map(String::as_str))
                .collect();
            format!("command ({}{timeout})", line.join(" "))
        }
        DelegateBackend::Script { path } => format!("script ({path})"),
        DelegateBackend::Human => "human".to_string(),
    }
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

fn validate(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let catalog = Catalog::load(root).context("failed to load workflows")?;
    let warnings = config.validate(&catalog.names());

    if json {
        print_json(&serde_json::json!({ "warnings": warnings }))?;
    } else if warnings.is_empty() {
        println!("Config is valid. No warnings.");
    } else {
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
    }

    if warnings.iter().any(|w| w.level == WarnLevel::Error) {
        anyhow::bail!("config validation found errors");
    }
    Ok(())
}
