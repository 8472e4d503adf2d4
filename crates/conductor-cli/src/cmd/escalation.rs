use crate::output::{print_json, print_table, truncate};
use clap::Subcommand;
use conductor_core::escalation::{self, StatusFilter};
use std::path::Path;

// ---------------------------------------------------------------------------
// Subcommand tree
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum EscalationSubcommand {
    /// List escalations (default: open only)
    List {
        /// Filter by status: open | resolved | all
        #[arg(long, default_value = "open")]
        status: String,
    },

    /// Show details of a single escalation
    Show {
        /// Escalation ID (e.g. E1)
        id: String,
    },

    /// Resolve an escalation with a note
    Resolve {
        /// Escalation ID (e.g. E1)
        id: String,

        /// Human-readable resolution notes
        resolution: String,
    },
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(root: &Path, subcommand: EscalationSubcommand, json: bool) -> anyhow::Result<()> {
    match subcommand {
        EscalationSubcommand::List { status } => {
            let filter: StatusFilter = status.parse()?;
            let items = escalation::list(root, filter)?;
            if json {
                return print_json(&items);
            }
            if items.is_empty() {
                println!("no escalations (status: {status})");
                return Ok(());
            }
            print_table(
                &["ID", "KIND", "STATUS", "RUN", "TITLE"],
                items
                    .iter()
                    .map(|e| {
                        vec![
                            e.id.clone(),
                            e.kind.to_string(),
                            e.status.to_string(),
                            e.run_id.chars().take(8).collect(),
                            truncate(&e.title, 60),
                        ]
                    })
                    .collect(),
            );
            Ok(())
        }

        EscalationSubcommand::Show { id } => {
            let item = escalation::get(root, &id)?;
            if json {
                return print_json(&item);
            }
            println!("ID:       {}", item.id);
            println!("Kind:     {}", item.kind);
            println!("Status:   {}", item.status);
            println!("Run:      {} ({})", item.run_id, item.workflow);
            println!("Step:     {}", item.step);
            println!("Title:    {}", item.title);
            println!("Created:  {}", item.created_at.format("%Y-%m-%d %H:%M UTC"));
            if let Some(res) = &item.resolution {
                println!("Resolved: {res}");
            }
            println!("\n{}", item.context.trim_end());
            Ok(())
        }

        EscalationSubcommand::Resolve { id, resolution } => {
            let item = escalation::resolve(root, &id, &resolution)?;
            if json {
                print_json(&item)?;
            } else {
                println!("resolved escalation {}", item.id);
            }
            Ok(())
        }
    }
}
