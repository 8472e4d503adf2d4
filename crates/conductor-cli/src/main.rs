mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{
    config::ConfigSubcommand, escalation::EscalationSubcommand, runs::RunsSubcommand,
    workflow::WorkflowSubcommand,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "conductor",
    about = "Deterministic workflow coordinator: drive multi-step workflows through external delegates",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .conductor/ or .git/)
    #[arg(long, global = true, env = "CONDUCTOR_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize conductor in the current project
    Init,

    /// Inspect and validate workflow definitions
    Workflow {
        #[command(subcommand)]
        subcommand: WorkflowSubcommand,
    },

    /// Start a workflow run and drive it until it finishes or needs input
    Run {
        /// Workflow name (built-in or .conductor/workflows/<name>.yaml)
        workflow: String,

        /// Replay delegate outcomes from a YAML script instead of the configured backends
        #[arg(long)]
        script: Option<PathBuf>,

        /// Park the run instead of prompting when a step needs input
        #[arg(long)]
        no_input: bool,
    },

    /// Answer the question a parked run is waiting on and keep driving it
    Resume {
        /// Run id (or unique prefix)
        id: String,

        /// Answer handed to the waiting step
        #[arg(long)]
        answer: String,

        /// Replay delegate outcomes from a YAML script (entries already consumed are skipped)
        #[arg(long)]
        script: Option<PathBuf>,

        /// Park the run again instead of prompting on the next question
        #[arg(long)]
        no_input: bool,
    },

    /// Abort a run that has not finished
    Abort {
        /// Run id (or unique prefix)
        id: String,

        #[arg(long, default_value = "aborted by operator")]
        reason: String,
    },

    /// List and inspect stored runs
    Runs {
        #[command(subcommand)]
        subcommand: RunsSubcommand,
    },

    /// Human escalation queue
    Escalation {
        #[command(subcommand)]
        subcommand: EscalationSubcommand,
    },

    /// Show and validate the project configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Run { .. } | Commands::Resume { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    // Logs go to stderr so --json output on stdout stays parseable.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root).map(|_| 0),
        Commands::Workflow { subcommand } => cmd::workflow::run(&root, subcommand, cli.json).map(|_| 0),
        Commands::Run {
            workflow,
            script,
            no_input,
        } => cmd::run::start(&root, &workflow, script.as_deref(), !no_input, cli.json),
        Commands::Resume {
            id,
            answer,
            script,
            no_input,
        } => cmd::run::resume(&root, &id, &answer, script.as_deref(), !no_input, cli.json),
        Commands::Abort { id, reason } => cmd::run::abort(&root, &id, &reason, cli.json),
        Commands::Runs { subcommand } => cmd::runs::run(&root, subcommand, cli.json).map(|_| 0),
        Commands::Escalation { subcommand } => {
            cmd::escalation::run(&root, subcommand, cli.json).map(|_| 0)
        }
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json).map(|_| 0),
    };

    match result {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(e) => {
            // Print the full error chain (anyhow's alternate Display)
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    }
}
