mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::run::RunExit;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "sequencer",
    about = "Timed test-step sequencer: run Setup, During and Post steps against a time reference",
    version,
    propagate_version = true
)]
struct Cli {
    /// Working root (default: nearest directory with sequencer.yaml, else cwd)
    #[arg(long, global = true, env = "SEQUENCER_ROOT")]
    root: Option<PathBuf>,

    /// Config file (default: <root>/sequencer.yaml)
    #[arg(long, global = true, env = "SEQUENCER_CONFIG")]
    config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    /// Log step results and section changes
    #[arg(long, global = true, short = 'v')]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a sequence file
    Run {
        /// Sequence file (.json, .yaml, .yml)
        file: Option<PathBuf>,

        /// Run the most recently used sequence
        #[arg(long, conflicts_with = "file")]
        previous: bool,
    },

    /// Load a sequence and check its timeline without running anything
    Validate {
        /// Sequence file (.json, .yaml, .yml)
        file: PathBuf,
    },

    /// List previously run sequences
    History {
        /// Forget all previous sequences
        #[arg(long)]
        clear: bool,
    },

    /// Show the effective configuration and its warnings
    Config,
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());
    let config = cli.config.as_deref();

    let result = match cli.command {
        Commands::Run { file, previous } => {
            cmd::run::run(&root, config, file.as_deref(), previous, cli.json)
        }
        Commands::Validate { file } => cmd::validate::run(&root, config, &file, cli.json),
        Commands::History { clear } => cmd::history::run(&root, config, clear, cli.json),
        Commands::Config => cmd::config::run(&root, config, cli.json),
    };

    if let Err(e) = result {
        if let Some(exit) = e.downcast_ref::<RunExit>() {
            eprintln!("{exit}");
            std::process::exit(exit.exit_code());
        }
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
