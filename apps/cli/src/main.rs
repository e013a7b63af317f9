//! rangefetch CLI - resumable multi-connection downloads from the terminal
//!
//! Thin front-end over `rangefetch-core`: loads the JSON config file, applies
//! command-line overrides and drives a `DownloadManager`.

mod commands;
mod config;
mod output;
mod progress;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// rangefetch - resumable multi-connection HTTP downloads
#[derive(Parser)]
#[command(name = "rangefetch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to the JSON config file
    #[arg(long, env = "RANGEFETCH_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, value_enum, default_value = "human", global = true)]
    format: OutputFormat,

    /// Verbose engine logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Human,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a file
    Get {
        /// URL to download
        url: String,

        /// Output file or directory (defaults to the remote filename in the current directory)
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        overrides: Overrides,
    },

    /// Probe URLs for size, range support and validators
    Probe {
        /// URLs to probe
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Show the chunk layout a download would use
    Plan {
        /// URL to plan
        url: String,

        #[command(flatten)]
        overrides: Overrides,
    },

    /// Show or create the config file
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand, Clone, Copy)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show,

    /// Print the config file location
    Path,

    /// Write a config file with the defaults
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Per-invocation overrides on top of the config file
#[derive(Args, Debug, Default, Clone)]
pub struct Overrides {
    /// Number of parallel connections
    #[arg(short, long)]
    threads: Option<u32>,

    /// Chunk size, e.g. 4M or 512K
    #[arg(long, value_parser = config::parse_size)]
    chunk_size: Option<u64>,

    /// Read buffer size, e.g. 64K
    #[arg(long, value_parser = config::parse_size)]
    buffer_size: Option<u64>,

    /// Retries per chunk
    #[arg(long)]
    retries: Option<u32>,

    /// Request timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Speed limit per second, e.g. 2M (0 = unlimited)
    #[arg(short, long, value_parser = config::parse_size)]
    limit: Option<u64>,

    /// Start over instead of resuming a partial download
    #[arg(long)]
    no_resume: bool,

    /// Don't size the temp file up front
    #[arg(long)]
    no_preallocate: bool,

    /// Pick concurrency from file size and split slow chunks
    #[arg(long)]
    adaptive: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config_path = cli.config.clone().or_else(config::default_path);

    match cli.command {
        Commands::Get {
            url,
            output,
            overrides,
        } => {
            let config = config::load(config_path.as_deref(), &overrides)?;
            commands::get(&url, output, config, cli.format).await?
        }

        Commands::Probe { urls } => commands::probe_urls(urls, cli.format).await?,

        Commands::Plan { url, overrides } => {
            let config = config::load(config_path.as_deref(), &overrides)?;
            commands::plan(&url, config, cli.format).await?
        }

        Commands::Config { action } => commands::config_action(
            action.unwrap_or(ConfigAction::Show),
            config_path.as_deref(),
            cli.format,
        )?,

        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "rangefetch",
                &mut std::io::stdout(),
            );
        }
    }

    Ok(())
}

/// Log to stderr so progress bars and JSON stay on stdout
fn init_tracing(verbose: bool) {
    let default_level = if verbose {
        "warn,rangefetch_core=debug"
    } else {
        "warn"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .try_init();
}
