//! # Context Bundler CLI (`ctxb`)
//!
//! The `ctxb` binary builds, inspects and serves cached context bundles.
//!
//! ## Usage
//!
//! ```bash
//! ctxb --config ./config/ctxb.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ctxb init` | Create the SQLite database and run schema migrations |
//! | `ctxb get <project> <type>` | Print the bundle, building it if needed |
//! | `ctxb build <project> <type>` | Trigger a build (`--now` skips the debounce) |
//! | `ctxb status <project> <type>` | Show build status and metadata |
//! | `ctxb overflow <project> <type>` | Show the ranked budget report |
//! | `ctxb select <project> <type> --id ...` | Store a manual selection |
//! | `ctxb clear <project> <type>` | Drop the cached bundle |
//! | `ctxb cleanup` | Purge old cache entries |
//! | `ctxb serve` | Start the HTTP server |
//! | `ctxb completions <shell>` | Print shell completions |
//!
//! Logging goes to stderr and is controlled with `RUST_LOG`
//! (default `info`).

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use context_bundler::{commands, config, migrate, server};

/// Context Bundler: priority-ranked, token-budgeted context bundles for
/// document generation.
#[derive(Parser)]
#[command(
    name = "ctxb",
    about = "Context Bundler: cached, token-budgeted context bundles",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ctxb.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Print the context bundle for a project and document type.
    ///
    /// Builds the bundle first when none is cached, the cached one is stale,
    /// or `--force` is given.
    Get {
        project: String,
        document_type: String,

        /// Rebuild even if a fresh bundle is cached.
        #[arg(long)]
        force: bool,

        /// Seconds to wait for a build (defaults to debounce + build timeout).
        #[arg(long)]
        wait: Option<u64>,

        /// Print the full response as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Trigger a build.
    Build {
        project: String,
        document_type: String,

        /// Build immediately instead of after the debounce delay.
        #[arg(long)]
        now: bool,
    },

    /// Show build status, age and metadata.
    Status {
        project: String,
        document_type: String,
    },

    /// Report which documents fit a model's context budget.
    Overflow {
        project: String,
        document_type: String,

        /// Model category (defaults to `models.default`).
        #[arg(long)]
        model: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Store a bundle made of exactly the given documents.
    Select {
        project: String,
        document_type: String,

        /// Document id to include (repeatable).
        #[arg(long = "id", required = true)]
        ids: Vec<String>,

        #[arg(long)]
        model: Option<String>,
    },

    /// Drop the cached bundle; the next `get` rebuilds it.
    Clear {
        project: String,
        document_type: String,
    },

    /// Purge cache entries older than the given age.
    Cleanup {
        /// Defaults to `cache.cleanup_max_age_hours`.
        #[arg(long)]
        max_age_hours: Option<u64>,
    },

    /// Start the HTTP server on `server.bind`.
    Serve,

    /// Print shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // Commands that don't require config
    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "ctxb", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Get {
            project,
            document_type,
            force,
            wait,
            json,
        } => {
            commands::run_get(&cfg, &project, &document_type, force, wait, json).await?;
        }
        Commands::Build {
            project,
            document_type,
            now,
        } => {
            commands::run_build(&cfg, &project, &document_type, now).await?;
        }
        Commands::Status {
            project,
            document_type,
        } => {
            commands::run_status(&cfg, &project, &document_type).await?;
        }
        Commands::Overflow {
            project,
            document_type,
            model,
            json,
        } => {
            commands::run_overflow(&cfg, &project, &document_type, model.as_deref(), json).await?;
        }
        Commands::Select {
            project,
            document_type,
            ids,
            model,
        } => {
            commands::run_select(&cfg, &project, &document_type, &ids, model.as_deref()).await?;
        }
        Commands::Clear {
            project,
            document_type,
        } => {
            commands::run_clear(&cfg, &project, &document_type).await?;
        }
        Commands::Cleanup { max_age_hours } => {
            commands::run_cleanup(&cfg, max_age_hours).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Completions { .. } => unreachable!(),
    }

    Ok(())
}
