//! # similar-issues CLI (`simi`)
//!
//! ## Usage
//!
//! ```bash
//! simi --config ./config/simi.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `simi init` | Create the SQLite database and run schema migrations |
//! | `simi index <owner/name>` | Index a repository (cold or warm pass) |
//! | `simi similar <owner/name>` | Find issues similar to a pull/merge request |
//! | `simi status <owner/name>` | Show the repository's index marker |
//!
//! Logs go to stderr (`RUST_LOG` controls the level); results go to stdout.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

use similar_issues::config;
use similar_issues::migrate;
use similar_issues::models::{Repository, SearchOutcome, TriggeringItem};
use similar_issues::retrieval::RetrievalService;

/// Find historical issues similar to a pull/merge request.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(name = "simi", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/simi.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database.
    Init,

    /// Bring a repository's index up to date.
    Index {
        /// Repository as `owner/name`.
        repository: String,

        /// Drop the repository's partition and re-index from scratch.
        #[arg(long)]
        force: bool,

        /// Stop starting new batches after this many seconds.
        #[arg(long)]
        deadline_secs: Option<u64>,
    },

    /// Search for issues similar to a pull/merge request.
    Similar {
        /// Repository as `owner/name`.
        repository: String,

        /// Title of the triggering pull/merge request.
        #[arg(long)]
        title: String,

        /// Description of the triggering pull/merge request.
        #[arg(long, default_value = "")]
        body: String,

        /// Number of the triggering item; its own issue is never a hit.
        #[arg(long)]
        number: Option<u64>,

        /// Reference results are reported against (defaults to `#<number>`).
        #[arg(long)]
        reference: Option<String>,

        /// Stop starting new indexing batches after this many seconds.
        #[arg(long)]
        deadline_secs: Option<u64>,

        /// Print the result as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show a repository's index state.
    Status {
        /// Repository as `owner/name`.
        repository: String,
    },
}

fn deadline(secs: Option<u64>) -> Option<Instant> {
    secs.map(|s| Instant::now() + Duration::from_secs(s))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Index {
            repository,
            force,
            deadline_secs,
        } => {
            let repo: Repository = repository.parse()?;
            cfg.index.force_rebuild |= force;
            let service = RetrievalService::from_config(&cfg).await?;
            let report = service
                .ensure_index(&repo, deadline(deadline_secs))
                .await
                .with_context(|| format!("indexing {} failed", repo))?;

            match report {
                Some(report) => {
                    println!("partition:  {}", report.partition);
                    println!("path:       {:?}", report.path);
                    println!("fetched:    {}", report.fetched);
                    println!("embedded:   {}", report.embedded);
                    println!("batches:    {}", report.committed_batches);
                    match report.highest_seen {
                        Some(highest) => println!("highest id: {}", highest),
                        None => println!("highest id: -"),
                    }
                    if let Some(failure) = &report.failure {
                        println!("incomplete: {}", failure);
                    } else if report.deadline_hit {
                        println!("incomplete: deadline reached");
                    }
                }
                None => println!("Another indexing pass is still running."),
            }
        }
        Commands::Similar {
            repository,
            title,
            body,
            number,
            reference,
            deadline_secs,
            json,
        } => {
            let repo: Repository = repository.parse()?;
            let trigger = TriggeringItem {
                reference: reference
                    .or_else(|| number.map(|n| format!("#{}", n)))
                    .unwrap_or_else(|| "(unsaved)".to_string()),
                number,
                title,
                description: body,
            };
            let service = RetrievalService::from_config(&cfg).await?;
            let outcome = service
                .search(&repo, &trigger, deadline(deadline_secs))
                .await?;

            match (&outcome, json) {
                (SearchOutcome::Found(result), true) => {
                    println!("{}", serde_json::to_string_pretty(result)?);
                }
                (SearchOutcome::Found(result), false) => {
                    println!("{}", outcome.message());
                    for (i, hit) in result.hits.iter().enumerate() {
                        println!(
                            "{}. [{:.3}] {} {} ({})",
                            i + 1,
                            hit.score,
                            hit.reference,
                            hit.title,
                            hit.level.as_str()
                        );
                        if let Some(url) = &hit.url {
                            println!("   {}", url);
                        }
                    }
                }
                (_, true) => {
                    let empty = serde_json::json!({
                        "trigger": trigger.reference,
                        "hits": [],
                        "message": outcome.message(),
                    });
                    println!("{}", empty);
                }
                (_, false) => println!("{}", outcome.message()),
            }

            if matches!(outcome, SearchOutcome::Unavailable { .. }) {
                std::process::exit(2);
            }
        }
        Commands::Status { repository } => {
            let repo: Repository = repository.parse()?;
            let service = RetrievalService::from_config(&cfg).await?;
            let status = service.status(&repo).await?;
            println!("partition:  {}", status.partition);
            println!("backend:    {}", status.backend);
            match status.collection_dimension {
                Some(dim) => println!("dimension:  {}", dim),
                None => println!("dimension:  (no collection)"),
            }
            match status.marker {
                Some(marker) => {
                    println!("indexed:    {}", marker.indexed);
                    match marker.highest_seen {
                        Some(highest) => println!("highest id: {}", highest),
                        None => println!("highest id: -"),
                    }
                    println!("updated:    {}", marker.last_indexed_at.to_rfc3339());
                }
                None => println!("indexed:    false"),
            }
        }
    }

    Ok(())
}
