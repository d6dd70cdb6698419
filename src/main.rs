//! # catalog-sync CLI (`catsync`)
//!
//! The `catsync` binary drives the acquisition pipeline: database setup,
//! delta syncs per source, health inspection, and one-off media resolution.
//!
//! ## Usage
//!
//! ```bash
//! catsync --config ./config/catsync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `catsync init` | Create the SQLite database and run schema migrations |
//! | `catsync sources` | List configured sources and their health |
//! | `catsync sync <all\|source>` | Delta-sync one source or all of them |
//! | `catsync health` | Show, purge or reset per-source health |
//! | `catsync get <id>` | Print one stored item |
//! | `catsync stats` | Item counts, cursors and health summary |
//! | `catsync resolve <page-url>` | Resolve a page to playable media URLs |
//! | `catsync cdn <slug>` | Print CDN URLs derived from a slug |
//! | `catsync clear` | Delete every stored item and cursor |
//!
//! Reports go to stdout; logs and progress go to stderr. `RUST_LOG`
//! controls log verbosity (default `info`).

use std::path::PathBuf;

use anyhow::bail;
use catalog_sync::cdn::{cdn_links, CdnQuery, CdnUrlBuilder};
use catalog_sync::config::{self, Config};
use catalog_sync::ingest::{self, SyncOptions};
use catalog_sync::models::ContentSource;
use catalog_sync::progress::ProgressMode;
use catalog_sync::resolve::{self, ResolveMode};
use catalog_sync::store::{CatalogStore, SqliteStore};
use catalog_sync::{get, health, migrate, sources, stats};
use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// catalog-sync: incremental content acquisition for video-catalog sites.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/catsync.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "catsync",
    about = "catalog-sync: incremental content acquisition for video-catalog websites",
    version,
    long_about = "catalog-sync reduces REST, sitemap-only, plain HTML and members-only catalog \
    sites to one canonical item model and keeps a local SQLite store in step with them using \
    per-source delta cursors. Every outbound URL is checked against a domain allow-list and \
    must use HTTPS."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/catsync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite file and the item, cursor and health tables.
    /// Safe to run repeatedly.
    Init,

    /// List configured sources and their health.
    Sources,

    /// Delta-sync content from one source or from all of them.
    ///
    /// Only items whose modified (or, failing that, published) timestamp is
    /// after the source's cursor are stored. The cursor moves only when the
    /// pass finished without errors.
    Sync {
        /// `all`, or a source: `api`, `sitemap`, `scraper`, `authenticated`.
        source: String,

        /// Ignore the cursor and consider every fetched item.
        #[arg(long)]
        full: bool,

        /// Fetch and select without writing to the database.
        #[arg(long)]
        dry_run: bool,

        /// Store at most this many items per source.
        #[arg(long)]
        limit: Option<usize>,

        /// Print reports as JSON.
        #[arg(long)]
        json: bool,

        /// Progress on stderr: `auto` (human when stderr is a TTY), `off`, `human`, `json`.
        #[arg(long, default_value = "auto", value_parser = ["auto", "off", "human", "json"])]
        progress: String,
    },

    /// Show per-source health.
    Health {
        /// Delete records with no activity inside the retention window first.
        #[arg(long)]
        purge: bool,

        /// Zero the record of one source first.
        #[arg(long)]
        reset: Option<String>,

        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Print a stored item by id.
    Get {
        id: i64,

        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show store statistics.
    Stats,

    /// Resolve a content page to gate-approved media URLs.
    ///
    /// Without flags, looks for an `.mp4` on the CDN host.
    Resolve {
        page_url: String,

        /// Look for an `.m3u8` live stream instead.
        #[arg(long, conflicts_with = "player")]
        live: bool,

        /// Submit the page's player form and collect every source.
        #[arg(long)]
        player: bool,

        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Print CDN URLs derived from a page slug.
    ///
    /// Defaults to the series poster.
    Cdn {
        slug: String,

        /// Episode URL and thumbnail for episode N.
        #[arg(long, value_name = "N", conflicts_with = "movie")]
        episode: Option<u32>,

        /// Movie URL and poster.
        #[arg(long)]
        movie: bool,

        /// Only the poster (or thumbnail).
        #[arg(long)]
        poster: bool,
    },

    /// Delete every stored item and sync cursor.
    ///
    /// The next sync of each source will be a full one. Health is kept.
    Clear,
}

fn progress_mode(flag: &str) -> ProgressMode {
    match flag {
        "off" => ProgressMode::Off,
        "human" => ProgressMode::Human,
        "json" => ProgressMode::Json,
        _ => ProgressMode::default_for_tty(),
    }
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

    // Commands that don't require config
    if let Commands::Cdn {
        slug,
        episode,
        movie,
        poster,
    } = &cli.command
    {
        let base = config::load_config(&cli.config)
            .map(|cfg| cfg.cdn.base_url)
            .unwrap_or_else(|_| config::CdnConfig::default().base_url);
        let query = CdnQuery {
            episode: *episode,
            movie: *movie,
            poster_only: *poster,
        };
        for (label, url) in cdn_links(&CdnUrlBuilder::new(&base), slug, query) {
            println!("{:<10} {}", label, url);
        }
        return Ok(());
    }

    let cfg: Config = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sources => {
            sources::list_sources(&cfg).await?;
        }
        Commands::Sync {
            source,
            full,
            dry_run,
            limit,
            json,
            progress,
        } => {
            let options = SyncOptions {
                full,
                dry_run,
                limit,
            };
            let mode = progress_mode(&progress);
            tokio::select! {
                result = ingest::run_sync(&cfg, &source, options, mode, json) => result?,
                _ = tokio::signal::ctrl_c() => {
                    warn!("interrupted, in-flight sync cancelled; cursors left unadvanced");
                    bail!("sync interrupted");
                }
            }
        }
        Commands::Health { purge, reset, json } => {
            let reset = reset
                .as_deref()
                .map(str::parse::<ContentSource>)
                .transpose()?;
            health::run_health(&cfg, purge, reset, json).await?;
        }
        Commands::Get { id, json } => {
            get::run_get(&cfg, id, json).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Resolve {
            page_url,
            live,
            player,
            json,
        } => {
            let mode = if player {
                ResolveMode::Player
            } else if live {
                ResolveMode::LiveStream
            } else {
                ResolveMode::Video
            };
            resolve::run_resolve(&cfg, &page_url, mode, json).await?;
        }
        Commands::Clear => {
            let store = SqliteStore::open(&cfg).await?;
            let removed = store.clear_items().await?;
            store.pool().close().await;
            println!("Cleared {} item(s) and all sync cursors.", removed);
        }
        Commands::Cdn { .. } => {
            // Handled above (before config loading)
            unreachable!()
        }
    }

    Ok(())
}
