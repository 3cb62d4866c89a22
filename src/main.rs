//! # Forum Wisdom CLI (`wisdom`)
//!
//! ## Usage
//!
//! ```bash
//! wisdom --config ./config/wisdom.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `wisdom serve` | Start the HTTP server |
//! | `wisdom threads` | List ingested threads |
//! | `wisdom delete <key>` | Delete an ingested thread |
//!
//! A missing config file is not an error: every setting has a default, and
//! `PORT`, `OLLAMA_BASE_URL` and `WISDOM_DATA_DIR` override the file.

use anyhow::bail;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use forum_wisdom::config::{self, Config};
use forum_wisdom::logging::init_logging;
use forum_wisdom::server;
use forum_wisdom::store::ThreadStore;
use forum_wisdom::thread_key::ThreadKey;

/// Forum Wisdom: ingest forum threads and ask questions about them.
#[derive(Parser)]
#[command(
    name = "wisdom",
    about = "Forum Wisdom: ingest forum threads and ask streamed questions against them",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/wisdom.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server.
    ///
    /// Binds to `[server].bind` (or `PORT`) and serves `/ask`, the thread
    /// endpoints, `/health` and `/stats`.
    Serve,

    /// List ingested threads, most recently processed first.
    Threads,

    /// Delete an ingested thread and everything derived from it.
    Delete {
        /// Thread key, as shown by `wisdom threads`.
        key: String,
    },
}

fn load(path: &std::path::Path) -> anyhow::Result<Config> {
    let mut cfg = config::load_config(path)?;
    cfg.apply_env_overrides()?;
    config::validate(&cfg)?;
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = load(&cli.config)?;
    let store = ThreadStore::new(cfg.storage.threads_dir());

    match cli.command {
        Commands::Serve => {
            let log_file = cfg.log_file();
            let _guard = init_logging(log_file.as_deref(), &cfg.logging.filter)?;
            server::run_server(&cfg).await?;
        }
        Commands::Threads => {
            let threads = store.list_threads()?;
            if threads.is_empty() {
                println!("No threads in {}", store.root().display());
                return Ok(());
            }
            println!(
                "{:<48} {:>7} {:>6} {:<20} TITLE",
                "KEY", "POSTS", "PAGES", "PROCESSED"
            );
            for t in &threads {
                println!(
                    "{:<48} {:>7} {:>6} {:<20} {}",
                    t.thread_key,
                    t.posts_count.map(|n| n.to_string()).unwrap_or_else(|| "-".into()),
                    t.pages.map(|n| n.to_string()).unwrap_or_else(|| "-".into()),
                    t.processed_at
                        .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "-".into()),
                    t.title.as_deref().unwrap_or("")
                );
            }
            println!("\n{} thread(s)", threads.len());
        }
        Commands::Delete { key } => {
            let key = ThreadKey::parse(&key)?;
            if !store.delete(&key)? {
                bail!("Thread not found: {}", key);
            }
            println!("Thread '{}' deleted successfully", key);
        }
    }

    Ok(())
}
