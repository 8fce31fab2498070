//! tmplcache: maintenance CLI for persistent module caches.
//!
//! Operates on the store file a running renderer fleet shares: inspect
//! counters, evict stale modules, or wipe the cache outright.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;

use tmpl_module_cache::{CacheLimits, ModuleCache};

#[derive(Parser, Debug)]
#[command(name = "tmplcache", about = "Maintain a persistent template module cache")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print cache statistics as JSON.
    Stat {
        /// Path to the cache store file.
        path: PathBuf,
    },
    /// Evict modules older than the given age.
    Gc {
        /// Path to the cache store file.
        path: PathBuf,

        /// Maximum module age in seconds.
        #[arg(long, default_value_t = 3600)]
        max_age_secs: i64,
    },
    /// Remove every cached module.
    Reset {
        /// Path to the cache store file.
        path: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "tmpl_module_cache=debug"
    } else {
        "tmpl_module_cache=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    match cli.command {
        Command::Stat { path } => {
            let cache = ModuleCache::persistent(CacheLimits::default(), &path)?;
            println!("{}", serde_json::to_string_pretty(&cache.stat())?);
        }
        Command::Gc { path, max_age_secs } => {
            let limits = CacheLimits {
                max_age_secs,
                ..Default::default()
            };
            let mut cache = ModuleCache::persistent(limits, &path)?;
            let removed = cache.gc()?;
            info!(removed, path = %path.display(), "GC complete");
            println!("{}", serde_json::to_string_pretty(&cache.stat())?);
        }
        Command::Reset { path } => {
            let mut cache = ModuleCache::persistent(CacheLimits::default(), &path)?;
            cache.reset()?;
            info!(path = %path.display(), "Cache reset");
        }
    }

    Ok(())
}
