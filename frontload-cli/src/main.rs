//! Frontload operator CLI
//!
//! Inspects and manipulates the cache service behind the access layer:
//! liveness probes, point reads and writes, counters, and flushes.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use frontload_core::{
    AccessConfig, CacheSettings, HealthStatus, KeyTtl, KeyValueStore, RedisBackend,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "frontload")]
#[command(about = "Frontload cache layer administration tool")]
#[command(version = "0.2.0")]
struct Cli {
    /// Configuration file path; flags below override its cache section
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Cache server URL
    #[arg(short, long, default_value = "redis://127.0.0.1:6379")]
    url: String,

    /// Connection pool size
    #[arg(long, default_value = "4")]
    pool_size: usize,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe cache liveness and latency
    Ping,
    /// Fetch a value
    Get { key: String },
    /// Store a value
    Set {
        key: String,
        value: String,
        /// Expiration in seconds
        #[arg(long)]
        ttl_secs: Option<u64>,
    },
    /// Delete keys
    Del { keys: Vec<String> },
    /// Add to an integer counter
    Incr {
        key: String,
        #[arg(long, default_value = "1")]
        by: i64,
    },
    /// Check whether a key exists
    Exists { key: String },
    /// Show the remaining lifetime of a key
    Ttl { key: String },
    /// Remove every key from the cache
    Flush {
        /// Confirm the flush
        #[arg(long)]
        yes: bool,
    },
    /// Validate a configuration file
    Check { path: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::new(format!(
        "frontload={},frontload_core={}",
        log_level, log_level
    ));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    // Config validation needs no cache connection
    if let Commands::Check { path } = &cli.command {
        let config = AccessConfig::load_from_file(path)?;
        println!("configuration valid: {}", path.display());
        println!("  cache url: {}", config.cache.url);
        println!("  loaders:   {}", config.loaders.len());
        for (entity, loader) in &config.loaders {
            println!(
                "    {} (window {}ms, batch {}, ttl {}s, prefix '{}')",
                entity,
                loader.window_ms,
                loader.max_batch_size,
                loader.cache_ttl_secs,
                loader.cache_key_prefix
            );
        }
        return Ok(());
    }

    let settings = match &cli.config {
        Some(path) => AccessConfig::load_from_file(path)?.cache,
        None => CacheSettings {
            url: cli.url.clone(),
            pool_size: cli.pool_size,
            ..CacheSettings::default()
        },
    };

    let backend = RedisBackend::connect(&settings.url, settings.pool_size)
        .context("failed to build cache client")?;
    let store = KeyValueStore::new(Arc::new(backend), &settings);

    match cli.command {
        Commands::Ping => {
            let report = store.health_check().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.status == HealthStatus::Unhealthy {
                bail!("cache is unhealthy");
            }
        }
        Commands::Get { key } => match store.get(&key).await {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => println!("(absent)"),
        },
        Commands::Set {
            key,
            value,
            ttl_secs,
        } => {
            let ttl = ttl_secs.map(Duration::from_secs);
            if !store.set(&key, value.as_bytes(), ttl).await {
                bail!("set failed");
            }
            info!("stored '{}'", key);
        }
        Commands::Del { keys } => {
            if keys.is_empty() {
                bail!("no keys given");
            }
            let removed = store.mdel(&keys).await;
            println!("removed {} of {} keys", removed, keys.len());
        }
        Commands::Incr { key, by } => {
            let value = store.incr(&key, by).await;
            println!("{}", value);
        }
        Commands::Exists { key } => {
            println!("{}", store.exists(&key).await);
        }
        Commands::Ttl { key } => match store.ttl(&key).await {
            KeyTtl::Missing => println!("(missing)"),
            KeyTtl::Persistent => println!("(persistent)"),
            KeyTtl::Expires(remaining) => println!("{}s", remaining.as_secs()),
        },
        Commands::Flush { yes } => {
            if !yes {
                bail!("refusing to flush without --yes");
            }
            if !store.flush().await {
                bail!("flush failed");
            }
            info!("cache flushed");
        }
        Commands::Check { .. } => unreachable!("handled above"),
    }

    Ok(())
}
