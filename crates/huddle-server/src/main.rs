//! Huddle server binary.
//!
//! # Usage
//!
//! ```bash
//! # Durable history in ./huddle.redb
//! huddle-server --bind 0.0.0.0:42424
//!
//! # Start over with an empty database
//! huddle-server --db /var/lib/huddle/chat.redb --fresh
//!
//! # Nothing written to disk
//! huddle-server --in-memory
//! ```

use std::path::PathBuf;

use clap::Parser;
use huddle_server::{ServerConfig, SessionConfig, StorageBackend};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Huddle chat relay server
#[derive(Parser, Debug)]
#[command(name = "huddle-server")]
#[command(about = "Huddle text chat relay server")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "127.0.0.1:42424")]
    bind: String,

    /// Path to the history database
    #[arg(long, default_value = "huddle.redb", conflicts_with = "in_memory")]
    db: PathBuf,

    /// Keep users and history in memory only
    #[arg(long)]
    in_memory: bool,

    /// Delete the database before starting
    #[arg(long, conflicts_with = "in_memory")]
    fresh: bool,

    /// Maximum concurrent connections
    #[arg(long, default_value = "1024")]
    max_connections: usize,

    /// Messages replayed to a user on registration
    #[arg(long, default_value = "20")]
    history_limit: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("Huddle server starting");
    tracing::info!("Binding to {}", args.bind);

    let storage = if args.in_memory {
        StorageBackend::InMemory
    } else {
        StorageBackend::Redb { path: args.db, fresh: args.fresh }
    };

    let config = ServerConfig {
        bind_address: args.bind,
        storage,
        max_connections: args.max_connections,
        session: SessionConfig { history_limit: args.history_limit, ..Default::default() },
        ..Default::default()
    };

    huddle_server::run_configured(config).await?;

    Ok(())
}
