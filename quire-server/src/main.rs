//! Standalone quire sync server.
//!
//! Sessions come from a JSON file mapping tokens to users:
//!
//! ```json
//! { "dev-token": { "userId": "u1", "displayName": "Dev" } }
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{info, warn};
use quire_collab::{ServerConfig, StaticSessionValidator, SyncServer};

#[derive(Parser, Debug)]
#[command(name = "quire-server", version, about = "Real-time collaborative document sync server")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "QUIRE_BIND", default_value = "127.0.0.1:9090")]
    bind: String,

    /// JSON file of session tokens.
    #[arg(long, env = "QUIRE_SESSIONS")]
    sessions: PathBuf,

    /// RocksDB directory. Without it documents live in memory only.
    #[arg(long, env = "QUIRE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Seconds an empty room stays loaded.
    #[arg(long, env = "QUIRE_ROOM_IDLE_SECS", default_value_t = 30)]
    room_idle_secs: u64,

    /// Minimum milliseconds between forwarded cursor moves per connection.
    #[arg(long, env = "QUIRE_CURSOR_THROTTLE_MS", default_value_t = 100)]
    cursor_throttle_ms: u64,

    /// Frames queued per connection before new ones are dropped.
    #[arg(long, env = "QUIRE_OUTBOUND_CAPACITY", default_value_t = 256)]
    outbound_capacity: usize,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind.clone(),
            outbound_capacity: self.outbound_capacity,
            room_idle_timeout: Duration::from_secs(self.room_idle_secs),
            cursor_throttle: Duration::from_millis(self.cursor_throttle_ms),
            storage_path: self.data_dir.clone(),
            ..ServerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let validator = StaticSessionValidator::from_json_file(&args.sessions)?;
    if validator.is_empty() {
        warn!("{} has no sessions, every connection will be rejected", args.sessions.display());
    }
    info!("Loaded {} sessions", validator.len());

    let config = args.server_config();
    match &config.storage_path {
        Some(path) => info!("Persisting documents to {}", path.display()),
        None => warn!("No --data-dir given, documents are kept in memory only"),
    }

    let server = SyncServer::new(config, Arc::new(validator))?;
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down, flushing open rooms");
            server.shutdown().await;
            let stats = server.stats();
            info!(
                "Served {} connections, persisted {} snapshots",
                stats.total_connections, stats.rooms.snapshots_persisted
            );
        }
    }
    Ok(())
}
