//! SketchSync server — hosts whiteboard rooms over WebSockets.

use std::path::PathBuf;

use clap::Parser;
use log::{error, info};
use sketchsync_collab::{ServerConfig, SyncServer};

/// Real-time whiteboard sync server
#[derive(Parser, Debug)]
#[command(name = "sketchsync-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "SKETCHSYNC_BIND", default_value = "127.0.0.1:9090")]
    bind: String,

    /// RocksDB directory for room snapshots (in-memory if omitted)
    #[arg(long, env = "SKETCHSYNC_DATA", value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Maximum peers per room
    #[arg(long, default_value_t = 100)]
    max_peers: usize,

    /// Seconds an empty room stays loaded before it is snapshotted and released
    #[arg(long, env = "SKETCHSYNC_IDLE_GRACE", default_value_t = 60)]
    idle_grace: u64,

    /// Seconds without a presence update before a peer's cursor is dropped
    #[arg(long, default_value_t = 30)]
    presence_timeout: u64,

    /// Largest accepted frame in bytes
    #[arg(long, default_value_t = 4 * 1024 * 1024)]
    max_frame_bytes: usize,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind,
            storage_path: self.data_dir,
            max_peers_per_room: self.max_peers,
            idle_grace_secs: self.idle_grace,
            presence_timeout_secs: self.presence_timeout,
            max_frame_bytes: self.max_frame_bytes,
            ..ServerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let config = Args::parse().into_config();

    info!("Starting SketchSync server...");
    let server = match SyncServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to open snapshot store: {e}");
            std::process::exit(1);
        }
    };

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {e}");
            std::future::pending::<()>().await;
        }
        info!("Shutting down");
    };
    if let Err(e) = server.run_until(shutdown).await {
        error!("Server error: {e}");
        std::process::exit(1);
    }
}
