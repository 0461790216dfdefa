use std::path::PathBuf;

use clap::Parser;
use scene_sync::server::{ServerConfig, SyncServer};

#[derive(Parser)]
#[command(name = "scene-server")]
#[command(about = "Real-time scene sync server over WebSocket", version)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:9090")]
    bind: String,

    /// RocksDB directory; scenes are kept in memory when omitted
    #[arg(short, long, value_name = "DIR")]
    storage: Option<PathBuf>,

    /// Minimum milliseconds between two writes of the same scene
    #[arg(long, default_value = "1000")]
    persist_interval_ms: u64,

    /// Elements per initial-sync message (0 = send the scene in one message)
    #[arg(long, default_value = "256")]
    snapshot_batch_size: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let config = ServerConfig {
        bind_addr: args.bind,
        snapshot_batch_size: (args.snapshot_batch_size > 0).then_some(args.snapshot_batch_size),
        persist_interval_ms: args.persist_interval_ms,
        storage_path: args.storage,
    };
    if let Some(path) = &config.storage_path {
        log::info!("Persisting scenes to {}", path.display());
    }
    let server = SyncServer::new(config)?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutting down");
        }
    }

    server.shutdown().await?;
    Ok(())
}
