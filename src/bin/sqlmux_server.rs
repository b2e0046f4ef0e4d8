use std::{error::Error, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use log::info;
use sqlmux::{
    ServerConfig, SessionServer, SqliteEngine,
    config::{DEFAULT_BUSY_TIMEOUT, DEFAULT_WORKERS},
    protocol::DEFAULT_MAX_FRAME_SIZE,
};

#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path to the database file
    path: PathBuf,
    /// Listen for new connections at address
    address: SocketAddr,
    /// Worker threads shared by all sessions
    #[arg(long, default_value_t = DEFAULT_WORKERS)]
    workers: usize,
    /// Largest accepted frame, in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_SIZE)]
    max_frame_size: usize,
    /// How long to wait on a locked database, in milliseconds
    #[arg(long, default_value_t = DEFAULT_BUSY_TIMEOUT.as_millis() as u64)]
    busy_timeout_ms: u64,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let config = ServerConfig {
        listen_addr: cli.address,
        db_path: cli.path,
        workers: cli.workers,
        max_frame_size: cli.max_frame_size,
        busy_timeout: Duration::from_millis(cli.busy_timeout_ms),
    };

    let engine = SqliteEngine::open(&config.db_path, config.busy_timeout);
    info!("serving database {:?}", engine.path());
    let server = SessionServer::bind(config, Arc::new(engine))?;

    let handle = server.handle()?;
    ctrlc::set_handler(move || {
        info!("interrupted");
        handle.shutdown();
    })?;

    server.listen()?;
    Ok(())
}
