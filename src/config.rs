//! Server configuration.
//!
//! Values come from the command line of `sqlmux-server`; library users build a [`ServerConfig`]
//! directly, starting from [`ServerConfig::default`].
use std::{net::SocketAddr, path::PathBuf, time::Duration};

use crate::protocol::DEFAULT_MAX_FRAME_SIZE;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:7878";
pub const DEFAULT_DB_PATH: &str = "sqlmux.db";
pub const DEFAULT_WORKERS: usize = 8;
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address the listener binds to.
    pub listen_addr: SocketAddr,
    /// Database file shared by every stream of every session.
    pub db_path: PathBuf,
    /// Worker threads running database operations, shared by all sessions.
    pub workers: usize,
    /// Largest accepted inbound frame, in bytes.
    pub max_frame_size: usize,
    /// How long a connection waits on a locked database before failing.
    pub busy_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 7878)),
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            workers: DEFAULT_WORKERS,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }
}
