pub mod config;
pub mod engine;
pub mod protocol;
pub mod value;

pub use config::ServerConfig;
pub use engine::{Connection, Engine, SqliteEngine};
pub use protocol::SessionServer;
pub use value::Value;
