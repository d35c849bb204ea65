pub mod commands;
pub mod config;
pub mod error;
pub mod guard;
pub mod handshake;
pub mod health;
pub mod networking;
pub mod rate_limit;
pub mod relay_utils;
pub mod sweeper;

pub use commands::relay::{RelayServer, RelayStats};
pub use config::RelayConfig;
pub use error::{HandshakeError, RelayError};
