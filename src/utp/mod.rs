// utp/mod.rs

pub mod common;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod ids;
pub mod packet;
pub mod punch;
pub mod reliability;
pub mod socket_manager;
pub mod stream;

#[cfg(test)]
pub mod test_util;

pub use common::{ConnectionId, ConnectionState, Role, UtpError};
pub use config::UtpConfig;
pub use connection::ConnectionEvent;
pub use socket_manager::{UtpListener, UtpSocketManager};
pub use stream::UtpStream;

/// Installs a `tracing` subscriber printing INFO and above. Calling it again
/// keeps the first subscriber.
pub fn initialize() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .try_init();
    tracing::info!("uTP module initialized");
}
