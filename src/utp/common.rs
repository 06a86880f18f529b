// utp/common.rs

#![forbid(unsafe_code)]

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Instant;

/// Protocol version constant
pub const UTP_VERSION: u8 = 1;

/// Packet types
pub const ST_DATA: u8 = 0;
pub const ST_FIN: u8 = 1;
pub const ST_STATE: u8 = 2;
pub const ST_RESET: u8 = 3;
pub const ST_SYN: u8 = 4;

/// The extension byte is always zero, no extension chain is supported
pub const NO_EXTENSION: u8 = 0;

/// Advertised receive window. Constant, it never reflects buffer occupancy.
pub const DEFAULT_WINDOW_SIZE: u32 = 1 << 18;

/// Default protocol values
pub const DEFAULT_BUFFER_SIZE: usize = 512;
pub const DEFAULT_MTU: usize = 1000;
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_RESEND_INTERVAL_MS: u64 = 300;
pub const DEFAULT_KEEPALIVE_INTERVAL_MS: u64 = 1000;
pub const TIMEOUT_CHECK_INTERVAL_MS: u64 = 500;
pub const RETRANSMIT_THRESHOLD_MICROS: u64 = 500_000;
pub const ID_QUARANTINE_MS: u64 = 5000;

/// Hole punching
pub const PUNCH_SYN: &[u8] = b"PUNCH";
pub const PUNCH_ACK: &[u8] = b"PUNCHED";
pub const PUNCH_INTERVAL_MS: u64 = 500;

pub type ConnectionId = u16;

/// Lifecycle of a single logical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Outbound only, SYN sent and no STATE reply seen yet
    Connecting,
    Established,
    /// Local FIN sent, waiting for the flush and the peer's FIN
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Established => "ESTABLISHED",
            ConnectionState::Closing => "CLOSING",
            ConnectionState::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the handshake a connection is on.
///
/// The initiator tags its packets with the even id `E`, the acceptor with `E + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Initiator,
    Acceptor,
}

#[derive(Debug, thiserror::Error)]
pub enum UtpError {
    #[error("Datagram is shorter than the 20-byte header")]
    MalformedPacket,
    #[error("No connection matches the packet")]
    UnroutablePacket,
    #[error("Packet sequence number is outside the receive window")]
    StalePacket,
    #[error("Every connection identifier towards {0} is in use")]
    ExhaustedIdentifierSpace(SocketAddr),
    #[error("Address {0} is already in use")]
    AddressInUse(SocketAddr),
    #[error("Cannot bind to {addr}: {source}")]
    Address {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("Already connected to {0} under this identifier")]
    AlreadyConnected(SocketAddr),
    #[error("Socket is already listening")]
    AlreadyListening,
    #[error("Socket is closed")]
    SocketClosed,
    #[error("A hole punch towards {0} is already running")]
    PunchInProgress(SocketAddr),
    #[error("Connection reset by peer")]
    PeerReset,
    #[error("Connection idle timeout")]
    IdleTimeout,
    #[error("Connection is closed")]
    ConnectionClosed,
    #[error("Invalid state for operation")]
    InvalidState,
    #[error("Network error: {0}")]
    Network(#[from] io::Error),
    #[error("Invalid rendezvous reply: {0}")]
    Rendezvous(#[from] serde_json::Error),
}

/// Get current monotonic time in microseconds
pub fn current_micros() -> u64 {
    lazy_static::lazy_static! {
        static ref START_TIME: Instant = Instant::now();
    }
    START_TIME.elapsed().as_micros() as u64
}

/// Generate a random 16-bit number
pub fn random_u16() -> u16 {
    rand::random::<u16>()
}

/// Random even connection id, the start of the allocator's probe cursor
pub fn random_even_id() -> ConnectionId {
    random_u16() & !1
}
