// lib.rs

//! Reliable, ordered byte streams multiplexed over one UDP socket, plus UDP
//! hole punching to reach peers behind NATs.

pub mod rendezvous;
pub mod utp;

pub use rendezvous::PeerRole;
pub use utp::{ConnectionEvent, UtpConfig, UtpError, UtpListener, UtpSocketManager, UtpStream};
