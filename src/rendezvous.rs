// rendezvous.rs

#![forbid(unsafe_code)]

//! Messages exchanged with an introducer so two peers behind NATs learn each
//! other's public endpoint before punching.
//!
//! Each peer sends `{"name":"SERVER"}` or `{"name":"CLIENT"}` from its
//! transport socket. The introducer answers with the other peer's observed
//! endpoint as `{"address":"1.2.3.4","port":5678}`.

use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::utp::UtpError;

/// Which side of the exchange this peer plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PeerRole {
    Server,
    Client,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub name: PeerRole,
}

/// Endpoint of the other peer as the introducer saw it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEndpoint {
    pub address: IpAddr,
    pub port: u16,
}

impl PeerEndpoint {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl From<SocketAddr> for PeerEndpoint {
    fn from(addr: SocketAddr) -> Self {
        Self {
            address: addr.ip(),
            port: addr.port(),
        }
    }
}

pub fn encode_registration(role: PeerRole) -> Result<Vec<u8>, UtpError> {
    Ok(serde_json::to_vec(&Registration { name: role })?)
}

pub fn decode_peer(data: &[u8]) -> Result<SocketAddr, UtpError> {
    let endpoint: PeerEndpoint = serde_json::from_slice(data)?;
    Ok(endpoint.socket_addr())
}
