// utp/test_util.rs

#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;

use crate::utp::connection::Transmit;
use crate::utp::packet::UtpPacket;

/// Records every datagram instead of sending it, so tests can drop, duplicate
/// or reorder packets before handing them to the other side.
#[derive(Default)]
pub struct Wire {
    sent: RefCell<Vec<(Vec<u8>, SocketAddr)>>,
}

impl Wire {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain the recorded datagrams as decoded packets
    pub fn take(&self) -> Vec<UtpPacket> {
        self.sent
            .borrow_mut()
            .drain(..)
            .map(|(bytes, _)| UtpPacket::decode(&bytes).expect("recorded datagram decodes"))
            .collect()
    }

    /// Drain the recorded datagrams untouched
    pub fn take_raw(&self) -> Vec<(Vec<u8>, SocketAddr)> {
        self.sent.borrow_mut().drain(..).collect()
    }
}

impl Transmit for Wire {
    fn transmit(&self, datagram: &[u8], target: SocketAddr) -> io::Result<()> {
        self.sent.borrow_mut().push((datagram.to_vec(), target));
        Ok(())
    }
}
