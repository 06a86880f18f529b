// utp/connection.rs

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;

use tokio::sync::oneshot;

use crate::utp::common::{
    ConnectionId, ConnectionState, Role, ST_DATA, ST_FIN, ST_RESET, ST_STATE, ST_SYN, UtpError,
    random_u16,
};
use crate::utp::config::{UtpConfig, micros};
use crate::utp::packet::UtpPacket;
use crate::utp::reliability::{OutgoingWindow, SeqRing};

/// The shared datagram send primitive.
///
/// Every connection of a socket writes through the same implementation. A
/// failed send is treated as packet loss by the caller.
#[cfg_attr(test, mockall::automock)]
pub trait Transmit {
    fn transmit(&self, datagram: &[u8], target: SocketAddr) -> io::Result<()>;
}

impl Transmit for std::net::UdpSocket {
    fn transmit(&self, datagram: &[u8], target: SocketAddr) -> io::Result<()> {
        self.send_to(datagram, target).map(|_| ())
    }
}

/// Notifications produced by a connection, in the order they happened
#[derive(Debug)]
pub enum ConnectionEvent {
    /// Handshake finished; emitted at once for accepted connections
    Connected,
    Data(Vec<u8>),
    /// The peer will send no more data
    End,
    /// No inbound traffic for the configured timeout. Advisory only.
    Timeout,
    Error(UtpError),
    /// Terminal, always the last event
    Closed,
}

pub type WriteDone = oneshot::Sender<Result<(), UtpError>>;

#[derive(Debug)]
struct PendingWrite {
    data: Vec<u8>,
    offset: usize,
    done: Option<WriteDone>,
}

#[derive(Debug)]
enum Outbound {
    Data(PendingWrite),
    Fin,
}

fn reply(done: Option<WriteDone>, result: Result<(), UtpError>) {
    if let Some(done) = done {
        // the writer may have gone away
        let _ = done.send(result);
    }
}

fn type_name(packet_type: u8) -> &'static str {
    match packet_type {
        ST_DATA => "DATA",
        ST_FIN => "FIN",
        ST_STATE => "STATE",
        ST_RESET => "RESET",
        ST_SYN => "SYN",
        _ => "UNKNOWN",
    }
}

/// Per-stream protocol state machine.
///
/// Sans-io: every method takes the current time in microseconds and the
/// send primitive, and records notifications for [`poll_event`](Self::poll_event).
pub struct Connection {
    role: Role,

    /// The even half of the id pair, the multiplexer key
    connection_id: ConnectionId,

    /// Id stamped on every packet we send: `E` as initiator, `E + 1` as acceptor
    send_id: ConnectionId,

    remote_addr: SocketAddr,
    state: ConnectionState,

    /// Next sequence number to send
    seq_nr: u16,

    /// Last in-order sequence number received from the peer
    ack_nr: u16,

    outgoing: OutgoingWindow,
    incoming: SeqRing<UtpPacket>,

    /// Writes and the FIN waiting for window space, strictly FIFO
    pending: VecDeque<Outbound>,

    /// Acceptor's STATE reply to the SYN, resent on a duplicate SYN
    handshake_reply: Option<UtpPacket>,

    mtu: usize,
    timeout_micros: u64,

    /// Start of the current idle period. `None` once the timeout fired.
    timeout_since: Option<u64>,

    /// Set by every transmission, cleared by the keepalive timer
    alive: bool,

    end_requested: bool,
    fin_sent: bool,
    fin_acked: bool,
    fin_received: bool,
    end_emitted: bool,

    connect_deadline: Option<u64>,
    close_deadline: Option<u64>,

    resend_interval: u64,
    keepalive_interval: u64,
    timeout_check_interval: u64,
    retransmit_threshold: u64,
    next_resend: u64,
    next_keepalive: u64,
    next_timeout_check: u64,

    events: VecDeque<ConnectionEvent>,
}

impl Connection {
    fn new(
        role: Role,
        connection_id: ConnectionId,
        remote_addr: SocketAddr,
        config: &UtpConfig,
        now: u64,
    ) -> Self {
        let send_id = match role {
            Role::Initiator => connection_id,
            Role::Acceptor => connection_id.wrapping_add(1),
        };
        let resend_interval = micros(config.resend_interval);
        let keepalive_interval = micros(config.keepalive_interval);
        let timeout_check_interval = micros(config.timeout_check_interval);

        Self {
            role,
            connection_id,
            send_id,
            remote_addr,
            state: ConnectionState::Connecting,
            seq_nr: random_u16(),
            ack_nr: 0,
            outgoing: OutgoingWindow::new(config.buffer_size),
            incoming: SeqRing::new(config.buffer_size),
            pending: VecDeque::new(),
            handshake_reply: None,
            mtu: config.mtu.max(1),
            timeout_micros: micros(config.timeout),
            timeout_since: Some(now),
            alive: false,
            end_requested: false,
            fin_sent: false,
            fin_acked: false,
            fin_received: false,
            end_emitted: false,
            connect_deadline: None,
            close_deadline: None,
            resend_interval,
            keepalive_interval,
            timeout_check_interval,
            retransmit_threshold: micros(config.retransmit_threshold),
            next_resend: now.saturating_add(resend_interval),
            next_keepalive: now.saturating_add(keepalive_interval),
            next_timeout_check: now.saturating_add(timeout_check_interval),
            events: VecDeque::new(),
        }
    }

    /// Open an outbound connection with the even id `connection_id` and send the SYN
    pub fn connect(
        remote_addr: SocketAddr,
        connection_id: ConnectionId,
        config: &UtpConfig,
        now: u64,
        tx: &dyn Transmit,
    ) -> Self {
        let mut conn = Self::new(Role::Initiator, connection_id, remote_addr, config, now);
        let syn = UtpPacket::create_syn(conn.send_id, conn.seq_nr, now as u32);
        conn.send_outgoing(syn, now, tx);
        conn
    }

    /// Build the accepting side from a received SYN and answer it with a STATE
    pub fn accept(
        syn: &UtpPacket,
        remote_addr: SocketAddr,
        config: &UtpConfig,
        now: u64,
        tx: &dyn Transmit,
    ) -> Self {
        let mut conn = Self::new(
            Role::Acceptor,
            syn.header.connection_id,
            remote_addr,
            config,
            now,
        );
        conn.ack_nr = syn.header.seq_nr;
        conn.state = ConnectionState::Established;

        let reply = UtpPacket::create_state(conn.send_id, conn.seq_nr, conn.ack_nr, now as u32);
        conn.transmit(&reply, tx);
        conn.handshake_reply = Some(reply);
        conn.events.push_back(ConnectionEvent::Connected);
        conn
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn send_id(&self) -> ConnectionId {
        self.send_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn seq_nr(&self) -> u16 {
        self.seq_nr
    }

    pub fn ack_nr(&self) -> u16 {
        self.ack_nr
    }

    pub fn in_flight(&self) -> usize {
        self.outgoing.in_flight()
    }

    pub fn is_writable(&self) -> bool {
        self.outgoing.has_room()
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn poll_event(&mut self) -> Option<ConnectionEvent> {
        self.events.pop_front()
    }

    /// Queue `data` behind earlier writes. `done` resolves once every chunk
    /// has entered the in-flight window, or with the reason it never will.
    pub fn write(&mut self, data: Vec<u8>, done: Option<WriteDone>, now: u64, tx: &dyn Transmit) {
        if self.is_closed() {
            reply(done, Err(UtpError::ConnectionClosed));
            return;
        }
        if self.end_requested {
            reply(done, Err(UtpError::InvalidState));
            return;
        }
        self.pending.push_back(Outbound::Data(PendingWrite {
            data,
            offset: 0,
            done,
        }));
        self.pump(now, tx);
    }

    /// Finish the write side: a FIN follows the queued writes
    pub fn end(&mut self, now: u64, tx: &dyn Transmit) {
        if self.end_requested || self.is_closed() {
            return;
        }
        self.end_requested = true;
        if self.state == ConnectionState::Connecting && self.timeout_micros > 0 {
            self.connect_deadline = Some(now.saturating_add(self.timeout_micros));
        }
        self.pending.push_back(Outbound::Fin);
        self.pump(now, tx);
    }

    /// Abort without sending anything
    pub fn destroy(&mut self) {
        if self.is_closed() {
            return;
        }
        tracing::debug!("{}/{}: destroyed", self.remote_addr, self.send_id);
        self.emit_end();
        self.close();
    }

    pub fn set_timeout(&mut self, timeout_micros: u64, now: u64) {
        self.timeout_micros = timeout_micros;
        self.timeout_since = Some(now);
    }

    pub fn set_mtu(&mut self, mtu: usize) {
        self.mtu = mtu.max(1);
    }

    /// Process one inbound packet addressed to this connection
    pub fn recv_incoming(&mut self, packet: UtpPacket, now: u64, tx: &dyn Transmit) {
        let packet_type = packet.packet_type();
        tracing::trace!(
            "{}/{}: received {} #{} ack #{} ({} bytes)",
            self.remote_addr,
            self.send_id,
            type_name(packet_type),
            packet.header.seq_nr,
            packet.header.ack_nr,
            packet.payload.len()
        );

        if self.is_closed() {
            if packet_type != ST_RESET {
                self.send_reset(now, tx);
            }
            return;
        }

        self.timeout_since = Some(now);

        match packet_type {
            ST_RESET => {
                tracing::debug!("{}/{}: reset by peer", self.remote_addr, self.send_id);
                self.events.push_back(ConnectionEvent::Error(UtpError::PeerReset));
                self.emit_end();
                self.close();
                return;
            }
            ST_SYN => {
                if let Some(handshake) = self.handshake_reply.clone() {
                    self.transmit(&handshake, tx);
                }
                return;
            }
            _ => {}
        }

        let mut packet = packet;
        if self.state == ConnectionState::Connecting {
            if packet_type != ST_STATE {
                self.incoming.put(packet.header.seq_nr, packet);
                return;
            }

            self.ack_nr = packet.header.seq_nr.wrapping_sub(1);
            self.recv_ack(packet.header.ack_nr, now, tx);
            self.state = ConnectionState::Established;
            self.connect_deadline = None;
            tracing::debug!("{}/{}: connected", self.remote_addr, self.send_id);
            self.events.push_back(ConnectionEvent::Connected);
            self.pump(now, tx);

            match self.incoming.del(self.ack_nr.wrapping_add(1)) {
                Some(buffered) => packet = buffered,
                None => return,
            }
        }

        let distance = packet.header.seq_nr.wrapping_sub(self.ack_nr) as usize;
        if distance == 0 || distance >= self.incoming.capacity() {
            tracing::debug!(
                "{}/{}: {}",
                self.remote_addr,
                self.send_id,
                UtpError::StalePacket
            );
            self.send_state(now, tx);
            return;
        }

        self.recv_ack(packet.header.ack_nr, now, tx);
        if packet.packet_type() == ST_STATE {
            // may be the ack of our FIN
            self.check_closed();
            return;
        }

        self.incoming.put(packet.header.seq_nr, packet);
        while let Some(next) = self.incoming.del(self.ack_nr.wrapping_add(1)) {
            self.ack_nr = self.ack_nr.wrapping_add(1);
            match next.packet_type() {
                ST_DATA if !next.payload.is_empty() => {
                    self.events.push_back(ConnectionEvent::Data(next.payload));
                }
                ST_FIN => self.on_peer_fin(now, tx),
                _ => {}
            }
        }

        self.send_state(now, tx);
        self.check_closed();
    }

    /// Drive the retransmit, keepalive and idle timers and the close deadlines
    pub fn on_tick(&mut self, now: u64, tx: &dyn Transmit) {
        if self.is_closed() {
            return;
        }

        let expired = [self.connect_deadline, self.close_deadline]
            .into_iter()
            .flatten()
            .any(|deadline| now >= deadline);
        if expired {
            tracing::debug!("{}/{}: no answer, closing", self.remote_addr, self.send_id);
            self.emit_end();
            self.close();
            return;
        }

        if now >= self.next_resend {
            self.next_resend = now.saturating_add(self.resend_interval);
            self.resend(now, tx);
        }

        if now >= self.next_keepalive {
            self.next_keepalive = now.saturating_add(self.keepalive_interval);
            if self.state != ConnectionState::Connecting {
                if self.alive {
                    self.alive = false;
                } else {
                    self.send_state(now, tx);
                }
            }
        }

        if now >= self.next_timeout_check {
            self.next_timeout_check = now.saturating_add(self.timeout_check_interval);
            self.check_idle(now);
        }
    }

    fn check_idle(&mut self, now: u64) {
        if self.timeout_micros == 0 {
            return;
        }
        if let Some(since) = self.timeout_since {
            if now.saturating_sub(since) >= self.timeout_micros {
                self.timeout_since = None;
                self.events.push_back(ConnectionEvent::Timeout);
            }
        }
    }

    fn resend(&mut self, now: u64, tx: &dyn Transmit) {
        let due = self
            .outgoing
            .due_for_resend(self.seq_nr, now, self.retransmit_threshold);
        if due.is_empty() {
            return;
        }

        tracing::debug!(
            "{}/{}: packet loss since #{}, resending {}",
            self.remote_addr,
            self.send_id,
            self.outgoing.base(self.seq_nr),
            due.len()
        );
        for seq in due {
            let Some(sent) = self.outgoing.get_mut(seq) else {
                continue;
            };
            sent.packet.header.timestamp_micros = now as u32;
            sent.packet.header.ack_nr = self.ack_nr;
            sent.sent_at_micros = now;
            sent.transmissions += 1;
            let packet = sent.packet.clone();
            self.transmit(&packet, tx);
        }
    }

    fn recv_ack(&mut self, ack_nr: u16, now: u64, tx: &dyn Transmit) {
        let Some(released) = self.outgoing.process_ack(self.seq_nr, ack_nr) else {
            return;
        };
        if released == 0 {
            return;
        }
        if self.outgoing.is_empty() && self.fin_sent {
            self.fin_acked = true;
        }
        self.pump(now, tx);
    }

    /// Move queued writes into the window while there is room
    fn pump(&mut self, now: u64, tx: &dyn Transmit) {
        if self.state == ConnectionState::Connecting || self.is_closed() {
            return;
        }

        while let Some(front) = self.pending.front_mut() {
            match front {
                Outbound::Data(write) if write.offset < write.data.len() => {
                    if !self.outgoing.has_room() {
                        return;
                    }
                    let end = write.offset.saturating_add(self.mtu).min(write.data.len());
                    let chunk = write.data[write.offset..end].to_vec();
                    write.offset = end;

                    let packet =
                        UtpPacket::create_data(self.send_id, self.seq_nr, self.ack_nr, now as u32, chunk);
                    self.send_outgoing(packet, now, tx);
                }
                Outbound::Data(_) => {
                    if let Some(Outbound::Data(write)) = self.pending.pop_front() {
                        reply(write.done, Ok(()));
                    }
                }
                Outbound::Fin => {
                    if !self.outgoing.has_room() {
                        return;
                    }
                    self.pending.pop_front();
                    let fin = UtpPacket::create_fin(self.send_id, self.seq_nr, self.ack_nr, now as u32);
                    self.send_outgoing(fin, now, tx);
                    self.fin_sent = true;
                    self.state = ConnectionState::Closing;
                    if self.timeout_micros > 0 {
                        self.close_deadline = Some(now.saturating_add(self.timeout_micros));
                    }
                }
            }
        }
    }

    fn on_peer_fin(&mut self, now: u64, tx: &dyn Transmit) {
        self.fin_received = true;
        self.emit_end();
        self.end(now, tx);
    }

    fn check_closed(&mut self) {
        if self.fin_acked && self.fin_received {
            self.close();
        }
    }

    fn emit_end(&mut self) {
        if !self.end_emitted {
            self.end_emitted = true;
            self.events.push_back(ConnectionEvent::End);
        }
    }

    fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        self.state = ConnectionState::Closed;
        self.emit_end();
        for outbound in self.pending.drain(..) {
            if let Outbound::Data(write) = outbound {
                reply(write.done, Err(UtpError::ConnectionClosed));
            }
        }
        self.connect_deadline = None;
        self.close_deadline = None;
        tracing::debug!("{}/{}: closed", self.remote_addr, self.send_id);
        self.events.push_back(ConnectionEvent::Closed);
    }

    /// Send a sequenced packet and keep it for retransmission
    fn send_outgoing(&mut self, packet: UtpPacket, now: u64, tx: &dyn Transmit) {
        self.seq_nr = self.seq_nr.wrapping_add(1);
        self.transmit(&packet, tx);
        self.outgoing.push(packet, now);
    }

    fn send_state(&mut self, now: u64, tx: &dyn Transmit) {
        let state = UtpPacket::create_state(self.send_id, self.seq_nr, self.ack_nr, now as u32);
        self.transmit(&state, tx);
    }

    fn send_reset(&mut self, now: u64, tx: &dyn Transmit) {
        let reset = UtpPacket::create_reset(self.send_id, self.seq_nr, self.ack_nr, now as u32);
        self.transmit(&reset, tx);
    }

    fn transmit(&mut self, packet: &UtpPacket, tx: &dyn Transmit) {
        tracing::trace!(
            "{}/{}: sent {} #{} ack #{} ({} bytes)",
            self.remote_addr,
            self.send_id,
            type_name(packet.packet_type()),
            packet.header.seq_nr,
            packet.header.ack_nr,
            packet.payload.len()
        );
        self.alive = true;
        if let Err(e) = tx.transmit(&packet.encode(), self.remote_addr) {
            tracing::warn!("{}/{}: send failed: {}", self.remote_addr, self.send_id, e);
        }
    }
}
