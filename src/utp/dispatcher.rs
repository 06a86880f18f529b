// utp/dispatcher.rs

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, MissedTickBehavior};

use crate::utp::common::{ConnectionId, Role, ST_RESET, ST_SYN, UtpError, current_micros};
use crate::utp::config::{UtpConfig, micros};
use crate::utp::connection::{Connection, ConnectionEvent, Transmit, WriteDone};
use crate::utp::ids::{ConnKey, IdAllocator, IdQuarantine, StreamKey};
use crate::utp::packet::UtpPacket;
use crate::utp::punch::HolePunch;

/// Maximum packet size for UDP datagrams
const MAX_PACKET_SIZE: usize = 65536;
/// Timer resolution for every connection and hole punch
const TICK_INTERVAL_MS: u64 = 50;
/// Maximum number of commands to buffer
const CHANNEL_BUFFER_SIZE: usize = 100;
/// Accepted streams waiting for `UtpListener::accept`
pub const MAX_PENDING_CONNECTIONS: usize = 16;

pub type Reply<T> = oneshot::Sender<Result<T, UtpError>>;

/// A stream registered with the dispatcher, handed to the application side
#[derive(Debug)]
pub struct NewStream {
    pub key: StreamKey,
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

/// Commands that can be sent to the dispatcher
#[derive(Debug)]
pub enum DispatcherCommand {
    /// Start accepting inbound connections
    Listen(Reply<mpsc::Receiver<NewStream>>),
    /// Open an outbound connection; `id` overrides the allocator
    Connect {
        remote: SocketAddr,
        id: Option<ConnectionId>,
        reply: Reply<NewStream>,
    },
    Punch {
        target: SocketAddr,
        attempts: u32,
        reply: Reply<bool>,
    },
    /// Send `payload` to the introducer and wait for its next datagram
    Rendezvous {
        introducer: SocketAddr,
        payload: Vec<u8>,
        reply: Reply<Vec<u8>>,
    },
    Write(StreamKey, Vec<u8>, WriteDone),
    End(StreamKey),
    Destroy(StreamKey),
    SetTimeout(StreamKey, Duration),
    SetMtu(StreamKey, usize),
    /// End every connection, then release the socket
    Close(Option<oneshot::Sender<()>>),
}

/// Send a command and wait for its reply
pub(crate) async fn request<T>(
    command_tx: &mpsc::Sender<DispatcherCommand>,
    make: impl FnOnce(Reply<T>) -> DispatcherCommand,
) -> Result<T, UtpError> {
    let (reply_tx, reply_rx) = oneshot::channel();
    command_tx
        .send(make(reply_tx))
        .await
        .map_err(|_| UtpError::SocketClosed)?;
    reply_rx.await.map_err(|_| UtpError::SocketClosed)?
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Open,
    /// No new connections; waiting for the open ones to finish
    Closing,
    Closed,
}

struct Entry {
    conn: Connection,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

/// Outbound connections keyed by `(remote, E)` and inbound ones keyed by the
/// same pair. Both may hold the same key.
#[derive(Default)]
struct ConnectionTable {
    outbound: HashMap<ConnKey, Entry>,
    inbound: HashMap<ConnKey, Entry>,
}

impl ConnectionTable {
    fn get_mut(&mut self, key: &StreamKey) -> Option<&mut Entry> {
        match key.role {
            Role::Initiator => self.outbound.get_mut(&key.key),
            Role::Acceptor => self.inbound.get_mut(&key.key),
        }
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut Entry> {
        self.outbound.values_mut().chain(self.inbound.values_mut())
    }

    fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.inbound.is_empty()
    }
}

struct PendingPunch {
    punch: HolePunch,
    reply: Reply<bool>,
}

/// Owns the UDP socket and every connection on it.
///
/// One task runs [`run`](Self::run); everything else talks to it through
/// [`DispatcherCommand`]s, so no protocol state is shared.
pub struct UtpDispatcher {
    recv_socket: UdpSocket,
    /// Non-blocking clone of the same socket, used for every send
    send_socket: std::net::UdpSocket,
    local_addr: SocketAddr,
    config: UtpConfig,
    connections: ConnectionTable,
    listener: Option<mpsc::Sender<NewStream>>,
    ids: IdAllocator,
    quarantine: IdQuarantine,
    punches: HashMap<SocketAddr, PendingPunch>,
    rendezvous: HashMap<SocketAddr, Reply<Vec<u8>>>,
    lifecycle: Lifecycle,
    close_waiters: Vec<oneshot::Sender<()>>,
    command_rx: mpsc::Receiver<DispatcherCommand>,
    command_tx: mpsc::Sender<DispatcherCommand>,
}

fn bind_error(addr: SocketAddr, e: io::Error) -> UtpError {
    match e.kind() {
        io::ErrorKind::AddrInUse => UtpError::AddressInUse(addr),
        _ => UtpError::Address { addr, source: e },
    }
}

impl UtpDispatcher {
    /// Creates a new UtpDispatcher bound to the specified address
    pub async fn new(bind_addr: SocketAddr, config: UtpConfig) -> Result<Self, UtpError> {
        let std_socket =
            std::net::UdpSocket::bind(bind_addr).map_err(|e| bind_error(bind_addr, e))?;
        std_socket.set_nonblocking(true)?;
        let send_socket = std_socket.try_clone()?;
        let recv_socket = UdpSocket::from_std(std_socket)?;
        let local_addr = recv_socket.local_addr()?;

        let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let quarantine = IdQuarantine::new(micros(config.id_quarantine));

        Ok(Self {
            recv_socket,
            send_socket,
            local_addr,
            config,
            connections: ConnectionTable::default(),
            listener: None,
            ids: IdAllocator::new(),
            quarantine,
            punches: HashMap::new(),
            rendezvous: HashMap::new(),
            lifecycle: Lifecycle::Open,
            close_waiters: Vec::new(),
            command_rx,
            command_tx,
        })
    }

    /// Returns a sender for sending commands to the dispatcher
    pub fn command_sender(&self) -> mpsc::Sender<DispatcherCommand> {
        self.command_tx.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Runs the dispatcher until the socket is closed
    pub async fn run(mut self) {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let mut ticker = time::interval(Duration::from_millis(TICK_INTERVAL_MS));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                result = self.recv_socket.recv_from(&mut buf) => match result {
                    Ok((size, from)) => self.handle_datagram(&buf[..size], from),
                    // ICMP errors surface here on some platforms
                    Err(e) => tracing::debug!("Receive on {} failed: {}", self.local_addr, e),
                },
                _ = ticker.tick() => self.handle_tick(),
            }

            self.flush_events();
            if self.lifecycle == Lifecycle::Closed {
                break;
            }
        }
        tracing::debug!("Dispatcher for {} stopped", self.local_addr);
    }

    fn handle_command(&mut self, cmd: DispatcherCommand) {
        let now = current_micros();
        match cmd {
            DispatcherCommand::Listen(reply) => {
                let _ = reply.send(self.listen());
            }
            DispatcherCommand::Connect { remote, id, reply } => {
                let _ = reply.send(self.open_outbound(remote, id, now));
            }
            DispatcherCommand::Punch {
                target,
                attempts,
                reply,
            } => self.start_punch(target, attempts, reply, now),
            DispatcherCommand::Rendezvous {
                introducer,
                payload,
                reply,
            } => self.start_rendezvous(introducer, &payload, reply),
            DispatcherCommand::Write(key, data, done) => match self.connections.get_mut(&key) {
                Some(entry) => entry.conn.write(data, Some(done), now, &self.send_socket),
                None => {
                    let _ = done.send(Err(UtpError::ConnectionClosed));
                }
            },
            DispatcherCommand::End(key) => {
                if let Some(entry) = self.connections.get_mut(&key) {
                    entry.conn.end(now, &self.send_socket);
                }
            }
            DispatcherCommand::Destroy(key) => {
                if let Some(entry) = self.connections.get_mut(&key) {
                    entry.conn.destroy();
                }
            }
            DispatcherCommand::SetTimeout(key, timeout) => {
                if let Some(entry) = self.connections.get_mut(&key) {
                    entry.conn.set_timeout(micros(timeout), now);
                }
            }
            DispatcherCommand::SetMtu(key, mtu) => {
                if let Some(entry) = self.connections.get_mut(&key) {
                    entry.conn.set_mtu(mtu);
                }
            }
            DispatcherCommand::Close(done) => self.begin_close(done, now),
        }
    }

    fn listen(&mut self) -> Result<mpsc::Receiver<NewStream>, UtpError> {
        if self.lifecycle != Lifecycle::Open {
            return Err(UtpError::SocketClosed);
        }
        if self.listener.as_ref().is_some_and(|l| !l.is_closed()) {
            return Err(UtpError::AlreadyListening);
        }
        let (listener_tx, listener_rx) = mpsc::channel(MAX_PENDING_CONNECTIONS);
        self.listener = Some(listener_tx);
        tracing::info!("Listening on {}", self.local_addr);
        Ok(listener_rx)
    }

    fn open_outbound(
        &mut self,
        remote: SocketAddr,
        id: Option<ConnectionId>,
        now: u64,
    ) -> Result<NewStream, UtpError> {
        if self.lifecycle != Lifecycle::Open {
            return Err(UtpError::SocketClosed);
        }

        let outbound = &self.connections.outbound;
        let quarantine = &self.quarantine;
        let taken = |id: ConnectionId| {
            let key = ConnKey::new(remote, id);
            outbound.contains_key(&key) || quarantine.contains(Role::Initiator, &key, now)
        };
        let id = match id {
            Some(id) if id % 2 == 1 => return Err(UtpError::InvalidState),
            Some(id) if taken(id) => return Err(UtpError::AlreadyConnected(remote)),
            Some(id) => id,
            None => self.ids.allocate(remote, taken)?,
        };

        let key = ConnKey::new(remote, id);
        let conn = Connection::connect(remote, id, &self.config, now, &self.send_socket);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.connections.outbound.insert(
            key,
            Entry {
                conn,
                events: events_tx,
            },
        );
        tracing::info!("Connecting to {} with id {}", remote, id);
        Ok(NewStream {
            key: StreamKey::new(Role::Initiator, key),
            events: events_rx,
        })
    }

    fn start_punch(&mut self, target: SocketAddr, attempts: u32, reply: Reply<bool>, now: u64) {
        if self.lifecycle != Lifecycle::Open {
            let _ = reply.send(Err(UtpError::SocketClosed));
            return;
        }
        if self.punches.contains_key(&target) {
            let _ = reply.send(Err(UtpError::PunchInProgress(target)));
            return;
        }
        tracing::info!("Punching a hole to {} ({} attempts)", target, attempts);
        self.punches.insert(
            target,
            PendingPunch {
                punch: HolePunch::new(target, attempts, now),
                reply,
            },
        );
        self.poll_punch(target, now);
    }

    fn poll_punch(&mut self, target: SocketAddr, now: u64) {
        let Some(pending) = self.punches.get_mut(&target) else {
            return;
        };
        let Some(outcome) = pending.punch.poll(now, &self.send_socket) else {
            return;
        };
        if let Some(pending) = self.punches.remove(&target) {
            tracing::info!(
                "Punch to {}: {}",
                target,
                if outcome { "success" } else { "failure" }
            );
            let _ = pending.reply.send(Ok(outcome));
        }
    }

    fn start_rendezvous(&mut self, introducer: SocketAddr, payload: &[u8], reply: Reply<Vec<u8>>) {
        if self.lifecycle != Lifecycle::Open {
            let _ = reply.send(Err(UtpError::SocketClosed));
            return;
        }
        self.rendezvous.retain(|_, waiter| !waiter.is_closed());
        if self.rendezvous.contains_key(&introducer) {
            let _ = reply.send(Err(UtpError::InvalidState));
            return;
        }
        if let Err(e) = self.send_socket.transmit(payload, introducer) {
            let _ = reply.send(Err(UtpError::Network(e)));
            return;
        }
        tracing::info!("Registered with introducer {}", introducer);
        self.rendezvous.insert(introducer, reply);
    }

    /// Route one datagram: rendezvous replies and punch traffic first, then
    /// transport packets by id parity
    fn handle_datagram(&mut self, data: &[u8], from: SocketAddr) {
        let now = current_micros();

        if let Some(reply) = self.rendezvous.remove(&from) {
            // an abandoned waiter does not consume the datagram
            if !reply.is_closed() {
                let _ = reply.send(Ok(data.to_vec()));
                return;
            }
        }
        if let Some(pending) = self.punches.get_mut(&from) {
            if pending.punch.on_datagram(data, &self.send_socket) {
                self.poll_punch(from, now);
                return;
            }
        }

        let packet = match UtpPacket::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::trace!("Dropping datagram from {}: {}", from, e);
                return;
            }
        };
        let id = packet.header.connection_id;

        if id % 2 == 1 {
            let key = ConnKey::new(from, id.wrapping_sub(1));
            if let Some(entry) = self.connections.outbound.get_mut(&key) {
                entry.conn.recv_incoming(packet, now, &self.send_socket);
                return;
            }
            self.reply_unroutable(&packet, from, id.wrapping_sub(1));
            return;
        }

        let key = ConnKey::new(from, id);
        if let Some(entry) = self.connections.inbound.get_mut(&key) {
            entry.conn.recv_incoming(packet, now, &self.send_socket);
            return;
        }
        let acceptable = packet.packet_type() == ST_SYN
            && self.lifecycle == Lifecycle::Open
            && !self.quarantine.contains(Role::Acceptor, &key, now);
        if acceptable && self.accept(&packet, key, now) {
            return;
        }
        self.reply_unroutable(&packet, from, id.wrapping_add(1));
    }

    /// Hand a new inbound connection to the listener. Returns false when
    /// nobody is listening.
    fn accept(&mut self, syn: &UtpPacket, key: ConnKey, now: u64) -> bool {
        if self.listener.as_ref().is_some_and(|l| l.is_closed()) {
            self.listener = None;
        }
        let Some(listener) = &self.listener else {
            return false;
        };
        let permit = match listener.try_reserve() {
            Ok(permit) => permit,
            Err(mpsc::error::TrySendError::Full(())) => {
                // the peer retransmits its SYN
                tracing::warn!("Accept backlog full, dropping SYN from {}", key.remote);
                return true;
            }
            Err(mpsc::error::TrySendError::Closed(())) => return false,
        };

        let conn = Connection::accept(syn, key.remote, &self.config, now, &self.send_socket);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.connections.inbound.insert(
            key,
            Entry {
                conn,
                events: events_tx,
            },
        );
        permit.send(NewStream {
            key: StreamKey::new(Role::Acceptor, key),
            events: events_rx,
        });
        tracing::info!("Accepted connection from {} with id {}", key.remote, key.id);
        true
    }

    fn reply_unroutable(&self, packet: &UtpPacket, from: SocketAddr, reset_id: ConnectionId) {
        if packet.packet_type() == ST_RESET {
            return;
        }
        tracing::debug!(
            "{} (id {} from {}), sending RESET",
            UtpError::UnroutablePacket,
            packet.header.connection_id,
            from
        );
        let reset = UtpPacket::create_reset(reset_id, 0, packet.header.seq_nr, current_micros() as u32);
        if let Err(e) = self.send_socket.transmit(&reset.encode(), from) {
            tracing::warn!("Failed to send RESET to {}: {}", from, e);
        }
    }

    fn handle_tick(&mut self) {
        let now = current_micros();
        for entry in self.connections.iter_mut() {
            entry.conn.on_tick(now, &self.send_socket);
        }
        self.quarantine.purge(now);
        self.rendezvous.retain(|_, waiter| !waiter.is_closed());

        let targets: Vec<SocketAddr> = self.punches.keys().copied().collect();
        for target in targets {
            self.poll_punch(target, now);
        }
    }

    /// Forward notifications and retire closed connections into quarantine
    fn flush_events(&mut self) {
        let now = current_micros();
        let quarantine = &mut self.quarantine;
        let tables = [
            (Role::Initiator, &mut self.connections.outbound),
            (Role::Acceptor, &mut self.connections.inbound),
        ];
        for (role, table) in tables {
            table.retain(|key, entry| {
                while let Some(event) = entry.conn.poll_event() {
                    // the application may have dropped its handle
                    let _ = entry.events.send(event);
                }
                if entry.conn.is_closed() {
                    tracing::info!("Connection {} with {} closed", key.id, key.remote);
                    quarantine.insert(role, *key, now);
                    return false;
                }
                true
            });
        }

        if self.lifecycle == Lifecycle::Closing && self.connections.is_empty() {
            self.lifecycle = Lifecycle::Closed;
            tracing::info!("Socket {} closed", self.local_addr);
            for waiter in self.close_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    fn begin_close(&mut self, done: Option<oneshot::Sender<()>>, now: u64) {
        if let Some(done) = done {
            self.close_waiters.push(done);
        }
        if self.lifecycle != Lifecycle::Open {
            return;
        }

        tracing::info!("Closing socket {}", self.local_addr);
        self.lifecycle = Lifecycle::Closing;
        self.listener = None;
        for (_, pending) in self.punches.drain() {
            let _ = pending.reply.send(Err(UtpError::SocketClosed));
        }
        for (_, reply) in self.rendezvous.drain() {
            let _ = reply.send(Err(UtpError::SocketClosed));
        }
        for entry in self.connections.iter_mut() {
            entry.conn.end(now, &self.send_socket);
        }
    }
}
