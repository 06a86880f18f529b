// utp/socket_manager.rs

#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, oneshot};

use crate::rendezvous::{self, PeerRole};
use crate::utp::common::{ConnectionId, UtpError};
use crate::utp::config::UtpConfig;
use crate::utp::dispatcher::{DispatcherCommand, NewStream, UtpDispatcher, request};
use crate::utp::stream::UtpStream;

/// One UDP socket carrying any number of uTP connections.
///
/// Binding spawns the dispatcher task that owns the socket. Dropping the
/// manager closes it gracefully in the background.
pub struct UtpSocketManager {
    command_tx: mpsc::Sender<DispatcherCommand>,
    local_addr: SocketAddr,
    closed: AtomicBool,
}

impl UtpSocketManager {
    pub async fn bind(addr: SocketAddr) -> Result<Self, UtpError> {
        Self::bind_with_config(addr, UtpConfig::default()).await
    }

    pub async fn bind_with_config(addr: SocketAddr, config: UtpConfig) -> Result<Self, UtpError> {
        let dispatcher = UtpDispatcher::new(addr, config).await?;
        let local_addr = dispatcher.local_addr();
        let command_tx = dispatcher.command_sender();
        tokio::spawn(dispatcher.run());
        tracing::info!("uTP socket bound to {}", local_addr);

        Ok(Self {
            command_tx,
            local_addr,
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start accepting inbound connections. Only one listener at a time.
    pub async fn listen(&self) -> Result<UtpListener, UtpError> {
        let incoming = request(&self.command_tx, DispatcherCommand::Listen).await?;
        Ok(UtpListener {
            local_addr: self.local_addr,
            incoming,
            command_tx: self.command_tx.clone(),
        })
    }

    /// Open a connection to `remote`. Returns as soon as the SYN is out; use
    /// [`UtpStream::wait_connected`] to wait for the handshake.
    pub async fn connect(&self, remote: SocketAddr) -> Result<UtpStream, UtpError> {
        self.open(remote, None).await
    }

    /// Like [`connect`](Self::connect) with a caller-chosen even id
    pub async fn connect_with_id(
        &self,
        remote: SocketAddr,
        id: ConnectionId,
    ) -> Result<UtpStream, UtpError> {
        self.open(remote, Some(id)).await
    }

    async fn open(&self, remote: SocketAddr, id: Option<ConnectionId>) -> Result<UtpStream, UtpError> {
        let stream = request(&self.command_tx, |reply| DispatcherCommand::Connect {
            remote,
            id,
            reply,
        })
        .await?;
        Ok(UtpStream::new(stream, self.command_tx.clone()))
    }

    /// Exchange probes with `target` until both directions answered or
    /// `attempts` probes went unanswered
    pub async fn punch(&self, attempts: u32, target: SocketAddr) -> Result<bool, UtpError> {
        request(&self.command_tx, |reply| DispatcherCommand::Punch {
            target,
            attempts,
            reply,
        })
        .await
    }

    /// Register with an introducer and wait for the other peer's public endpoint
    pub async fn rendezvous(
        &self,
        introducer: SocketAddr,
        role: PeerRole,
    ) -> Result<SocketAddr, UtpError> {
        let payload = rendezvous::encode_registration(role)?;
        let reply = request(&self.command_tx, |reply| DispatcherCommand::Rendezvous {
            introducer,
            payload,
            reply,
        })
        .await?;
        let peer = rendezvous::decode_peer(&reply)?;
        tracing::info!("Introducer {} sent peer {}", introducer, peer);
        Ok(peer)
    }

    /// End every connection, wait for them to finish, then release the socket
    pub async fn close(&self) -> Result<(), UtpError> {
        self.closed.store(true, Ordering::Release);
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .command_tx
            .send(DispatcherCommand::Close(Some(done_tx)))
            .await
            .is_err()
        {
            // dispatcher already gone
            return Ok(());
        }
        let _ = done_rx.await;
        Ok(())
    }
}

impl Drop for UtpSocketManager {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            let _ = self.command_tx.try_send(DispatcherCommand::Close(None));
        }
    }
}

/// Inbound connections of one socket
pub struct UtpListener {
    local_addr: SocketAddr,
    incoming: mpsc::Receiver<NewStream>,
    command_tx: mpsc::Sender<DispatcherCommand>,
}

impl UtpListener {
    /// Next accepted connection. Fails once the socket closes.
    pub async fn accept(&mut self) -> Result<(UtpStream, SocketAddr), UtpError> {
        let stream = self.incoming.recv().await.ok_or(UtpError::SocketClosed)?;
        let stream = UtpStream::new(stream, self.command_tx.clone());
        let remote = stream.remote_addr();
        Ok((stream, remote))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utp::common::Role;
    use crate::utp::connection::ConnectionEvent;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::AtomicU16;
    use std::time::Duration;
    use tokio::net::UdpSocket;
    use tokio::time::timeout;

    static NEXT_PORT: AtomicU16 = AtomicU16::new(33000);

    fn unique_addr() -> SocketAddr {
        let port = NEXT_PORT.fetch_add(1, Ordering::Relaxed);
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    const WAIT: Duration = Duration::from_secs(5);

    async fn pair() -> (UtpSocketManager, UtpListener, UtpSocketManager) {
        let server = UtpSocketManager::bind(unique_addr()).await.unwrap();
        let listener = server.listen().await.unwrap();
        let client = UtpSocketManager::bind(unique_addr()).await.unwrap();
        (server, listener, client)
    }

    /// Events seen until `Closed`, inclusive
    async fn drain_until_closed(stream: &mut UtpStream) -> Vec<ConnectionEvent> {
        timeout(WAIT, async {
            let mut seen = Vec::new();
            while let Some(event) = stream.next_event().await {
                let closed = matches!(event, ConnectionEvent::Closed);
                seen.push(event);
                if closed {
                    break;
                }
            }
            seen
        })
        .await
        .unwrap()
    }

    fn has_error(events: &[ConnectionEvent]) -> bool {
        events.iter().any(|e| matches!(e, ConnectionEvent::Error(_)))
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let (server, mut listener, client) = pair().await;

        let server_task = tokio::spawn(async move {
            let (mut stream, remote) = listener.accept().await.unwrap();
            assert_eq!(stream.role(), Role::Acceptor);
            let ping = stream.read().await.unwrap().unwrap();
            assert_eq!(ping, b"PING");
            stream.write(b"PONG").await.unwrap();
            remote
        });

        let mut stream = client.connect(server.local_addr()).await.unwrap();
        timeout(WAIT, stream.wait_connected()).await.unwrap().unwrap();
        stream.write(b"PING").await.unwrap();
        let pong = timeout(WAIT, stream.read()).await.unwrap().unwrap();
        assert_eq!(pong.as_deref(), Some(&b"PONG"[..]));

        let remote = timeout(WAIT, server_task).await.unwrap().unwrap();
        assert_eq!(remote, client.local_addr());
    }

    #[tokio::test]
    async fn test_bind_address_in_use() {
        let first = UtpSocketManager::bind(unique_addr()).await.unwrap();
        let second = UtpSocketManager::bind(first.local_addr()).await;
        assert!(matches!(second, Err(UtpError::AddressInUse(_))));
    }

    #[tokio::test]
    async fn test_listen_twice() {
        let (server, _listener, _client) = pair().await;
        assert!(matches!(server.listen().await, Err(UtpError::AlreadyListening)));
    }

    #[tokio::test]
    async fn test_write_sequence_arrives_in_order() {
        let (server, mut listener, client) = pair().await;

        let server_task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.read_to_end().await.unwrap()
        });

        let mut stream = client.connect(server.local_addr()).await.unwrap();
        let mut expected = Vec::new();
        for i in 0..50u32 {
            let chunk = format!("chunk-{};", i).into_bytes();
            stream.write(&chunk).await.unwrap();
            expected.extend_from_slice(&chunk);
        }
        stream.end().await.unwrap();

        let received = timeout(WAIT, server_task).await.unwrap().unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_large_write() {
        let (server, mut listener, client) = pair().await;

        let server_task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.read_to_end().await.unwrap()
        });

        let data: Vec<u8> = (0..100 * 1024).map(|i| (i % 251) as u8).collect();
        let mut stream = client.connect(server.local_addr()).await.unwrap();
        stream.write(&data).await.unwrap();
        stream.end().await.unwrap();

        let received = timeout(WAIT, server_task).await.unwrap().unwrap();
        assert_eq!(received.len(), data.len());
        assert!(received == data);
    }

    #[tokio::test]
    async fn test_graceful_close_of_both_sides() {
        let (server, mut listener, client) = pair().await;

        let mut stream = client.connect(server.local_addr()).await.unwrap();
        stream.write(b"bye").await.unwrap();
        stream.end().await.unwrap();

        let (mut accepted, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        let received = timeout(WAIT, accepted.read_to_end()).await.unwrap().unwrap();
        assert_eq!(received, b"bye");

        let accepted_events = drain_until_closed(&mut accepted).await;
        let stream_events = drain_until_closed(&mut stream).await;
        assert!(accepted.is_closed());
        assert!(stream.is_closed());
        assert!(!has_error(&accepted_events), "{:?}", accepted_events);
        assert!(!has_error(&stream_events), "{:?}", stream_events);
    }

    #[tokio::test]
    async fn test_connection_ids_rotate() {
        let (server, mut listener, client) = pair().await;
        let server_task = tokio::spawn(async move {
            for _ in 0..3 {
                let (mut stream, _) = listener.accept().await.unwrap();
                stream.read_to_end().await.unwrap();
            }
        });

        let mut ids = Vec::new();
        for _ in 0..3 {
            let mut stream = client.connect(server.local_addr()).await.unwrap();
            timeout(WAIT, stream.wait_connected()).await.unwrap().unwrap();
            ids.push(stream.connection_id());
            stream.end().await.unwrap();
            drain_until_closed(&mut stream).await;
        }
        timeout(WAIT, server_task).await.unwrap().unwrap();

        assert!(ids.iter().all(|id| id % 2 == 0));
        assert_ne!(ids[0], ids[1]);
        assert_ne!(ids[1], ids[2]);
        assert_ne!(ids[0], ids[2]);
    }

    #[tokio::test]
    async fn test_connect_with_duplicate_id() {
        let client = UtpSocketManager::bind(unique_addr()).await.unwrap();
        let remote = unique_addr();
        let _first = client.connect_with_id(remote, 100).await.unwrap();
        let second = client.connect_with_id(remote, 100).await;
        assert!(matches!(second, Err(UtpError::AlreadyConnected(addr)) if addr == remote));
        assert!(client.connect_with_id(unique_addr(), 100).await.is_ok());
    }

    #[tokio::test]
    async fn test_idle_timeout_fires_once() {
        let silent = UdpSocket::bind(unique_addr()).await.unwrap();
        let config = UtpConfig::default().with_timeout(Duration::from_millis(1000));
        let client = UtpSocketManager::bind_with_config(unique_addr(), config)
            .await
            .unwrap();

        let mut stream = client.connect(silent.local_addr().unwrap()).await.unwrap();
        let event = timeout(Duration::from_secs(3), stream.next_event())
            .await
            .unwrap();
        assert!(matches!(event, Some(ConnectionEvent::Timeout)));

        // nothing re-arms the deadline, so no second notification
        let again = timeout(Duration::from_millis(2000), stream.next_event()).await;
        assert!(again.is_err());
    }

    #[tokio::test]
    async fn test_end_without_answer_closes() {
        let silent = UdpSocket::bind(unique_addr()).await.unwrap();
        let config = UtpConfig::default().with_timeout(Duration::from_millis(500));
        let client = UtpSocketManager::bind_with_config(unique_addr(), config)
            .await
            .unwrap();

        let mut stream = client.connect(silent.local_addr().unwrap()).await.unwrap();
        stream.end().await.unwrap();

        let mut saw_end = false;
        timeout(WAIT, async {
            while let Some(event) = stream.next_event().await {
                match event {
                    ConnectionEvent::End => saw_end = true,
                    ConnectionEvent::Closed => break,
                    _ => {}
                }
            }
        })
        .await
        .unwrap();
        assert!(saw_end);
    }

    #[tokio::test]
    async fn test_punch_between_managers() {
        let a = UtpSocketManager::bind(unique_addr()).await.unwrap();
        let b = UtpSocketManager::bind(unique_addr()).await.unwrap();

        let (ra, rb) = tokio::join!(a.punch(5, b.local_addr()), b.punch(5, a.local_addr()));
        assert!(ra.unwrap());
        assert!(rb.unwrap());

        // the punched path carries a connection
        let mut listener = b.listen().await.unwrap();
        let mut stream = a.connect(b.local_addr()).await.unwrap();
        timeout(WAIT, stream.wait_connected()).await.unwrap().unwrap();
        let (accepted, remote) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        assert_eq!(remote, a.local_addr());
        assert_eq!(accepted.connection_id(), stream.connection_id());
    }

    #[tokio::test]
    async fn test_punch_without_peer_fails() {
        let a = UtpSocketManager::bind(unique_addr()).await.unwrap();
        let result = timeout(WAIT, a.punch(2, unique_addr())).await.unwrap();
        assert!(!result.unwrap());
    }

    #[tokio::test]
    async fn test_rendezvous_with_introducer() {
        let introducer = UdpSocket::bind(unique_addr()).await.unwrap();
        let introducer_addr = introducer.local_addr().unwrap();
        let peer = UtpSocketManager::bind(unique_addr()).await.unwrap();
        let peer_addr = peer.local_addr();

        let fake_introducer = tokio::spawn(async move {
            let mut buf = [0u8; 256];
            let (size, from) = introducer.recv_from(&mut buf).await.unwrap();
            assert_eq!(from, peer_addr);
            assert_eq!(&buf[..size], br#"{"name":"CLIENT"}"#);
            introducer
                .send_to(br#"{"address":"192.0.2.10","port":6000}"#, from)
                .await
                .unwrap();
        });

        let other = timeout(WAIT, peer.rendezvous(introducer_addr, PeerRole::Client))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(other, "192.0.2.10:6000".parse().unwrap());
        fake_introducer.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_ends_open_connections() {
        let (server, mut listener, client) = pair().await;

        let mut stream = client.connect(server.local_addr()).await.unwrap();
        timeout(WAIT, stream.wait_connected()).await.unwrap().unwrap();
        let (mut accepted, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();

        timeout(WAIT, client.close()).await.unwrap().unwrap();
        assert_eq!(timeout(WAIT, accepted.read()).await.unwrap().unwrap(), None);
        drain_until_closed(&mut stream).await;

        // closing again is a no-op, new work is refused
        client.close().await.unwrap();
        assert!(matches!(
            client.connect(server.local_addr()).await,
            Err(UtpError::SocketClosed)
        ));
    }

    #[tokio::test]
    async fn test_accept_after_close() {
        let (server, mut listener, _client) = pair().await;
        server.close().await.unwrap();
        assert!(matches!(listener.accept().await, Err(UtpError::SocketClosed)));
    }
}
