// utp/stream.rs

#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::utp::common::{ConnectionId, Role, UtpError};
use crate::utp::connection::ConnectionEvent;
use crate::utp::dispatcher::{DispatcherCommand, NewStream};
use crate::utp::ids::StreamKey;

/// A uTP connection as seen by the application.
///
/// The protocol state lives in the socket's dispatcher task. The handle sends
/// commands there and receives the connection's [`ConnectionEvent`]s in order.
/// Dropping the handle ends the write side.
#[derive(Debug)]
pub struct UtpStream {
    key: StreamKey,
    command_tx: mpsc::Sender<DispatcherCommand>,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    connected: bool,
    ended: bool,
    closed: bool,
}

impl UtpStream {
    pub(crate) fn new(stream: NewStream, command_tx: mpsc::Sender<DispatcherCommand>) -> Self {
        Self {
            key: stream.key,
            command_tx,
            events: stream.events,
            connected: false,
            ended: false,
            closed: false,
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.key.key.remote
    }

    /// The even id `E` of the connection's id pair
    pub fn connection_id(&self) -> ConnectionId {
        self.key.key.id
    }

    pub fn role(&self) -> Role {
        self.key.role
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Queue `data` for sending. Resolves once every chunk has entered the
    /// in-flight window, so awaiting each write provides backpressure.
    pub async fn write(&self, data: &[u8]) -> Result<(), UtpError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.command_tx
            .send(DispatcherCommand::Write(self.key, data.to_vec(), done_tx))
            .await
            .map_err(|_| UtpError::SocketClosed)?;
        done_rx.await.map_err(|_| UtpError::ConnectionClosed)?
    }

    /// Half-close: send FIN after the queued writes
    pub async fn end(&mut self) -> Result<(), UtpError> {
        self.ended = true;
        self.send(DispatcherCommand::End(self.key)).await
    }

    /// Abort without telling the peer
    pub async fn destroy(&mut self) -> Result<(), UtpError> {
        self.ended = true;
        self.send(DispatcherCommand::Destroy(self.key)).await
    }

    /// Idle timeout; zero disables it. Re-arms the deadline from now.
    pub async fn set_timeout(&self, timeout: Duration) -> Result<(), UtpError> {
        self.send(DispatcherCommand::SetTimeout(self.key, timeout)).await
    }

    pub async fn set_mtu(&self, mtu: usize) -> Result<(), UtpError> {
        self.send(DispatcherCommand::SetMtu(self.key, mtu)).await
    }

    async fn send(&self, cmd: DispatcherCommand) -> Result<(), UtpError> {
        self.command_tx
            .send(cmd)
            .await
            .map_err(|_| UtpError::SocketClosed)
    }

    /// Next notification, `None` after `Closed` has been delivered
    pub async fn next_event(&mut self) -> Option<ConnectionEvent> {
        let event = self.events.recv().await?;
        match &event {
            ConnectionEvent::Connected => self.connected = true,
            ConnectionEvent::Closed => self.closed = true,
            _ => {}
        }
        Some(event)
    }

    /// Wait for the handshake. Data that arrives first stays queued for
    /// [`read`](Self::read).
    pub async fn wait_connected(&mut self) -> Result<(), UtpError> {
        if self.connected {
            return Ok(());
        }
        match self.next_event().await {
            Some(ConnectionEvent::Connected) => Ok(()),
            Some(ConnectionEvent::Error(e)) => Err(e),
            Some(ConnectionEvent::Timeout) => Err(UtpError::IdleTimeout),
            _ => Err(UtpError::ConnectionClosed),
        }
    }

    /// Next chunk of received bytes, `Ok(None)` at end of stream
    pub async fn read(&mut self) -> Result<Option<Vec<u8>>, UtpError> {
        loop {
            match self.next_event().await {
                Some(ConnectionEvent::Data(bytes)) => return Ok(Some(bytes)),
                Some(ConnectionEvent::Connected) => continue,
                Some(ConnectionEvent::Error(e)) => return Err(e),
                Some(ConnectionEvent::Timeout) => return Err(UtpError::IdleTimeout),
                Some(ConnectionEvent::End) | Some(ConnectionEvent::Closed) | None => {
                    return Ok(None);
                }
            }
        }
    }

    /// Collect everything until the peer ends the stream
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, UtpError> {
        let mut buf = Vec::new();
        while let Some(bytes) = self.read().await? {
            buf.extend_from_slice(&bytes);
        }
        Ok(buf)
    }
}

impl Drop for UtpStream {
    fn drop(&mut self) {
        if !self.ended && !self.closed {
            let _ = self.command_tx.try_send(DispatcherCommand::End(self.key));
        }
    }
}
