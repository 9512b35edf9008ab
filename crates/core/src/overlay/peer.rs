//! One actor per overlay TCP connection.
//!
//! The engine and the connection's reader task share a [`Peer`] through an
//! `Arc`. Only the reader mutates the address and state; socket writes are
//! serialized by the connection's write lock. The reader owns connection
//! health: it pushes every decoded message into the peer's inbox queue and
//! exactly one closed sentinel at end-of-stream.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use super::Event;
use crate::config::DIAL_TIMEOUT;
use crate::message::{self, Message, NodeAddress};
use crate::queue_set::QueueSender;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("dial to {0} timed out")]
    Timeout(NodeAddress),
    #[error("dial to {0} failed: {1}")]
    Refused(NodeAddress, std::io::Error),
}

/// Opens a TCP connection with the hard dial timeout. Runs on worker
/// tasks so a slow candidate never stalls the dispatcher.
pub(crate) async fn dial(address: NodeAddress) -> Result<TcpStream, ConnectError> {
    let attempt = tokio::time::timeout(
        DIAL_TIMEOUT,
        TcpStream::connect((address.host(), address.port())),
    )
    .await;
    match attempt {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(error)) => Err(ConnectError::Refused(address, error)),
        Err(_) => Err(ConnectError::Timeout(address)),
    }
}

pub(crate) struct Peer {
    /// Canonical peer address. The reader fixes up the port in place once
    /// the peer's Hello announces where it really listens.
    address: RwLock<NodeAddress>,
    state: RwLock<ConnState>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    inbox: QueueSender<Event>,
}

impl Peer {
    /// Wraps an established connection, sends the handshake and starts the
    /// read loop. `address` is the dialed address for outbound connections
    /// or the socket endpoint for accepted ones.
    pub(crate) async fn start(
        stream: TcpStream,
        address: NodeAddress,
        local_port: u16,
        inbox: QueueSender<Event>,
    ) -> Arc<Peer> {
        let (read_half, write_half) = stream.into_split();
        let peer = Arc::new(Peer {
            address: RwLock::new(address),
            state: RwLock::new(ConnState::Connecting),
            writer: Mutex::new(Some(write_half)),
            inbox,
        });
        peer.send(&Message::Hello {
            listen_port: local_port,
        })
        .await;
        *peer.state.write() = ConnState::Connected;
        tokio::spawn(read_loop(peer.clone(), read_half));
        peer
    }

    pub(crate) fn address(&self) -> NodeAddress {
        self.address.read().clone()
    }

    #[allow(dead_code)]
    pub(crate) fn state(&self) -> ConnState {
        *self.state.read()
    }

    /// Serializes and writes under the connection's write lock. Failures
    /// are logged, never propagated: the read loop alone decides when a
    /// connection is dead.
    pub(crate) async fn send(&self, message: &Message) {
        let mut guard = self.writer.lock().await;
        match guard.as_mut() {
            Some(writer) => {
                if let Err(error) = message::write_frame(writer, message).await {
                    tracing::warn!(peer = %self.address(), %message, %error, "message send failed");
                }
            }
            None => {
                tracing::debug!(peer = %self.address(), %message, "write side already closed");
            }
        }
    }

    /// Half-closes the write side. The read loop keeps running until the
    /// remote end closes too.
    pub(crate) async fn disconnect(&self) {
        let mut guard = self.writer.lock().await;
        if let Some(mut writer) = guard.take() {
            tracing::debug!(peer = %self.address(), "closing connection");
            if let Err(error) = writer.shutdown().await {
                tracing::debug!(peer = %self.address(), %error, "shutdown failed");
            }
        }
        *self.state.write() = ConnState::Disconnected;
    }
}

async fn read_loop(peer: Arc<Peer>, read_half: OwnedReadHalf) {
    let mut reader = BufReader::new(read_half);
    loop {
        match message::read_frame(&mut reader).await {
            Ok(Some(Message::Hello { listen_port })) => {
                let mut address = peer.address.write();
                tracing::debug!(
                    peer = %address, port = listen_port,
                    "peer announced its listen port"
                );
                *address = address.with_port(listen_port);
            }
            Ok(Some(message)) => {
                peer.inbox.send(Event::Message(message));
            }
            Ok(None) => {
                tracing::info!(peer = %peer.address(), "connection closed by remote");
                break;
            }
            Err(error) if error.is_recoverable() => {
                tracing::warn!(peer = %peer.address(), %error, "dropping undecodable message");
            }
            Err(error) => {
                tracing::info!(peer = %peer.address(), %error, "connection failed");
                break;
            }
        }
    }
    peer.disconnect().await;
    peer.inbox.send(Event::Closed);
}
