//! Wire messages, addressing and framing.
//!
//! Every message is serialized to an opaque payload and framed as the
//! payload's decimal length in ASCII, a newline, then the payload bytes.
//! The message set is closed: handlers dispatch with an exhaustive match,
//! so a missing handler is a compile-time gap.

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use ulid::Ulid;

use crate::config::MAX_FRAME_SIZE;
use crate::media::TrackHash;

/// A peer's location as `host:port`. Equality and hashing are by value;
/// protocol state is keyed on this, never on connection identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddress {
    host: String,
    port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        NodeAddress {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn with_port(&self, port: u16) -> Self {
        NodeAddress {
            host: self.host.clone(),
            port,
        }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<SocketAddr> for NodeAddress {
    fn from(addr: SocketAddr) -> Self {
        NodeAddress {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid host/port: {0}")]
pub struct AddressParseError(String);

impl FromStr for NodeAddress {
    type Err = AddressParseError;

    /// Parses `host:port`; a bare port means localhost.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(port) = s.parse::<u16>() {
            return Ok(NodeAddress::new("127.0.0.1", port));
        }
        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| AddressParseError(s.to_owned()))?;
                Ok(NodeAddress::new(host.trim(), port))
            }
            _ => Err(AddressParseError(s.to_owned())),
        }
    }
}

/// Unique identifier of one flood round, carried by every ping and pong
/// belonging to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FloodId(Ulid);

impl FloodId {
    pub fn random() -> Self {
        FloodId(Ulid::new())
    }
}

impl fmt::Display for FloodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A replicated playlist mutation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PlaylistOp {
    /// Queue the track with this hash.
    Add(TrackHash),
    /// Start playing the given playlist index.
    Play(u32),
}

/// The closed set of wire messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Announces the sender's real listen port right after connecting; the
    /// source port of an outbound connection says nothing about where the
    /// peer accepts connections.
    Hello { listen_port: u16 },
    /// Flood discovery request.
    Ping { id: FloodId, ttl: u8 },
    /// Flood discovery response, aggregated along the reverse path.
    Pong {
        id: FloodId,
        peers: HashSet<NodeAddress>,
    },
    /// Request (or acknowledge) a stable neighbour relationship.
    Neighbour { force: bool },
    /// A sample of the sender's catalog, offered for match scoring.
    Sample { hashes: HashSet<TrackHash> },
    /// Ask to join the receiver's group; `port` is the sender's own group
    /// server port.
    GroupJoin { port: u16 },
    /// The leader's membership snapshot.
    GroupInfo {
        leader: NodeAddress,
        members: HashSet<NodeAddress>,
    },
    /// Catalog hash set for intersection.
    GroupMusic { hashes: HashSet<TrackHash> },
    /// Leave the current group.
    GroupLeave,
    /// Group discovery flood request.
    GroupPing { id: FloodId, ttl: u8 },
    /// Group discovery flood response.
    GroupPong {
        id: FloodId,
        group: NodeAddress,
        hashes: HashSet<TrackHash>,
    },
    /// Replicated playlist mutation.
    GroupPlaylist(PlaylistOp),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "HELLO",
            Message::Ping { .. } => "PING",
            Message::Pong { .. } => "PONG",
            Message::Neighbour { .. } => "NEIGHBOUR",
            Message::Sample { .. } => "SAMPLE",
            Message::GroupJoin { .. } => "GJOIN",
            Message::GroupInfo { .. } => "GINFO",
            Message::GroupMusic { .. } => "GMUSIC",
            Message::GroupLeave => "GLEAVE",
            Message::GroupPing { .. } => "GPING",
            Message::GroupPong { .. } => "GPONG",
            Message::GroupPlaylist(_) => "GPLAYLIST",
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Hello { listen_port } => write!(f, "HELLO myport={listen_port}"),
            Message::Ping { id, ttl } => write!(f, "PING id={id} ttl={ttl}"),
            Message::Pong { id, peers } => write!(f, "PONG id={id} peers={}", peers.len()),
            Message::Neighbour { force } => write!(f, "NEIGHBOUR force={force}"),
            Message::Sample { hashes } => write!(f, "SAMPLE hashes={}", hashes.len()),
            Message::GroupJoin { port } => write!(f, "GJOIN myport={port}"),
            Message::GroupInfo { leader, members } => {
                write!(f, "GINFO leader={leader} members={}", members.len())
            }
            Message::GroupMusic { hashes } => write!(f, "GMUSIC hashes={}", hashes.len()),
            Message::GroupLeave => write!(f, "GLEAVE"),
            Message::GroupPing { id, ttl } => write!(f, "GPING id={id} ttl={ttl}"),
            Message::GroupPong { id, group, .. } => write!(f, "GPONG id={id} group={group}"),
            Message::GroupPlaylist(PlaylistOp::Add(hash)) => write!(f, "GPLAYLIST add {hash}"),
            Message::GroupPlaylist(PlaylistOp::Play(index)) => write!(f, "GPLAYLIST play {index}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("i/o error on framed stream: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame length {0:?}")]
    BadLength(String),
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_SIZE} byte ceiling")]
    Oversized(usize),
    #[error("undecodable payload: {0}")]
    Decode(#[from] bincode::Error),
}

impl FrameError {
    /// Decode failures spoil only the one message; everything else means
    /// the stream can no longer be trusted.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, FrameError::Decode(_))
    }
}

/// Serializes a message into a complete frame.
pub fn encode(message: &Message) -> Result<Vec<u8>, FrameError> {
    let payload = bincode::serialize(message)?;
    let mut frame = format!("{}\n", payload.len()).into_bytes();
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Writes one framed message.
pub async fn write_frame<W>(writer: &mut W, message: &Message) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one framed message. `Ok(None)` is a clean end-of-stream at a
/// frame boundary.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Message>, FrameError>
where
    R: AsyncBufRead + Unpin,
{
    let mut header = Vec::new();
    let n = reader.read_until(b'\n', &mut header).await?;
    if n == 0 {
        return Ok(None);
    }
    if header.last() == Some(&b'\n') {
        header.pop();
    }
    let text = std::str::from_utf8(&header)
        .map_err(|_| FrameError::BadLength(String::from_utf8_lossy(&header).into_owned()))?;
    let length: usize = text
        .trim()
        .parse()
        .map_err(|_| FrameError::BadLength(text.to_owned()))?;
    if length > MAX_FRAME_SIZE {
        return Err(FrameError::Oversized(length));
    }
    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    Ok(Some(bincode::deserialize(&payload)?))
}
