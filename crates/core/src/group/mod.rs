//! Listening groups: a leader merges the members' catalogs by
//! intersection and everyone replicates playlist operations.
//!
//! Each role runs its own small TCP server, independent of the overlay
//! dispatcher. All group traffic is one-shot: a fresh connection carries
//! exactly one framed message and is closed, so handlers never hold
//! long-lived sockets.

use std::collections::HashSet;

use tokio::io::BufReader;
use tokio::net::TcpStream;

use crate::config::DIAL_TIMEOUT;
use crate::media::{Catalog, TrackHash};
use crate::message::{self, FrameError, Message, NodeAddress, PlaylistOp};

mod leader;
mod member;

pub use leader::GroupLeader;
pub use member::GroupMember;

#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    #[error("cannot reach {0}: {1}")]
    Unreachable(NodeAddress, std::io::Error),
    #[error("contacting {0} timed out")]
    Timeout(NodeAddress),
    #[error("cannot start group server: {0}")]
    Bind(std::io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Summary of the local group role for status reporting.
#[derive(Debug, Clone)]
pub struct GroupStatus {
    pub leading: bool,
    /// The group's contact address: our own server when leading, the
    /// leader's otherwise.
    pub leader: NodeAddress,
    pub members: Vec<NodeAddress>,
    pub tracks: usize,
    pub join_pending: bool,
}

/// The role this node currently plays in a group. At most one exists.
pub enum GroupRole {
    Leader(GroupLeader),
    Member(GroupMember),
}

impl GroupRole {
    /// The address other nodes should contact to join this group.
    pub fn group_address(&self) -> NodeAddress {
        match self {
            GroupRole::Leader(leader) => leader.group_address(),
            GroupRole::Member(member) => member.leader(),
        }
    }

    pub fn music(&self) -> HashSet<TrackHash> {
        match self {
            GroupRole::Leader(leader) => leader.music(),
            GroupRole::Member(member) => member.music(),
        }
    }

    pub fn status(&self) -> GroupStatus {
        match self {
            GroupRole::Leader(leader) => GroupStatus {
                leading: true,
                leader: leader.group_address(),
                members: leader.members(),
                tracks: leader.music().len(),
                join_pending: false,
            },
            GroupRole::Member(member) => GroupStatus {
                leading: false,
                leader: member.leader(),
                members: member.members(),
                tracks: member.music().len(),
                join_pending: member.join_pending(),
            },
        }
    }

    /// Leaves the group, tearing down this role's own server.
    pub(crate) async fn leave(self) {
        match self {
            GroupRole::Leader(leader) => leader.leave().await,
            GroupRole::Member(member) => member.leave().await,
        }
    }

    /// Applies a playlist operation on every other group participant.
    pub(crate) async fn replicate(&self, op: PlaylistOp) {
        match self {
            GroupRole::Leader(leader) => leader.replicate(op).await,
            GroupRole::Member(member) => member.replicate(op).await,
        }
    }
}

/// Sends one framed message over a fresh connection, then drops it.
pub(crate) async fn send_oneshot(
    address: &NodeAddress,
    message: &Message,
) -> Result<(), GroupError> {
    let mut stream = tokio::time::timeout(
        DIAL_TIMEOUT,
        TcpStream::connect((address.host(), address.port())),
    )
    .await
    .map_err(|_| GroupError::Timeout(address.clone()))?
    .map_err(|error| GroupError::Unreachable(address.clone(), error))?;
    message::write_frame(&mut stream, message).await?;
    Ok(())
}

/// Reads the one message an accepted group connection carries.
pub(crate) async fn read_oneshot(stream: TcpStream) -> Option<Message> {
    let mut reader = BufReader::new(stream);
    match message::read_frame(&mut reader).await {
        Ok(message) => message,
        Err(error) => {
            tracing::warn!(%error, "dropping bad group message");
            None
        }
    }
}

/// Delivers a message to every address, logging the stragglers.
pub(crate) async fn broadcast(targets: &HashSet<NodeAddress>, message: &Message) {
    for target in targets {
        if let Err(error) = send_oneshot(target, message).await {
            tracing::warn!(%target, %error, "cannot deliver group message");
        }
    }
}

/// Applies a replicated playlist operation against the local catalog.
pub(crate) fn apply_playlist_op(catalog: &dyn Catalog, op: PlaylistOp) {
    match op {
        PlaylistOp::Add(hash) => match catalog.lookup(hash) {
            Some(track) => {
                tracing::info!(%track, "queueing replicated track");
                if let Err(error) = catalog.playlist_add(&track) {
                    tracing::warn!(%error, "cannot queue replicated track");
                }
            }
            None => tracing::warn!(%hash, "replicated track is not in the local catalog"),
        },
        PlaylistOp::Play(index) => {
            tracing::info!(index, "starting replicated playback");
            if let Err(error) = catalog.play(index as usize) {
                tracing::warn!(%error, "cannot start replicated playback");
            }
        }
    }
}
