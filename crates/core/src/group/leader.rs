//! The leader's side of a group: membership, catalog intersection and
//! broadcasts.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

use super::GroupError;
use crate::config::NodeConfig;
use crate::media::{Catalog, TrackHash};
use crate::message::{Message, NodeAddress};

pub struct GroupLeader {
    shared: Arc<LeaderShared>,
}

struct LeaderShared {
    group_addr: NodeAddress,
    members: Mutex<HashSet<NodeAddress>>,
    music: Mutex<HashSet<TrackHash>>,
    catalog: Arc<dyn Catalog>,
    shutdown: Notify,
}

impl GroupLeader {
    /// Binds the leader's group server and starts serving. The group's
    /// music set starts as the local catalog.
    pub(crate) async fn spawn(
        config: &NodeConfig,
        catalog: Arc<dyn Catalog>,
    ) -> Result<GroupLeader, GroupError> {
        let listener = TcpListener::bind((config.host.as_str(), config.group_port))
            .await
            .map_err(GroupError::Bind)?;
        let port = listener.local_addr().map_err(GroupError::Bind)?.port();
        let group_addr = NodeAddress::new(&config.host, port);
        tracing::info!(%group_addr, "starting group leader server");

        let shared = Arc::new(LeaderShared {
            group_addr,
            members: Mutex::new(HashSet::new()),
            music: Mutex::new(catalog.hashes()),
            catalog,
            shutdown: Notify::new(),
        });
        tokio::spawn(serve(listener, shared.clone()));
        Ok(GroupLeader { shared })
    }

    pub fn group_address(&self) -> NodeAddress {
        self.shared.group_addr.clone()
    }

    pub fn music(&self) -> HashSet<TrackHash> {
        self.shared.music.lock().clone()
    }

    pub fn members(&self) -> Vec<NodeAddress> {
        let mut members: Vec<_> = self.shared.members.lock().iter().cloned().collect();
        members.sort();
        members
    }

    /// Dissolves the group: tells every member, then stops the server.
    pub(crate) async fn leave(self) {
        let members = self.shared.members.lock().clone();
        super::broadcast(&members, &Message::GroupLeave).await;
        self.shared.shutdown.notify_one();
    }

    pub(crate) async fn replicate(&self, op: crate::message::PlaylistOp) {
        let members = self.shared.members.lock().clone();
        super::broadcast(&members, &Message::GroupPlaylist(op)).await;
    }
}

async fn serve(listener: TcpListener, shared: Arc<LeaderShared>) {
    loop {
        tokio::select! {
            _ = shared.shutdown.notified() => {
                tracing::debug!(group = %shared.group_addr, "group leader server stopping");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    tokio::spawn(handle(stream, remote, shared.clone()));
                }
                Err(error) => tracing::warn!(%error, "group accept failed"),
            }
        }
    }
}

async fn handle(stream: TcpStream, remote: SocketAddr, shared: Arc<LeaderShared>) {
    let Some(message) = super::read_oneshot(stream).await else {
        return;
    };
    tracing::debug!(%remote, %message, "group leader received message");

    match message {
        Message::GroupJoin { port } => {
            let member = NodeAddress::new(remote.ip().to_string(), port);
            tracing::info!(%member, "member joined the group");
            let members = {
                let mut members = shared.members.lock();
                members.insert(member);
                members.clone()
            };
            let info = Message::GroupInfo {
                leader: shared.group_addr.clone(),
                members: members.clone(),
            };
            super::broadcast(&members, &info).await;
        }
        Message::GroupMusic { hashes } => {
            let updated = {
                let mut music = shared.music.lock();
                music.retain(|hash| hashes.contains(hash));
                music.clone()
            };
            tracing::info!(tracks = updated.len(), "group music intersected");
            let members = shared.members.lock().clone();
            super::broadcast(&members, &Message::GroupMusic { hashes: updated }).await;
        }
        Message::GroupLeave => {
            // GroupLeave carries no identity, so membership stays as-is;
            // stale members show up as logged broadcast failures
            tracing::info!(%remote, "member announced leaving");
        }
        Message::GroupPlaylist(op) => super::apply_playlist_op(&*shared.catalog, op),
        other => {
            tracing::warn!(%remote, message = %other, "unexpected message on the group server");
        }
    }
}
