//! A group member: joins a leader, mirrors membership and the intersected
//! music set, and applies replicated playlist operations.

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
use crate::overlay::Event;
use crate::queue_set::QueueSender;

pub struct GroupMember {
    shared: Arc<MemberShared>,
}

struct MemberShared {
    /// This member's own group server address.
    group_addr: NodeAddress,
    leader: Mutex<NodeAddress>,
    peers: Mutex<HashSet<NodeAddress>>,
    music: Mutex<HashSet<TrackHash>>,
    join_pending: Mutex<bool>,
    catalog: Arc<dyn Catalog>,
    /// Lets the role tell the overlay engine when the leader dissolved
    /// the group.
    engine: QueueSender<Event>,
    shutdown: Notify,
}

impl GroupMember {
    /// Starts this member's group server and contacts the leader. An
    /// unreachable leader fails the join and tears the server down again.
    pub(crate) async fn join(
        leader: NodeAddress,
        config: &NodeConfig,
        catalog: Arc<dyn Catalog>,
        engine: QueueSender<Event>,
    ) -> Result<GroupMember, GroupError> {
        let listener = TcpListener::bind((config.host.as_str(), config.group_port))
            .await
            .map_err(GroupError::Bind)?;
        let port = listener.local_addr().map_err(GroupError::Bind)?.port();
        let group_addr = NodeAddress::new(&config.host, port);
        tracing::info!(%group_addr, %leader, "starting group member server");

        let shared = Arc::new(MemberShared {
            group_addr,
            leader: Mutex::new(leader.clone()),
            peers: Mutex::new(HashSet::new()),
            music: Mutex::new(catalog.hashes()),
            join_pending: Mutex::new(true),
            catalog,
            engine,
            shutdown: Notify::new(),
        });
        tokio::spawn(serve(listener, shared.clone()));

        tracing::debug!(%leader, "contacting group leader");
        if let Err(error) = super::send_oneshot(&leader, &Message::GroupJoin { port }).await {
            shared.shutdown.notify_one();
            return Err(error);
        }
        Ok(GroupMember { shared })
    }

    pub fn leader(&self) -> NodeAddress {
        self.shared.leader.lock().clone()
    }

    pub fn music(&self) -> HashSet<TrackHash> {
        self.shared.music.lock().clone()
    }

    pub fn members(&self) -> Vec<NodeAddress> {
        let mut members: Vec<_> = self.shared.peers.lock().iter().cloned().collect();
        members.sort();
        members
    }

    pub fn join_pending(&self) -> bool {
        *self.shared.join_pending.lock()
    }

    /// Leaves the group: tells the leader, then stops the server.
    pub(crate) async fn leave(self) {
        let leader = self.leader();
        if let Err(error) = super::send_oneshot(&leader, &Message::GroupLeave).await {
            tracing::warn!(%leader, %error, "cannot announce leave to the leader");
        }
        self.shared.shutdown.notify_one();
    }

    pub(crate) async fn replicate(&self, op: crate::message::PlaylistOp) {
        let mut targets = self.shared.peers.lock().clone();
        targets.insert(self.leader());
        targets.remove(&self.shared.group_addr);
        super::broadcast(&targets, &Message::GroupPlaylist(op)).await;
    }
}

async fn serve(listener: TcpListener, shared: Arc<MemberShared>) {
    loop {
        tokio::select! {
            _ = shared.shutdown.notified() => {
                tracing::debug!(group = %shared.group_addr, "group member server stopping");
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

async fn handle(stream: TcpStream, remote: SocketAddr, shared: Arc<MemberShared>) {
    let Some(message) = super::read_oneshot(stream).await else {
        return;
    };
    tracing::debug!(%remote, %message, "group member received message");

    match message {
        Message::GroupInfo { leader, members } => {
            {
                let mut peers = shared.peers.lock();
                *peers = members;
                peers.remove(&shared.group_addr);
            }
            let first = {
                let mut pending = shared.join_pending.lock();
                std::mem::replace(&mut *pending, false)
            };
            if first {
                *shared.leader.lock() = leader.clone();
                let music = shared.music.lock().clone();
                if let Err(error) =
                    super::send_oneshot(&leader, &Message::GroupMusic { hashes: music }).await
                {
                    tracing::warn!(%leader, %error, "cannot offer music to the leader");
                }
                tracing::info!(%leader, "group join complete");
            }
        }
        Message::GroupMusic { hashes } => {
            let mut music = shared.music.lock();
            music.retain(|hash| hashes.contains(hash));
            tracing::info!(tracks = music.len(), "group music updated");
        }
        Message::GroupLeave => {
            tracing::info!("group dissolved by the leader");
            shared.shutdown.notify_one();
            shared.engine.send(Event::GroupDissolved);
        }
        Message::GroupPlaylist(op) => super::apply_playlist_op(&*shared.catalog, op),
        other => {
            tracing::warn!(%remote, message = %other, "unexpected message on the group server");
        }
    }
}
