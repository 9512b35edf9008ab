//! The overlay engine: joining, managing and searching the Gnutella-like
//! overlay.
//!
//! One dispatcher task owns all protocol state. Every other task — the
//! acceptor, each connection's reader, dial workers, the group servers,
//! the command shell — only ever talks to it by enqueueing events on the
//! engine's [`QueueSet`]. Events are classified by the queue they arrive
//! on: the accept queue, the command queue, the internal worker queue, or
//! a specific peer's inbox.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use futures::StreamExt;
use ordered_float::OrderedFloat;
use rand::seq::SliceRandom;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use crate::config::{NodeConfig, FLOOD_CACHE_SIZE, GROUP_PING_TTL, N_NEIGHBOURS, PING_TTL};
use crate::group::{GroupLeader, GroupMember, GroupRole, GroupStatus};
use crate::media::{Catalog, Track, TrackHash};
use crate::message::{FloodId, Message, NodeAddress, PlaylistOp};
use crate::queue_set::{QueueId, QueueSender, QueueSet};
use crate::util::BoundedMap;

mod peer;
#[cfg(test)]
mod tests;

pub use peer::ConnectError;
use peer::Peer;

/// How many catalog hashes a Sample message offers at most.
const SAMPLE_LIMIT: usize = 64;

/// Everything the dispatcher can be woken by.
pub(crate) enum Event {
    /// New inbound TCP connection, from the acceptor task.
    Accepted(TcpStream),
    /// A command from the local user (or a re-queued join).
    Command(Command),
    /// A worker finished an outbound dial.
    Dialed {
        purpose: DialPurpose,
        address: NodeAddress,
        result: Result<TcpStream, ConnectError>,
    },
    /// Our group role tore itself down after the leader left.
    GroupDissolved,
    /// A decoded message from a peer connection.
    Message(Message),
    /// The peer's read loop observed end-of-stream.
    Closed,
}

impl Event {
    fn kind(&self) -> &'static str {
        match self {
            Event::Accepted(_) => "accepted",
            Event::Command(_) => "command",
            Event::Dialed { .. } => "dialed",
            Event::GroupDissolved => "group-dissolved",
            Event::Message(_) => "message",
            Event::Closed => "closed",
        }
    }
}

/// Commands accepted over the engine's command queue.
pub enum Command {
    /// Join the overlay through the given entry candidates.
    Join(Vec<NodeAddress>),
    Status {
        reply: oneshot::Sender<StatusReport>,
    },
    /// Create a new group with this node as the leader.
    GroupNew,
    /// Join a group: an explicit leader address, or the best candidate
    /// discovered by `GroupFind`.
    GroupJoin { leader: Option<NodeAddress> },
    /// Flood a group discovery ping through the overlay.
    GroupFind,
    GroupLeave,
    /// The group's music set, resolved against the local catalog where
    /// possible, sorted for stable indexing.
    GroupMusic {
        reply: oneshot::Sender<Vec<(TrackHash, Option<Track>)>>,
    },
    /// Replicate "play this playlist index" through the group.
    GroupPlay { index: u32 },
    /// Replicate "queue the group track at this index".
    GroupAdd { index: usize },
    /// Offer a catalog sample to every neighbour for scoring.
    Sample,
}

pub(crate) enum DialPurpose {
    /// A join entry candidate.
    JoinEntry,
    /// A prospective neighbour during admission.
    Neighbour,
}

/// Where a group flood id came from, for dedup and reverse routing.
enum FloodOrigin {
    /// We flooded it ourselves.
    Local,
    /// It arrived from this peer; pongs route back there.
    Peer(NodeAddress),
}

/// The join protocol's phases. At most one join runs at a time.
enum JoinState {
    Idle,
    /// A dial worker is trying to reach the next entry candidate.
    Dialing { remaining: VecDeque<NodeAddress> },
    /// Ping sent to the entry; waiting for its aggregated Pong.
    AwaitingPong {
        entry: NodeAddress,
        ping_id: FloodId,
        remaining: VecDeque<NodeAddress>,
    },
    /// Dialing shuffled candidates until the neighbour set fills.
    Admitting {
        candidates: VecDeque<NodeAddress>,
        forced_sent: bool,
    },
}

impl JoinState {
    fn is_active(&self) -> bool {
        !matches!(self, JoinState::Idle)
    }
}

/// Bookkeeping for one flood this node is relaying.
struct FloodSession {
    /// Upstream peer the aggregated pong goes back to.
    from: NodeAddress,
    /// Neighbours whose pongs we still wait for.
    pending: HashSet<NodeAddress>,
    /// Addresses gathered from downstream pongs.
    collected: HashSet<NodeAddress>,
}

/// Snapshot of engine state, answered over a oneshot channel.
#[derive(Debug)]
pub struct StatusReport {
    pub address: NodeAddress,
    pub neighbours: Vec<NodeAddress>,
    pub joining: bool,
    pub group: Option<GroupStatus>,
    pub playlist: Vec<Track>,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[{}]", self.address)?;
        writeln!(f, "[Peers]")?;
        for neighbour in &self.neighbours {
            writeln!(f, "{neighbour}")?;
        }
        if self.joining {
            writeln!(f, "*joining*")?;
        }
        writeln!(f, "[Group]")?;
        match &self.group {
            Some(group) => {
                writeln!(f, "*{}*", group.tracks)?;
                if group.leading {
                    writeln!(f, "*leader*")?;
                } else {
                    writeln!(f, "*peer*")?;
                    writeln!(f, "{} *leader*", group.leader)?;
                }
                for member in &group.members {
                    writeln!(f, "{member}")?;
                }
            }
            None => writeln!(f, "*none*")?,
        }
        writeln!(f, "[Playlist]")?;
        for (index, track) in self.playlist.iter().enumerate() {
            writeln!(f, "{index}: {track}")?;
        }
        Ok(())
    }
}

/// Cheap handle for issuing commands to a running engine.
#[derive(Clone)]
pub struct OverlayHandle {
    commands: QueueSender<Event>,
}

impl OverlayHandle {
    pub fn command(&self, command: Command) {
        self.commands.send(Event::Command(command));
    }

    pub async fn status(&self) -> Option<StatusReport> {
        let (reply, answer) = oneshot::channel();
        self.command(Command::Status { reply });
        answer.await.ok()
    }

    pub async fn group_music(&self) -> Option<Vec<(TrackHash, Option<Track>)>> {
        let (reply, answer) = oneshot::channel();
        self.command(Command::GroupMusic { reply });
        answer.await.ok()
    }
}

/// The overlay engine. Owns every piece of protocol state; runs as a
/// single dispatcher task.
pub struct Overlay {
    config: NodeConfig,
    catalog: Arc<dyn Catalog>,
    local_addr: NodeAddress,
    queues: QueueSet<Event>,
    accept_q: QueueId,
    command_q: QueueId,
    internal_q: QueueId,
    /// Producer for worker results and group role notifications.
    internal: QueueSender<Event>,
    /// Producer for the command queue, kept for re-queued joins.
    commands: QueueSender<Event>,
    /// Every live connection, keyed by its inbox queue.
    peers: HashMap<QueueId, Arc<Peer>>,
    /// Stable overlay links, at most `N_NEIGHBOURS` unless force-accepted.
    neighbours: Vec<Arc<Peer>>,
    join: JoinState,
    /// In-flight floods this node is relaying.
    floods: HashMap<FloodId, FloodSession>,
    /// Flood ids already answered, including ones whose session is gone.
    seen_pings: BoundedMap<FloodId, ()>,
    /// Group flood dedup and reverse routes.
    group_pings: BoundedMap<FloodId, FloodOrigin>,
    /// Discovered groups, keyed by catalog overlap score.
    group_candidates: BTreeMap<OrderedFloat<f64>, NodeAddress>,
    group: Option<GroupRole>,
}

impl Overlay {
    /// Binds the overlay listener and assembles the engine. Bootstrap
    /// candidates from the config are queued as an initial join command.
    pub async fn bind(
        config: NodeConfig,
        catalog: Arc<dyn Catalog>,
    ) -> anyhow::Result<(Overlay, OverlayHandle)> {
        let listener = TcpListener::bind((config.host.as_str(), config.listen_port)).await?;
        let local_addr = NodeAddress::new(&config.host, listener.local_addr()?.port());
        tracing::info!(address = %local_addr, "overlay listener established");

        let mut queues = QueueSet::new();
        let accept = queues.register();
        let commands = queues.register();
        let internal = queues.register();

        tokio::spawn(accept_loop(listener, accept.clone()));

        if !config.bootstrap.is_empty() {
            commands.send(Event::Command(Command::Join(config.bootstrap.clone())));
        }

        let handle = OverlayHandle {
            commands: commands.clone(),
        };
        let overlay = Overlay {
            config,
            catalog,
            local_addr,
            accept_q: accept.id(),
            command_q: commands.id(),
            internal_q: internal.id(),
            internal,
            commands,
            queues,
            peers: HashMap::new(),
            neighbours: Vec::new(),
            join: JoinState::Idle,
            floods: HashMap::new(),
            seen_pings: BoundedMap::new(FLOOD_CACHE_SIZE),
            group_pings: BoundedMap::new(FLOOD_CACHE_SIZE),
            group_candidates: BTreeMap::new(),
            group: None,
        };
        Ok((overlay, handle))
    }

    /// The address this node advertises to peers.
    pub fn local_addr(&self) -> NodeAddress {
        self.local_addr.clone()
    }

    /// Runs the dispatcher until every event source is gone.
    pub async fn run(mut self) {
        while let Some((queue, event)) = self.queues.next().await {
            if queue == self.accept_q {
                self.on_accept(event).await;
            } else if queue == self.command_q {
                self.on_command(event).await;
            } else if queue == self.internal_q {
                self.on_internal(event).await;
            } else if self.peers.contains_key(&queue) {
                self.on_peer_event(queue, event).await;
            } else {
                tracing::warn!(kind = event.kind(), "event for an unknown queue");
            }
        }
        tracing::info!("overlay dispatcher stopping");
    }

    // -- connection plumbing --------------------------------------------

    async fn install_peer(&mut self, stream: TcpStream, address: NodeAddress) -> Arc<Peer> {
        let inbox = self.queues.register();
        let id = inbox.id();
        let peer = Peer::start(stream, address, self.local_addr.port(), inbox).await;
        self.peers.insert(id, peer.clone());
        peer
    }

    fn peer_by_addr(&self, address: &NodeAddress) -> Option<Arc<Peer>> {
        self.peers
            .values()
            .find(|peer| peer.address() == *address)
            .cloned()
    }

    fn is_neighbour(&self, address: &NodeAddress) -> bool {
        self.neighbours
            .iter()
            .any(|neighbour| neighbour.address() == *address)
    }

    fn spawn_dial(&self, purpose: DialPurpose, address: NodeAddress) {
        let events = self.internal.clone();
        tokio::spawn(async move {
            let result = peer::dial(address.clone()).await;
            events.send(Event::Dialed {
                purpose,
                address,
                result,
            });
        });
    }

    async fn on_accept(&mut self, event: Event) {
        let stream = match event {
            Event::Accepted(stream) => stream,
            other => {
                tracing::warn!(kind = other.kind(), "unexpected event on the accept queue");
                return;
            }
        };
        let address = match stream.peer_addr() {
            Ok(addr) => NodeAddress::from(addr),
            Err(error) => {
                tracing::warn!(%error, "accepted socket has no peer address");
                return;
            }
        };
        tracing::info!(%address, "new incoming peer connection");
        self.install_peer(stream, address).await;
    }

    // -- commands -------------------------------------------------------

    async fn on_command(&mut self, event: Event) {
        let command = match event {
            Event::Command(command) => command,
            other => {
                tracing::warn!(kind = other.kind(), "unexpected event on the command queue");
                return;
            }
        };
        match command {
            Command::Join(candidates) => self.start_join(candidates),
            Command::Status { reply } => {
                let _ = reply.send(self.status_report());
            }
            Command::GroupNew => self.group_new().await,
            Command::GroupJoin { leader } => self.group_join(leader).await,
            Command::GroupFind => self.group_find().await,
            Command::GroupLeave => self.group_leave().await,
            Command::GroupMusic { reply } => {
                let _ = reply.send(self.group_music_listing());
            }
            Command::GroupPlay { index } => self.group_playlist(PlaylistOp::Play(index)).await,
            Command::GroupAdd { index } => self.group_add(index).await,
            Command::Sample => self.send_sample().await,
        }
    }

    fn start_join(&mut self, candidates: Vec<NodeAddress>) {
        if self.join.is_active() {
            tracing::error!("already joining, ignoring join command");
            return;
        }
        if self.neighbours.len() >= N_NEIGHBOURS {
            tracing::error!("neighbour set is full, not joining");
            return;
        }
        tracing::info!(?candidates, "joining the overlay");
        self.dial_next_entry(candidates.into());
    }

    fn dial_next_entry(&mut self, mut remaining: VecDeque<NodeAddress>) {
        match remaining.pop_front() {
            Some(entry) => {
                tracing::info!(%entry, "trying to join via entry peer");
                self.spawn_dial(DialPurpose::JoinEntry, entry);
                self.join = JoinState::Dialing { remaining };
            }
            None => {
                tracing::error!("no entry peer available, join failed");
                self.join = JoinState::Idle;
            }
        }
    }

    // -- internal worker results ----------------------------------------

    async fn on_internal(&mut self, event: Event) {
        match event {
            Event::Dialed {
                purpose: DialPurpose::JoinEntry,
                address,
                result,
            } => self.on_entry_dialed(address, result).await,
            Event::Dialed {
                purpose: DialPurpose::Neighbour,
                address,
                result,
            } => self.on_neighbour_dialed(address, result).await,
            Event::GroupDissolved => {
                self.group = None;
            }
            other => {
                tracing::warn!(kind = other.kind(), "unexpected event on the worker queue");
            }
        }
    }

    async fn on_entry_dialed(
        &mut self,
        address: NodeAddress,
        result: Result<TcpStream, ConnectError>,
    ) {
        let remaining = match std::mem::replace(&mut self.join, JoinState::Idle) {
            JoinState::Dialing { remaining } => remaining,
            other => {
                tracing::warn!(%address, "entry dial finished but no join is dialing");
                self.join = other;
                return;
            }
        };
        match result {
            Err(error) => {
                tracing::warn!(%error, "cannot join via this entry");
                self.dial_next_entry(remaining);
            }
            Ok(stream) => {
                let peer = self.install_peer(stream, address.clone()).await;
                let ping_id = FloodId::random();
                peer.send(&Message::Ping {
                    id: ping_id,
                    ttl: PING_TTL,
                })
                .await;
                self.join = JoinState::AwaitingPong {
                    entry: address,
                    ping_id,
                    remaining,
                };
            }
        }
    }

    async fn on_neighbour_dialed(
        &mut self,
        address: NodeAddress,
        result: Result<TcpStream, ConnectError>,
    ) {
        let force = match &self.join {
            JoinState::Admitting { forced_sent, .. } => !forced_sent,
            _ => {
                tracing::debug!(%address, "neighbour dial finished outside admission");
                return;
            }
        };
        match result {
            Err(error) => {
                tracing::warn!(%error, "neighbour candidate does not work");
            }
            Ok(stream) => {
                let peer = self.install_peer(stream, address.clone()).await;
                tracing::info!(%address, "peer added as a neighbour");
                self.neighbours.push(peer.clone());
                peer.send(&Message::Neighbour { force }).await;
                if let JoinState::Admitting { forced_sent, .. } = &mut self.join {
                    *forced_sent = true;
                }
            }
        }
        self.advance_admission();
    }

    /// Dials the next usable admission candidate, or finishes the join.
    fn advance_admission(&mut self) {
        let (mut candidates, forced_sent) =
            match std::mem::replace(&mut self.join, JoinState::Idle) {
                JoinState::Admitting {
                    candidates,
                    forced_sent,
                } => (candidates, forced_sent),
                other => {
                    self.join = other;
                    return;
                }
            };
        if self.neighbours.len() >= N_NEIGHBOURS {
            tracing::info!("neighbour set filled, join complete");
            return;
        }
        while let Some(candidate) = candidates.pop_front() {
            if candidate == self.local_addr || self.is_neighbour(&candidate) {
                continue;
            }
            tracing::debug!(%candidate, "trying peer as a neighbour");
            self.spawn_dial(DialPurpose::Neighbour, candidate);
            self.join = JoinState::Admitting {
                candidates,
                forced_sent,
            };
            return;
        }
        tracing::info!(
            neighbours = self.neighbours.len(),
            "out of neighbour candidates, join finished"
        );
    }

    // -- peer events ----------------------------------------------------

    async fn on_peer_event(&mut self, queue: QueueId, event: Event) {
        match event {
            Event::Message(message) => {
                if let Some(peer) = self.peers.get(&queue) {
                    tracing::debug!(from = %peer.address(), %message, "received");
                }
                match message {
                    Message::Ping { id, ttl } => self.on_ping(queue, id, ttl).await,
                    Message::Pong { id, peers } => self.on_pong(queue, id, peers).await,
                    Message::Neighbour { force } => self.on_neighbour(queue, force).await,
                    Message::Sample { hashes } => self.on_sample(queue, hashes),
                    Message::GroupPing { id, ttl } => self.on_group_ping(queue, id, ttl).await,
                    Message::GroupPong { id, group, hashes } => {
                        self.on_group_pong(id, group, hashes).await
                    }
                    Message::Hello { .. }
                    | Message::GroupJoin { .. }
                    | Message::GroupInfo { .. }
                    | Message::GroupMusic { .. }
                    | Message::GroupLeave
                    | Message::GroupPlaylist(_) => {
                        tracing::warn!(%message, "unexpected message on an overlay link");
                    }
                }
            }
            Event::Closed => self.on_closed(queue).await,
            other => {
                tracing::warn!(kind = other.kind(), "unexpected event on a peer queue");
            }
        }
    }

    async fn on_ping(&mut self, queue: QueueId, id: FloodId, ttl: u8) {
        let Some(sender) = self.peers.get(&queue).cloned() else {
            return;
        };
        let sender_addr = sender.address();

        // neighbours we would have to wait for
        let dependencies: Vec<Arc<Peer>> = self
            .neighbours
            .iter()
            .filter(|neighbour| neighbour.address() != sender_addr)
            .cloned()
            .collect();

        if ttl == 0 || dependencies.is_empty() {
            sender
                .send(&Message::Pong {
                    id,
                    peers: HashSet::new(),
                })
                .await;
            if !self.is_neighbour(&sender_addr) {
                // transient probe connection
                sender.disconnect().await;
            }
            return;
        }

        if self.seen_pings.contains(&id) {
            tracing::debug!(%id, "known ping, answering with an empty pong");
            sender
                .send(&Message::Pong {
                    id,
                    peers: HashSet::new(),
                })
                .await;
            return;
        }
        self.seen_pings.insert(id, ());

        let pending = dependencies
            .iter()
            .map(|neighbour| neighbour.address())
            .collect();
        self.floods.insert(
            id,
            FloodSession {
                from: sender_addr,
                pending,
                collected: HashSet::new(),
            },
        );
        let forward = Message::Ping { id, ttl: ttl - 1 };
        for neighbour in &dependencies {
            tracing::debug!(to = %neighbour.address(), %id, "forwarding ping");
            neighbour.send(&forward).await;
        }
    }

    async fn on_pong(&mut self, queue: QueueId, id: FloodId, peers: HashSet<NodeAddress>) {
        let Some(sender) = self.peers.get(&queue).cloned() else {
            return;
        };
        let sender_addr = sender.address();

        let from_entry = matches!(
            &self.join,
            JoinState::AwaitingPong { entry, ping_id, .. }
                if *entry == sender_addr && *ping_id == id
        );
        if from_entry {
            let mut candidates: Vec<NodeAddress> = peers
                .into_iter()
                .chain([sender_addr])
                .filter(|candidate| {
                    *candidate != self.local_addr && !self.is_neighbour(candidate)
                })
                .collect();
            candidates.shuffle(&mut rand::thread_rng());
            tracing::debug!(?candidates, "got possible neighbours");
            self.join = JoinState::Admitting {
                candidates: candidates.into(),
                forced_sent: false,
            };
            // the transient entry connection closes on its own
            self.advance_admission();
            return;
        }

        let Some(session) = self.floods.get_mut(&id) else {
            tracing::warn!(from = %sender_addr, %id, "unexpected pong");
            return;
        };
        if !session.pending.remove(&sender_addr) {
            tracing::warn!(from = %sender_addr, %id, "pong from a peer that was not pending");
        }
        session.collected.insert(sender_addr);
        session.collected.extend(peers);

        if !session.pending.is_empty() {
            return;
        }
        tracing::debug!(%id, "collected all pending pongs");
        if let Some(session) = self.floods.remove(&id) {
            match self.peer_by_addr(&session.from) {
                Some(upstream) => {
                    upstream
                        .send(&Message::Pong {
                            id,
                            peers: session.collected,
                        })
                        .await;
                    if !self.is_neighbour(&session.from) {
                        upstream.disconnect().await;
                    }
                }
                None => {
                    tracing::debug!(upstream = %session.from, "upstream gone before aggregation finished");
                }
            }
        }
    }

    async fn on_neighbour(&mut self, queue: QueueId, force: bool) {
        let Some(sender) = self.peers.get(&queue).cloned() else {
            return;
        };
        let address = sender.address();
        if self.is_neighbour(&address) {
            tracing::debug!(%address, "already a neighbour");
            return;
        }
        if self.neighbours.len() >= N_NEIGHBOURS {
            if !force {
                tracing::debug!(%address, "neighbour set is full");
                return;
            }
            tracing::debug!(%address, "accepting a neighbour beyond the target");
        }
        tracing::info!(%address, "peer added as a neighbour");
        self.neighbours.push(sender.clone());
        sender.send(&Message::Neighbour { force: false }).await;
    }

    fn on_sample(&mut self, queue: QueueId, hashes: HashSet<TrackHash>) {
        let from = self.peers.get(&queue).map(|peer| peer.address());
        let score = self.catalog.sample_score(&hashes);
        tracing::info!(?from, score, offered = hashes.len(), "scored catalog sample");
    }

    async fn on_closed(&mut self, queue: QueueId) {
        let Some(peer) = self.peers.remove(&queue) else {
            self.queues.remove(queue);
            return;
        };
        self.queues.remove(queue);
        let address = peer.address();
        tracing::info!(%address, "connection closed");

        let entry_died = matches!(
            &self.join,
            JoinState::AwaitingPong { entry, .. } if *entry == address
        );
        if entry_died {
            tracing::error!("error joining, entry died");
            let remaining = match std::mem::replace(&mut self.join, JoinState::Idle) {
                JoinState::AwaitingPong { remaining, .. } => remaining,
                _ => VecDeque::new(),
            };
            if remaining.is_empty() {
                tracing::error!("joining finally failed");
            } else {
                tracing::info!("more entries to try");
                self.commands
                    .send(Event::Command(Command::Join(remaining.into())));
            }
        }

        // remove by connection, not by address: a dying transient probe
        // must not evict a live neighbour link to the same peer
        if let Some(position) = self
            .neighbours
            .iter()
            .position(|neighbour| Arc::ptr_eq(neighbour, &peer))
        {
            tracing::debug!(%address, "forgetting peer as a neighbour");
            self.neighbours.remove(position);
        }
    }

    // -- group sub-protocol ---------------------------------------------

    async fn on_group_ping(&mut self, queue: QueueId, id: FloodId, ttl: u8) {
        let Some(sender) = self.peers.get(&queue).cloned() else {
            return;
        };
        let sender_addr = sender.address();

        if self.group_pings.contains(&id) {
            tracing::debug!(%id, "known group ping, ignoring");
            return;
        }
        self.group_pings
            .insert(id, FloodOrigin::Peer(sender_addr.clone()));

        if ttl > 0 {
            let forward = Message::GroupPing { id, ttl: ttl - 1 };
            for neighbour in &self.neighbours {
                if neighbour.address() != sender_addr {
                    neighbour.send(&forward).await;
                }
            }
        }

        if let Some(role) = &self.group {
            tracing::debug!(to = %sender_addr, "answering with a group pong");
            sender
                .send(&Message::GroupPong {
                    id,
                    group: role.group_address(),
                    hashes: role.music(),
                })
                .await;
        }
    }

    async fn on_group_pong(&mut self, id: FloodId, group: NodeAddress, hashes: HashSet<TrackHash>) {
        match self.group_pings.get(&id) {
            None => tracing::debug!(%id, "group pong for an unknown id"),
            Some(FloodOrigin::Peer(origin)) => {
                let origin = origin.clone();
                tracing::debug!(%id, to = %origin, "reverse-routing group pong");
                match self.peer_by_addr(&origin) {
                    Some(peer) => peer.send(&Message::GroupPong { id, group, hashes }).await,
                    None => tracing::debug!(%origin, "group ping origin is gone"),
                }
            }
            Some(FloodOrigin::Local) => {
                let score = self.catalog.sample_score(&hashes);
                tracing::info!(%group, score, "discovered a group");
                if score > 0.0 {
                    self.group_candidates.insert(OrderedFloat(score), group);
                }
            }
        }
    }

    async fn group_new(&mut self) {
        if self.group.is_some() {
            tracing::error!("already in a group, leave it first");
            return;
        }
        match GroupLeader::spawn(&self.config, self.catalog.clone()).await {
            Ok(leader) => {
                self.group = Some(GroupRole::Leader(leader));
            }
            Err(error) => tracing::error!(%error, "cannot start a group"),
        }
    }

    async fn group_join(&mut self, leader: Option<NodeAddress>) {
        if self.group.is_some() {
            tracing::error!("already in a group, leave it first");
            return;
        }
        let leader = match leader.or_else(|| {
            self.group_candidates
                .last_key_value()
                .map(|(_, address)| address.clone())
        }) {
            Some(leader) => leader,
            None => {
                tracing::error!("no group candidate known, run group find first");
                return;
            }
        };
        self.group_candidates.clear();
        match GroupMember::join(
            leader.clone(),
            &self.config,
            self.catalog.clone(),
            self.internal.clone(),
        )
        .await
        {
            Ok(member) => {
                self.group = Some(GroupRole::Member(member));
            }
            Err(error) => tracing::error!(%leader, %error, "group join failed"),
        }
    }

    async fn group_find(&mut self) {
        let id = FloodId::random();
        self.group_pings.insert(id, FloodOrigin::Local);
        tracing::info!(%id, "flooding a group discovery ping");
        let ping = Message::GroupPing {
            id,
            ttl: GROUP_PING_TTL,
        };
        for neighbour in &self.neighbours {
            neighbour.send(&ping).await;
        }
    }

    async fn group_leave(&mut self) {
        match self.group.take() {
            Some(role) => {
                tracing::info!("leaving the group");
                role.leave().await;
            }
            None => tracing::error!("not in a group"),
        }
    }

    fn group_music_listing(&self) -> Vec<(TrackHash, Option<Track>)> {
        let Some(role) = &self.group else {
            return Vec::new();
        };
        let mut hashes: Vec<TrackHash> = role.music().into_iter().collect();
        hashes.sort();
        hashes
            .into_iter()
            .map(|hash| (hash, self.catalog.lookup(hash)))
            .collect()
    }

    async fn group_playlist(&mut self, op: PlaylistOp) {
        let Some(role) = &self.group else {
            tracing::error!("not in a group");
            return;
        };
        role.replicate(op).await;
        crate::group::apply_playlist_op(&*self.catalog, op);
    }

    async fn group_add(&mut self, index: usize) {
        let hash = {
            let Some(role) = &self.group else {
                tracing::error!("not in a group");
                return;
            };
            let mut hashes: Vec<TrackHash> = role.music().into_iter().collect();
            hashes.sort();
            hashes.get(index).copied()
        };
        match hash {
            Some(hash) => self.group_playlist(PlaylistOp::Add(hash)).await,
            None => tracing::error!(index, "no group track at that index"),
        }
    }

    async fn send_sample(&self) {
        let hashes: HashSet<TrackHash> = self
            .catalog
            .hashes()
            .into_iter()
            .take(SAMPLE_LIMIT)
            .collect();
        tracing::info!(offered = hashes.len(), "offering a catalog sample");
        let sample = Message::Sample { hashes };
        for neighbour in &self.neighbours {
            neighbour.send(&sample).await;
        }
    }

    fn status_report(&self) -> StatusReport {
        StatusReport {
            address: self.local_addr.clone(),
            neighbours: self
                .neighbours
                .iter()
                .map(|neighbour| neighbour.address())
                .collect(),
            joining: self.join.is_active(),
            group: self.group.as_ref().map(GroupRole::status),
            playlist: self.catalog.playlist().unwrap_or_default(),
        }
    }
}

async fn accept_loop(listener: TcpListener, queue: QueueSender<Event>) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                tracing::debug!(%remote, "new TCP connection");
                if !queue.send(Event::Accepted(stream)) {
                    return;
                }
            }
            Err(error) => tracing::warn!(%error, "accept failed"),
        }
    }
}
