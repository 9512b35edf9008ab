//! Engine tests against real sockets: scripted raw peers drive a running
//! dispatcher over localhost connections.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use super::*;
use crate::media::{test_track, StaticCatalog};
use crate::message::{self, FloodId, Message, NodeAddress};

const WAIT: Duration = Duration::from_secs(5);

async fn start_node(catalog: StaticCatalog) -> (OverlayHandle, NodeAddress) {
    let config = NodeConfig {
        host: "127.0.0.1".to_owned(),
        listen_port: 0,
        group_port: 0,
        bootstrap: Vec::new(),
    };
    let (overlay, handle) = Overlay::bind(config, Arc::new(catalog)).await.unwrap();
    let address = overlay.local_addr();
    tokio::spawn(overlay.run());
    (handle, address)
}

/// A scripted bare-protocol peer. Sends its own Hello and silently skips
/// the Hellos the engine sends.
struct TestPeer {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestPeer {
    async fn connect(target: &NodeAddress, listen_port: u16) -> TestPeer {
        let stream = TcpStream::connect((target.host(), target.port()))
            .await
            .unwrap();
        Self::wrap(stream, listen_port).await
    }

    async fn wrap(stream: TcpStream, listen_port: u16) -> TestPeer {
        let (read_half, write_half) = stream.into_split();
        let mut peer = TestPeer {
            reader: BufReader::new(read_half),
            writer: write_half,
        };
        peer.send(Message::Hello { listen_port }).await;
        peer
    }

    async fn send(&mut self, message: Message) {
        message::write_frame(&mut self.writer, &message).await.unwrap();
    }

    /// Next non-Hello message, or `None` on end-of-stream.
    async fn recv(&mut self) -> Option<Message> {
        loop {
            let message = timeout(WAIT, message::read_frame(&mut self.reader))
                .await
                .expect("timed out waiting for a message")
                .expect("read failed");
            match message {
                Some(Message::Hello { .. }) => continue,
                other => return other,
            }
        }
    }

    async fn assert_silent(&mut self, wait: Duration) {
        let extra = timeout(wait, message::read_frame(&mut self.reader)).await;
        assert!(extra.is_err(), "expected silence, got {extra:?}");
    }
}

fn empty_pong(id: FloodId) -> Message {
    Message::Pong {
        id,
        peers: HashSet::new(),
    }
}

#[tokio::test]
async fn lone_node_answers_pings_immediately() {
    let (_handle, address) = start_node(StaticCatalog::empty()).await;
    let mut probe = TestPeer::connect(&address, 50_000).await;

    let id = FloodId::random();
    probe.send(Message::Ping { id, ttl: 3 }).await;
    assert_eq!(probe.recv().await, Some(empty_pong(id)));

    // not a neighbour: the transient probe connection gets closed
    assert_eq!(probe.recv().await, None);
}

#[tokio::test]
async fn neighbour_requests_are_acknowledged_up_to_capacity() {
    let (_handle, address) = start_node(StaticCatalog::empty()).await;

    let mut a = TestPeer::connect(&address, 50_001).await;
    a.send(Message::Neighbour { force: false }).await;
    assert_eq!(a.recv().await, Some(Message::Neighbour { force: false }));

    let mut b = TestPeer::connect(&address, 50_002).await;
    b.send(Message::Neighbour { force: false }).await;
    assert_eq!(b.recv().await, Some(Message::Neighbour { force: false }));

    // the set is full: a plain request is ignored, a forced one admitted
    let mut c = TestPeer::connect(&address, 50_003).await;
    c.send(Message::Neighbour { force: false }).await;
    c.assert_silent(Duration::from_millis(200)).await;
    c.send(Message::Neighbour { force: true }).await;
    assert_eq!(c.recv().await, Some(Message::Neighbour { force: false }));
}

#[test_log::test(tokio::test)]
async fn pings_flood_to_other_neighbours_and_aggregate() {
    let (_handle, address) = start_node(StaticCatalog::empty()).await;

    let mut a = TestPeer::connect(&address, 50_001).await;
    a.send(Message::Neighbour { force: true }).await;
    assert_eq!(a.recv().await, Some(Message::Neighbour { force: false }));
    let mut b = TestPeer::connect(&address, 50_002).await;
    b.send(Message::Neighbour { force: true }).await;
    assert_eq!(b.recv().await, Some(Message::Neighbour { force: false }));

    // a's ping is forwarded to b only, with the ttl decremented
    let id = FloodId::random();
    a.send(Message::Ping { id, ttl: 3 }).await;
    assert_eq!(b.recv().await, Some(Message::Ping { id, ttl: 2 }));

    // while the flood is pending, the same id gets an immediate empty
    // pong and no second forward
    let mut probe = TestPeer::connect(&address, 50_003).await;
    probe.send(Message::Ping { id, ttl: 3 }).await;
    assert_eq!(probe.recv().await, Some(empty_pong(id)));
    b.assert_silent(Duration::from_millis(200)).await;

    // b answers; the upstream pong aggregates b's report and b itself
    let extra: NodeAddress = "10.0.0.9:4000".parse().unwrap();
    b.send(Message::Pong {
        id,
        peers: [extra.clone()].into(),
    })
    .await;
    let b_addr: NodeAddress = "127.0.0.1:50002".parse().unwrap();
    assert_eq!(
        a.recv().await,
        Some(Message::Pong {
            id,
            peers: [extra, b_addr].into(),
        })
    );

    // the session is gone, but the id is still deduplicated
    a.send(Message::Ping { id, ttl: 3 }).await;
    assert_eq!(a.recv().await, Some(empty_pong(id)));
    b.assert_silent(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn ttl_exhaustion_stops_the_flood() {
    let (_handle, address) = start_node(StaticCatalog::empty()).await;

    let mut a = TestPeer::connect(&address, 50_001).await;
    a.send(Message::Neighbour { force: true }).await;
    assert_eq!(a.recv().await, Some(Message::Neighbour { force: false }));
    let mut b = TestPeer::connect(&address, 50_002).await;
    b.send(Message::Neighbour { force: true }).await;
    assert_eq!(b.recv().await, Some(Message::Neighbour { force: false }));

    let id = FloodId::random();
    a.send(Message::Ping { id, ttl: 0 }).await;
    assert_eq!(a.recv().await, Some(empty_pong(id)));
    b.assert_silent(Duration::from_millis(200)).await;
}

#[test_log::test(tokio::test)]
async fn join_retries_candidates_and_admits_a_neighbour() {
    let (handle, _address) = start_node(StaticCatalog::empty()).await;

    // a candidate that is certainly dead
    let dead = {
        let throwaway = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = throwaway.local_addr().unwrap().port();
        drop(throwaway);
        NodeAddress::new("127.0.0.1", port)
    };
    let entry_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let live = NodeAddress::new("127.0.0.1", entry_listener.local_addr().unwrap().port());

    handle.command(Command::Join(vec![dead, live.clone()]));

    // the dead candidate fails, the engine lands on the live one
    let (stream, _) = timeout(WAIT, entry_listener.accept()).await.unwrap().unwrap();
    let mut entry = TestPeer::wrap(stream, live.port()).await;
    let id = match entry.recv().await {
        Some(Message::Ping { id, ttl: 3 }) => id,
        other => panic!("expected the join ping, got {other:?}"),
    };

    // an empty pong leaves the entry itself as the only candidate
    entry.send(empty_pong(id)).await;

    // admission dials us again and asks for a forced neighbour link
    let (stream, _) = timeout(WAIT, entry_listener.accept()).await.unwrap().unwrap();
    let mut neighbour = TestPeer::wrap(stream, live.port()).await;
    assert_eq!(neighbour.recv().await, Some(Message::Neighbour { force: true }));

    let status = handle.status().await.unwrap();
    assert_eq!(status.neighbours, vec![live]);
    assert!(!status.joining);
}

#[tokio::test]
async fn duplicate_joins_are_rejected_while_one_is_active() {
    let (handle, _address) = start_node(StaticCatalog::empty()).await;

    let entry_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let live = NodeAddress::new("127.0.0.1", entry_listener.local_addr().unwrap().port());

    handle.command(Command::Join(vec![live.clone()]));
    let (stream, _) = timeout(WAIT, entry_listener.accept()).await.unwrap().unwrap();
    let mut entry = TestPeer::wrap(stream, live.port()).await;
    assert!(matches!(entry.recv().await, Some(Message::Ping { .. })));

    // second join while the first still waits for its pong
    handle.command(Command::Join(vec![live.clone()]));
    let status = handle.status().await.unwrap();
    assert!(status.joining);
    assert!(
        timeout(Duration::from_millis(200), entry_listener.accept())
            .await
            .is_err(),
        "the duplicate join dialed out"
    );
}

#[tokio::test]
async fn samples_are_offered_and_scored() {
    let catalog = StaticCatalog::new(vec![test_track("fugazi", "waiting room")]);
    let (handle, address) = start_node(catalog).await;

    let mut a = TestPeer::connect(&address, 50_001).await;
    a.send(Message::Neighbour { force: true }).await;
    assert_eq!(a.recv().await, Some(Message::Neighbour { force: false }));

    handle.command(Command::Sample);
    let hashes = match a.recv().await {
        Some(Message::Sample { hashes }) => hashes,
        other => panic!("expected a sample, got {other:?}"),
    };
    let expected: HashSet<_> = [test_track("fugazi", "waiting room").hash()].into();
    assert_eq!(hashes, expected);

    // scoring a received sample is log-only; the link stays up
    a.send(Message::Sample { hashes }).await;
    a.assert_silent(Duration::from_millis(200)).await;
}

#[test_log::test(tokio::test)]
async fn two_nodes_discover_and_form_a_group() {
    let shared = test_track("can", "vitamin c");
    let first = StaticCatalog::new(vec![shared.clone(), test_track("can", "halleluwah")]);
    let second = StaticCatalog::new(vec![shared.clone(), test_track("neu", "hallogallo")]);

    let (leader_handle, leader_addr) = start_node(first).await;
    let (member_handle, _member_addr) = start_node(second).await;

    // the second node joins the overlay through the first
    member_handle.command(Command::Join(vec![leader_addr.clone()]));
    wait_until(|| async {
        member_handle
            .status()
            .await
            .is_some_and(|status| status.neighbours.len() == 1 && !status.joining)
    })
    .await;

    leader_handle.command(Command::GroupNew);
    wait_until(|| async {
        leader_handle
            .status()
            .await
            .is_some_and(|status| status.group.is_some())
    })
    .await;

    // discovery floods across the neighbour link and scores the overlap
    member_handle.command(Command::GroupFind);
    tokio::time::sleep(Duration::from_millis(200)).await;
    member_handle.command(Command::GroupJoin { leader: None });

    wait_until(|| async {
        member_handle.status().await.is_some_and(|status| {
            status
                .group
                .as_ref()
                .is_some_and(|group| !group.leading && !group.join_pending)
        })
    })
    .await;
    wait_until(|| async {
        leader_handle.status().await.is_some_and(|status| {
            status
                .group
                .as_ref()
                .is_some_and(|group| group.leading && group.members.len() == 1)
        })
    })
    .await;

    // the group's music converges on the intersection on both sides
    wait_until(|| async {
        leader_handle
            .status()
            .await
            .is_some_and(|status| status.group.is_some_and(|group| group.tracks == 1))
    })
    .await;
    wait_until(|| async {
        member_handle
            .group_music()
            .await
            .is_some_and(|listing| listing.len() == 1)
    })
    .await;
    let listing = member_handle.group_music().await.unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].0, shared.hash());
    assert_eq!(listing[0].1.as_ref().map(|t| t.title.clone()), Some("vitamin c".to_owned()));
}

async fn wait_until<F, Fut>(mut probe: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if probe().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
