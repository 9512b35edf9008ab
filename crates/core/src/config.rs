use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::message::NodeAddress;

/// Number of stable overlay links every node tries to keep.
pub const N_NEIGHBOURS: usize = 2;

/// Hop budget for overlay discovery floods.
pub const PING_TTL: u8 = 3;

/// Hop budget for group discovery floods.
pub const GROUP_PING_TTL: u8 = 3;

/// Hard timeout for outbound dials and one-shot group contacts.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the seen-flood-id caches.
pub const FLOOD_CACHE_SIZE: usize = 16384;

/// Ceiling on a single framed message payload.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Per-node configuration, built once at startup and handed to the overlay
/// engine and the group roles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Host other peers can reach this node at. Listeners bind to it and
    /// it is advertised in group addresses.
    pub host: String,
    /// Overlay listen port. Port 0 binds an ephemeral port; the engine
    /// advertises the actually bound port in its handshake.
    pub listen_port: u16,
    /// Listen port for the group sub-protocol servers (0 works here too).
    pub group_port: u16,
    /// Entry peers to try joining through at startup.
    pub bootstrap: Vec<NodeAddress>,
}

impl NodeConfig {
    pub fn overlay_addr(&self) -> NodeAddress {
        NodeAddress::new(&self.host, self.listen_port)
    }

    pub fn group_addr(&self) -> NodeAddress {
        NodeAddress::new(&self.host, self.group_port)
    }
}
