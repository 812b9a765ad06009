//! Node records
//!
//! A node is the permanent record of a mesh member: its name, Ed25519
//! public key, device class, addresses, and the runtime state attached to
//! it (SPTPS session, PMTU probing, graph scratch fields, counters).

use std::net::SocketAddr;
use std::time::Instant;

use lib_crypto::PublicKey;

use crate::sptps::Sptps;

/// Maximum number of recently-seen addresses kept per node.
pub const MAX_RECENT: usize = 5;

/// Stable index of a node in the mesh state tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct NodeId(pub u32);

/// Stable index of a connection in the mesh state tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct ConnId(pub u64);

/// Device classes, ordered from most to least available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i32)]
pub enum DevClass {
    Backbone = 0,
    Stationary = 1,
    Portable = 2,
    Unknown = 3,
}

impl DevClass {
    pub const COUNT: usize = 4;

    pub fn from_i32(val: i32) -> Option<Self> {
        match val {
            0 => Some(Self::Backbone),
            1 => Some(Self::Stationary),
            2 => Some(Self::Portable),
            3 => Some(Self::Unknown),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Per-class timing and connectivity parameters.
#[derive(Debug, Clone, Copy)]
pub struct DevClassTraits {
    pub pingtimeout: i64,
    pub pinginterval: i64,
    pub maxtimeout: u64,
    pub fast_retry_period: i64,
    pub min_connects: usize,
    pub max_connects: usize,
    pub edge_weight: i32,
}

pub const DEV_CLASS_TRAITS: [DevClassTraits; DevClass::COUNT] = [
    // Backbone
    DevClassTraits {
        pingtimeout: 5,
        pinginterval: 60,
        maxtimeout: 900,
        fast_retry_period: 5,
        min_connects: 3,
        max_connects: 10000,
        edge_weight: 1,
    },
    // Stationary
    DevClassTraits {
        pingtimeout: 5,
        pinginterval: 60,
        maxtimeout: 900,
        fast_retry_period: 5,
        min_connects: 3,
        max_connects: 100,
        edge_weight: 3,
    },
    // Portable
    DevClassTraits {
        pingtimeout: 5,
        pinginterval: 60,
        maxtimeout: 900,
        fast_retry_period: 5,
        min_connects: 3,
        max_connects: 3,
        edge_weight: 6,
    },
    // Unknown
    DevClassTraits {
        pingtimeout: 5,
        pinginterval: 60,
        maxtimeout: 900,
        fast_retry_period: 5,
        min_connects: 1,
        max_connects: 1,
        edge_weight: 9,
    },
];

impl DevClass {
    pub fn traits(self) -> &'static DevClassTraits {
        &DEV_CLASS_TRAITS[self.index()]
    }
}

/// The permanent record of a mesh member plus its runtime state.
pub(crate) struct Node {
    pub name: String,
    pub devclass: DevClass,
    pub submesh: Option<String>,
    pub public_key: Option<PublicKey>,
    /// Canonical "host port" string, if configured.
    pub canonical_address: Option<String>,
    /// Recently-seen socket addresses, most recent first.
    pub recent: Vec<SocketAddr>,
    pub last_reachable: i64,
    pub last_unreachable: i64,
    pub blacklisted: bool,
    /// Suspected duplicate name; the duplicate callback fired already.
    pub duplicate: bool,
    /// The host config on disk is out of date.
    pub dirty: bool,

    // Runtime state.
    pub reachable: bool,
    /// Current UDP address, once learned.
    pub address: Option<SocketAddr>,
    /// Index of the listen socket last used for this node.
    pub sock: usize,
    pub udp_confirmed: bool,
    pub options: u32,
    /// End-to-end datagram session.
    pub sptps: Option<Sptps>,
    pub waiting_for_key: bool,
    pub last_req_key: i64,
    pub connection: Option<ConnId>,
    pub last_connect_try: i64,
    pub last_successful_connection: i64,

    // Graph scratch fields, valid after the last BFS.
    pub visited: bool,
    pub indirect: bool,
    pub distance: i32,
    pub nexthop: Option<NodeId>,
    pub prevedge: Option<(NodeId, NodeId)>,
    pub via: Option<NodeId>,

    // PMTU probing state.
    pub mtuprobes: i32,
    pub minmtu: u16,
    pub maxmtu: u16,
    pub mtu: u16,
    pub last_mtu_probe: Option<Instant>,
    pub last_udp_keepalive: Option<Instant>,

    // Traffic counters.
    pub in_packets: u64,
    pub in_bytes: u64,
    pub out_packets: u64,
    pub out_bytes: u64,
}

impl Node {
    pub fn new(name: String) -> Self {
        Self {
            name,
            devclass: DevClass::Unknown,
            submesh: None,
            public_key: None,
            canonical_address: None,
            recent: Vec::new(),
            last_reachable: 0,
            last_unreachable: 0,
            blacklisted: false,
            duplicate: false,
            dirty: false,
            reachable: false,
            address: None,
            sock: 0,
            udp_confirmed: false,
            options: 0,
            sptps: None,
            waiting_for_key: false,
            last_req_key: 0,
            connection: None,
            last_connect_try: 0,
            last_successful_connection: 0,
            visited: false,
            indirect: false,
            distance: -1,
            nexthop: None,
            prevedge: None,
            via: None,
            mtuprobes: 0,
            minmtu: 0,
            maxmtu: crate::net::MTU,
            mtu: 0,
            last_mtu_probe: None,
            last_udp_keepalive: None,
            in_packets: 0,
            in_bytes: 0,
            out_packets: 0,
            out_bytes: 0,
        }
    }

    /// True once the end-to-end session has finished its handshake.
    pub fn has_valid_key(&self) -> bool {
        self.sptps.as_ref().map_or(false, |s| s.established())
    }

    /// Record a recently-seen address: deduplicate, move to the front,
    /// evict the oldest beyond the cap. Returns true if the list changed.
    pub fn add_recent_address(&mut self, addr: SocketAddr) -> bool {
        if self.recent.first() == Some(&addr) {
            return false;
        }

        self.recent.retain(|a| *a != addr);
        self.recent.insert(0, addr);
        self.recent.truncate(MAX_RECENT);
        self.dirty = true;
        true
    }

    /// Reset transient end-to-end state when the node becomes unreachable
    /// or its key rolls.
    pub fn reset_session(&mut self) {
        self.sptps = None;
        self.waiting_for_key = false;
        self.last_req_key = 0;
        self.udp_confirmed = false;
        self.maxmtu = crate::net::MTU;
        self.minmtu = 0;
        self.mtu = 0;
        self.mtuprobes = 0;
        self.last_mtu_probe = None;
        self.last_udp_keepalive = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recent_addresses_dedupe_and_cap() {
        let mut n = Node::new("test".into());

        for i in 1..=7u16 {
            let addr: SocketAddr = format!("10.0.0.{}:655", i).parse().unwrap();
            assert!(n.add_recent_address(addr));
        }

        assert_eq!(n.recent.len(), MAX_RECENT);
        // Most recent first, oldest evicted.
        assert_eq!(n.recent[0], "10.0.0.7:655".parse().unwrap());
        assert!(!n.recent.contains(&"10.0.0.1:655".parse().unwrap()));

        // Re-adding an existing address moves it to the front without
        // growing the list.
        let repeat: SocketAddr = "10.0.0.4:655".parse().unwrap();
        assert!(n.add_recent_address(repeat));
        assert_eq!(n.recent[0], repeat);
        assert_eq!(n.recent.len(), MAX_RECENT);

        // Same address again is a no-op.
        assert!(!n.add_recent_address(repeat));
    }

    #[test]
    fn test_devclass_traits() {
        assert_eq!(DevClass::Backbone.traits().edge_weight, 1);
        assert_eq!(DevClass::Unknown.traits().max_connects, 1);
        assert_eq!(DevClass::from_i32(2), Some(DevClass::Portable));
        assert_eq!(DevClass::from_i32(7), None);
    }
}
