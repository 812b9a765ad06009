//! Central mesh state
//!
//! One `MeshState` owns every table: nodes, edges, submeshes, connections,
//! outgoing wishes, the seen-request cache and the listen sockets. All
//! protocol processing happens with exclusive access to this structure;
//! nothing in here ever blocks.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use lib_crypto::Keypair;
use tokio::net::UdpSocket;

use crate::conf::ConfStore;
use crate::connection::{Connection, Outgoing};
use crate::edge::Edge;
use crate::error::Error;
use crate::node::{ConnId, DevClass, DevClassTraits, Node, NodeId, DEV_CLASS_TRAITS};

/// Seconds since the Unix epoch.
pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// One bound listen address: the UDP socket (shared with its receive
/// task) and the local address both TCP and UDP are bound to.
pub(crate) struct ListenSocket {
    pub udp: Arc<UdpSocket>,
    pub local: SocketAddr,
}

/// Callbacks to deliver to the application once the state lock is
/// released.
#[derive(Debug)]
pub(crate) enum AppEvent {
    Receive { from: String, data: Vec<u8> },
    NodeStatus { node: String, reachable: bool },
    NodeDuplicate { node: String },
    ConnectionTry { node: String },
    Error { error: Error },
}

pub(crate) struct MeshState {
    pub name: String,
    pub appname: String,
    pub devclass: DevClass,
    pub myport: u16,
    pub session_id: u32,
    pub traits: [DevClassTraits; DevClass::COUNT],

    pub private_key: Keypair,
    pub invitation_key: Keypair,
    pub store: Option<ConfStore>,
    pub inviter_commits_first: bool,
    /// Seconds before an unused invitation expires.
    pub invitation_timeout: i64,
    /// Blacklist flag installed on nodes learned from the network.
    pub default_blacklist: bool,

    pub self_id: NodeId,
    nodes: HashMap<NodeId, Node>,
    ids_by_name: HashMap<String, NodeId>,
    next_node: u32,

    pub edges: BTreeMap<(NodeId, NodeId), Edge>,
    pub submeshes: BTreeSet<String>,

    pub connections: HashMap<ConnId, Connection>,
    next_conn: u64,
    pub outgoings: HashMap<String, Outgoing>,

    /// Flood suppression: request text to first-seen time.
    seen_requests: HashMap<String, i64>,

    pub contradicting_add_edge: u32,
    pub contradicting_del_edge: u32,
    /// Duplicate-name defense backoff, seconds.
    pub sleeptime: i64,
    pub autoconnect_paused_until: i64,

    pub listen: Vec<ListenSocket>,
    udp_index: HashMap<SocketAddr, NodeId>,
    /// Round-robin counter for unconfirmed UDP address selection.
    pub udp_choice_counter: u32,
    /// Last second in which a full MAC scan for an unknown source ran.
    pub last_hard_try: i64,
    pub discovery_enabled: bool,

    pub connection_burst: u32,
    pub connection_burst_time: i64,
    /// When the whole rest of the mesh last became unreachable.
    pub last_unreachable_all: i64,
    /// At least one other node is currently reachable.
    pub mesh_reachable: bool,
    pub running: bool,

    /// Application callbacks collected while the lock is held.
    pub app_events: Vec<AppEvent>,

    /// Back-reference to the mesh handle, for spawning follow-up work
    /// (outgoing retries) from deep inside event handlers.
    pub worker_handle: std::sync::Weak<crate::mesh::MeshInner>,
}

impl MeshState {
    pub fn new(
        name: String,
        appname: String,
        devclass: DevClass,
        private_key: Keypair,
        invitation_key: Keypair,
        store: Option<ConfStore>,
    ) -> Self {
        let mut session_id = 0u32;

        while session_id == 0 {
            let mut buf = [0u8; 4];
            lib_crypto::randomize(&mut buf);
            session_id = u32::from_le_bytes(buf);
        }

        let mut state = Self {
            name: name.clone(),
            appname,
            devclass,
            myport: 0,
            session_id,
            traits: DEV_CLASS_TRAITS,
            private_key,
            invitation_key,
            store,
            inviter_commits_first: false,
            invitation_timeout: 604800,
            default_blacklist: false,
            self_id: NodeId(0),
            nodes: HashMap::new(),
            ids_by_name: HashMap::new(),
            next_node: 0,
            edges: BTreeMap::new(),
            submeshes: BTreeSet::new(),
            connections: HashMap::new(),
            next_conn: 0,
            outgoings: HashMap::new(),
            seen_requests: HashMap::new(),
            contradicting_add_edge: 0,
            contradicting_del_edge: 0,
            sleeptime: 10,
            autoconnect_paused_until: 0,
            listen: Vec::new(),
            udp_index: HashMap::new(),
            udp_choice_counter: 0,
            last_hard_try: 0,
            discovery_enabled: true,
            connection_burst: 0,
            connection_burst_time: 0,
            last_unreachable_all: unix_now(),
            mesh_reachable: false,
            running: false,
            app_events: Vec::new(),
            worker_handle: std::sync::Weak::new(),
        };

        let pubkey = state.private_key.public();

        let mut self_node = Node::new(name);
        self_node.devclass = devclass;
        self_node.reachable = true;
        let self_id = state.node_add(self_node);
        state.self_id = self_id;

        let node = state.node_mut(self_id);
        node.nexthop = Some(self_id);
        node.via = Some(self_id);
        node.public_key = Some(pubkey);

        state
    }

    // Node table

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[&id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes.get_mut(&id).expect("node id is live")
    }

    pub fn self_node(&self) -> &Node {
        self.node(self.self_id)
    }

    pub fn lookup_node(&self, name: &str) -> Option<NodeId> {
        self.ids_by_name.get(name).copied()
    }

    pub fn node_add(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.next_node);
        self.next_node += 1;
        self.ids_by_name.insert(node.name.clone(), id);
        self.nodes.insert(id, node);
        id
    }

    /// Look up a node by name, creating it with mesh defaults on first
    /// mention.
    pub fn lookup_or_create_node(&mut self, name: &str) -> NodeId {
        if let Some(id) = self.lookup_node(name) {
            return id;
        }

        let mut node = Node::new(name.to_string());
        node.blacklisted = self.default_blacklist;
        self.node_add(node)
    }

    /// Adopt a new name for ourselves, keeping the name index in step.
    pub fn rename_self(&mut self, new_name: String) {
        let id = self.self_id;
        let old = self.node(id).name.clone();
        self.ids_by_name.remove(&old);
        self.ids_by_name.insert(new_name.clone(), id);
        self.node_mut(id).name = new_name.clone();
        self.name = new_name;
    }

    /// Remove a node and everything referencing it. Only valid for nodes
    /// without a live connection.
    pub fn node_remove(&mut self, id: NodeId) {
        let edges: Vec<(NodeId, NodeId)> = self
            .edges
            .keys()
            .filter(|(f, t)| *f == id || *t == id)
            .copied()
            .collect();

        for key in edges {
            self.edges.remove(&key);
        }

        if let Some(node) = self.nodes.remove(&id) {
            self.ids_by_name.remove(&node.name);

            if let Some(addr) = node.address {
                self.udp_index.remove(&addr);
            }

            self.outgoings.remove(&node.name);
        }
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    // Edge table

    pub fn lookup_edge(&self, from: NodeId, to: NodeId) -> Option<&Edge> {
        self.edges.get(&(from, to))
    }

    pub fn edge_add(&mut self, edge: Edge) {
        self.edges.insert((edge.from, edge.to), edge);
    }

    pub fn edge_del(&mut self, from: NodeId, to: NodeId) -> Option<Edge> {
        self.edges.remove(&(from, to))
    }

    /// Edges announced by the given node.
    pub fn edges_from(&self, from: NodeId) -> impl Iterator<Item = &Edge> {
        self.edges
            .range((from, NodeId(u32::MIN))..=(from, NodeId(u32::MAX)))
            .map(|(_, e)| e)
    }

    pub fn edge_count_of(&self, id: NodeId) -> usize {
        self.edges_from(id).count()
    }

    // Connections

    pub fn alloc_conn_id(&mut self) -> ConnId {
        self.next_conn += 1;
        ConnId(self.next_conn)
    }

    pub fn conn(&self, id: ConnId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn conn_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn conn_ids(&self) -> Vec<ConnId> {
        self.connections.keys().copied().collect()
    }

    // UDP address binding

    /// Bind a node to a UDP address (or clear it), keeping the reverse
    /// index in sync.
    pub fn update_node_udp(&mut self, id: NodeId, addr: Option<SocketAddr>) {
        if let Some(old) = self.node(id).address {
            if self.udp_index.get(&old) == Some(&id) {
                self.udp_index.remove(&old);
            }
        }

        let node = self.node_mut(id);
        node.address = addr;
        node.udp_confirmed = false;

        if let Some(addr) = addr {
            self.udp_index.insert(addr, id);
            self.node_mut(id).add_recent_address(addr);
        }
    }

    pub fn lookup_node_udp(&self, addr: &SocketAddr) -> Option<NodeId> {
        self.udp_index.get(addr).copied()
    }

    // Seen-request cache

    /// Record a flood request; returns true if it was already seen.
    pub fn seen_request(&mut self, request: &str) -> bool {
        let now = unix_now();

        if self.seen_requests.contains_key(request) {
            tracing::debug!("already seen request");
            return true;
        }

        self.seen_requests.insert(request.to_string(), now);
        false
    }

    pub fn age_seen_requests(&mut self, max_age: i64) {
        let now = unix_now();
        let before = self.seen_requests.len();
        self.seen_requests.retain(|_, seen| *seen + max_age > now);
        let deleted = before - self.seen_requests.len();

        if deleted > 0 {
            tracing::debug!(deleted, left = self.seen_requests.len(), "aged past requests");
        }
    }

    // Misc

    pub fn my_traits(&self) -> &DevClassTraits {
        &self.traits[self.devclass.index()]
    }

    pub fn push_app_event(&mut self, event: AppEvent) {
        self.app_events.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> MeshState {
        MeshState::new(
            "self".into(),
            "testapp".into(),
            DevClass::Stationary,
            Keypair::generate(),
            Keypair::generate(),
            None,
        )
    }

    #[test]
    fn test_one_record_per_name() {
        let mut s = test_state();
        let a = s.lookup_or_create_node("alpha");
        let b = s.lookup_or_create_node("alpha");
        assert_eq!(a, b);
        assert_eq!(s.node_count(), 2); // self + alpha
    }

    #[test]
    fn test_session_id_nonzero() {
        let s = test_state();
        assert_ne!(s.session_id, 0);
    }

    #[test]
    fn test_self_key_matches_private_key() {
        let s = test_state();
        assert_eq!(
            s.self_node().public_key.unwrap(),
            s.private_key.public()
        );
    }

    #[test]
    fn test_udp_binding_rebinds() {
        let mut s = test_state();
        let n = s.lookup_or_create_node("peer");

        let a1: SocketAddr = "192.0.2.1:655".parse().unwrap();
        let a2: SocketAddr = "192.0.2.1:656".parse().unwrap();

        s.update_node_udp(n, Some(a1));
        assert_eq!(s.lookup_node_udp(&a1), Some(n));

        s.update_node_udp(n, Some(a2));
        assert_eq!(s.lookup_node_udp(&a1), None);
        assert_eq!(s.lookup_node_udp(&a2), Some(n));

        s.update_node_udp(n, None);
        assert_eq!(s.lookup_node_udp(&a2), None);
    }

    #[test]
    fn test_seen_request_ages_out() {
        let mut s = test_state();
        assert!(!s.seen_request("12 abc"));
        assert!(s.seen_request("12 abc"));

        s.age_seen_requests(-1);
        assert!(!s.seen_request("12 abc"));
    }

    #[test]
    fn test_edges_from_range() {
        let mut s = test_state();
        let a = s.lookup_or_create_node("a");
        let b = s.lookup_or_create_node("b");
        let c = s.lookup_or_create_node("c");

        for (from, to) in [(a, b), (a, c), (b, a)] {
            s.edge_add(Edge {
                from,
                to,
                address: None,
                options: 0,
                weight: 1,
            });
        }

        assert_eq!(s.edges_from(a).count(), 2);
        assert_eq!(s.edges_from(b).count(), 1);
        assert_eq!(s.edges_from(c).count(), 0);
    }
}
