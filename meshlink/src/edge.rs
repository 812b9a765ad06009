//! Edge records
//!
//! An edge is a directed claim "`from` has an active meta-connection to
//! `to` at address `A` with weight `W` and options `O`", flooded through
//! the mesh. Edges are stored in one map keyed by `(from, to)`; the
//! reverse edge, when present, lives under `(to, from)`.

use std::net::SocketAddr;

use crate::node::NodeId;

/// Traffic to this node must be routed via the node that announced the edge.
pub const OPTION_INDIRECT: u32 = 0x0001;
/// Only use the meta-connection for data, never UDP.
pub const OPTION_TCPONLY: u32 = 0x0002;
/// Path MTU discovery is enabled on this link.
pub const OPTION_PMTU_DISCOVERY: u32 = 0x0004;

#[derive(Debug, Clone)]
pub(crate) struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    /// The address of `to` as seen by `from`.
    pub address: Option<SocketAddr>,
    pub options: u32,
    pub weight: i32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_reverse_lookup_by_key() {
        let mut edges: BTreeMap<(NodeId, NodeId), Edge> = BTreeMap::new();
        let a = NodeId(1);
        let b = NodeId(2);

        edges.insert(
            (a, b),
            Edge {
                from: a,
                to: b,
                address: None,
                options: 0,
                weight: 3,
            },
        );

        assert!(edges.contains_key(&(a, b)));
        assert!(!edges.contains_key(&(b, a)));

        edges.insert(
            (b, a),
            Edge {
                from: b,
                to: a,
                address: None,
                options: 0,
                weight: 3,
            },
        );

        assert!(edges.contains_key(&(b, a)));
    }
}
