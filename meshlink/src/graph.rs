//! Graph algorithms
//!
//! A breadth-first search from self over the flooded edge set computes,
//! for every node: reachability, the next hop on the shortest path, the
//! via node used for indirect routing, and the inherited link options.
//! Only edges whose reverse edge exists are traversable, so a node counts
//! as reachable only over bidirectional edge pairs.
//!
//! The search runs synchronously on every edge change and on connection
//! activation or termination; reachability transitions detected afterwards
//! drive session teardown, PMTU resets, and the application status
//! callback.

use std::collections::VecDeque;

use tracing::debug;

use crate::edge::OPTION_INDIRECT;
use crate::state::{unix_now, AppEvent, MeshState};

/// Run the BFS and apply reachability transitions.
pub(crate) fn run_graph(state: &mut MeshState) {
    sssp_bfs(state);
    check_reachability(state);
}

fn sssp_bfs(state: &mut MeshState) {
    for id in state.node_ids() {
        let node = state.node_mut(id);
        node.visited = false;
        node.indirect = true;
        node.distance = -1;
    }

    let self_id = state.self_id;
    let self_node = state.node_mut(self_id);
    self_node.visited = true;
    self_node.indirect = false;
    self_node.nexthop = Some(self_id);
    self_node.prevedge = None;
    self_node.via = Some(self_id);
    self_node.distance = 0;

    let mut todo = VecDeque::new();
    todo.push_back(self_id);

    while let Some(n) = todo.pop_front() {
        let edges: Vec<crate::edge::Edge> = state.edges_from(n).cloned().collect();

        for e in edges {
            // Only traverse bidirectional edge pairs.
            if state.lookup_edge(e.to, e.from).is_none() {
                continue;
            }

            let from = state.node(n);
            let indirect = from.indirect || e.options & OPTION_INDIRECT != 0;
            let candidate_distance = from.distance + 1;
            let nexthop = if from.nexthop == Some(self_id) {
                e.to
            } else {
                from.nexthop.expect("visited nodes have a next hop")
            };
            let via = if indirect { from.via } else { Some(e.to) };

            let to = state.node(e.to);

            if to.visited && (!to.indirect || indirect) {
                // Already reached at least as well; only a strictly
                // heavier last edge at the same distance wins.
                let prev_weight = to
                    .prevedge
                    .and_then(|key| state.edges.get(&key))
                    .map(|prev| prev.weight)
                    .unwrap_or(i32::MAX);

                if to.distance != candidate_distance || e.weight >= prev_weight {
                    continue;
                }
            }

            let needs_address = {
                let to = state.node_mut(e.to);
                to.visited = true;
                to.indirect = indirect;
                to.nexthop = Some(nexthop);
                to.prevedge = Some((e.from, e.to));
                to.via = via;
                to.options = e.options;
                to.distance = candidate_distance;
                !to.reachable || to.address.is_none()
            };

            if needs_address {
                if let Some(addr) = e.address {
                    state.update_node_udp(e.to, Some(addr));
                }
            }

            todo.push_back(e.to);
        }
    }
}

fn check_reachability(state: &mut MeshState) {
    let now = unix_now();
    let mut went_up = Vec::new();

    for id in state.node_ids() {
        let self_id = state.self_id;
        let node = state.node_mut(id);

        if node.visited == node.reachable {
            continue;
        }

        node.reachable = node.visited;

        if node.reachable {
            debug!(node = %node.name, "node became reachable");
            node.last_reachable = now;
        } else {
            debug!(node = %node.name, "node became unreachable");
            node.last_unreachable = now;
        }

        if id == self_id {
            continue;
        }

        // Any end-to-end session state is now stale.
        node.reset_session();

        if !node.reachable {
            node.options = 0;
        }

        let name = node.name.clone();
        let reachable = node.reachable;
        let blacklisted = node.blacklisted;
        let connection = node.connection;

        if !reachable {
            state.update_node_udp(id, None);
        }

        if !blacklisted {
            state.push_app_event(AppEvent::NodeStatus {
                node: name,
                reachable,
            });
        }

        if reachable {
            if let Some(cid) = connection {
                let outgoing = state
                    .conn(cid)
                    .map(|c| c.status.initiator)
                    .unwrap_or(false);

                if outgoing {
                    went_up.push(id);
                }
            }
        }
    }

    // Re-establish end-to-end keys over fresh outgoing connections.
    for id in went_up {
        crate::protocol::key::send_req_key(state, id);
    }

    let any_reachable = state
        .node_ids()
        .iter()
        .any(|&id| id != state.self_id && state.node(id).reachable);

    if !any_reachable && state.mesh_reachable {
        state.last_unreachable_all = now;
    }

    state.mesh_reachable = any_reachable;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::Edge;
    use crate::node::DevClass;
    use lib_crypto::Keypair;

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

    fn add_pair(state: &mut MeshState, a: &str, b: &str, weight: i32) {
        let a = state.lookup_or_create_node(a);
        let b = state.lookup_or_create_node(b);

        for (from, to) in [(a, b), (b, a)] {
            state.edge_add(Edge {
                from,
                to,
                address: None,
                options: 0,
                weight,
            });
        }
    }

    #[test]
    fn test_unidirectional_edge_not_traversed() {
        let mut s = test_state();
        let self_id = s.self_id;
        let peer = s.lookup_or_create_node("peer");

        s.edge_add(Edge {
            from: self_id,
            to: peer,
            address: None,
            options: 0,
            weight: 3,
        });

        run_graph(&mut s);
        assert!(!s.node(peer).reachable);

        // The reverse edge completes the pair.
        s.edge_add(Edge {
            from: peer,
            to: self_id,
            address: None,
            options: 0,
            weight: 3,
        });

        run_graph(&mut s);
        assert!(s.node(peer).reachable);
        assert_eq!(s.node(peer).nexthop, Some(peer));
        assert_eq!(s.node(peer).distance, 1);
    }

    #[test]
    fn test_multi_hop_nexthop() {
        let mut s = test_state();
        add_pair(&mut s, "self", "relay", 3);
        add_pair(&mut s, "relay", "far", 3);

        run_graph(&mut s);

        let relay = s.lookup_node("relay").unwrap();
        let far = s.lookup_node("far").unwrap();
        assert!(s.node(far).reachable);
        assert_eq!(s.node(far).nexthop, Some(relay));
        assert_eq!(s.node(far).distance, 2);
    }

    #[test]
    fn test_reachability_transitions_update_timestamps() {
        let mut s = test_state();
        add_pair(&mut s, "self", "peer", 3);
        run_graph(&mut s);

        let peer = s.lookup_node("peer").unwrap();
        assert!(s.node(peer).reachable);
        assert!(s.node(peer).last_reachable > 0);
        let up_events = s
            .app_events
            .iter()
            .filter(|e| matches!(e, AppEvent::NodeStatus { reachable: true, .. }))
            .count();
        assert_eq!(up_events, 1);

        // Drop the pair; the node goes unreachable.
        let self_id = s.self_id;
        s.edge_del(self_id, peer);
        s.edge_del(peer, self_id);
        run_graph(&mut s);

        assert!(!s.node(peer).reachable);
        assert!(s.node(peer).last_unreachable > 0);
    }

    #[test]
    fn test_blacklisted_node_status_suppressed() {
        let mut s = test_state();
        let peer = s.lookup_or_create_node("peer");
        s.node_mut(peer).blacklisted = true;
        add_pair(&mut s, "self", "peer", 3);

        run_graph(&mut s);
        assert!(s.node(peer).reachable);
        assert!(s.app_events.is_empty());
    }

    #[test]
    fn test_visited_matches_reachable_after_run() {
        let mut s = test_state();
        add_pair(&mut s, "self", "a", 1);
        add_pair(&mut s, "a", "b", 1);
        add_pair(&mut s, "self", "c", 9);
        run_graph(&mut s);

        for id in s.node_ids() {
            assert_eq!(s.node(id).visited, s.node(id).reachable);
        }
    }
}
