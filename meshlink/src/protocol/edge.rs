//! Edge flooding: ADD_EDGE and DEL_EDGE

use std::net::IpAddr;

use rand::Rng;
use tracing::{error, warn};

use crate::edge::Edge;
use crate::node::{ConnId, DevClass, NodeId};
use crate::protocol::{
    check_id, forward_request, send_request, ADD_EDGE, DEL_EDGE,
};
use crate::state::{AppEvent, MeshState};
use crate::submesh::{submesh_allows_node, CORE_MESH};

/// Pick the submesh that scopes the visibility of an edge.
fn edge_submesh(state: &MeshState, key: (NodeId, NodeId)) -> Option<String> {
    let from = state.node(key.0).submesh.clone();
    let to = state.node(key.1).submesh.clone();
    from.or(to)
}

/// Whether a connection's peer may learn about this edge at all.
fn edge_visible_to(state: &MeshState, cid: ConnId, key: (NodeId, NodeId)) -> bool {
    let from_sub = state.node(key.0).submesh.clone();
    let to_sub = state.node(key.1).submesh.clone();

    // Edges spanning two different submeshes are never flooded.
    if let (Some(f), Some(t)) = (&from_sub, &to_sub) {
        if f != t {
            return false;
        }
    }

    let Some(conn) = state.conn(cid) else {
        return false;
    };

    let Some(peer) = conn.node else {
        return true;
    };

    let peer_sub = state.node(peer).submesh.clone();

    if peer_sub.is_none() {
        return true;
    }

    submesh_allows_node(from_sub.as_deref(), peer_sub.as_deref())
        && submesh_allows_node(to_sub.as_deref(), peer_sub.as_deref())
}

/// Send one ADD_EDGE to one connection, subject to submesh visibility.
pub(crate) fn send_add_edge(
    state: &mut MeshState,
    cid: ConnId,
    key: (NodeId, NodeId),
    contradictions: u32,
) -> bool {
    if !edge_visible_to(state, cid, key) {
        return true;
    }

    let Some(edge) = state.lookup_edge(key.0, key.1).cloned() else {
        return true;
    };

    let Some(address) = edge.address else {
        return true;
    };

    let from = state.node(key.0);
    let to = state.node(key.1);

    let line = format!(
        "{} {:x} {} {} {} {} {} {} {} {} {:x} {} {}",
        ADD_EDGE,
        rand::thread_rng().gen::<u32>(),
        from.name,
        from.devclass as i32,
        from.submesh.as_deref().unwrap_or(CORE_MESH),
        to.name,
        address.ip(),
        address.port(),
        to.devclass as i32,
        to.submesh.as_deref().unwrap_or(CORE_MESH),
        edge.options,
        edge.weight,
        contradictions
    );

    send_request(state, cid, &line)
}

/// Flood an ADD_EDGE to every active connection except `from`.
pub(crate) fn broadcast_add_edge(
    state: &mut MeshState,
    from: Option<ConnId>,
    key: (NodeId, NodeId),
    contradictions: u32,
) {
    for cid in state.conn_ids() {
        if Some(cid) == from {
            continue;
        }

        if state.conn(cid).map(|c| c.status.active).unwrap_or(false) {
            send_add_edge(state, cid, key, contradictions);
        }
    }
}

/// Send one DEL_EDGE to one connection, subject to submesh visibility.
pub(crate) fn send_del_edge(
    state: &mut MeshState,
    cid: ConnId,
    key: (NodeId, NodeId),
    contradictions: u32,
) -> bool {
    if !edge_visible_to(state, cid, key) {
        return true;
    }

    let from = state.node(key.0).name.clone();
    let to = state.node(key.1).name.clone();

    let line = format!(
        "{} {:x} {} {} {}",
        DEL_EDGE,
        rand::thread_rng().gen::<u32>(),
        from,
        to,
        contradictions
    );

    send_request(state, cid, &line)
}

pub(crate) fn broadcast_del_edge(
    state: &mut MeshState,
    from: Option<ConnId>,
    key: (NodeId, NodeId),
    contradictions: u32,
) {
    for cid in state.conn_ids() {
        if Some(cid) == from {
            continue;
        }

        if state.conn(cid).map(|c| c.status.active).unwrap_or(false) {
            send_del_edge(state, cid, key, contradictions);
        }
    }
}

fn mark_duplicate(state: &mut MeshState, id: NodeId) {
    let node = state.node_mut(id);

    if node.duplicate {
        return;
    }

    node.duplicate = true;
    let name = node.name.clone();
    warn!(node = %name, "detected possible duplicate node");
    state.push_app_event(AppEvent::NodeDuplicate { node: name });
}

/// Resolve a node named in an edge request, creating it on first mention
/// with its announced submesh and device class.
fn resolve_endpoint(
    state: &mut MeshState,
    name: &str,
    devclass: DevClass,
    submesh: &str,
) -> Option<NodeId> {
    let id = match state.lookup_node(name) {
        Some(id) => id,
        None => {
            let id = state.lookup_or_create_node(name);

            if submesh != CORE_MESH {
                state.node_mut(id).submesh = Some(submesh.to_string());
                state.submeshes.insert(submesh.to_string());
            }

            id
        }
    };

    let node = state.node_mut(id);

    if node.devclass != devclass {
        node.devclass = devclass;
        node.dirty = true;
    }

    crate::net::write_node_config(state, id);
    Some(id)
}

pub(crate) fn add_edge_h(state: &mut MeshState, cid: ConnId, request: &str) -> bool {
    let fields: Vec<&str> = request.split(' ').collect();

    if fields.len() < 12 {
        error!("got bad ADD_EDGE");
        return false;
    }

    let from_name = fields[2];
    let to_name = fields[5];
    let from_submesh = fields[4];
    let to_submesh = fields[9];

    let (Some(from_dc), Some(to_dc)) = (
        fields[3].parse().ok().and_then(DevClass::from_i32),
        fields[8].parse().ok().and_then(DevClass::from_i32),
    ) else {
        error!("got bad ADD_EDGE: devclass invalid");
        return false;
    };

    if !check_id(from_name) || !check_id(to_name) {
        error!("got bad ADD_EDGE: invalid name");
        return false;
    }

    if from_submesh.is_empty() || to_submesh.is_empty() {
        error!("got bad ADD_EDGE: invalid submesh id");
        return false;
    }

    let (Ok(options), Ok(weight), Ok(contradictions)) = (
        u32::from_str_radix(fields[10], 16),
        fields[11].parse::<i32>(),
        fields
            .get(12)
            .map_or(Ok(0u32), |f| f.parse::<u32>()),
    ) else {
        error!("got bad ADD_EDGE");
        return false;
    };

    if weight <= 0 {
        error!("got bad ADD_EDGE: invalid weight");
        return false;
    }

    if state.seen_request(request) {
        return true;
    }

    let Some(from) = resolve_endpoint(state, from_name, from_dc, from_submesh) else {
        return false;
    };
    let Some(to) = resolve_endpoint(state, to_name, to_dc, to_submesh) else {
        return false;
    };

    if contradictions > 50 {
        mark_duplicate(state, from);
    }

    let address = fields[6]
        .parse::<IpAddr>()
        .ok()
        .zip(fields[7].parse::<u16>().ok())
        .map(|(ip, port)| std::net::SocketAddr::new(ip, port));

    let self_id = state.self_id;

    if let Some(existing) = state.lookup_edge(from, to).cloned() {
        let differs = existing.weight != weight
            || existing.options != options
            || existing.address != address;

        if !differs {
            return true;
        }

        if from == self_id {
            // Someone has a stale view of our own edge; correct them.
            warn!("got ADD_EDGE for ourself which does not match existing entry");
            send_add_edge(state, cid, (from, to), 0);
            return true;
        }

        warn!("got ADD_EDGE which does not match existing entry");
        state.edge_del(from, to);
        crate::graph::run_graph(state);
    } else if from == self_id {
        // We are claimed to have an edge we do not; deny it.
        warn!("got ADD_EDGE for ourself which does not exist");
        state.contradicting_add_edge += 1;
        let contradictions = state.contradicting_add_edge;
        let line = format!(
            "{} {:x} {} {} {}",
            DEL_EDGE,
            rand::thread_rng().gen::<u32>(),
            from_name,
            to_name,
            contradictions
        );
        send_request(state, cid, &line);
        return true;
    }

    state.edge_add(Edge {
        from,
        to,
        address,
        options,
        weight,
    });

    crate::graph::run_graph(state);

    let submesh = edge_submesh(state, (from, to));
    forward_request(state, cid, submesh.as_deref(), request);

    true
}

pub(crate) fn del_edge_h(state: &mut MeshState, cid: ConnId, request: &str) -> bool {
    let fields: Vec<&str> = request.split(' ').collect();

    if fields.len() < 4 {
        error!("got bad DEL_EDGE");
        return false;
    }

    let from_name = fields[2];
    let to_name = fields[3];
    let contradictions = fields
        .get(4)
        .and_then(|f| f.parse::<u32>().ok())
        .unwrap_or(0);

    if !check_id(from_name) || !check_id(to_name) {
        error!("got bad DEL_EDGE: invalid name");
        return false;
    }

    if state.seen_request(request) {
        return true;
    }

    let (Some(from), Some(to)) = (state.lookup_node(from_name), state.lookup_node(to_name))
    else {
        error!("got DEL_EDGE for unknown nodes");
        return true;
    };

    if contradictions > 50 {
        mark_duplicate(state, from);
    }

    if state.lookup_edge(from, to).is_none() {
        warn!("got DEL_EDGE which does not appear in the edge tree");
        return true;
    }

    let self_id = state.self_id;

    if from == self_id {
        // Someone claims our own edge is gone; correct them.
        warn!("got DEL_EDGE for ourself");
        state.contradicting_del_edge += 1;
        let contradictions = state.contradicting_del_edge;
        send_add_edge(state, cid, (from, to), contradictions);
        return true;
    }

    let submesh = edge_submesh(state, (from, to));
    forward_request(state, cid, submesh.as_deref(), request);

    state.edge_del(from, to);
    crate::graph::run_graph(state);

    // If the announcing node became unreachable but we still remember a
    // stale edge from it to us, withdraw that one as well.
    if !state.node(to).reachable {
        if state.lookup_edge(to, self_id).is_some() {
            broadcast_del_edge(state, None, (to, self_id), 0);
            state.edge_del(to, self_id);
            crate::graph::run_graph(state);
        }
    }

    true
}
