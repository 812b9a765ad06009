//! Authentication phase of the meta-protocol: ID and ACK

use tracing::{debug, error, info, warn};

use crate::connection::AllowRequest;
use crate::edge::{Edge, OPTION_PMTU_DISCOVERY};
use crate::node::ConnId;
use crate::protocol::{
    check_id, send_request, ACK, ID, PROT_MAJOR, PROT_MINOR,
};
use crate::sptps::Sptps;
use crate::state::{unix_now, MeshState};

/// Label prefix for meta-connection SPTPS sessions.
pub const TCP_LABEL: &[u8] = b"meshlink tcp";

/// Label for invitation SPTPS sessions.
pub const INVITATION_LABEL: &[u8] = b"MeshLink invitation";

/// Send our identity: `0 <name> <major>.<minor> <appname>`.
pub(crate) fn send_id(state: &mut MeshState, cid: ConnId) -> bool {
    let line = format!(
        "{} {} {}.{} {}",
        ID, state.name, PROT_MAJOR, PROT_MINOR, state.appname
    );
    send_request(state, cid, &line)
}

pub(crate) fn id_h(state: &mut MeshState, cid: ConnId, request: &str) -> bool {
    let mut fields = request.split(' ');
    fields.next(); // reqno

    let (Some(name), Some(version)) = (fields.next(), fields.next()) else {
        error!("got bad ID");
        return false;
    };

    let mut ver = version.splitn(2, '.');
    let (Some(major), minor) = (
        ver.next().and_then(|v| v.parse::<u32>().ok()),
        ver.next().and_then(|v| v.parse::<u32>().ok()).unwrap_or(0),
    ) else {
        error!("got bad ID");
        return false;
    };

    {
        let Some(conn) = state.conn_mut(cid) else { return false };
        conn.protocol_major = major;
        conn.protocol_minor = minor;
    }

    // An identity starting with '?' is an invitation request carrying a
    // throwaway public key instead of a name.
    if let Some(b64key) = name.strip_prefix('?') {
        return invitation_id(state, cid, b64key);
    }

    if !check_id(name) {
        error!("got bad ID: invalid name");
        return false;
    }

    let (outgoing, expected) = {
        let conn = state.conn(cid).expect("connection is live");
        (conn.status.initiator, conn.name.clone())
    };

    if outgoing {
        if expected.as_deref() != Some(name) {
            error!(
                peer = name,
                expected = expected.as_deref().unwrap_or(""),
                "peer has wrong identity"
            );
            return false;
        }
    } else if let Some(conn) = state.conn_mut(cid) {
        conn.name = Some(name.to_string());
    }

    if major != PROT_MAJOR {
        error!(peer = name, major, minor, "peer uses incompatible version");
        return false;
    }

    let Some(node_id) = state.lookup_node(name) else {
        error!(peer = name, "peer has unknown identity");
        return false;
    };

    let (blacklisted, peer_key, reachable, waiting_for_key) = {
        let node = state.node(node_id);
        (
            node.blacklisted,
            node.public_key,
            node.reachable,
            node.waiting_for_key,
        )
    };

    if blacklisted {
        warn!(peer = name, "peer is blacklisted");
        return false;
    }

    let Some(peer_key) = peer_key else {
        error!(peer = name, "no key known for peer");

        if reachable && !waiting_for_key {
            info!(peer = name, "requesting key from peer");
            crate::protocol::key::send_req_key(state, node_id);
        }

        return false;
    };

    // Forbid version rollback for peers whose key we already know.
    if minor < 2 {
        error!(peer = name, major, minor, "peer tries to roll back protocol version");
        return false;
    }

    let label = if outgoing {
        format!(
            "{} {} {}",
            String::from_utf8_lossy(TCP_LABEL),
            state.name,
            name
        )
    } else {
        format!(
            "{} {} {}",
            String::from_utf8_lossy(TCP_LABEL),
            name,
            state.name
        )
    };

    let (sptps, kex) = match Sptps::new(
        outgoing,
        false,
        state.private_key.clone(),
        peer_key,
        label.as_bytes(),
    ) {
        Ok(pair) => pair,
        Err(e) => {
            error!(error = %e, "could not start meta-connection session");
            return false;
        }
    };

    let Some(conn) = state.conn_mut(cid) else { return false };
    conn.allow_request = AllowRequest::Ack;
    conn.sptps = Some(sptps);
    conn.send_raw(kex.wire);
    true
}

/// Answer an invitation greeting: confirm with our invitation public key
/// and switch the connection to the invitation SPTPS session.
fn invitation_id(state: &mut MeshState, cid: ConnId, b64key: &str) -> bool {
    if state.store.is_none() {
        error!("got invitation but we have no persistent storage");
        return false;
    }

    let Ok(peer_key) = lib_crypto::PublicKey::from_base64(b64key) else {
        error!("got bad invitation");
        return false;
    };

    let mykey = state.invitation_key.public().to_base64();

    if !send_request(state, cid, &format!("{} {}", ACK, mykey)) {
        return false;
    }

    let (sptps, kex) = match Sptps::new(
        false,
        false,
        state.invitation_key.clone(),
        peer_key,
        INVITATION_LABEL,
    ) {
        Ok(pair) => pair,
        Err(e) => {
            error!(error = %e, "could not start invitation session");
            return false;
        }
    };

    let Some(conn) = state.conn_mut(cid) else { return false };
    conn.status.invitation = true;
    conn.invitation_pubkey = Some(peer_key);
    conn.allow_request = AllowRequest::Ack;
    conn.sptps = Some(sptps);
    conn.send_raw(kex.wire);
    true
}

/// Establish the connection: `4 <myport> <devclass> <options_hex>`.
pub(crate) fn send_ack(state: &mut MeshState, cid: ConnId) -> bool {
    let options = {
        let Some(conn) = state.conn(cid) else { return false };
        (conn.options | OPTION_PMTU_DISCOVERY) & 0x00ff_ffff | (PROT_MINOR << 24)
    };

    let line = format!(
        "{} {} {} {:x}",
        ACK,
        state.myport,
        state.devclass as i32,
        options
    );
    send_request(state, cid, &line)
}

pub(crate) fn ack_h(state: &mut MeshState, cid: ConnId, request: &str) -> bool {
    let mut fields = request.split(' ');
    fields.next();

    let (Some(port), Some(devclass), Some(options)) =
        (fields.next(), fields.next(), fields.next())
    else {
        error!("got bad ACK");
        return false;
    };

    let Ok(port) = port.parse::<u16>() else {
        error!("got bad ACK: invalid port");
        return false;
    };

    let Some(devclass) = devclass
        .parse::<i32>()
        .ok()
        .and_then(crate::node::DevClass::from_i32)
    else {
        error!("got bad ACK: devclass invalid");
        return false;
    };

    let Ok(options) = u32::from_str_radix(options, 16) else {
        error!("got bad ACK: invalid options");
        return false;
    };

    let name = {
        let Some(conn) = state.conn(cid) else { return false };
        match &conn.name {
            Some(name) => name.clone(),
            None => return false,
        }
    };

    let node_id = state.lookup_or_create_node(&name);

    // A second established connection replaces the older one.
    if let Some(old_cid) = state.node(node_id).connection {
        if old_cid != cid {
            debug!(peer = %name, "established a second connection, closing old one");

            let old_outgoing = state
                .conn(old_cid)
                .and_then(|c| c.outgoing.clone());

            if let Some(outgoing_name) = old_outgoing {
                let new_is_outgoing =
                    state.conn(cid).map(|c| c.status.initiator).unwrap_or(false);

                if new_is_outgoing {
                    warn!(peer = %name, "two outgoing connections to the same node");
                } else if let Some(conn) = state.conn_mut(cid) {
                    conn.outgoing = Some(outgoing_name);
                }

                if let Some(old) = state.conn_mut(old_cid) {
                    old.outgoing = None;
                }
            }

            crate::net::terminate_connection(state, old_cid, false);
        }
    }

    {
        let node = state.node_mut(node_id);
        node.devclass = devclass;
        node.dirty = true;
        node.last_successful_connection = unix_now();
        node.connection = Some(cid);
    }

    crate::net::write_node_config(state, node_id);

    let peer_address = {
        let conn = state.conn_mut(cid).expect("connection is live");
        conn.node = Some(node_id);
        conn.devclass = devclass;
        conn.options |= options & 0x00ff_ffff;
        conn.allow_request = AllowRequest::All;
        conn.status.active = true;
        conn.address
    };

    info!(peer = %name, "connection activated");

    // Tell the new peer everything we know.
    send_everything(state, cid);

    // Materialize the connection as an edge and flood it.
    let self_id = state.self_id;
    let weight = state
        .my_traits()
        .edge_weight
        .max(devclass.traits().edge_weight);
    let edge_address = std::net::SocketAddr::new(peer_address.ip(), port);

    let edge = Edge {
        from: self_id,
        to: node_id,
        address: Some(edge_address),
        options: state.conn(cid).map(|c| c.options).unwrap_or(0),
        weight,
    };

    state.edge_add(edge.clone());

    if let Some(conn) = state.conn_mut(cid) {
        conn.edge = Some((self_id, node_id));
    }

    crate::protocol::edge::broadcast_add_edge(state, None, (self_id, node_id), 0);
    crate::graph::run_graph(state);

    true
}

/// Dump our entire edge set to a newly activated connection.
fn send_everything(state: &mut MeshState, cid: ConnId) {
    let keys: Vec<(crate::node::NodeId, crate::node::NodeId)> =
        state.edges.keys().copied().collect();

    for key in keys {
        crate::protocol::edge::send_add_edge(state, cid, key, 0);
    }
}
