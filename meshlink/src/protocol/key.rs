//! End-to-end key exchange over the meta-protocol
//!
//! REQ_KEY and ANS_KEY are overloaded to route small end-to-end blobs
//! between two arbitrary nodes, hop by hop along next-hop links: lazy
//! public key fetching (REQ_PUBKEY/ANS_PUBKEY) and base64-tunneled SPTPS
//! records (REQ_KEY/REQ_SPTPS sub-requests, plain ANS_KEY before the key
//! is valid). KEY_CHANGED floods a key rollover through the mesh.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use rand::Rng;
use tracing::{debug, error, info, warn};

use lib_crypto::PublicKey;

use crate::node::{ConnId, NodeId};
use crate::protocol::{
    check_id, forward_request, send_request, ANS_KEY, KEY_CHANGED, REQ_KEY, SUB_ANS_PUBKEY,
    SUB_REQ_KEY, SUB_REQ_PUBKEY, SUB_REQ_SPTPS,
};
use crate::sptps::Sptps;
use crate::state::{unix_now, MeshState};

/// Label prefix for end-to-end datagram SPTPS sessions.
pub const UDP_LABEL: &[u8] = b"meshlink udp";

pub(crate) fn b64_encode(data: &[u8]) -> String {
    STANDARD_NO_PAD.encode(data)
}

pub(crate) fn b64_decode(data: &str) -> Option<Vec<u8>> {
    STANDARD_NO_PAD.decode(data.trim_end_matches('=')).ok()
}

/// Send a unicast-routed request towards a destination node.
fn send_via_nexthop(state: &mut MeshState, to: NodeId, line: &str) -> bool {
    let Some(nexthop) = state.node(to).nexthop else {
        warn!(node = %state.node(to).name, "no next hop for request");
        return true;
    };

    let Some(cid) = state.node(nexthop).connection else {
        warn!(node = %state.node(nexthop).name, "next hop has no connection");
        return true;
    };

    send_request(state, cid, line)
}

fn udp_label(initiator: &str, responder: &str) -> Vec<u8> {
    let mut label = UDP_LABEL.to_vec();
    label.push(b' ');
    label.extend_from_slice(initiator.as_bytes());
    label.push(b' ');
    label.extend_from_slice(responder.as_bytes());
    label
}

/// Start (or restart) the end-to-end session with a node, tunneling the
/// initial KEX through the mesh.
pub(crate) fn send_req_key(state: &mut MeshState, to: NodeId) -> bool {
    let to_name = state.node(to).name.clone();
    let self_name = state.name.clone();

    let Some(peer_key) = state.node(to).public_key else {
        debug!(node = %to_name, "no key known, requesting public key");
        let line = format!(
            "{} {} {} {}",
            REQ_KEY, self_name, to_name, SUB_REQ_PUBKEY
        );
        return send_via_nexthop(state, to, &line);
    };

    if state.node(to).sptps.is_some() {
        debug!(node = %to_name, "restarting end-to-end session");
    }

    let label = udp_label(&self_name, &to_name);

    let (sptps, kex) = match Sptps::new(true, true, state.private_key.clone(), peer_key, &label)
    {
        Ok(pair) => pair,
        Err(e) => {
            error!(error = %e, "could not start end-to-end session");
            return false;
        }
    };

    {
        let node = state.node_mut(to);
        node.sptps = Some(sptps);
        node.waiting_for_key = true;
        node.last_req_key = unix_now();
    }

    let line = format!(
        "{} {} {} {} {}",
        REQ_KEY,
        self_name,
        to_name,
        SUB_REQ_KEY,
        b64_encode(&kex.wire)
    );
    send_via_nexthop(state, to, &line)
}

/// Flood a KEY_CHANGED for ourselves and roll every established session.
pub(crate) fn send_key_changed(state: &mut MeshState) {
    let line = format!(
        "{} {:x} {}",
        KEY_CHANGED,
        rand::thread_rng().gen::<u32>(),
        state.name
    );
    crate::protocol::broadcast_request(state, None, None, &line);

    for id in state.node_ids() {
        if id == state.self_id || !state.node(id).reachable {
            continue;
        }

        force_kex(state, id);
    }
}

/// Force a secondary key exchange on a node's established session.
fn force_kex(state: &mut MeshState, id: NodeId) {
    let Some(mut sptps) = state.node_mut(id).sptps.take() else {
        return;
    };

    if sptps.established() {
        match sptps.force_kex() {
            Ok(kex) => {
                state.node_mut(id).sptps = Some(sptps);
                crate::udp::send_node_packets(state, id, vec![kex]);
                return;
            }
            Err(e) => {
                debug!(error = %e, "could not force key exchange");
            }
        }
    }

    state.node_mut(id).sptps = Some(sptps);
}

pub(crate) fn key_changed_h(state: &mut MeshState, cid: ConnId, request: &str) -> bool {
    let fields: Vec<&str> = request.split(' ').collect();

    if fields.len() < 3 {
        error!("got bad KEY_CHANGED");
        return false;
    }

    let name = fields[2];

    if state.seen_request(request) {
        return true;
    }

    let Some(id) = state.lookup_node(name) else {
        error!(origin = name, "got KEY_CHANGED for unknown node");
        return true;
    };

    forward_request(state, cid, None, request);
    force_kex(state, id);
    true
}

pub(crate) fn req_key_h(state: &mut MeshState, cid: ConnId, request: &str) -> bool {
    let fields: Vec<&str> = request.split(' ').collect();

    if fields.len() < 3 {
        error!("got bad REQ_KEY");
        return false;
    }

    let from_name = fields[1];
    let to_name = fields[2];
    let sub = fields.get(3).and_then(|f| f.parse::<i32>().ok()).unwrap_or(0);

    if !check_id(from_name) || !check_id(to_name) {
        error!("got bad REQ_KEY: invalid name");
        return false;
    }

    let Some(from) = state.lookup_node(from_name) else {
        error!(origin = from_name, "got REQ_KEY from unknown origin");
        return true;
    };

    let Some(to) = state.lookup_node(to_name) else {
        error!(destination = to_name, "got REQ_KEY for unknown destination");
        return true;
    };

    if to == state.self_id {
        if sub != 0 {
            return req_key_ext_h(state, from, sub, request);
        }

        // A bare REQ_KEY for us is a protocol relic; drop it unless it
        // came straight from the connected peer.
        return state.node(from).connection != Some(cid);
    }

    if !state.node(to).reachable {
        warn!(destination = to_name, "got REQ_KEY for unreachable destination");
        return true;
    }

    send_via_nexthop(state, to, request);
    true
}

fn req_key_ext_h(state: &mut MeshState, from: NodeId, sub: i32, request: &str) -> bool {
    let from_name = state.node(from).name.clone();
    let self_name = state.name.clone();

    match sub {
        SUB_REQ_PUBKEY => {
            let pubkey = state.private_key.public().to_base64();
            let line = format!(
                "{} {} {} {} {}",
                REQ_KEY, self_name, from_name, SUB_ANS_PUBKEY, pubkey
            );
            send_via_nexthop(state, from, &line);
            true
        }

        SUB_ANS_PUBKEY => {
            if state.node(from).public_key.is_some() {
                warn!(node = %from_name, "got ANS_PUBKEY but we already have the key");
                return true;
            }

            let fields: Vec<&str> = request.split(' ').collect();
            let Some(key) = fields.get(4).and_then(|k| PublicKey::from_base64(k).ok())
            else {
                error!(node = %from_name, "got bad ANS_PUBKEY: invalid pubkey");
                return true;
            };

            info!(node = %from_name, "learned public key");
            let node = state.node_mut(from);
            node.public_key = Some(key);
            node.dirty = true;
            crate::net::write_node_config(state, from);
            true
        }

        SUB_REQ_KEY => {
            if state.node(from).public_key.is_none() {
                debug!(node = %from_name, "no key known, requesting public key");
                let line = format!(
                    "{} {} {} {}",
                    REQ_KEY, self_name, from_name, SUB_REQ_PUBKEY
                );
                send_via_nexthop(state, from, &line);
                return true;
            }

            // Both sides may try to start a session at once; the node
            // with the lexicographically smaller name wins the race.
            if state.node(from).sptps.is_some() {
                debug!(node = %from_name, "got REQ_KEY while a session exists");

                if self_name.as_str() < from_name.as_str() {
                    debug!(node = %from_name, "ignoring REQ_KEY");
                    return true;
                }
            }

            let fields: Vec<&str> = request.split(' ').collect();
            let Some(data) = fields.get(4).and_then(|d| b64_decode(d)) else {
                error!(node = %from_name, "got bad REQ_KEY: invalid session data");
                return true;
            };

            let peer_key = state.node(from).public_key.expect("checked above");
            let label = udp_label(&from_name, &self_name);

            let (sptps, kex) =
                match Sptps::new(false, true, state.private_key.clone(), peer_key, &label) {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "could not start end-to-end session");
                        return true;
                    }
                };

            {
                let node = state.node_mut(from);
                node.sptps = Some(sptps);
                node.waiting_for_key = true;
                node.last_req_key = unix_now();
            }

            crate::udp::send_node_packets(state, from, vec![kex]);
            crate::udp::node_sptps_receive(state, from, &data);
            true
        }

        SUB_REQ_SPTPS => {
            if !state.node(from).has_valid_key() && state.node(from).sptps.is_none() {
                error!(node = %from_name, "got REQ_SPTPS but no session exists");
                return true;
            }

            let fields: Vec<&str> = request.split(' ').collect();
            let Some(data) = fields.get(4).and_then(|d| b64_decode(d)) else {
                error!(node = %from_name, "got bad REQ_SPTPS: invalid data");
                return true;
            };

            crate::udp::node_sptps_receive(state, from, &data);
            true
        }

        _ => {
            error!(node = %from_name, "unknown extended REQ_KEY request");
            true
        }
    }
}

pub(crate) fn ans_key_h(state: &mut MeshState, cid: ConnId, request: &str) -> bool {
    let fields: Vec<&str> = request.split(' ').collect();

    // "16 from to key cipher digest maclength compression [address port]"
    if fields.len() < 8 {
        error!("got bad ANS_KEY");
        return false;
    }

    let from_name = fields[1];
    let to_name = fields[2];
    let key = fields[3];
    let compression = fields[7].parse::<i32>().unwrap_or(-1);
    let address = fields.get(8).copied();
    let port = fields.get(9).copied();

    if !check_id(from_name) || !check_id(to_name) {
        error!("got bad ANS_KEY: invalid name");
        return false;
    }

    let Some(from) = state.lookup_node(from_name) else {
        error!(origin = from_name, "got ANS_KEY from unknown origin");
        return true;
    };

    let Some(to) = state.lookup_node(to_name) else {
        error!(destination = to_name, "got ANS_KEY for unknown destination");
        return true;
    };

    let _ = cid;

    if to != state.self_id {
        if !state.node(to).reachable {
            warn!(destination = to_name, "got ANS_KEY for unreachable destination");
            return true;
        }

        // Append the origin's reflexive UDP address if we know it and
        // the request does not carry one yet.
        if address.is_none() {
            if let Some(addr) = state.node(from).address {
                debug!(origin = from_name, "appending reflexive UDP address to ANS_KEY");
                let line = format!("{} {} {}", request, addr.ip(), addr.port());
                return send_via_nexthop(state, to, &line);
            }
        }

        return send_via_nexthop(state, to, request);
    }

    // The blob is for us.

    if compression != 0 {
        error!(origin = from_name, "node uses bogus compression level");
        return true;
    }

    let Some(data) = b64_decode(key) else {
        error!(origin = from_name, "got bad ANS_KEY: invalid session data");
        return true;
    };

    if state.node(from).sptps.is_none() {
        error!(origin = from_name, "got ANS_KEY but no session exists");
        return true;
    }

    crate::udp::node_sptps_receive(state, from, &data);

    if state.node(from).has_valid_key() {
        // Learn our peer-observed reflexive address.
        if let (Some(addr), Some(port)) = (address, port) {
            if let (Ok(ip), Ok(port)) = (addr.parse(), port.parse::<u16>()) {
                let sa = std::net::SocketAddr::new(ip, port);
                debug!(origin = from_name, address = %sa, "using reflexive UDP address");
                state.update_node_udp(from, Some(sa));
            }
        }

        crate::pmtu::start_probing(state, from);
    }

    true
}
