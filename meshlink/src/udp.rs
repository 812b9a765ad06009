//! The UDP data path
//!
//! Outgoing SPTPS datagrams are sent over UDP when they fit the known
//! path and the record is plain data; handshake records and oversized
//! records fall back to base64 tunneling over the next hop's
//! meta-connection, which keeps end-to-end keys converging even before
//! NAT traversal succeeds.
//!
//! Incoming UDP packets are mapped to a node by source address; when that
//! fails, a bounded "try harder" pass checks the authentication tag
//! against every reachable peer whose known address differs only in port,
//! and rebinds the peer on success.

use std::net::SocketAddr;

use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::edge::OPTION_TCPONLY;
use crate::node::NodeId;
use crate::protocol::key::{b64_encode, send_req_key};
use crate::protocol::{send_request, ANS_KEY, REQ_KEY, SUB_REQ_SPTPS};
use crate::sptps::{OutPacket, SptpsEvent, SPTPS_HANDSHAKE};
use crate::state::{unix_now, MeshState};

/// Record type of a PMTU probe.
pub const PKT_PROBE: u8 = 4;

/// Reserved compressed-payload record type; always refused.
pub const PKT_COMPRESSED: u8 = 1;

/// Send application data over a node's end-to-end session, establishing
/// the session first if necessary.
pub(crate) fn send_node_data(state: &mut MeshState, to: NodeId, rtype: u8, data: &[u8]) {
    if !state.node(to).has_valid_key() {
        let (waiting, last_req_key) = {
            let node = state.node(to);
            info!(node = %node.name, "no valid key known yet");
            (node.waiting_for_key, node.last_req_key)
        };

        if !waiting {
            send_req_key(state, to);
        } else if last_req_key + 10 < unix_now() {
            debug!(node = %state.node(to).name, "key request timed out, restarting session");
            let node = state.node_mut(to);
            node.sptps = None;
            node.waiting_for_key = false;
            send_req_key(state, to);
        }

        return;
    }

    let Some(sptps) = state.node_mut(to).sptps.as_mut() else {
        return;
    };

    match sptps.send_record(rtype, data) {
        Ok(pkt) => send_node_packets(state, to, vec![pkt]),
        Err(e) => error!(error = %e, "failed to send record"),
    }
}

/// Transmit session packets, choosing UDP or the meta-connection tunnel
/// per packet.
pub(crate) fn send_node_packets(state: &mut MeshState, to: NodeId, packets: Vec<OutPacket>) {
    for pkt in packets {
        let node = state.node(to);
        let tcponly = (node.options | state.self_node().options) & OPTION_TCPONLY != 0;
        let oversized = pkt.rtype != PKT_PROBE && pkt.wire.len() > node.minmtu as usize;

        if pkt.rtype >= SPTPS_HANDSHAKE || tcponly || oversized {
            send_tunneled(state, to, &pkt.wire);
        } else {
            send_udp(state, to, &pkt.wire);
        }
    }
}

/// Tunnel a session packet through the next hop's meta-connection. Before
/// the key is valid it rides an ANS_KEY so the receiver learns our
/// reflexive address along the way.
fn send_tunneled(state: &mut MeshState, to: NodeId, wire: &[u8]) {
    let to_name = state.node(to).name.clone();
    let self_name = state.name.clone();
    let encoded = b64_encode(wire);

    let line = if !state.node(to).has_valid_key() {
        format!("{} {} {} {} -1 -1 -1 0", ANS_KEY, self_name, to_name, encoded)
    } else {
        format!(
            "{} {} {} {} {}",
            REQ_KEY, self_name, to_name, SUB_REQ_SPTPS, encoded
        )
    };

    let Some(nexthop) = state.node(to).nexthop else {
        warn!(node = %to_name, "no next hop for tunneled packet");
        return;
    };

    let Some(cid) = state.node(nexthop).connection else {
        warn!(node = %to_name, "next hop has no connection");
        return;
    };

    send_request(state, cid, &line);
}

/// Pick the destination address and listen socket for a UDP packet.
fn choose_udp_address(state: &mut MeshState, to: NodeId) -> Option<(SocketAddr, usize)> {
    let (mut sa, mut sock, confirmed) = {
        let node = state.node(to);
        (node.address, node.sock, node.udp_confirmed)
    };

    if !confirmed {
        // Every third packet goes to the latest guess (possibly the
        // node's reflexive address); otherwise pick a random edge
        // pointing at the node and use its reverse's address.
        state.udp_choice_counter = state.udp_choice_counter.wrapping_add(1);

        if state.udp_choice_counter % 3 != 0 {
            let candidates: Vec<SocketAddr> = state
                .edges
                .values()
                .filter(|e| e.to == to)
                .filter_map(|e| state.edges.get(&(e.to, e.from)))
                .filter_map(|rev| rev.address)
                .collect();

            if !candidates.is_empty() {
                let pick = candidates[rand::thread_rng().gen_range(0..candidates.len())];
                sa = Some(pick);
                sock = rand::thread_rng().gen_range(0..state.listen.len().max(1));
            }
        }
    }

    let sa = sa?;

    // Make sure the socket family matches the chosen address.
    if state.listen.get(sock).map(|l| l.local.is_ipv4()) != Some(sa.is_ipv4()) {
        sock = state.listen.iter().position(|l| l.local.is_ipv4() == sa.is_ipv4())?;
    }

    Some((sa, sock))
}

fn send_udp(state: &mut MeshState, to: NodeId, wire: &[u8]) {
    let Some((sa, sock)) = choose_udp_address(state, to) else {
        debug!(node = %state.node(to).name, "no UDP address known");
        return;
    };

    let Some(udp) = state.listen.get(sock).map(|l| l.udp.clone()) else {
        return;
    };

    match udp.try_send_to(wire, sa) {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
        Err(e) => {
            // EMSGSIZE means the path rejected this size outright.
            if e.raw_os_error() == Some(90) {
                let len = wire.len() as u16;
                let node = state.node_mut(to);

                if node.maxmtu >= len {
                    node.maxmtu = len - 1;
                }

                if node.mtu >= len {
                    node.mtu = len - 1;
                }
            } else {
                warn!(node = %state.node(to).name, error = %e, "error sending UDP packet");
            }
        }
    }
}

/// Send a probe to the local broadcast address, using the port of the
/// peer's closest edge.
pub(crate) fn send_broadcast_probe(state: &mut MeshState, to: NodeId, wire: &[u8]) {
    let Some(port) = state
        .node(to)
        .prevedge
        .and_then(|key| state.edges.get(&key))
        .and_then(|e| e.address)
        .map(|a| a.port())
    else {
        return;
    };

    let Some(udp) = state
        .listen
        .iter()
        .find(|l| l.local.is_ipv4())
        .map(|l| l.udp.clone())
    else {
        return;
    };

    let sa = SocketAddr::from((std::net::Ipv4Addr::BROADCAST, port));
    let _ = udp.try_send_to(wire, sa);
}

/// Handle one incoming UDP packet.
pub(crate) fn handle_incoming(
    state: &mut MeshState,
    sock: usize,
    from: SocketAddr,
    data: &[u8],
) {
    let id = match state.lookup_node_udp(&from) {
        Some(id) => Some(id),
        None => try_harder(state, &from, data).map(|id| {
            info!(node = %state.node(id).name, address = %from, "rebinding node address");
            state.update_node_udp(id, Some(from));
            id
        }),
    };

    let Some(id) = id else {
        warn!(address = %from, "received UDP packet from unknown source");
        return;
    };

    if state.node(id).blacklisted {
        warn!(node = %state.node(id).name, "dropping packet from blacklisted node");
        return;
    }

    state.node_mut(id).sock = sock;

    if state.node(id).sptps.is_none() {
        if !state.node(id).waiting_for_key {
            debug!(node = %state.node(id).name, "got packet but no session, requesting key");
            send_req_key(state, id);
        }

        return;
    }

    node_sptps_receive(state, id, data);
}

/// Match an unrecognized source address against reachable peers whose
/// known addresses differ only in port, by checking the packet's
/// authentication tag against each candidate session. Scans are limited
/// to one per second.
fn try_harder(state: &mut MeshState, from: &SocketAddr, data: &[u8]) -> Option<NodeId> {
    let now = unix_now();

    if state.last_hard_try == now {
        return None;
    }

    state.last_hard_try = now;

    for id in state.node_ids() {
        if id == state.self_id {
            continue;
        }

        let node = state.node(id);

        if !node.reachable || !node.has_valid_key() {
            continue;
        }

        let same_host = node
            .recent
            .iter()
            .chain(node.address.iter())
            .any(|a| a.ip() == from.ip());

        if !same_host {
            continue;
        }

        if node
            .sptps
            .as_ref()
            .map(|s| s.verify_datagram(data))
            .unwrap_or(false)
        {
            return Some(id);
        }
    }

    None
}

/// Feed received datagram bytes into a node's end-to-end session and act
/// on the results. Returns false when the record was rejected.
pub(crate) fn node_sptps_receive(state: &mut MeshState, id: NodeId, data: &[u8]) -> bool {
    let Some(mut sptps) = state.node_mut(id).sptps.take() else {
        return false;
    };

    let result = sptps.receive_data(data);
    state.node_mut(id).sptps = Some(sptps);

    let output = match result {
        Ok(output) => output,
        Err(e) => {
            // Datagram sessions survive bad packets; the peer re-keys if
            // its own state is broken.
            debug!(node = %state.node(id).name, error = %e, "rejected datagram");
            return false;
        }
    };

    send_node_packets(state, id, output.packets);

    for event in output.events {
        match event {
            SptpsEvent::HandshakeDone => {
                let node = state.node_mut(id);

                if node.waiting_for_key {
                    info!(node = %node.name, "end-to-end key exchange successful");
                }

                node.waiting_for_key = false;
                crate::pmtu::start_probing(state, id);
            }
            SptpsEvent::Record { rtype, payload } => {
                handle_node_record(state, id, rtype, payload);
            }
        }
    }

    true
}

fn handle_node_record(state: &mut MeshState, id: NodeId, rtype: u8, payload: Vec<u8>) {
    match rtype {
        0 => crate::route::route_incoming(state, id, payload),
        PKT_PROBE => crate::pmtu::probe_h(state, id, payload),
        PKT_COMPRESSED => {
            error!(node = %state.node(id).name, "refusing compressed packet");
        }
        _ => {
            error!(node = %state.node(id).name, rtype, "unexpected record type");
        }
    }
}
