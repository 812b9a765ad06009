//! Path-MTU discovery
//!
//! Per peer, `mtuprobes` drives the schedule:
//!
//! - `0`: initial; reset the bounds and send the first probe at `maxmtu`.
//! - `1..30`: fast discovery, a batch of three randomly-sized probes per
//!   second between `minmtu + 1` and `maxmtu`, plus one of `maxmtu + 1`
//!   to detect growth, plus one local broadcast when discovery is on.
//! - `30` reached or `minmtu >= maxmtu`: converge, `mtu = minmtu`, enter
//!   the steady state at `-1`.
//! - `-1..-3`: slow maintenance, one probe at `maxmtu` and one at
//!   `maxmtu + 1` per ping interval; three consecutive misses restart
//!   discovery from scratch.
//!
//! A probe is a random-filled SPTPS datagram whose first byte is 0 for a
//! request and 1 for a reply; the responder echoes the packet back with
//! the first byte flipped, preserving path symmetry. Any valid reply also
//! confirms the peer's UDP address.

use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, warn};

use crate::node::NodeId;
use crate::state::MeshState;
use crate::udp::PKT_PROBE;

/// Smallest probe ever sent.
pub const MIN_PROBE_SIZE: usize = 64;

/// Interval between NAT keepalive probes once UDP is confirmed.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Begin (or restart) probing a node whose session just came up.
pub(crate) fn start_probing(state: &mut MeshState, id: NodeId) {
    let fresh = {
        let node = state.node_mut(id);

        if node.mtuprobes == 0 && node.last_mtu_probe.is_none() {
            node.minmtu = 0;
            node.maxmtu = crate::net::MTU;
            true
        } else {
            false
        }
    };

    if fresh {
        keepalive(state, id);
    }
}

/// Drive probing for one node; called once per second for every
/// reachable node with an established session.
pub(crate) fn keepalive(state: &mut MeshState, id: NodeId) {
    let now = Instant::now();

    {
        let node = state.node(id);

        if !node.reachable || !node.has_valid_key() {
            return;
        }
    }

    // NAT keepalive, independent of the discovery schedule.
    let send_keepalive = {
        let node = state.node(id);
        node.udp_confirmed
            && node
                .last_udp_keepalive
                .map_or(true, |t| now.duration_since(t) >= KEEPALIVE_INTERVAL)
    };

    if send_keepalive {
        state.node_mut(id).last_udp_keepalive = Some(now);
        send_probe(state, id, MIN_PROBE_SIZE, false);
    }

    let (mtuprobes, elapsed, pinginterval) = {
        let node = state.node(id);
        let elapsed = node
            .last_mtu_probe
            .map(|t| now.duration_since(t))
            .unwrap_or(Duration::MAX);
        let pinginterval = state.traits[node.devclass.index()].pinginterval;
        (node.mtuprobes, elapsed, pinginterval)
    };

    if mtuprobes >= 0 {
        // Fast discovery, one batch per second.
        if mtuprobes != 0 && elapsed < Duration::from_secs(1) {
            return;
        }
    } else if mtuprobes >= -3 {
        // Steady state, one round per ping interval.
        if elapsed < Duration::from_secs(pinginterval as u64) {
            return;
        }
    }

    state.node_mut(id).last_mtu_probe = Some(now);

    if mtuprobes < -3 {
        // Three rounds went unanswered.
        info!(node = %state.node(id).name, "PMTU decreased or UDP path lost, restarting discovery");
        let node = state.node_mut(id);
        node.mtuprobes = 0;
        node.minmtu = 0;
        node.maxmtu = crate::net::MTU;
        node.udp_confirmed = false;
        return;
    }

    if mtuprobes < 0 {
        // Steady state: confirm the fixed PMTU and watch for growth.
        let maxmtu = state.node(id).maxmtu;
        send_probe(state, id, maxmtu as usize, false);

        if maxmtu < crate::net::MTU {
            send_probe(state, id, maxmtu as usize + 1, false);
        }

        state.node_mut(id).mtuprobes -= 1;
        return;
    }

    if mtuprobes == 0 {
        // Initial probe at the upper bound.
        let node = state.node_mut(id);
        node.minmtu = 0;
        node.maxmtu = crate::net::MTU;
        let len = node.maxmtu as usize;
        send_probe(state, id, len, false);
        state.node_mut(id).mtuprobes = 1;
        try_fix_mtu(state, id);
        return;
    }

    // Fast discovery batch.
    let (minmtu, maxmtu) = {
        let node = state.node(id);
        (node.minmtu, node.maxmtu)
    };

    for _ in 0..3 {
        let len = if maxmtu <= minmtu {
            maxmtu as usize
        } else {
            rand::thread_rng().gen_range(minmtu as usize + 1..=maxmtu as usize)
        };

        send_probe(state, id, len, false);
    }

    if maxmtu < crate::net::MTU {
        send_probe(state, id, maxmtu as usize + 1, false);
    }

    if state.discovery_enabled {
        send_probe(state, id, MIN_PROBE_SIZE, true);
    }

    state.node_mut(id).mtuprobes += 3;
    try_fix_mtu(state, id);
}

fn try_fix_mtu(state: &mut MeshState, id: NodeId) {
    let node = state.node_mut(id);

    if node.mtuprobes < 0 {
        return;
    }

    if node.mtuprobes >= 30 || (node.minmtu != 0 && node.minmtu >= node.maxmtu) {
        if node.minmtu > node.maxmtu {
            node.minmtu = node.maxmtu;
        } else {
            node.maxmtu = node.minmtu;
        }

        node.mtu = node.minmtu;
        info!(node = %node.name, mtu = node.mtu, probes = node.mtuprobes, "fixed PMTU");
        node.mtuprobes = -1;
    }
}

fn send_probe(state: &mut MeshState, id: NodeId, len: usize, broadcast: bool) {
    let len = len.max(MIN_PROBE_SIZE);

    let mut payload = vec![0u8; len];
    lib_crypto::randomize(&mut payload[1..]);
    payload[0] = 0;

    debug!(node = %state.node(id).name, len, "sending PMTU probe");

    let Some(sptps) = state.node_mut(id).sptps.as_mut() else {
        return;
    };

    match sptps.send_record(PKT_PROBE, &payload) {
        Ok(pkt) => {
            if broadcast {
                crate::udp::send_broadcast_probe(state, id, &pkt.wire);
            } else {
                crate::udp::send_node_packets(state, id, vec![pkt]);
            }
        }
        Err(e) => debug!(error = %e, "could not send probe"),
    }
}

/// Handle a received probe record.
pub(crate) fn probe_h(state: &mut MeshState, id: NodeId, mut payload: Vec<u8>) {
    if payload.len() < MIN_PROBE_SIZE {
        warn!(node = %state.node(id).name, len = payload.len(), "got too short PMTU probe");
        return;
    }

    if payload[0] == 0 {
        // A request; echo it back the way it came.
        debug!(node = %state.node(id).name, len = payload.len(), "got PMTU probe");
        payload[0] = 1;

        let was_confirmed = state.node(id).udp_confirmed;
        state.node_mut(id).udp_confirmed = true;

        let reply = state
            .node_mut(id)
            .sptps
            .as_mut()
            .and_then(|s| s.send_record(PKT_PROBE, &payload).ok());

        if let Some(pkt) = reply {
            crate::udp::send_node_packets(state, id, vec![pkt]);
        }

        state.node_mut(id).udp_confirmed = was_confirmed;
        return;
    }

    // A reply: bidirectional UDP works at this size.
    let len = payload.len() as u16;
    debug!(node = %state.node(id).name, len, "got PMTU reply");

    let node = state.node_mut(id);

    if !node.udp_confirmed {
        info!(node = %node.name, "UDP communication confirmed");
        node.udp_confirmed = true;
    }

    if len > node.maxmtu {
        info!(node = %node.name, "PMTU increase detected, restarting discovery");
        node.minmtu = len;
        node.maxmtu = crate::net::MTU;
        node.mtuprobes = 1;
        return;
    }

    if node.mtuprobes < 0 && len == node.maxmtu {
        // The fixed PMTU is still valid.
        node.mtuprobes = -1;
    }

    if node.minmtu < len {
        node.minmtu = len;
    }

    try_fix_mtu(state, id);
}
