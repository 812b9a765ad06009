//! Application packet routing
//!
//! Every application datagram carries a 32-byte header: the destination
//! name followed by the source name, each in a 16-byte NUL-padded field.
//! Packets whose destination is not us are re-routed towards their owner;
//! relaying re-encrypts hop-wise under the relay's own sessions while the
//! header names are preserved end to end.

use tracing::{debug, warn};

use crate::node::NodeId;
use crate::state::{AppEvent, MeshState};

/// Size of one name field in the packet header.
pub const NAME_FIELD: usize = 16;

/// Total header size: destination plus source.
pub const HEADER_SIZE: usize = 2 * NAME_FIELD;

fn put_name(buf: &mut [u8], name: &str) -> bool {
    if name.len() > NAME_FIELD {
        return false;
    }

    buf[..name.len()].copy_from_slice(name.as_bytes());
    true
}

fn get_name(buf: &[u8]) -> Option<&str> {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(NAME_FIELD);
    std::str::from_utf8(&buf[..end]).ok()
}

/// Prefix application data with the routing header.
pub(crate) fn build_packet(dest: &str, source: &str, data: &[u8]) -> Option<Vec<u8>> {
    let mut packet = vec![0u8; HEADER_SIZE + data.len()];

    if !put_name(&mut packet[..NAME_FIELD], dest)
        || !put_name(&mut packet[NAME_FIELD..HEADER_SIZE], source)
    {
        return None;
    }

    packet[HEADER_SIZE..].copy_from_slice(data);
    Some(packet)
}

/// Split a packet into its header names and payload.
pub(crate) fn parse_packet(packet: &[u8]) -> Option<(&str, &str, &[u8])> {
    if packet.len() < HEADER_SIZE {
        return None;
    }

    let dest = get_name(&packet[..NAME_FIELD])?;
    let source = get_name(&packet[NAME_FIELD..HEADER_SIZE])?;
    Some((dest, source, &packet[HEADER_SIZE..]))
}

/// Handle a decrypted data record that arrived from `via`.
pub(crate) fn route_incoming(state: &mut MeshState, via: NodeId, packet: Vec<u8>) {
    if state.node(via).blacklisted {
        warn!(node = %state.node(via).name, "dropping packet from blacklisted node");
        return;
    }

    {
        let node = state.node_mut(via);
        node.in_packets += 1;
        node.in_bytes += packet.len() as u64;
    }

    route(state, packet);
}

/// Deliver a packet locally or forward it towards its destination.
pub(crate) fn route(state: &mut MeshState, packet: Vec<u8>) {
    let Some((dest, source, payload)) = parse_packet(&packet) else {
        warn!("dropping packet with malformed header");
        return;
    };

    let Some(owner) = state.lookup_node(dest) else {
        warn!(dest, "cannot route packet to unknown destination");
        return;
    };

    if owner == state.self_id {
        let from = source.to_string();
        let data = payload.to_vec();
        debug!(from = %from, len = data.len(), "delivering packet");

        let len = packet.len() as u64;
        let node = state.node_mut(owner);
        node.in_packets += 1;
        node.in_bytes += len;

        state.push_app_event(AppEvent::Receive { from, data });
        return;
    }

    if !state.node(owner).reachable {
        warn!(dest, "dropping packet for unreachable destination");
        return;
    }

    send_packet(state, owner, packet);
}

/// Send a fully-formed packet to a node over its end-to-end session.
pub(crate) fn send_packet(state: &mut MeshState, to: NodeId, packet: Vec<u8>) {
    {
        let node = state.node_mut(to);
        node.out_packets += 1;
        node.out_bytes += packet.len() as u64;
    }

    debug!(to = %state.node(to).name, len = packet.len(), "sending packet");
    crate::udp::send_node_data(state, to, 0, &packet);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_header_roundtrip() {
        let packet = build_packet("destnode", "srcnode", b"payload bytes").unwrap();
        assert_eq!(packet.len(), HEADER_SIZE + 13);

        let (dest, source, payload) = parse_packet(&packet).unwrap();
        assert_eq!(dest, "destnode");
        assert_eq!(source, "srcnode");
        assert_eq!(payload, b"payload bytes");
    }

    #[test]
    fn test_name_field_limit() {
        assert!(build_packet(&"a".repeat(16), "b", b"").is_some());
        assert!(build_packet(&"a".repeat(17), "b", b"").is_none());
    }

    #[test]
    fn test_short_packet_rejected() {
        assert!(parse_packet(&[0u8; HEADER_SIZE - 1]).is_none());
    }
}
