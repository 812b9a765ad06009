//! The meta-protocol
//!
//! Line-oriented text requests carried as SPTPS application records over
//! the TCP meta-connections. Each request is a single line
//! `REQNO arg1 arg2 ...`; request numbers keep their historical values so
//! the wire stays recognizable.

pub mod auth;
pub mod edge;
pub mod key;
pub mod misc;

use tracing::{debug, error};

use crate::connection::AllowRequest;
use crate::node::ConnId;
use crate::state::MeshState;
use crate::submesh::submesh_allows_node;

/// Protocol version. Different major versions are incompatible.
pub const PROT_MAJOR: u32 = 17;
pub const PROT_MINOR: u32 = 3;

/// Maximum length of any single string in a request.
pub const MAX_STRING_SIZE: usize = 2049;

/// Requests longer than this close the connection.
pub const MAX_REQUEST_SIZE: usize = 4096;

// Request numbers.
pub const ID: i32 = 0;
pub const ACK: i32 = 4;
pub const STATUS: i32 = 5;
pub const ERROR: i32 = 6;
pub const TERMREQ: i32 = 7;
pub const PING: i32 = 8;
pub const PONG: i32 = 9;
pub const ADD_EDGE: i32 = 12;
pub const DEL_EDGE: i32 = 13;
pub const KEY_CHANGED: i32 = 14;
pub const REQ_KEY: i32 = 15;
pub const ANS_KEY: i32 = 16;
pub const PACKET: i32 = 17;

// REQ_KEY sub-requests, carried as the fourth field.
pub const SUB_REQ_KEY: i32 = 15;
pub const SUB_REQ_PUBKEY: i32 = 19;
pub const SUB_ANS_PUBKEY: i32 = 20;
pub const SUB_REQ_SPTPS: i32 = 21;

fn request_name(reqno: i32) -> &'static str {
    match reqno {
        ID => "ID",
        ACK => "ACK",
        STATUS => "STATUS",
        ERROR => "ERROR",
        TERMREQ => "TERMREQ",
        PING => "PING",
        PONG => "PONG",
        ADD_EDGE => "ADD_EDGE",
        DEL_EDGE => "DEL_EDGE",
        KEY_CHANGED => "KEY_CHANGED",
        REQ_KEY => "REQ_KEY",
        ANS_KEY => "ANS_KEY",
        PACKET => "PACKET",
        _ => "UNKNOWN",
    }
}

/// Node and submesh names: 1-64 characters from `[A-Za-z0-9_]`.
pub fn check_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Send one request line over a connection. Before the SPTPS session is
/// up the line goes out in plaintext; afterwards it is wrapped in an
/// application record.
pub(crate) fn send_request(state: &mut MeshState, cid: ConnId, line: &str) -> bool {
    if line.len() >= MAX_REQUEST_SIZE {
        error!("output buffer overflow while sending request");
        return false;
    }

    let Some(conn) = state.conn(cid) else {
        return false;
    };

    let reqno = line.split(' ').next().and_then(|t| t.parse().ok()).unwrap_or(-1);
    debug!(to = conn.log_name(), request = request_name(reqno), "sending {}", line);

    let mut data = line.as_bytes().to_vec();
    data.push(b'\n');

    if conn.sptps.is_none() {
        conn.send_raw(data);
        return true;
    }

    let conn = state.conn_mut(cid).expect("connection is live");
    let Some(sptps) = conn.sptps.as_mut() else {
        return false;
    };

    match sptps.send_record(0, &data) {
        Ok(pkt) => {
            conn.send_raw(pkt.wire);
            true
        }
        Err(e) => {
            error!(error = %e, "failed to send request");
            false
        }
    }
}

/// Flood a request to every other active connection, honoring submesh
/// visibility.
pub(crate) fn broadcast_request(
    state: &mut MeshState,
    from: Option<ConnId>,
    submesh: Option<&str>,
    line: &str,
) {
    for cid in state.conn_ids() {
        if Some(cid) == from {
            continue;
        }

        let Some(conn) = state.conn(cid) else { continue };

        if !conn.status.active {
            continue;
        }

        if let Some(node) = conn.node {
            let node_submesh = state.node(node).submesh.clone();

            if !submesh_allows_node(submesh, node_submesh.as_deref()) {
                continue;
            }
        }

        send_request(state, cid, line);
    }
}

/// Forward a flooded request onward, excluding where it came from.
pub(crate) fn forward_request(
    state: &mut MeshState,
    from: ConnId,
    submesh: Option<&str>,
    request: &str,
) {
    debug!("forwarding {}", request);
    broadcast_request(state, Some(from), submesh, request);
}

/// Parse and dispatch one request line. Returns false when the
/// connection must be terminated.
pub(crate) fn receive_request(state: &mut MeshState, cid: ConnId, request: &str) -> bool {
    let Some(conn) = state.conn(cid) else {
        return false;
    };

    let Some(reqno) = request
        .split(' ')
        .next()
        .and_then(|t| t.parse::<i32>().ok())
    else {
        error!(from = conn.log_name(), "bogus data received");
        return false;
    };

    let allowed = match conn.allow_request {
        AllowRequest::Id => reqno == ID,
        AllowRequest::Ack => reqno == ACK,
        AllowRequest::All => true,
    };

    if !allowed {
        error!(from = conn.log_name(), request = request_name(reqno), "unauthorized request");
        return false;
    }

    debug!(from = conn.log_name(), request = request_name(reqno), "got {}", request);

    let ok = match reqno {
        ID => auth::id_h(state, cid, request),
        ACK => auth::ack_h(state, cid, request),
        STATUS => misc::status_h(state, cid, request),
        ERROR => misc::error_h(state, cid, request),
        TERMREQ => misc::termreq_h(state, cid, request),
        PING => misc::ping_h(state, cid, request),
        PONG => misc::pong_h(state, cid, request),
        ADD_EDGE => edge::add_edge_h(state, cid, request),
        DEL_EDGE => edge::del_edge_h(state, cid, request),
        KEY_CHANGED => key::key_changed_h(state, cid, request),
        REQ_KEY => key::req_key_h(state, cid, request),
        ANS_KEY => key::ans_key_h(state, cid, request),
        PACKET => misc::tcppacket_h(state, cid, request),
        _ => {
            debug!("unknown request {}", reqno);
            false
        }
    };

    if !ok {
        error!(request = request_name(reqno), "error while processing request");
    }

    ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_id() {
        assert!(check_id("foo"));
        assert!(check_id("node_17"));
        assert!(check_id(&"a".repeat(64)));
        assert!(!check_id(""));
        assert!(!check_id(&"a".repeat(65)));
        assert!(!check_id("has space"));
        assert!(!check_id("dash-ed"));
        assert!(!check_id("unicodé"));
    }

    #[test]
    fn test_request_names() {
        assert_eq!(request_name(ADD_EDGE), "ADD_EDGE");
        assert_eq!(request_name(99), "UNKNOWN");
    }
}
