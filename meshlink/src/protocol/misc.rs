//! Liveness and notification requests: PING/PONG, STATUS, ERROR, TERMREQ

use tracing::{error, info};

use crate::node::ConnId;
use crate::protocol::{send_request, PING, PONG};
use crate::state::{unix_now, MeshState};

pub(crate) fn send_ping(state: &mut MeshState, cid: ConnId) -> bool {
    if let Some(conn) = state.conn_mut(cid) {
        conn.status.pinged = true;
        conn.last_ping_time = unix_now();
    }

    send_request(state, cid, &format!("{}", PING))
}

pub(crate) fn ping_h(state: &mut MeshState, cid: ConnId, _request: &str) -> bool {
    send_pong(state, cid)
}

pub(crate) fn send_pong(state: &mut MeshState, cid: ConnId) -> bool {
    send_request(state, cid, &format!("{}", PONG))
}

pub(crate) fn pong_h(state: &mut MeshState, cid: ConnId, _request: &str) -> bool {
    let outgoing = {
        let Some(conn) = state.conn_mut(cid) else { return false };
        conn.status.pinged = false;
        conn.outgoing.clone()
    };

    // A successful round trip resets the retry backoff and the address
    // iterator of the outgoing this connection satisfies.
    if let Some(name) = outgoing {
        if let Some(out) = state.outgoings.get_mut(&name) {
            out.reset();
        }
    }

    true
}

pub(crate) fn status_h(state: &mut MeshState, cid: ConnId, request: &str) -> bool {
    let Some(conn) = state.conn(cid) else { return false };
    let rest = request.splitn(2, ' ').nth(1).unwrap_or("");
    info!(from = conn.log_name(), "status message: {}", rest);
    true
}

pub(crate) fn error_h(state: &mut MeshState, cid: ConnId, request: &str) -> bool {
    let Some(conn) = state.conn(cid) else { return false };
    let rest = request.splitn(2, ' ').nth(1).unwrap_or("");
    info!(from = conn.log_name(), "error message: {}", rest);
    false
}

pub(crate) fn termreq_h(_state: &mut MeshState, _cid: ConnId, _request: &str) -> bool {
    false
}

/// Encapsulated TCP packets are not part of this protocol.
pub(crate) fn tcppacket_h(state: &mut MeshState, cid: ConnId, _request: &str) -> bool {
    if let Some(conn) = state.conn(cid) {
        error!(from = conn.log_name(), "got unsupported PACKET request");
    }

    false
}
