//! Connections and outgoing connection attempts
//!
//! A `Connection` is a live TCP meta-link to one adjacent node. An
//! `Outgoing` is the persistent wish to be connected to a given node; it
//! walks the node's known addresses in a fixed order and backs off between
//! attempt cycles.

use std::net::SocketAddr;

use lib_crypto::PublicKey;
use tokio::sync::mpsc;

use crate::node::{ConnId, DevClass, NodeId};
use crate::sptps::Sptps;

/// Which meta-protocol request the connection may receive next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AllowRequest {
    /// Freshly accepted; only an ID line is acceptable.
    Id,
    /// ID exchanged; waiting for the SPTPS handshake and the ACK request.
    Ack,
    /// Fully established.
    All,
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ConnStatus {
    pub active: bool,
    pub connecting: bool,
    pub pinged: bool,
    /// We initiated this connection.
    pub initiator: bool,
    /// The peer presented an invitation instead of an identity.
    pub invitation: bool,
    pub invitation_used: bool,
}

/// Commands for a connection's writer task.
#[derive(Debug)]
pub(crate) enum WriterCmd {
    Data(Vec<u8>),
    Shutdown,
}

pub(crate) struct Connection {
    pub id: ConnId,
    /// Peer name, once learned from ID (or the expected name for outgoing).
    pub name: Option<String>,
    pub address: SocketAddr,
    pub node: Option<NodeId>,
    /// The self→peer edge materializing this connection, once active.
    pub edge: Option<(NodeId, NodeId)>,
    pub status: ConnStatus,
    pub allow_request: AllowRequest,
    pub protocol_major: u32,
    pub protocol_minor: u32,
    pub options: u32,
    pub devclass: DevClass,
    pub last_ping_time: i64,
    pub sptps: Option<Sptps>,
    /// Peer public key for invitation connections (the throwaway key).
    pub invitation_pubkey: Option<PublicKey>,
    /// Submesh assigned to an invited node, parsed from the invitation file.
    pub invitation_submesh: Option<String>,
    /// Name of the outgoing record this connection satisfies.
    pub outgoing: Option<String>,
    /// Inbound line buffer used before the SPTPS session starts.
    pub inbuf: Vec<u8>,
    pub writer: mpsc::UnboundedSender<WriterCmd>,
    /// Cancels the socket reader task when the connection dies.
    pub reader: Option<tokio::task::AbortHandle>,
}

impl Connection {
    pub fn log_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<unknown>")
    }

    pub fn send_raw(&self, data: Vec<u8>) {
        let _ = self.writer.send(WriterCmd::Data(data));
    }
}

/// Address enumeration phases for an outgoing attempt cycle. The state
/// only moves forward within one cycle; a successful PONG resets it to
/// `Start` for the next cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum OutgoingState {
    Start,
    Canonical,
    Recent,
    Known,
    End,
    /// The cycle ran to completion without producing a single address.
    NoKnownAddresses,
}

/// A persistent wish to be connected to a node.
pub(crate) struct Outgoing {
    pub name: String,
    pub state: OutgoingState,
    /// Current backoff, seconds.
    pub timeout: u64,
    /// Invalidates retry timers and connect tasks from older cycles.
    pub generation: u64,
    /// A connect task is currently running.
    pub connecting: bool,
}

impl Outgoing {
    pub fn new(name: String) -> Self {
        Self {
            name,
            state: OutgoingState::Start,
            timeout: 0,
            generation: 0,
            connecting: false,
        }
    }

    pub fn reset(&mut self) {
        self.state = OutgoingState::Start;
        self.timeout = 0;
        self.generation += 1;
        self.connecting = false;
    }
}

/// The per-cycle address list, walked in phase order. Built from the node
/// tables when the attempt starts and consumed by the connect task.
#[derive(Debug, Clone)]
pub(crate) struct AddressPlan {
    /// Canonical "host port" to resolve, if the node has one.
    pub canonical: Option<(String, u16)>,
    /// Recently-seen addresses, no DNS involved.
    pub recent: Vec<SocketAddr>,
    /// Addresses from the reverse edges in the current graph, deduplicated.
    pub known: Vec<SocketAddr>,
}

impl AddressPlan {
    pub fn is_empty(&self) -> bool {
        self.canonical.is_none() && self.recent.is_empty() && self.known.is_empty()
    }

    /// Phase the n-th address (after resolution) belongs to, used to keep
    /// the outgoing's state in step while the plan is walked.
    pub fn phases(&self) -> impl Iterator<Item = (OutgoingState, SocketAddr)> + '_ {
        self.recent
            .iter()
            .map(|a| (OutgoingState::Recent, *a))
            .chain(self.known.iter().map(|a| (OutgoingState::Known, *a)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outgoing_state_moves_forward() {
        // The enum ordering is the enumeration order of an attempt cycle.
        assert!(OutgoingState::Start < OutgoingState::Canonical);
        assert!(OutgoingState::Canonical < OutgoingState::Recent);
        assert!(OutgoingState::Recent < OutgoingState::Known);
        assert!(OutgoingState::Known < OutgoingState::End);
    }

    #[test]
    fn test_outgoing_reset_bumps_generation() {
        let mut o = Outgoing::new("peer".into());
        o.state = OutgoingState::End;
        o.timeout = 40;
        let gen = o.generation;

        o.reset();
        assert_eq!(o.state, OutgoingState::Start);
        assert_eq!(o.timeout, 0);
        assert_eq!(o.generation, gen + 1);
    }

    #[test]
    fn test_address_plan_phases() {
        let plan = AddressPlan {
            canonical: None,
            recent: vec!["10.0.0.1:655".parse().unwrap()],
            known: vec!["10.0.0.2:655".parse().unwrap()],
        };

        let phases: Vec<_> = plan.phases().collect();
        assert_eq!(phases[0].0, OutgoingState::Recent);
        assert_eq!(phases[1].0, OutgoingState::Known);
    }
}
