//! The mesh worker
//!
//! All protocol processing funnels through one task draining a single
//! event channel: socket readers, UDP receivers, timers, discovery and
//! the application send queue all post events here. Each event is
//! handled with exclusive access to the mesh state; the lock is never
//! held across an await point, and application callbacks collected during
//! handling are delivered only after it is released.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::connection::{
    AddressPlan, AllowRequest, ConnStatus, Connection, Outgoing, OutgoingState, WriterCmd,
};
use crate::mesh::MeshInner;
use crate::node::{ConnId, DevClass, NodeId};
use crate::protocol;
use crate::sptps::SptpsEvent;
use crate::state::{unix_now, AppEvent, MeshState};

/// Largest end-to-end SPTPS payload: a 1500-byte wire MTU minus IPv4,
/// UDP, and SPTPS datagram overhead.
pub const MTU: u16 = 1451;

/// Accepted TCP connections per second before new ones are dropped.
const MAX_CONNECTION_BURST: u32 = 100;

/// Seconds added to the outgoing retry backoff per failed cycle.
const RETRY_STEP: u64 = 5;

pub(crate) enum Event {
    Accepted {
        stream: TcpStream,
        from: SocketAddr,
    },
    OutgoingConnected {
        name: String,
        generation: u64,
        stream: TcpStream,
        addr: SocketAddr,
    },
    OutgoingFailed {
        name: String,
        generation: u64,
        no_address: bool,
    },
    RetryOutgoing {
        name: String,
        generation: u64,
    },
    ConnData {
        cid: ConnId,
        data: Vec<u8>,
    },
    ConnClosed {
        cid: ConnId,
    },
    Udp {
        sock: usize,
        from: SocketAddr,
        data: Vec<u8>,
    },
    PingTick,
    PeriodicTick,
    /// Roll the keys of every established end-to-end session and tell
    /// the mesh.
    ForceRekey,
    AppSend {
        packet: Vec<u8>,
    },
    Discovered {
        fingerprint: String,
        addr: SocketAddr,
    },
    Stop,
}

/// Drain the event channel until the mesh stops; the receiver is handed
/// back so the mesh can be started again.
pub(crate) async fn run_worker(
    inner: Arc<MeshInner>,
    mut rx: mpsc::UnboundedReceiver<Event>,
) -> mpsc::UnboundedReceiver<Event> {
    while let Some(event) = rx.recv().await {
        if matches!(event, Event::Stop) {
            break;
        }

        let events = {
            let mut state = inner.state.write();

            if !state.running {
                continue;
            }

            handle_event(&mut state, &inner, event);
            state.app_events.drain(..).collect::<Vec<AppEvent>>()
        };

        inner.deliver_app_events(events);
    }

    debug!("mesh worker stopped");
    rx
}

fn handle_event(state: &mut MeshState, inner: &Arc<MeshInner>, event: Event) {
    match event {
        Event::Accepted { stream, from } => handle_accepted(state, inner, stream, from),
        Event::OutgoingConnected {
            name,
            generation,
            stream,
            addr,
        } => handle_outgoing_connected(state, inner, name, generation, stream, addr),
        Event::OutgoingFailed {
            name,
            generation,
            no_address,
        } => handle_outgoing_failed(state, inner, name, generation, no_address),
        Event::RetryOutgoing { name, generation } => {
            let current = state.outgoings.get(&name).map(|o| o.generation);

            if current == Some(generation) {
                setup_outgoing_connection(state, inner, &name);
            }
        }
        Event::ConnData { cid, data } => handle_conn_data(state, cid, &data),
        Event::ConnClosed { cid } => {
            let report = state.conn(cid).map(|c| c.status.active).unwrap_or(false);
            terminate_connection(state, cid, report);
        }
        Event::Udp { sock, from, data } => crate::udp::handle_incoming(state, sock, from, &data),
        Event::PingTick => handle_ping_tick(state),
        Event::PeriodicTick => handle_periodic_tick(state, inner),
        Event::ForceRekey => crate::protocol::key::send_key_changed(state),
        Event::AppSend { packet } => crate::route::route(state, packet),
        Event::Discovered { fingerprint, addr } => handle_discovered(state, inner, fingerprint, addr),
        Event::Stop => {}
    }
}

// Connection plumbing

/// Spawn the reader and writer tasks for an accepted or connected socket
/// and register the connection record.
fn install_connection(
    state: &mut MeshState,
    inner: &Arc<MeshInner>,
    stream: TcpStream,
    addr: SocketAddr,
    status: ConnStatus,
    name: Option<String>,
    outgoing: Option<String>,
) -> ConnId {
    let _ = stream.set_nodelay(true);

    let cid = state.alloc_conn_id();
    let (read_half, write_half) = stream.into_split();
    let (writer_tx, writer_rx) = mpsc::unbounded_channel();

    let reader = tokio::spawn(reader_task(inner.clone(), cid, read_half));
    tokio::spawn(writer_task(writer_rx, write_half));

    let conn = Connection {
        id: cid,
        name,
        address: addr,
        node: None,
        edge: None,
        status,
        allow_request: AllowRequest::Id,
        protocol_major: 0,
        protocol_minor: 0,
        options: 0,
        devclass: DevClass::Unknown,
        last_ping_time: unix_now(),
        sptps: None,
        invitation_pubkey: None,
        invitation_submesh: None,
        outgoing,
        inbuf: Vec::new(),
        writer: writer_tx,
        reader: Some(reader.abort_handle()),
    };

    state.connections.insert(cid, conn);
    cid
}

async fn reader_task(inner: Arc<MeshInner>, cid: ConnId, mut read_half: OwnedReadHalf) {
    let mut buf = [0u8; 4096];

    loop {
        match read_half.read(&mut buf).await {
            Ok(0) | Err(_) => {
                let _ = inner.event_tx.send(Event::ConnClosed { cid });
                return;
            }
            Ok(n) => {
                if inner
                    .event_tx
                    .send(Event::ConnData {
                        cid,
                        data: buf[..n].to_vec(),
                    })
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}

async fn writer_task(mut rx: mpsc::UnboundedReceiver<WriterCmd>, mut write_half: OwnedWriteHalf) {
    use tokio::io::AsyncWriteExt;

    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriterCmd::Data(data) => {
                if write_half.write_all(&data).await.is_err() {
                    return;
                }
            }
            WriterCmd::Shutdown => {
                let _ = write_half.shutdown().await;
                return;
            }
        }
    }
}

fn handle_accepted(
    state: &mut MeshState,
    inner: &Arc<MeshInner>,
    stream: TcpStream,
    from: SocketAddr,
) {
    // Rate limit incoming connections.
    let now = unix_now();

    if state.connection_burst_time != now {
        state.connection_burst_time = now;
        state.connection_burst = 0;
    }

    if state.connection_burst >= MAX_CONNECTION_BURST {
        debug!(address = %from, "dropping connection over burst limit");
        return;
    }

    state.connection_burst += 1;

    info!(address = %from, "connection from");

    let status = ConnStatus::default();
    let cid = install_connection(state, inner, stream, from, status, None, None);
    protocol::auth::send_id(state, cid);
}

fn handle_outgoing_connected(
    state: &mut MeshState,
    inner: &Arc<MeshInner>,
    name: String,
    generation: u64,
    stream: TcpStream,
    addr: SocketAddr,
) {
    let valid = state
        .outgoings
        .get(&name)
        .map(|o| o.generation == generation)
        .unwrap_or(false);

    if !valid {
        return;
    }

    if let Some(out) = state.outgoings.get_mut(&name) {
        out.connecting = false;
    }

    info!(peer = %name, address = %addr, "connected to");

    let status = ConnStatus {
        connecting: false,
        initiator: true,
        ..Default::default()
    };

    let cid = install_connection(
        state,
        inner,
        stream,
        addr,
        status,
        Some(name.clone()),
        Some(name),
    );
    protocol::auth::send_id(state, cid);
}

fn handle_outgoing_failed(
    state: &mut MeshState,
    inner: &Arc<MeshInner>,
    name: String,
    generation: u64,
    no_address: bool,
) {
    let valid = state
        .outgoings
        .get(&name)
        .map(|o| o.generation == generation)
        .unwrap_or(false);

    if !valid {
        return;
    }

    if no_address {
        warn!(peer = %name, "no known addresses");

        if let Some(out) = state.outgoings.get_mut(&name) {
            out.state = OutgoingState::NoKnownAddresses;
            out.connecting = false;
        }
    } else {
        warn!(peer = %name, "could not set up a meta connection");
    }

    retry_outgoing(state, inner, &name);
}

/// Schedule the next attempt cycle with linear backoff, switching to fast
/// retries while the whole mesh just became unreachable.
fn retry_outgoing(state: &mut MeshState, inner: &Arc<MeshInner>, name: &str) {
    let fast_retry_period = state.my_traits().fast_retry_period;
    let maxtimeout = state.my_traits().maxtimeout;
    let fast = !state.mesh_reachable
        && unix_now() < state.last_unreachable_all + fast_retry_period;

    let Some(out) = state.outgoings.get_mut(name) else {
        return;
    };

    out.connecting = false;

    if fast {
        out.timeout = 1;
    } else {
        out.timeout = (out.timeout + RETRY_STEP).min(maxtimeout);
    }

    let delay = out.timeout;
    let generation = out.generation;
    let name = name.to_string();
    let tx = inner.event_tx.clone();

    info!(peer = %name, seconds = delay, "trying to re-establish outgoing connection");

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(delay)).await;
        let _ = tx.send(Event::RetryOutgoing { name, generation });
    });
}

/// Kick off one outgoing attempt cycle.
pub(crate) fn setup_outgoing_connection(
    state: &mut MeshState,
    inner: &Arc<MeshInner>,
    name: &str,
) {
    let Some(node_id) = state.lookup_node(name) else {
        state.outgoings.remove(name);
        return;
    };

    // Already connected; just adopt the connection.
    if let Some(cid) = state.node(node_id).connection {
        info!(peer = %name, "already connected");

        if let Some(conn) = state.conn_mut(cid) {
            conn.outgoing = Some(name.to_string());
        }

        return;
    }

    if state.node(node_id).blacklisted {
        return;
    }

    let Some(out) = state.outgoings.get_mut(name) else {
        return;
    };

    if out.connecting {
        return;
    }

    out.state = OutgoingState::Start;
    out.generation += 1;
    out.connecting = true;
    let generation = out.generation;

    state.push_app_event(AppEvent::ConnectionTry {
        node: name.to_string(),
    });

    let plan = build_address_plan(state, node_id);
    let name = name.to_string();
    let tx = inner.event_tx.clone();
    let inner = inner.clone();

    tokio::spawn(async move {
        let set_phase = |phase: OutgoingState| {
            let mut state = inner.state.write();

            if let Some(out) = state.outgoings.get_mut(&name) {
                if out.generation == generation && out.state < phase {
                    out.state = phase;
                }
            }
        };

        let mut tried_any = false;

        // Canonical address first, resolved with a short deadline.
        if let Some((host, port)) = plan.canonical.clone() {
            set_phase(OutgoingState::Canonical);

            if let Ok(addrs) = crate::adns::resolve(&host, port, Duration::from_secs(5)).await {
                for addr in addrs {
                    tried_any = true;

                    if let Some(stream) = try_connect(addr).await {
                        let _ = tx.send(Event::OutgoingConnected {
                            name: name.clone(),
                            generation,
                            stream,
                            addr,
                        });
                        return;
                    }
                }
            }
        }

        for (phase, addr) in plan.phases() {
            set_phase(phase);
            tried_any = true;

            if let Some(stream) = try_connect(addr).await {
                let _ = tx.send(Event::OutgoingConnected {
                    name: name.clone(),
                    generation,
                    stream,
                    addr,
                });
                return;
            }
        }

        set_phase(OutgoingState::End);
        let _ = tx.send(Event::OutgoingFailed {
            name: name.clone(),
            generation,
            no_address: !tried_any,
        });
    });
}

async fn try_connect(addr: SocketAddr) -> Option<TcpStream> {
    debug!(address = %addr, "trying to connect");

    match tokio::time::timeout(Duration::from_secs(5), TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Some(stream),
        _ => None,
    }
}

/// Collect the node's addresses in enumeration order: canonical, recent,
/// then addresses from its reverse edges, deduplicated.
fn build_address_plan(state: &MeshState, id: NodeId) -> AddressPlan {
    let node = state.node(id);

    let canonical = node.canonical_address.as_ref().and_then(|ca| {
        let (host, port) = ca.rsplit_once(' ')?;
        Some((host.to_string(), port.parse().ok()?))
    });

    let recent = node.recent.clone();

    let mut known: Vec<SocketAddr> = Vec::new();

    for edge in state.edges.values().filter(|e| e.to == id) {
        if let Some(rev) = state.edges.get(&(edge.to, edge.from)) {
            if let Some(addr) = rev.address {
                if !known.contains(&addr) && !recent.contains(&addr) {
                    known.push(addr);
                }
            }
        }
    }

    AddressPlan {
        canonical,
        recent,
        known,
    }
}

/// Terminate a connection: deactivate it, withdraw its edge, rerun the
/// graph, and retry the outgoing it satisfied.
pub(crate) fn terminate_connection(state: &mut MeshState, cid: ConnId, report: bool) {
    let Some(conn) = state.conn_mut(cid) else {
        return;
    };

    info!(peer = conn.log_name(), "closing connection");

    conn.status.active = false;
    let node = conn.node;
    let edge = conn.edge.take();
    let outgoing = conn.outgoing.take();

    if let Some(handle) = conn.reader.take() {
        handle.abort();
    }

    let _ = conn.writer.send(WriterCmd::Shutdown);

    if let Some(node_id) = node {
        if state.node(node_id).connection == Some(cid) {
            state.node_mut(node_id).connection = None;
        }
    }

    if let Some(key) = edge {
        if report {
            crate::protocol::edge::broadcast_del_edge(state, Some(cid), key, 0);
        }

        state.edge_del(key.0, key.1);
        crate::graph::run_graph(state);

        // Clean up the stale reverse edge of a now-unreachable peer.
        if report {
            if let Some(node_id) = node {
                if !state.node(node_id).reachable {
                    let self_id = state.self_id;

                    if state.lookup_edge(node_id, self_id).is_some() {
                        crate::protocol::edge::broadcast_del_edge(
                            state,
                            Some(cid),
                            (node_id, self_id),
                            0,
                        );
                        state.edge_del(node_id, self_id);
                        crate::graph::run_graph(state);
                    }
                }
            }
        }
    }

    state.connections.remove(&cid);

    if let Some(name) = outgoing {
        if state.outgoings.contains_key(&name) {
            if let Some(inner) = state.worker_handle.clone().upgrade() {
                setup_outgoing_connection(state, &inner, &name);
            }
        }
    }
}

// Meta data processing

fn handle_conn_data(state: &mut MeshState, cid: ConnId, data: &[u8]) {
    let Some(conn) = state.conn_mut(cid) else {
        return;
    };

    if conn.sptps.is_none() {
        // Pre-identity phase: a single line-buffered plaintext request.
        // Processing the ID must leave the connection with a session;
        // anything else is a protocol violation.
        conn.inbuf.extend_from_slice(data);

        let Some(pos) = conn.inbuf.iter().position(|&b| b == b'\n') else {
            if conn.inbuf.len() >= protocol::MAX_REQUEST_SIZE {
                warn!(peer = conn.log_name(), "input buffer full");
                fail_connection(state, cid);
            }

            return;
        };

        let line: Vec<u8> = conn.inbuf[..pos].to_vec();
        conn.inbuf.drain(..=pos);

        let Ok(line) = String::from_utf8(line) else {
            fail_connection(state, cid);
            return;
        };

        if !protocol::receive_request(state, cid, &line) {
            fail_connection(state, cid);
            return;
        }

        // The ID handler must have started the SPTPS session; feed it
        // whatever arrived after the line.
        let leftover = match state.conn_mut(cid) {
            Some(conn) if conn.sptps.is_some() => std::mem::take(&mut conn.inbuf),
            Some(_) => {
                fail_connection(state, cid);
                return;
            }
            None => return,
        };

        feed_conn_sptps(state, cid, &leftover);
        return;
    }

    feed_conn_sptps(state, cid, data);
}

fn fail_connection(state: &mut MeshState, cid: ConnId) {
    // The failing handler already logged why.
    let report = state.conn(cid).map(|c| c.status.active).unwrap_or(false);
    terminate_connection(state, cid, report);
}

fn feed_conn_sptps(state: &mut MeshState, cid: ConnId, data: &[u8]) {
    if data.is_empty() {
        return;
    }

    let Some(conn) = state.conn_mut(cid) else {
        return;
    };

    let Some(mut sptps) = conn.sptps.take() else {
        return;
    };

    let result = sptps.receive_data(data);

    if let Some(conn) = state.conn_mut(cid) {
        conn.sptps = Some(sptps);
    }

    let output = match result {
        Ok(output) => output,
        Err(e) => {
            warn!(error = %e, "meta-connection session failed");
            fail_connection(state, cid);
            return;
        }
    };

    for pkt in output.packets {
        if let Some(conn) = state.conn(cid) {
            conn.send_raw(pkt.wire);
        }
    }

    for event in output.events {
        let (is_invitation, allow) = match state.conn(cid) {
            Some(conn) => (conn.status.invitation, conn.allow_request),
            None => return,
        };

        match event {
            SptpsEvent::HandshakeDone => {
                if is_invitation {
                    continue;
                }

                if allow == AllowRequest::Ack && !protocol::auth::send_ack(state, cid) {
                    fail_connection(state, cid);
                    return;
                }
            }
            SptpsEvent::Record { rtype, payload } => {
                if payload.len() > protocol::MAX_REQUEST_SIZE {
                    warn!("oversized request");
                    fail_connection(state, cid);
                    return;
                }

                let ok = if is_invitation {
                    crate::invitation::invitation_record(state, cid, rtype, &payload)
                } else if rtype == 0 {
                    let mut text = payload;

                    if text.last() == Some(&b'\n') {
                        text.pop();
                    }

                    match String::from_utf8(text) {
                        Ok(line) => protocol::receive_request(state, cid, &line),
                        Err(_) => false,
                    }
                } else {
                    warn!(rtype, "unexpected record type on meta-connection");
                    false
                };

                if !ok {
                    fail_connection(state, cid);
                    return;
                }
            }
        }
    }
}

// Timers

fn handle_ping_tick(state: &mut MeshState) {
    let now = unix_now();
    let pingtimeout = state.my_traits().pingtimeout;
    let pinginterval = state.my_traits().pinginterval;

    // Retransmit stale end-to-end key requests.
    for id in state.node_ids() {
        let node = state.node(id);

        if node.waiting_for_key && node.last_req_key + pingtimeout <= now {
            crate::protocol::key::send_req_key(state, id);
        }
    }

    for cid in state.conn_ids() {
        let Some(conn) = state.conn(cid) else { continue };
        let last_ping = conn.last_ping_time;

        if last_ping + pingtimeout > now {
            continue;
        }

        if conn.status.active {
            if conn.status.pinged {
                info!(
                    peer = conn.log_name(),
                    seconds = now - last_ping,
                    "peer did not respond to PING"
                );
            } else if last_ping + pinginterval <= now {
                protocol::misc::send_ping(state, cid);
                continue;
            } else {
                continue;
            }
        } else if conn.status.connecting {
            warn!(peer = conn.log_name(), "timeout while connecting");
        } else {
            warn!(peer = conn.log_name(), "timeout during authentication");
        }

        let report = state.conn(cid).map(|c| c.status.active).unwrap_or(false);
        terminate_connection(state, cid, report);
    }

    // Keep sessions and path MTU fresh.
    for id in state.node_ids() {
        if id != state.self_id {
            crate::pmtu::keepalive(state, id);
        }
    }

    state.age_seen_requests(pinginterval);
}

fn handle_periodic_tick(state: &mut MeshState, inner: &Arc<MeshInner>) {
    let now = unix_now();

    // Too many contradicting edge claims usually means another node has
    // our name; back off exponentially instead of fighting it.
    if state.contradicting_add_edge > 100 && state.contradicting_del_edge > 100 {
        warn!(
            seconds = state.sleeptime,
            "possible node with the same name, pausing autoconnect"
        );
        state.autoconnect_paused_until = now + state.sleeptime;
        state.sleeptime = (state.sleeptime * 2).min(3600);
    } else {
        state.sleeptime = (state.sleeptime / 2).max(10);
    }

    state.contradicting_add_edge = 0;
    state.contradicting_del_edge = 0;

    if now >= state.autoconnect_paused_until {
        autoconnect(state, inner);
    }

    // Sweep expired invitations.
    let timeout = state.invitation_timeout;

    if let Some(store) = &state.store {
        store.invitation_purge(now - timeout);
    }

    // Flush dirty host configs.
    for id in state.node_ids() {
        write_node_config(state, id);
    }
}

// Autoconnect

fn active_connection_count(state: &MeshState) -> usize {
    state
        .connections
        .values()
        .filter(|c| c.status.active)
        .count()
}

fn active_count_at_class(state: &MeshState, devclass: DevClass) -> usize {
    state
        .connections
        .values()
        .filter(|c| c.status.active && c.node.is_some() && c.devclass == devclass)
        .count()
}

/// Candidate order: most recently successfully connected first, with
/// never-connected nodes counting as best.
fn better_candidate(state: &MeshState, a: NodeId, b: NodeId) -> bool {
    let a = state.node(a).last_successful_connection;
    let b = state.node(b).last_successful_connection;

    if a == b {
        return false;
    }

    a == 0 || (b != 0 && a > b)
}

fn connect_candidate(
    state: &MeshState,
    retry_timeout: i64,
    now: i64,
    class_filter: impl Fn(DevClass) -> bool,
) -> Option<NodeId> {
    let mut best: Option<NodeId> = None;

    for id in state.node_ids() {
        if id == state.self_id {
            continue;
        }

        let node = state.node(id);

        if node.connection.is_some()
            || node.blacklisted
            || !class_filter(node.devclass)
            || (node.last_connect_try != 0 && now - node.last_connect_try <= retry_timeout)
        {
            continue;
        }

        let replace = match best {
            None => true,
            Some(b) => {
                let bn = state.node(b);
                node.devclass < bn.devclass
                    || (node.devclass == bn.devclass && better_candidate(state, id, b))
            }
        };

        if replace {
            best = Some(id);
        }
    }

    best
}

/// Record the attempt and start an outgoing connection to the chosen
/// node, unless one is already being maintained.
fn start_autoconnect_attempt(
    state: &mut MeshState,
    inner: &Arc<MeshInner>,
    id: NodeId,
    now: i64,
) {
    let name = state.node(id).name.clone();
    state.node_mut(id).last_connect_try = now;

    if !state.outgoings.contains_key(&name) {
        debug!(node = %name, "autoconnecting");
        state.outgoings.insert(name.clone(), Outgoing::new(name.clone()));
        setup_outgoing_connection(state, inner, &name);
    }
}

/// The periodic controller deciding which meta-connections to form and
/// tear down.
fn autoconnect(state: &mut MeshState, inner: &Arc<MeshInner>) {
    if state.node_count() <= 1 {
        return;
    }

    let now = unix_now();
    let retry_timeout = ((state.node_count() as i64) * 5).min(60);
    let my_class = state.devclass;
    let min_connects = state.my_traits().min_connects;
    let max_connects = state.my_traits().max_connects;
    let cur = active_connection_count(state);

    debug!(cur, min_connects, max_connects, retry_timeout, "autoconnect");

    let mut connect_to: Option<NodeId> = None;
    let mut disconnect_from: Option<ConnId> = None;

    if cur < min_connects {
        // Starved: pick the best candidate of any class up to ours.
        connect_to = connect_candidate(state, retry_timeout, now, |c| c <= my_class);
    } else if cur < max_connects {
        // Try to improve the class balance from the backbone down: every
        // class in range is checked on its own count, and the first one
        // that is both starved and has a candidate wins.
        for class_idx in 0..=my_class.index() {
            let devclass = DevClass::from_i32(class_idx as i32).expect("valid class index");

            if active_count_at_class(state, devclass) >= min_connects {
                continue;
            }

            connect_to = connect_candidate(state, retry_timeout, now, |c| c == devclass);

            if connect_to.is_some() {
                break;
            }
        }
    }

    if let Some(id) = connect_to {
        start_autoconnect_attempt(state, inner, id, now);
    }

    // Partition healing, independent of the connect/disconnect logic:
    // occasionally poke one unreachable node; picking a random index over
    // all nodes gives backoff proportional to mesh size.
    let heal = {
        let ids = {
            let mut ids = state.node_ids();
            ids.sort();
            ids
        };
        let pick = ids[rand::thread_rng().gen_range(0..ids.len())];
        let node = state.node(pick);

        if pick != state.self_id
            && Some(pick) != connect_to
            && !node.reachable
            && !node.blacklisted
            && node.connection.is_none()
            && (node.last_connect_try == 0 || now - node.last_connect_try > retry_timeout)
        {
            debug!(node = %node.name, "trying to heal possible partition");
            Some(pick)
        } else {
            None
        }
    };

    if let Some(id) = heal {
        start_autoconnect_attempt(state, inner, id, now);
    }

    // Tear down redundant outgoing connections, preferring the least
    // available classes, but never disconnect a peer whose removal could
    // partition the mesh.
    if cur > min_connects {
        for class_idx in 0..=my_class.index() {
            let devclass = DevClass::from_i32(class_idx as i32).expect("valid class index");

            if active_count_at_class(state, devclass) > min_connects {
                let candidates: Vec<ConnId> = state
                    .connections
                    .values()
                    .filter(|c| {
                        c.status.active
                            && c.outgoing.is_some()
                            && c.devclass >= devclass
                            && c.node
                                .map(|n| state.edge_count_of(n) >= 2)
                                .unwrap_or(false)
                    })
                    .map(|c| c.id)
                    .collect();

                if !candidates.is_empty() {
                    let pick = candidates[rand::thread_rng().gen_range(0..candidates.len())];
                    disconnect_from = Some(pick);
                }

                break;
            }
        }
    }

    if disconnect_from.is_none() && cur > max_connects {
        let candidates: Vec<ConnId> = state
            .connections
            .values()
            .filter(|c| c.status.active && c.outgoing.is_some())
            .map(|c| c.id)
            .collect();

        if !candidates.is_empty() {
            disconnect_from =
                Some(candidates[rand::thread_rng().gen_range(0..candidates.len())]);
        }
    }

    if let Some(cid) = disconnect_from {
        let name = match state.conn_mut(cid) {
            Some(conn) => {
                debug!(peer = conn.log_name(), "autodisconnecting");
                conn.outgoing.take()
            }
            None => None,
        };

        if let Some(name) = name {
            state.outgoings.remove(&name);
        }

        let report = state.conn(cid).map(|c| c.status.active).unwrap_or(false);
        terminate_connection(state, cid, report);
    }
}

// Discovery

fn handle_discovered(
    state: &mut MeshState,
    inner: &Arc<MeshInner>,
    fingerprint: String,
    addr: SocketAddr,
) {
    let found = state.node_ids().into_iter().find(|&id| {
        state
            .node(id)
            .public_key
            .map(|k| k.to_base64() == fingerprint)
            .unwrap_or(false)
    });

    let Some(id) = found else {
        return;
    };

    if id == state.self_id || state.node(id).blacklisted {
        return;
    }

    debug!(node = %state.node(id).name, address = %addr, "discovered on the local network");

    if state.node_mut(id).add_recent_address(addr) {
        write_node_config(state, id);
    }

    // Retry immediately over the fresh address.
    if state.node(id).connection.is_none() {
        let name = state.node(id).name.clone();
        state
            .outgoings
            .entry(name.clone())
            .or_insert_with(|| Outgoing::new(name.clone()))
            .reset();
        setup_outgoing_connection(state, inner, &name);
    }
}

// Config write-back

/// Persist a node's host config if it changed.
pub(crate) fn write_node_config(state: &mut MeshState, id: NodeId) {
    if !state.node(id).dirty {
        return;
    }

    let Some(store) = &state.store else {
        state.node_mut(id).dirty = false;
        return;
    };

    let node = state.node(id);
    let blob = crate::conf::HostConfig::from_node(node).encode();

    match store.host_write("current", &node.name.clone(), &blob) {
        Ok(()) => state.node_mut(id).dirty = false,
        Err(e) => {
            state.push_app_event(AppEvent::Error { error: e });
        }
    }
}
