//! The mesh handle
//!
//! Owns one mesh instance: its config store, its in-memory state, the
//! worker task and the listen sockets. The public API locks the shared
//! state, does bounded work, and releases the lock; no lock is ever held
//! while an application callback runs.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use lib_crypto::Keypair;
use lib_packmsg::{Reader, Writer};

use crate::conf::{ConfStore, HostConfig, MainConfig, StoragePolicy};
use crate::edge::OPTION_PMTU_DISCOVERY;
use crate::error::{Error, Result};
use crate::net::Event;
use crate::node::{DevClass, Node};
use crate::protocol::check_id;
use crate::state::{AppEvent, ListenSocket, MeshState};

/// Parameters for opening a mesh instance.
pub struct OpenParams {
    /// Directory owning this instance's persistent state; `None` runs
    /// fully in memory.
    pub confbase: Option<PathBuf>,
    /// Our name; required on first open, must match the store afterwards.
    pub name: Option<String>,
    /// Application name, shared by all nodes of one mesh.
    pub appname: String,
    pub devclass: DevClass,
    /// Network namespace fd (not supported on this build).
    pub netns: Option<i32>,
    /// Storage encryption key material.
    pub storage_key: Option<Vec<u8>>,
    pub storage_policy: StoragePolicy,
    /// Alternative lock file name inside the confbase.
    pub lock_filename: Option<String>,
}

impl OpenParams {
    pub fn new(
        confbase: Option<PathBuf>,
        name: Option<&str>,
        appname: &str,
        devclass: DevClass,
    ) -> Self {
        Self {
            confbase,
            name: name.map(str::to_string),
            appname: appname.to_string(),
            devclass,
            netns: None,
            storage_key: None,
            storage_policy: StoragePolicy::Enabled,
            lock_filename: None,
        }
    }
}

/// A read-only snapshot of one node.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub name: String,
    pub devclass: DevClass,
    pub submesh: Option<String>,
    pub reachable: bool,
    pub blacklisted: bool,
    pub public_key: Option<[u8; 32]>,
    pub canonical_address: Option<String>,
    pub mtu: u16,
    pub last_reachable: i64,
    pub last_unreachable: i64,
    pub in_packets: u64,
    pub in_bytes: u64,
    pub out_packets: u64,
    pub out_bytes: u64,
}

impl NodeInfo {
    fn from_node(node: &Node) -> Self {
        Self {
            name: node.name.clone(),
            devclass: node.devclass,
            submesh: node.submesh.clone(),
            reachable: node.reachable,
            blacklisted: node.blacklisted,
            public_key: node.public_key.map(|k| *k.as_bytes()),
            canonical_address: node.canonical_address.clone(),
            mtu: node.mtu,
            last_reachable: node.last_reachable,
            last_unreachable: node.last_unreachable,
            in_packets: node.in_packets,
            in_bytes: node.in_bytes,
            out_packets: node.out_packets,
            out_bytes: node.out_bytes,
        }
    }
}

type ReceiveCb = Box<dyn Fn(&str, &[u8]) + Send + Sync>;
type StatusCb = Box<dyn Fn(&str, bool) + Send + Sync>;
type NameCb = Box<dyn Fn(&str) + Send + Sync>;
type ErrorCb = Box<dyn Fn(Error) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    receive: Mutex<Option<ReceiveCb>>,
    node_status: Mutex<Option<StatusCb>>,
    node_duplicate: Mutex<Option<NameCb>>,
    connection_try: Mutex<Option<NameCb>>,
    error: Mutex<Option<ErrorCb>>,
}

pub(crate) struct MeshInner {
    pub(crate) state: RwLock<MeshState>,
    pub(crate) event_tx: mpsc::UnboundedSender<Event>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    callbacks: Callbacks,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MeshInner {
    /// Deliver collected callbacks with no lock held.
    pub(crate) fn deliver_app_events(&self, events: Vec<AppEvent>) {
        for event in events {
            match event {
                AppEvent::Receive { from, data } => {
                    if let Some(cb) = &*self.callbacks.receive.lock() {
                        cb(&from, &data);
                    }
                }
                AppEvent::NodeStatus { node, reachable } => {
                    if let Some(cb) = &*self.callbacks.node_status.lock() {
                        cb(&node, reachable);
                    }
                }
                AppEvent::NodeDuplicate { node } => {
                    if let Some(cb) = &*self.callbacks.node_duplicate.lock() {
                        cb(&node);
                    }
                }
                AppEvent::ConnectionTry { node } => {
                    if let Some(cb) = &*self.callbacks.connection_try.lock() {
                        cb(&node);
                    }
                }
                AppEvent::Error { error } => {
                    if let Some(cb) = &*self.callbacks.error.lock() {
                        cb(error);
                    }
                }
            }
        }
    }
}

/// One mesh instance.
pub struct Mesh {
    inner: Arc<MeshInner>,
}

impl Mesh {
    /// Open a mesh instance: load or create its configuration and keys.
    /// No network activity happens until [`Mesh::start`].
    pub fn open(params: OpenParams) -> Result<Mesh> {
        if params.appname.is_empty()
            || !params.appname.is_ascii()
            || params.appname.contains(' ')
        {
            error!("invalid appname");
            return Err(Error::Inval);
        }

        if let Some(name) = &params.name {
            if !check_id(name) {
                error!("invalid name");
                return Err(Error::Inval);
            }
        }

        if params.netns.is_some() {
            error!("network namespaces are not supported");
            return Err(Error::Notsup);
        }

        if params.storage_key.as_ref().map(|k| k.is_empty()).unwrap_or(false) {
            error!("invalid storage key");
            return Err(Error::Inval);
        }

        let config_key = params.storage_key.as_ref().map(|key| {
            let mut out = [0u8; 32];
            lib_crypto::prf(key, b"MeshLink configuration key", &mut out);
            out
        });

        let mut store = params.confbase.as_ref().map(|confbase| {
            ConfStore::new(confbase.clone(), config_key, params.storage_policy)
        });

        let mut stored: Option<MainConfig> = None;

        if let Some(store) = &mut store {
            store.lock(params.lock_filename.as_deref())?;

            if store.recover()? {
                stored = Some(store.main_read("current")?);
            }
        }

        let (name, private_key, invitation_key, port, fresh) = match stored {
            Some(main) => {
                if let Some(wanted) = &params.name {
                    if *wanted != main.name {
                        error!(
                            stored = %main.name,
                            requested = %wanted,
                            "name does not match stored configuration"
                        );
                        return Err(Error::Inval);
                    }
                }

                (main.name, main.private_key, main.invitation_key, main.port, false)
            }
            None => {
                let Some(name) = params.name.clone() else {
                    error!("no configuration files found and no name given");
                    return Err(Error::Storage);
                };

                let port = if store.is_some() { check_port() } else { 0 };
                (name, Keypair::generate(), Keypair::generate(), port, true)
            }
        };

        let mut state = MeshState::new(
            name.clone(),
            params.appname,
            params.devclass,
            private_key,
            invitation_key,
            store,
        );
        state.myport = port;

        {
            let self_id = state.self_id;
            state.node_mut(self_id).options |= OPTION_PMTU_DISCOVERY;
        }

        if fresh {
            if let Some(store) = &state.store {
                store.init("current")?;
                store.main_write(
                    "current",
                    &MainConfig {
                        name: name.clone(),
                        private_key: state.private_key.clone(),
                        invitation_key: state.invitation_key.clone(),
                        port,
                    },
                )?;
            }

            let self_id = state.self_id;
            state.node_mut(self_id).dirty = true;
            crate::net::write_node_config(&mut state, self_id);
        } else {
            load_all_nodes(&mut state);
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(MeshInner {
            state: RwLock::new(state),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            callbacks: Callbacks::default(),
            tasks: Mutex::new(Vec::new()),
        });

        inner.state.write().worker_handle = Arc::downgrade(&inner);

        debug!(name = %name, "mesh opened");
        Ok(Mesh { inner })
    }

    /// Bind the listen sockets and start the worker, timers, and local
    /// discovery.
    pub async fn start(&self) -> Result<()> {
        let (port, discovery) = {
            let state = self.inner.state.read();

            if state.running {
                return Ok(());
            }

            (state.myport, state.discovery_enabled)
        };

        let (listeners, bound_port) = bind_listen_sockets(port).await?;

        {
            let mut state = self.inner.state.write();
            state.running = true;

            if state.myport != bound_port {
                state.myport = bound_port;

                if let Some(store) = &state.store {
                    let _ = store.main_write(
                        "current",
                        &MainConfig {
                            name: state.name.clone(),
                            private_key: state.private_key.clone(),
                            invitation_key: state.invitation_key.clone(),
                            port: bound_port,
                        },
                    );
                }
            }
        }

        let mut tasks = Vec::new();

        // Accept and receive tasks per bound address.
        for (idx, (tcp, udp, local)) in listeners.into_iter().enumerate() {
            let udp = Arc::new(udp);

            self.inner.state.write().listen.push(ListenSocket {
                udp: udp.clone(),
                local,
            });

            let tx = self.inner.event_tx.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    match tcp.accept().await {
                        Ok((stream, from)) => {
                            if tx.send(Event::Accepted { stream, from }).is_err() {
                                return;
                            }
                        }
                        Err(_) => tokio::time::sleep(Duration::from_millis(100)).await,
                    }
                }
            }));

            let tx = self.inner.event_tx.clone();
            tasks.push(tokio::spawn(async move {
                let mut buf = [0u8; 2048];

                loop {
                    match udp.recv_from(&mut buf).await {
                        Ok((n, from)) => {
                            let event = Event::Udp {
                                sock: idx,
                                from,
                                data: buf[..n].to_vec(),
                            };

                            if tx.send(event).is_err() {
                                return;
                            }
                        }
                        Err(_) => tokio::time::sleep(Duration::from_millis(100)).await,
                    }
                }
            }));
        }

        // Timers.
        let tx = self.inner.event_tx.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));

            loop {
                ticker.tick().await;

                if tx.send(Event::PingTick).is_err() {
                    return;
                }
            }
        }));

        let tx = self.inner.event_tx.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));

            loop {
                ticker.tick().await;

                if tx.send(Event::PeriodicTick).is_err() {
                    return;
                }
            }
        }));

        if discovery {
            let inner = self.inner.clone();
            tasks.push(tokio::spawn(crate::discovery::run_discovery(inner)));
        }

        // The worker itself; it hands the receiver back when it stops so
        // the mesh can be started again.
        let rx = self
            .inner
            .event_rx
            .lock()
            .take()
            .ok_or(Error::Internal)?;
        let worker_inner = self.inner.clone();
        tokio::spawn(async move {
            let rx = crate::net::run_worker(worker_inner.clone(), rx).await;
            *worker_inner.event_rx.lock() = Some(rx);
        });

        self.inner.tasks.lock().extend(tasks);

        info!(port = bound_port, "mesh started");
        Ok(())
    }

    /// Stop all network activity. The instance can be started again.
    pub async fn stop(&self) {
        {
            let mut state = self.inner.state.write();

            if !state.running {
                return;
            }

            state.running = false;
            state.outgoings.clear();

            for cid in state.conn_ids() {
                crate::net::terminate_connection(&mut state, cid, false);
            }

            state.listen.clear();
        }

        let _ = self.inner.event_tx.send(Event::Stop);

        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }

        // Give the worker a moment to hand its receiver back.
        for _ in 0..50 {
            if self.inner.event_rx.lock().is_some() {
                break;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        info!("mesh stopped");
    }

    /// Queue an application datagram for a destination node.
    pub fn send(&self, to: &str, data: &[u8]) -> Result<()> {
        let state = self.inner.state.read();

        if !state.running {
            return Err(Error::Inval);
        }

        if data.len() > crate::net::MTU as usize - crate::route::HEADER_SIZE {
            return Err(Error::Inval);
        }

        let Some(id) = state.lookup_node(to) else {
            return Err(Error::Noent);
        };

        if state.node(id).blacklisted {
            return Err(Error::Blacklisted);
        }

        let packet = crate::route::build_packet(to, &state.name, data).ok_or(Error::Inval)?;
        drop(state);

        self.inner
            .event_tx
            .send(Event::AppSend { packet })
            .map_err(|_| Error::Internal)
    }

    pub fn get_name(&self) -> String {
        self.inner.state.read().name.clone()
    }

    pub fn get_port(&self) -> u16 {
        self.inner.state.read().myport
    }

    pub fn get_node(&self, name: &str) -> Option<NodeInfo> {
        let state = self.inner.state.read();
        let id = state.lookup_node(name)?;
        Some(NodeInfo::from_node(state.node(id)))
    }

    pub fn get_self(&self) -> NodeInfo {
        let state = self.inner.state.read();
        NodeInfo::from_node(state.self_node())
    }

    pub fn get_all_nodes(&self) -> Vec<NodeInfo> {
        let state = self.inner.state.read();
        let mut nodes: Vec<NodeInfo> = state
            .node_ids()
            .into_iter()
            .map(|id| NodeInfo::from_node(state.node(id)))
            .collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        nodes
    }

    /// Export our identity as a blob another node can import.
    pub fn export(&self) -> Result<String> {
        let state = self.inner.state.read();

        let mut config = HostConfig::from_node(state.self_node());

        // Make sure the canonical address carries a port.
        if let Some(canonical) = &config.canonical_address {
            if !canonical.contains(' ') {
                config.canonical_address = Some(format!("{} {}", canonical, state.myport));
            }
        }

        config.last_reachable = 0;
        config.last_unreachable = 0;

        let blob = config.encode();

        let mut w = Writer::new();
        w.add_array(1);
        w.add_bin(&blob);

        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        use base64::Engine;
        Ok(URL_SAFE_NO_PAD.encode(w.into_vec()))
    }

    /// Import a blob produced by another node's [`Mesh::export`].
    pub fn import(&self, data: &str) -> Result<()> {
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        use base64::Engine;

        let blob = URL_SAFE_NO_PAD
            .decode(data.trim_end_matches('='))
            .map_err(|_| Error::Peer)?;

        let mut state = self.inner.state.write();
        let mut r = Reader::new(&blob);
        let count = r.get_array().map_err(|_| Error::Peer)?;

        if count == 0 {
            return Err(Error::Peer);
        }

        for _ in 0..count {
            let data = r.get_bin().map_err(|_| Error::Peer)?;
            let config = HostConfig::decode(data).map_err(|_| Error::Peer)?;

            if let Some(id) = state.lookup_node(&config.name) {
                if state.node(id).public_key.is_some() {
                    return Err(Error::Exist);
                }

                config.apply(state.node_mut(id));
                state.node_mut(id).dirty = true;
                crate::net::write_node_config(&mut state, id);
                continue;
            }

            let mut node = Node::new(config.name.clone());
            config.apply(&mut node);
            node.dirty = true;

            if let Some(s) = &node.submesh {
                state.submeshes.insert(s.clone());
            }

            let id = state.node_add(node);
            crate::net::write_node_config(&mut state, id);
        }

        Ok(())
    }

    /// Create an invitation URL for a new node.
    pub fn invite(&self, submesh: Option<&str>, name: &str) -> Result<String> {
        let mut state = self.inner.state.write();
        crate::invitation::invite(&mut state, submesh, name)
    }

    /// Join a mesh using an invitation URL. Must be called before
    /// [`Mesh::start`].
    pub async fn join(&self, url: &str) -> Result<()> {
        crate::invitation::join_mesh(&self.inner, url).await
    }

    /// Create a named submesh partition.
    pub fn create_submesh(&self, name: &str) -> Result<()> {
        if !check_id(name) || name == crate::submesh::CORE_MESH {
            return Err(Error::Inval);
        }

        let mut state = self.inner.state.write();

        if !state.submeshes.insert(name.to_string()) {
            return Err(Error::Exist);
        }

        Ok(())
    }

    /// Blacklist a node: drop its traffic and never connect to it.
    pub fn blacklist(&self, name: &str) -> Result<()> {
        let mut state = self.inner.state.write();
        let id = state.lookup_node(name).ok_or(Error::Noent)?;

        if id == state.self_id {
            return Err(Error::Inval);
        }

        if state.node(id).blacklisted {
            return Ok(());
        }

        let node = state.node_mut(id);
        node.blacklisted = true;
        node.dirty = true;

        let connection = state.node(id).connection;

        if let Some(cid) = connection {
            crate::net::terminate_connection(&mut state, cid, true);
        }

        state.outgoings.remove(name);
        state.node_mut(id).reset_session();
        state.update_node_udp(id, None);
        crate::net::write_node_config(&mut state, id);
        info!(name, "blacklisted");
        Ok(())
    }

    /// Remove a node from the blacklist.
    pub fn whitelist(&self, name: &str) -> Result<()> {
        let mut state = self.inner.state.write();
        let id = state.lookup_node(name).ok_or(Error::Noent)?;

        if id == state.self_id {
            return Err(Error::Inval);
        }

        let node = state.node_mut(id);

        if node.blacklisted {
            node.blacklisted = false;
            node.dirty = true;
            crate::net::write_node_config(&mut state, id);
        }

        Ok(())
    }

    /// Forget everything about an unreachable node.
    pub fn forget_node(&self, name: &str) -> Result<()> {
        let mut state = self.inner.state.write();
        let id = state.lookup_node(name).ok_or(Error::Noent)?;

        if id == state.self_id {
            return Err(Error::Inval);
        }

        if state.node(id).reachable || state.node(id).connection.is_some() {
            return Err(Error::Busy);
        }

        if let Some(store) = &state.store {
            store.host_delete("current", name)?;
        }

        state.node_remove(id);
        Ok(())
    }

    /// Set a node's canonical address, used as the first candidate when
    /// connecting.
    pub fn set_canonical_address(&self, name: &str, host: &str, port: Option<u16>) -> Result<()> {
        if host.is_empty() || host.contains(' ') {
            return Err(Error::Inval);
        }

        let mut state = self.inner.state.write();
        let id = state.lookup_node(name).ok_or(Error::Noent)?;

        let canonical = match port {
            Some(port) => format!("{} {}", host, port),
            None => host.to_string(),
        };

        let node = state.node_mut(id);
        node.canonical_address = Some(canonical);
        node.dirty = true;
        crate::net::write_node_config(&mut state, id);
        Ok(())
    }

    /// Re-encrypt the persistent store under a new key.
    pub fn encrypted_key_rotate(&self, new_key: &[u8]) -> Result<()> {
        if new_key.is_empty() {
            return Err(Error::Inval);
        }

        let mut derived = [0u8; 32];
        lib_crypto::prf(new_key, b"MeshLink configuration key", &mut derived);

        let mut state = self.inner.state.write();
        let store = state.store.as_mut().ok_or(Error::Inval)?;
        store.rotate_key(Some(derived))
    }

    /// Roll the keys of every established end-to-end session, flooding a
    /// KEY_CHANGED notice through the mesh.
    pub fn force_rekey(&self) -> Result<()> {
        if !self.inner.state.read().running {
            return Err(Error::Inval);
        }

        self.inner
            .event_tx
            .send(Event::ForceRekey)
            .map_err(|_| Error::Internal)
    }

    /// Enable or disable local discovery; effective at the next start.
    pub fn enable_discovery(&self, enable: bool) {
        self.inner.state.write().discovery_enabled = enable;
    }

    /// Whether the inviter commits the invitee's identity before sending
    /// the invitation contents.
    pub fn set_inviter_commits_first(&self, commits_first: bool) {
        self.inner.state.write().inviter_commits_first = commits_first;
    }

    pub fn set_receive_cb(&self, cb: impl Fn(&str, &[u8]) + Send + Sync + 'static) {
        *self.inner.callbacks.receive.lock() = Some(Box::new(cb));
    }

    pub fn set_node_status_cb(&self, cb: impl Fn(&str, bool) + Send + Sync + 'static) {
        *self.inner.callbacks.node_status.lock() = Some(Box::new(cb));
    }

    pub fn set_node_duplicate_cb(&self, cb: impl Fn(&str) + Send + Sync + 'static) {
        *self.inner.callbacks.node_duplicate.lock() = Some(Box::new(cb));
    }

    pub fn set_connection_try_cb(&self, cb: impl Fn(&str) + Send + Sync + 'static) {
        *self.inner.callbacks.connection_try.lock() = Some(Box::new(cb));
    }

    pub fn set_error_cb(&self, cb: impl Fn(Error) + Send + Sync + 'static) {
        *self.inner.callbacks.error.lock() = Some(Box::new(cb));
    }
}

/// Load every node from the host config directory.
fn load_all_nodes(state: &mut MeshState) {
    let names = match &state.store {
        Some(store) => store.scan_hosts("current"),
        None => return,
    };

    for name in names {
        if !check_id(&name) {
            continue;
        }

        let blob = match state.store.as_ref().expect("store checked").host_read("current", &name) {
            Ok(blob) => blob,
            Err(_) => {
                warn!(name, "could not read host config");
                continue;
            }
        };

        let config = match HostConfig::decode(&blob) {
            Ok(config) => config,
            Err(_) => {
                warn!(name, "invalid host config");
                continue;
            }
        };

        if let Some(s) = &config.submesh {
            state.submeshes.insert(s.clone());
        }

        if name == state.name {
            let self_id = state.self_id;
            let devclass = state.devclass;
            config.apply(state.node_mut(self_id));
            // Our own device class comes from the caller, not the store.
            state.node_mut(self_id).devclass = devclass;
            continue;
        }

        if state.lookup_node(&name).is_some() {
            continue;
        }

        let mut node = Node::new(name);
        config.apply(&mut node);
        state.node_add(node);
    }
}

/// Probe for a free port: up to 1000 random candidates in
/// `0x1000..0x8000` that bind for both TCP and UDP, else 0 to let the
/// kernel pick at start.
fn check_port() -> u16 {
    for _ in 0..1000 {
        let port = rand::thread_rng().gen_range(0x1000..0x8000u16);

        if try_bind(port) {
            return port;
        }
    }

    warn!("could not find an available port, falling back to a random one");
    0
}

fn try_bind(port: u16) -> bool {
    let tcp = std::net::TcpListener::bind((Ipv4Addr::UNSPECIFIED, port));
    let udp = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port));
    tcp.is_ok() && udp.is_ok()
}

fn make_udp_socket(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let sock = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_nonblocking(true)?;
    sock.set_reuse_address(true)?;

    if addr.is_ipv4() {
        sock.set_broadcast(true)?;
    } else {
        sock.set_only_v6(true)?;
    }

    sock.bind(&addr.into())?;
    UdpSocket::from_std(sock.into())
}

type BoundListener = (TcpListener, UdpSocket, SocketAddr);

/// Bind TCP and UDP on the same port, for IPv4 and (best effort) IPv6.
/// With port 0, let the kernel pick a TCP port and require that UDP can
/// bind to the same one.
async fn bind_listen_sockets(port: u16) -> Result<(Vec<BoundListener>, u16)> {
    let mut listeners = Vec::new();
    let mut bound_port = port;

    for attempt in 0..10 {
        let v4_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, bound_port));

        let tcp = match TcpListener::bind(v4_addr).await {
            Ok(tcp) => tcp,
            Err(e) => {
                error!(error = %e, "could not bind TCP listen socket");
                return Err(Error::Network);
            }
        };

        let actual = tcp.local_addr().map_err(|_| Error::Network)?.port();

        match make_udp_socket(SocketAddr::from((Ipv4Addr::UNSPECIFIED, actual))) {
            Ok(udp) => {
                bound_port = actual;
                listeners.push((tcp, udp, SocketAddr::from((Ipv4Addr::UNSPECIFIED, actual))));
                break;
            }
            Err(_) if port == 0 && attempt < 9 => continue,
            Err(e) => {
                error!(error = %e, "could not bind UDP listen socket");
                return Err(Error::Network);
            }
        }
    }

    if listeners.is_empty() {
        return Err(Error::Network);
    }

    // IPv6 is best effort on the same port.
    let v6_addr = SocketAddr::from((Ipv6Addr::UNSPECIFIED, bound_port));

    if let Ok(tcp6) = TcpListener::bind(v6_addr).await {
        if let Ok(udp6) = make_udp_socket(v6_addr) {
            listeners.push((tcp6, udp6, v6_addr));
        }
    }

    Ok((listeners, bound_port))
}

impl Drop for Mesh {
    fn drop(&mut self) {
        // Stop the worker and helpers; sockets close with their tasks.
        let _ = self.inner.event_tx.send(Event::Stop);

        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
