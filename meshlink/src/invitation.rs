//! The invitation protocol
//!
//! A one-shot out-of-band bootstrap: the inviter mints a random cookie,
//! stores an invitation file named by a hash that does not reveal the
//! cookie, and hands out a URL `host:port,...,host:port/HASH24COOKIE24`.
//! The invitee connects with a throwaway key, verifies the inviter's
//! invitation key against the URL hash, and runs an SPTPS exchange in
//! which the cookie buys it the invitation file: its assigned name,
//! submesh, device class hint and seed host configs. The file is consumed
//! atomically, so a URL can only ever be used once.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use lib_crypto::{ct_eq, sha512, Keypair, PublicKey};
use lib_packmsg::{Reader, Writer};

use crate::conf::{HostConfig, MainConfig, INVITATION_VERSION};
use crate::connection::WriterCmd;
use crate::error::{Error, Result};
use crate::mesh::MeshInner;
use crate::node::{ConnId, DevClass, Node, NodeId};
use crate::protocol::auth::INVITATION_LABEL;
use crate::protocol::{check_id, PROT_MAJOR, PROT_MINOR};
use crate::sptps::{Sptps, SptpsEvent};
use crate::state::MeshState;
use crate::submesh::CORE_MESH;

/// Cookie length, raw bytes; 24 characters in base64url.
const COOKIE_SIZE: usize = 18;

/// Per-send and per-receive socket deadline during the join exchange.
const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for connecting to one invitation address.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

fn b64url(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

fn b64url_decode(s: &str) -> Option<Vec<u8>> {
    URL_SAFE_NO_PAD.decode(s.trim_end_matches('=')).ok()
}

/// Derive the on-disk invitation file name from a cookie and the
/// inviter's invitation public key.
fn cookie_filename(cookie: &[u8], invitation_key: &PublicKey) -> String {
    let fingerprint = invitation_key.to_base64();
    let mut buf = Vec::with_capacity(COOKIE_SIZE + fingerprint.len());
    buf.extend_from_slice(&cookie[..COOKIE_SIZE]);
    buf.extend_from_slice(fingerprint.as_bytes());
    b64url(&sha512(&buf)[..COOKIE_SIZE])
}

// Inviter side

/// Create an invitation for a new node and return its URL.
pub(crate) fn invite(
    state: &mut MeshState,
    submesh: Option<&str>,
    name: &str,
) -> Result<String> {
    if !check_id(name) {
        error!(name, "invalid name for invitation");
        return Err(Error::Inval);
    }

    let submesh = match submesh {
        Some(s) => {
            if !state.submeshes.contains(s) {
                error!(submesh = s, "invalid submesh for invitation");
                return Err(Error::Inval);
            }

            Some(s.to_string())
        }
        None => state.self_node().submesh.clone(),
    };

    if state.store.is_none() {
        return Err(Error::Inval);
    }

    if state
        .store
        .as_ref()
        .map(|s| s.host_exists("current", name))
        .unwrap_or(false)
        || state.lookup_node(name).is_some()
    {
        error!(name, "a node with this name is already known");
        return Err(Error::Exist);
    }

    let hostport = my_invitation_address(state)?;

    // Hash of the invitation public key, and a fresh cookie.
    let fingerprint = state.invitation_key.public().to_base64();
    let keyhash = b64url(&sha512(fingerprint.as_bytes())[..COOKIE_SIZE]);

    let mut cookie = [0u8; COOKIE_SIZE];
    lib_crypto::randomize(&mut cookie);
    let filename = cookie_filename(&cookie, &state.invitation_key.public());

    // The invitation file: assigned identity plus seed host configs,
    // starting with our own.
    let self_config = HostConfig::from_node(state.self_node()).encode();

    let mut w = Writer::new();
    w.add_u32(INVITATION_VERSION);
    w.add_str(name);
    w.add_str(submesh.as_deref().unwrap_or(CORE_MESH));
    w.add_i32(DevClass::Unknown as i32);
    w.add_array(1);
    w.add_bin(&self_config);

    state
        .store
        .as_ref()
        .expect("checked above")
        .invitation_write(&filename, &w.into_vec())?;

    let url = format!("{}/{}{}", hostport, keyhash, b64url(&cookie));
    info!(name, "created invitation");
    Ok(url)
}

/// The address part of an invitation URL: our canonical address if set,
/// else whatever local addresses we can find.
fn my_invitation_address(state: &mut MeshState) -> Result<String> {
    let port = state.myport;
    let mut hosts: Vec<String> = Vec::new();

    if let Some(canonical) = state.self_node().canonical_address.clone() {
        if let Some((host, canonical_port)) = canonical.rsplit_once(' ') {
            let host_entry = if host.contains(':') {
                format!("[{}]:{}", host, canonical_port)
            } else {
                format!("{}:{}", host, canonical_port)
            };
            hosts.push(host_entry);

            // Remember what the canonical name currently resolves to.
            if let Ok(canonical_port) = canonical_port.parse::<u16>() {
                if let Ok(addrs) =
                    crate::adns::resolve_blocking(host, canonical_port, Duration::from_secs(5))
                {
                    let self_id = state.self_id;

                    for addr in addrs {
                        state.node_mut(self_id).add_recent_address(addr);
                    }
                }
            }
        }
    }

    if let Ok(ip) = local_ip_address::local_ip() {
        if !ip.is_loopback() {
            let entry = match ip {
                std::net::IpAddr::V4(v4) => format!("{}:{}", v4, port),
                std::net::IpAddr::V6(v6) => format!("[{}]:{}", v6, port),
            };

            if !hosts.contains(&entry) {
                hosts.push(entry);
            }
        }
    }

    if hosts.is_empty() {
        error!("no address known for ourselves");
        return Err(Error::Resolv);
    }

    Ok(hosts.join(","))
}

/// Persist an invited node once its long-term key is known.
fn persist_invitee(
    state: &mut MeshState,
    name: &str,
    submesh: Option<String>,
    pubkey: PublicKey,
) -> bool {
    if state
        .store
        .as_ref()
        .map(|s| s.host_exists("current", name))
        .unwrap_or(false)
    {
        error!(name, "host config for invited node already exists");
        return false;
    }

    let id = match state.lookup_node(name) {
        Some(id) => id,
        None => {
            let mut node = Node::new(name.to_string());
            node.blacklisted = state.default_blacklist;
            state.node_add(node)
        }
    };

    {
        let node = state.node_mut(id);
        node.submesh = submesh.clone();
        node.public_key = Some(pubkey);
        node.dirty = true;
    }

    if let Some(s) = submesh {
        state.submeshes.insert(s);
    }

    crate::net::write_node_config(state, id);
    info!(name, "key received from invited node");
    true
}

/// Handle one SPTPS record on an invitation connection. Returns false
/// when the exchange is broken and the connection must be dropped.
pub(crate) fn invitation_record(
    state: &mut MeshState,
    cid: ConnId,
    rtype: u8,
    payload: &[u8],
) -> bool {
    let used = state
        .conn(cid)
        .map(|c| c.status.invitation_used)
        .unwrap_or(false);

    match (rtype, used) {
        (0, false) => serve_invitation(state, cid, payload),
        (1, true) => {
            // The invitee's long-term public key closes the exchange.
            let Ok(pubkey) = PublicKey::from_bytes(payload) else {
                error!("received invalid key from invited node");
                return false;
            };

            let (name, submesh) = {
                let Some(conn) = state.conn(cid) else { return false };
                (conn.name.clone(), conn.invitation_submesh.clone())
            };

            let Some(name) = name else { return false };

            if !persist_invitee(state, &name, submesh, pubkey) {
                return false;
            }

            if let Some(conn) = state.conn(cid) {
                let _ = conn.writer.send(WriterCmd::Shutdown);
            }

            true
        }
        _ => false,
    }
}

/// Look up and consume the invitation file named by the cookie, then
/// stream its contents back to the invitee.
fn serve_invitation(state: &mut MeshState, cid: ConnId, payload: &[u8]) -> bool {
    // An 18-byte cookie, optionally followed by the invitee's long-term
    // public key when the inviter commits first.
    if payload.len() != COOKIE_SIZE && payload.len() != COOKIE_SIZE + 32 {
        return false;
    }

    let filename = cookie_filename(payload, &state.invitation_key.public());
    let timeout = state.invitation_timeout;

    let Some(store) = &state.store else {
        return false;
    };

    let blob = match store.invitation_consume(&filename, timeout) {
        Ok(blob) => blob,
        Err(_) => {
            error!(cookie = %filename, "peer tried to use an invalid or expired invitation");
            return false;
        }
    };

    // Pull the assigned name and submesh out of the invitation.
    let mut r = Reader::new(&blob);

    let header = (|| {
        let version = r.get_u32().ok()?;

        if version != INVITATION_VERSION {
            return None;
        }

        let name = r.get_str().ok()?.to_string();
        let submesh = r.get_str().ok()?.to_string();
        Some((name, submesh))
    })();

    let Some((name, submesh_name)) = header else {
        error!(cookie = %filename, "invalid invitation file");
        return false;
    };

    if !check_id(&name) {
        error!(cookie = %filename, "invalid invitation file");
        return false;
    }

    let submesh = if submesh_name == CORE_MESH {
        None
    } else if check_id(&submesh_name) {
        Some(submesh_name)
    } else {
        error!(cookie = %filename, "invalid invitation file");
        return false;
    };

    {
        let Some(conn) = state.conn_mut(cid) else { return false };
        conn.name = Some(name.clone());
        conn.invitation_submesh = submesh.clone();
        conn.status.invitation_used = true;
    }

    // Inviter-commits-first: the cookie already carries the invitee's
    // long-term key, so persist it before handing over the file.
    if payload.len() == COOKIE_SIZE + 32 {
        let Ok(pubkey) = PublicKey::from_bytes(&payload[COOKIE_SIZE..]) else {
            return false;
        };

        if !persist_invitee(state, &name, submesh, pubkey) {
            return false;
        }
    }

    // Stream the invitation file, then the empty terminator record.
    let mut packets = Vec::new();

    {
        let Some(conn) = state.conn_mut(cid) else { return false };
        let Some(sptps) = conn.sptps.as_mut() else { return false };

        for chunk in blob.chunks(1024) {
            match sptps.send_record(0, chunk) {
                Ok(pkt) => packets.push(pkt),
                Err(_) => return false,
            }
        }

        match sptps.send_record(1, &[]) {
            Ok(pkt) => packets.push(pkt),
            Err(_) => return false,
        }
    }

    if let Some(conn) = state.conn(cid) {
        for pkt in packets {
            conn.send_raw(pkt.wire);
        }
    }

    info!(name = %name, "invitation successfully sent");
    true
}

// Invitee side

struct JoinTarget {
    host: String,
    port: u16,
}

/// Split an invitation URL into its address list, key hash and cookie.
fn parse_invitation_url(url: &str) -> Option<(Vec<JoinTarget>, Vec<u8>, Vec<u8>)> {
    let (addresses, secret) = url.split_once('/')?;

    if secret.len() != 48 {
        return None;
    }

    let hash = b64url_decode(&secret[..24])?;
    let cookie = b64url_decode(&secret[24..])?;

    if hash.len() != COOKIE_SIZE || cookie.len() != COOKIE_SIZE {
        return None;
    }

    let mut targets = Vec::new();

    for part in addresses.split(',') {
        let (host, port) = if let Some(rest) = part.strip_prefix('[') {
            // Bracketed IPv6 address.
            let (host, rest) = rest.split_once(']')?;
            (host, rest.strip_prefix(':')?)
        } else {
            part.rsplit_once(':')?
        };

        targets.push(JoinTarget {
            host: host.to_string(),
            port: port.parse().ok()?,
        });
    }

    if targets.is_empty() {
        return None;
    }

    Some((targets, hash, cookie))
}

/// Line-buffered reads for the plaintext greeting phase.
struct LineReader {
    buf: Vec<u8>,
}

impl LineReader {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    async fn read_line(&mut self, sock: &mut TcpStream) -> Result<String> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                return String::from_utf8(line[..line.len() - 1].to_vec())
                    .map_err(|_| Error::Peer);
            }

            if self.buf.len() > 4096 {
                return Err(Error::Peer);
            }

            let mut chunk = [0u8; 1024];
            let n = tokio::time::timeout(IO_TIMEOUT, sock.read(&mut chunk))
                .await
                .map_err(|_| Error::Network)?
                .map_err(|_| Error::Network)?;

            if n == 0 {
                return Err(Error::Network);
            }

            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

async fn send_all(sock: &mut TcpStream, data: &[u8]) -> Result<()> {
    tokio::time::timeout(IO_TIMEOUT, sock.write_all(data))
        .await
        .map_err(|_| Error::Network)?
        .map_err(|_| Error::Network)
}

/// Use an invitation URL to join a mesh.
pub(crate) async fn join_mesh(inner: &Arc<MeshInner>, url: &str) -> Result<()> {
    let (targets, hash, cookie) = parse_invitation_url(url).ok_or_else(|| {
        error!("invalid invitation URL");
        Error::Inval
    })?;

    let (appname, commits_first) = {
        let state = inner.state.read();

        if state.running {
            error!("cannot join while started");
            return Err(Error::Inval);
        }

        if state.node_count() > 1 {
            error!("already part of an existing mesh");
            return Err(Error::Inval);
        }

        if state.store.is_none() {
            return Err(Error::Inval);
        }

        (state.appname.clone(), state.inviter_commits_first)
    };

    // Connect to the first inviter address that accepts.
    let mut sock = None;

    for target in &targets {
        let Ok(addrs) =
            crate::adns::resolve(&target.host, target.port, CONNECT_TIMEOUT).await
        else {
            continue;
        };

        for addr in addrs {
            match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    debug!(address = %addr, "connected to inviter");
                    sock = Some((stream, addr));
                    break;
                }
                _ => continue,
            }
        }

        if sock.is_some() {
            break;
        }
    }

    let Some((mut sock, peer_addr)) = sock else {
        error!("could not connect to any inviter address");
        return Err(Error::Network);
    };

    // Greet with a throwaway key.
    let throwaway = Keypair::generate();
    let greeting = format!(
        "0 ?{} {}.{} {}\n",
        throwaway.public().to_base64(),
        PROT_MAJOR,
        PROT_MINOR,
        appname
    );
    send_all(&mut sock, greeting.as_bytes()).await?;

    let mut lines = LineReader::new();

    // Expect the inviter's ID followed by an ACK with its invitation key.
    let id_line = lines.read_line(&mut sock).await?;
    let mut id_fields = id_line.split(' ');
    let code = id_fields.next().and_then(|f| f.parse::<i32>().ok());
    let his_name = id_fields.next().unwrap_or("");
    let his_version = id_fields.next().unwrap_or("");
    let his_major = his_version
        .split('.')
        .next()
        .and_then(|v| v.parse::<u32>().ok());

    if code != Some(0) || !check_id(his_name) || his_major != Some(PROT_MAJOR) {
        error!("cannot read greeting from peer");
        return Err(Error::Network);
    }

    let ack_line = lines.read_line(&mut sock).await?;
    let fingerprint = match ack_line.split_once(' ') {
        Some(("4", fingerprint)) => fingerprint.to_string(),
        _ => {
            error!("cannot read greeting from peer");
            return Err(Error::Network);
        }
    };

    // The URL pins the inviter's invitation key.
    if !ct_eq(&sha512(fingerprint.as_bytes())[..COOKIE_SIZE], &hash) {
        error!("peer has an invalid key");
        return Err(Error::Peer);
    }

    let his_key = PublicKey::from_base64(&fingerprint).map_err(|_| Error::Peer)?;

    let (mut session, kex) = Sptps::new(true, false, throwaway, his_key, INVITATION_LABEL)
        .map_err(|_| Error::Internal)?;
    send_all(&mut sock, &kex.wire).await?;

    // Drive the exchange to completion.
    let mut contents: Vec<u8> = Vec::new();
    let mut success = false;
    let mut pending = std::mem::take(&mut lines.buf);

    'exchange: loop {
        if !pending.is_empty() {
            let output = session.receive_data(&pending).map_err(|_| Error::Peer)?;
            pending.clear();

            for pkt in output.packets {
                send_all(&mut sock, &pkt.wire).await?;
            }

            for event in output.events {
                match event {
                    SptpsEvent::HandshakeDone => {
                        // The tunnel is up; spend the cookie.
                        let mut record = cookie.clone();

                        if commits_first {
                            let key = {
                                let state = inner.state.read();
                                *state.private_key.public().as_bytes()
                            };
                            record.extend_from_slice(&key);
                        }

                        let pkt = session.send_record(0, &record).map_err(|_| Error::Peer)?;
                        send_all(&mut sock, &pkt.wire).await?;
                    }
                    SptpsEvent::Record { rtype: 0, payload } => {
                        contents.extend_from_slice(&payload);
                    }
                    SptpsEvent::Record { rtype: 1, .. } => {
                        // Terminator: the whole invitation file has
                        // arrived.
                        finalize_join(inner, &contents, peer_addr)?;

                        if !commits_first {
                            let key = {
                                let state = inner.state.read();
                                *state.private_key.public().as_bytes()
                            };
                            let pkt =
                                session.send_record(1, &key).map_err(|_| Error::Peer)?;
                            send_all(&mut sock, &pkt.wire).await?;
                        }

                        success = true;
                        let _ = sock.shutdown().await;
                        break 'exchange;
                    }
                    SptpsEvent::Record { .. } => {
                        return Err(Error::Peer);
                    }
                }
            }
        }

        let mut chunk = [0u8; 4096];
        let n = tokio::time::timeout(IO_TIMEOUT, sock.read(&mut chunk))
            .await
            .map_err(|_| Error::Network)?
            .map_err(|_| Error::Network)?;

        if n == 0 {
            break;
        }

        pending = chunk[..n].to_vec();
    }

    if !success {
        warn!("connection closed by peer, invitation cancelled");
        return Err(Error::Peer);
    }

    info!("invitation successfully accepted");
    Ok(())
}

/// Install the invitation file contents: our new identity and the seed
/// host configs.
fn finalize_join(inner: &Arc<MeshInner>, blob: &[u8], peer_addr: SocketAddr) -> Result<()> {
    let mut state = inner.state.write();

    let mut r = Reader::new(blob);

    let version = r.get_u32().map_err(|_| Error::Peer)?;

    if version != INVITATION_VERSION {
        error!("invalid invitation version");
        return Err(Error::Peer);
    }

    let name = r.get_str().map_err(|_| Error::Peer)?.to_string();
    let submesh_name = r.get_str().map_err(|_| Error::Peer)?.to_string();
    let devclass = DevClass::from_i32(r.get_i32().map_err(|_| Error::Peer)?);
    let count = r.get_array().map_err(|_| Error::Peer)?;

    if !check_id(&name) {
        error!("no valid name found in invitation");
        return Err(Error::Peer);
    }

    let submesh = if submesh_name == CORE_MESH {
        None
    } else if check_id(&submesh_name) {
        Some(submesh_name)
    } else {
        error!("no valid submesh found in invitation");
        return Err(Error::Peer);
    };

    if count == 0 {
        error!("incomplete invitation file");
        return Err(Error::Peer);
    }

    // Adopt the assigned identity.
    state.rename_self(name.clone());

    {
        let devclass = match devclass {
            Some(DevClass::Unknown) | None => state.devclass,
            Some(hint) => hint,
        };
        state.devclass = devclass;
        let self_id = state.self_id;
        let node = state.node_mut(self_id);
        node.devclass = devclass;
        node.submesh = submesh.clone();
        node.dirty = true;
    }

    if let Some(s) = &submesh {
        state.submeshes.insert(s.clone());
    }

    let store = state.store.as_ref().ok_or(Error::Inval)?;
    store.init("current")?;

    let main = MainConfig {
        name: name.clone(),
        private_key: state.private_key.clone(),
        invitation_key: state.invitation_key.clone(),
        port: state.myport,
    };
    store.main_write("current", &main)?;

    // Install the seed host configs; the first one is the inviter's, so
    // remember the address we used to reach it.
    let mut first: Option<NodeId> = None;

    for i in 0..count {
        let data = r.get_bin().map_err(|_| Error::Peer)?;
        let config = HostConfig::decode(data).map_err(|_| Error::Peer)?;

        if config.name == name {
            error!("invitation would overwrite our own host config");
            return Err(Error::Peer);
        }

        let mut node = Node::new(config.name.clone());
        config.apply(&mut node);
        node.last_reachable = 0;
        node.last_unreachable = 0;
        node.dirty = true;

        if let Some(s) = &node.submesh {
            state.submeshes.insert(s.clone());
        }

        let id = state.node_add(node);

        if i == 0 {
            state.node_mut(id).add_recent_address(peer_addr);
            first = Some(id);
        }

        crate::net::write_node_config(&mut state, id);
    }

    let _ = first;

    {
        let self_id = state.self_id;
        crate::net::write_node_config(&mut state, self_id);
    }

    if let Some(store) = &state.store {
        store.sync_all("current")?;
    }

    debug!(name = %name, "configuration stored");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_invitation_url() {
        let hash = b64url(&[1u8; 18]);
        let cookie = b64url(&[2u8; 18]);
        let url = format!("example.org:655,[2001:db8::1]:656/{}{}", hash, cookie);

        let (targets, h, c) = parse_invitation_url(&url).unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].host, "example.org");
        assert_eq!(targets[0].port, 655);
        assert_eq!(targets[1].host, "2001:db8::1");
        assert_eq!(targets[1].port, 656);
        assert_eq!(h, vec![1u8; 18]);
        assert_eq!(c, vec![2u8; 18]);
    }

    #[test]
    fn test_parse_invitation_url_rejects_garbage() {
        assert!(parse_invitation_url("nohash").is_none());
        assert!(parse_invitation_url("host:655/short").is_none());
        assert!(parse_invitation_url("host/aaaaaaaaaaaaaaaaaaaaaaaabbbbbbbbbbbbbbbbbbbbbbbb").is_none());
    }

    #[test]
    fn test_cookie_filename_is_stable_and_opaque() {
        let key = Keypair::generate();
        let cookie = [7u8; COOKIE_SIZE];

        let a = cookie_filename(&cookie, &key.public());
        let b = cookie_filename(&cookie, &key.public());
        assert_eq!(a, b);
        assert_eq!(a.len(), 24);

        // The name must not reveal the cookie.
        assert_ne!(a, b64url(&cookie));

        // A different key yields a different name.
        let other = Keypair::generate();
        assert_ne!(a, cookie_filename(&cookie, &other.public()));
    }
}
