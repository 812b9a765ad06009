//! Local discovery
//!
//! Announces this node on the local network over mDNS-style multicast
//! (224.0.0.251 and ff02::fb, port 5353) and listens for announcements of
//! other members of the same mesh. A received announcement is matched to
//! a node by its key fingerprint; fresh addresses reset the node's retry
//! timers and trigger an immediate reconnection attempt.
//!
//! Interface changes are tracked by periodically rescanning the local
//! address list and joining the multicast group on anything new.

pub mod mdns;

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use crate::mesh::MeshInner;
use crate::net::Event;

const MDNS_PORT: u16 = 5353;
const MDNS_GROUP_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
const MDNS_GROUP_V6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xfb);

/// How often interfaces are rescanned and announcements repeated.
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(10);

fn multicast_socket_v4() -> std::io::Result<UdpSocket> {
    let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_reuse_address(true)?;
    sock.set_nonblocking(true)?;
    sock.set_multicast_loop_v4(true)?;
    sock.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, MDNS_PORT)).into())?;
    UdpSocket::from_std(sock.into())
}

fn multicast_socket_v6() -> std::io::Result<UdpSocket> {
    let sock = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_reuse_address(true)?;
    sock.set_only_v6(true)?;
    sock.set_nonblocking(true)?;
    sock.set_multicast_loop_v6(true)?;
    sock.bind(&SocketAddr::from((Ipv6Addr::UNSPECIFIED, MDNS_PORT)).into())?;
    UdpSocket::from_std(sock.into())
}

struct Announcer {
    name: String,
    appname: String,
    port: u16,
    fingerprint: String,
}

impl Announcer {
    fn response(&self) -> Option<Vec<u8>> {
        mdns::prepare_response(
            &self.name,
            &self.appname,
            "tcp",
            self.port,
            &[("name", &self.name), ("fingerprint", &self.fingerprint)],
        )
    }
}

/// Run local discovery until the task is aborted.
pub(crate) async fn run_discovery(inner: Arc<MeshInner>) {
    let announcer = {
        let state = inner.state.read();
        Announcer {
            name: state.name.clone(),
            appname: state.appname.clone(),
            port: state.myport,
            fingerprint: state.private_key.public().to_base64(),
        }
    };

    let sock4 = match multicast_socket_v4() {
        Ok(sock) => Arc::new(sock),
        Err(e) => {
            warn!(error = %e, "could not open IPv4 discovery socket");
            return;
        }
    };

    let sock6 = multicast_socket_v6().map(Arc::new).ok();

    if let Some(sock6) = &sock6 {
        if let Err(e) = sock6.join_multicast_v6(&MDNS_GROUP_V6, 0) {
            debug!(error = %e, "could not join IPv6 multicast group");
        }
    }

    let mut joined: HashSet<Ipv4Addr> = HashSet::new();
    let mut ticker = tokio::time::interval(ANNOUNCE_INTERVAL);
    let mut buf4 = [0u8; 2048];
    let mut buf6 = [0u8; 2048];

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                rejoin_interfaces(&sock4, &mut joined);
                announce(&announcer, &sock4, sock6.as_deref()).await;
            }
            result = sock4.recv_from(&mut buf4) => {
                if let Ok((len, from)) = result {
                    handle_packet(&inner, &announcer, &sock4, &buf4[..len], from).await;
                }
            }
            result = recv_v6(sock6.as_deref(), &mut buf6) => {
                if let Some(Ok((len, from))) = result {
                    if let Some(sock6) = &sock6 {
                        handle_packet(&inner, &announcer, sock6, &buf6[..len], from).await;
                    }
                }
            }
        }
    }
}

async fn recv_v6(
    sock: Option<&UdpSocket>,
    buf: &mut [u8],
) -> Option<std::io::Result<(usize, SocketAddr)>> {
    match sock {
        Some(sock) => Some(sock.recv_from(buf).await),
        None => {
            // No IPv6 socket; park this select branch forever.
            std::future::pending::<()>().await;
            unreachable!()
        }
    }
}

/// Join the multicast group on any interface address we have not seen
/// yet. Rescanning doubles as interface change tracking.
fn rejoin_interfaces(sock4: &UdpSocket, joined: &mut HashSet<Ipv4Addr>) {
    let Ok(ifas) = local_ip_address::list_afinet_netifas() else {
        return;
    };

    for (ifname, addr) in ifas {
        let IpAddr::V4(addr) = addr else { continue };

        if addr.is_loopback() || joined.contains(&addr) {
            continue;
        }

        match sock4.join_multicast_v4(MDNS_GROUP_V4, addr) {
            Ok(()) => {
                debug!(interface = %ifname, address = %addr, "joined multicast group");
                joined.insert(addr);
            }
            Err(e) => trace!(interface = %ifname, error = %e, "could not join multicast group"),
        }
    }
}

async fn announce(announcer: &Announcer, sock4: &UdpSocket, sock6: Option<&UdpSocket>) {
    let Some(response) = announcer.response() else {
        return;
    };

    let request = mdns::prepare_request(&announcer.appname, "tcp");

    let group4 = SocketAddr::from((MDNS_GROUP_V4, MDNS_PORT));
    let _ = sock4.send_to(&response, group4).await;

    if let Some(request) = &request {
        let _ = sock4.send_to(request, group4).await;
    }

    if let Some(sock6) = sock6 {
        let group6 = SocketAddr::from((MDNS_GROUP_V6, MDNS_PORT));
        let _ = sock6.send_to(&response, group6).await;

        if let Some(request) = &request {
            let _ = sock6.send_to(request, group6).await;
        }
    }
}

async fn handle_packet(
    inner: &Arc<MeshInner>,
    announcer: &Announcer,
    sock: &UdpSocket,
    data: &[u8],
    from: SocketAddr,
) {
    // Someone is looking for members of our mesh; answer directly.
    if mdns::parse_request(data, &announcer.appname, "tcp") {
        if let Some(response) = announcer.response() {
            let _ = sock.send_to(&response, from).await;
        }

        return;
    }

    let Some((name, port, values)) =
        mdns::parse_response(data, &announcer.appname, "tcp", &["name", "fingerprint"])
    else {
        return;
    };

    let fingerprint = values.into_iter().nth(1).expect("two keys requested");

    // Ignore our own announcements.
    if name == announcer.name || fingerprint == announcer.fingerprint {
        return;
    }

    let addr = SocketAddr::new(from.ip(), port);
    debug!(node = %name, address = %addr, "local discovery response");

    let _ = inner.event_tx.send(Event::Discovered { fingerprint, addr });
}
