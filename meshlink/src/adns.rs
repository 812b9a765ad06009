//! Deadline-bounded hostname resolution
//!
//! Every lookup carries a deadline. The async variant rides the runtime's
//! resolver; the blocking variant spawns a detached thread and abandons
//! it on timeout (the thread cleans up after itself whenever the system
//! resolver eventually returns).

use std::net::SocketAddr;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Resolve a host/port pair, failing once the deadline passes.
pub(crate) async fn resolve(host: &str, port: u16, deadline: Duration) -> Result<Vec<SocketAddr>> {
    debug!(host, port, "resolving");

    let lookup = tokio::net::lookup_host((host, port));

    match tokio::time::timeout(deadline, lookup).await {
        Err(_) => {
            warn!(host, port, "deadline passed for DNS request");
            Err(Error::Resolv)
        }
        Ok(Err(e)) => {
            debug!(host, error = %e, "resolution failed");
            Err(Error::Resolv)
        }
        Ok(Ok(addrs)) => {
            let addrs: Vec<SocketAddr> = addrs.collect();

            if addrs.is_empty() {
                Err(Error::Resolv)
            } else {
                Ok(addrs)
            }
        }
    }
}

/// Blocking variant for callers that need a result inline.
pub(crate) fn resolve_blocking(host: &str, port: u16, deadline: Duration) -> Result<Vec<SocketAddr>> {
    use std::net::ToSocketAddrs;
    use std::sync::mpsc;

    let (tx, rx) = mpsc::channel();
    let host = host.to_string();

    std::thread::spawn(move || {
        let result = (host.as_str(), port).to_socket_addrs();
        let _ = tx.send(result);
    });

    match rx.recv_timeout(deadline) {
        Ok(Ok(addrs)) => {
            let addrs: Vec<SocketAddr> = addrs.collect();

            if addrs.is_empty() {
                Err(Error::Resolv)
            } else {
                Ok(addrs)
            }
        }
        Ok(Err(_)) => Err(Error::Resolv),
        Err(_) => {
            warn!(port, "deadline passed for blocking DNS request");
            Err(Error::Resolv)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_localhost() {
        let addrs = resolve("localhost", 655, Duration::from_secs(5)).await.unwrap();
        assert!(addrs.iter().all(|a| a.port() == 655));
        assert!(addrs.iter().any(|a| a.ip().is_loopback()));
    }

    #[tokio::test]
    async fn test_resolve_numeric() {
        let addrs = resolve("127.0.0.1", 1, Duration::from_secs(5)).await.unwrap();
        assert_eq!(addrs[0], "127.0.0.1:1".parse().unwrap());
    }

    #[test]
    fn test_resolve_blocking_localhost() {
        let addrs = resolve_blocking("127.0.0.1", 655, Duration::from_secs(5)).unwrap();
        assert_eq!(addrs[0], "127.0.0.1:655".parse().unwrap());
    }

    #[tokio::test]
    async fn test_resolve_invalid_name_fails() {
        assert!(resolve("no_such_host.invalid", 1, Duration::from_secs(5))
            .await
            .is_err());
    }
}
