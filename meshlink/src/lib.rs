//! MeshLink - end-to-end encrypted peer-to-peer mesh networking
//!
//! Each participating process ("node") is identified by a short name and
//! a long-lived Ed25519 identity keypair. Nodes form a fully connected
//! logical mesh: any node can send datagrams to any other node whose
//! identity it has learned, regardless of NAT topology, by routing over a
//! spanning tree of TCP meta-connections maintained between a subset of
//! nodes. Data travels end-to-end encrypted over UDP once path discovery
//! succeeds, and falls back to tunneling over the meta-connections until
//! it does.
//!
//! The building blocks:
//!
//! - SPTPS, the authenticated record protocol securing both the
//!   meta-connections and the end-to-end data path
//! - a distributed edge graph flooded through the mesh, with BFS-based
//!   routing and an autoconnect controller
//! - UDP path and path-MTU discovery
//! - a one-shot invitation protocol for admitting new nodes
//! - an atomically-updated, optionally encrypted on-disk config store
//! - mDNS-style local discovery
//!
//! ```no_run
//! use meshlink::{DevClass, Mesh, OpenParams};
//!
//! # async fn example() -> meshlink::Result<()> {
//! let params = OpenParams::new(
//!     Some("/var/lib/myapp/mesh".into()),
//!     Some("foo"),
//!     "myapp",
//!     DevClass::Stationary,
//! );
//!
//! let mesh = Mesh::open(params)?;
//! mesh.set_receive_cb(|from, data| {
//!     println!("{} says: {:?}", from, data);
//! });
//! mesh.start().await?;
//! mesh.send("bar", b"hello")?;
//! # Ok(())
//! # }
//! ```

mod adns;
mod conf;
mod connection;
mod discovery;
mod edge;
mod error;
mod graph;
mod invitation;
mod mesh;
mod net;
mod node;
mod pmtu;
mod protocol;
mod route;
mod sptps;
mod state;
mod submesh;
mod udp;

pub use conf::StoragePolicy;
pub use error::{Error, Result};
pub use mesh::{Mesh, NodeInfo, OpenParams};
pub use node::{DevClass, DevClassTraits, MAX_RECENT};
pub use sptps::{OutPacket, Output, Sptps, SptpsError, SptpsEvent};
