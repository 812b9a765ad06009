//! End-to-end tests: real meshes over loopback with throwaway confbases.

use std::path::PathBuf;
use std::time::Duration;

use meshlink::{DevClass, Error, Mesh, OpenParams, StoragePolicy};
use tempfile::TempDir;

fn params(dir: &TempDir, sub: &str, name: &str, appname: &str) -> OpenParams {
    OpenParams::new(
        Some(PathBuf::from(dir.path().join(sub))),
        Some(name),
        appname,
        DevClass::Stationary,
    )
}

fn open(dir: &TempDir, sub: &str, name: &str, appname: &str) -> Mesh {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mesh = Mesh::open(params(dir, sub, name, appname)).unwrap();
    // Keep tests isolated from each other and from real networks.
    mesh.enable_discovery(false);
    mesh
}

/// Pair two meshes the way applications do: export on each side, import
/// on the other.
fn pair(a: &Mesh, b: &Mesh) {
    a.set_canonical_address(&a.get_name(), "127.0.0.1", Some(a.get_port()))
        .unwrap();
    b.set_canonical_address(&b.get_name(), "127.0.0.1", Some(b.get_port()))
        .unwrap();

    let export_a = a.export().unwrap();
    let export_b = b.export().unwrap();
    b.import(&export_a).unwrap();
    a.import(&export_b).unwrap();
}

async fn wait_reachable(mesh: &Mesh, name: &str, secs: u64) -> bool {
    for _ in 0..secs * 10 {
        if mesh.get_node(name).map(|n| n.reachable).unwrap_or(false) {
            return true;
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    false
}

#[tokio::test(flavor = "multi_thread")]
async fn test_two_node_handshake() {
    let dir = TempDir::new().unwrap();
    let a = open(&dir, "a", "foo", "pairtest");
    let b = open(&dir, "b", "bar", "pairtest");

    let (status_tx, mut status_rx) = tokio::sync::mpsc::unbounded_channel();
    a.set_node_status_cb(move |name, reachable| {
        let _ = status_tx.send((name.to_string(), reachable));
    });

    pair(&a, &b);
    a.start().await.unwrap();
    b.start().await.unwrap();

    assert!(wait_reachable(&a, "bar", 15).await, "bar never became reachable");
    assert!(wait_reachable(&b, "foo", 15).await, "foo never became reachable");

    // The status callback fired with reachable=true for the peer.
    let event = tokio::time::timeout(Duration::from_secs(5), status_rx.recv())
        .await
        .expect("status callback")
        .unwrap();
    assert_eq!(event, ("bar".to_string(), true));

    // Each side knows the other's key after pairing.
    assert!(a.get_node("bar").unwrap().public_key.is_some());
    assert!(b.get_node("foo").unwrap().public_key.is_some());

    a.stop().await;
    b.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_datagram_delivery() {
    let dir = TempDir::new().unwrap();
    let a = open(&dir, "a", "foo", "datatest");
    let b = open(&dir, "b", "bar", "datatest");

    let (rx_tx, mut rx_rx) = tokio::sync::mpsc::unbounded_channel();
    b.set_receive_cb(move |from, data| {
        let _ = rx_tx.send((from.to_string(), data.to_vec()));
    });

    pair(&a, &b);
    a.start().await.unwrap();
    b.start().await.unwrap();

    assert!(wait_reachable(&a, "bar", 15).await);
    assert!(wait_reachable(&b, "foo", 15).await);

    // Sessions may still be converging; retry the send for a while.
    let payload = b"probe of the data path".to_vec();
    let mut received = None;

    for _ in 0..50 {
        a.send("bar", &payload).unwrap();

        match tokio::time::timeout(Duration::from_millis(500), rx_rx.recv()).await {
            Ok(Some(got)) => {
                received = Some(got);
                break;
            }
            _ => continue,
        }
    }

    let (from, data) = received.expect("no datagram arrived");
    assert_eq!(from, "foo");
    assert_eq!(data, payload);

    a.stop().await;
    b.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invitation_join() {
    let dir = TempDir::new().unwrap();
    let a = open(&dir, "a", "foo", "invitetest");
    a.set_canonical_address("foo", "127.0.0.1", Some(a.get_port()))
        .unwrap();
    a.start().await.unwrap();

    let url = a.invite(None, "baz").unwrap();
    assert!(url.contains('/'));

    let b = open(&dir, "b", "placeholder", "invitetest");
    b.join(&url).await.unwrap();

    // Joining adopted the invited name and learned the inviter.
    assert_eq!(b.get_name(), "baz");
    let inviter = b.get_node("foo").expect("inviter known after join");
    assert!(inviter.public_key.is_some());

    b.start().await.unwrap();

    assert!(wait_reachable(&a, "baz", 15).await, "invitee never became reachable");
    assert!(wait_reachable(&b, "foo", 15).await, "inviter never became reachable");

    a.stop().await;
    b.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invitation_single_use() {
    let dir = TempDir::new().unwrap();
    let a = open(&dir, "a", "foo", "invreplay");
    a.set_canonical_address("foo", "127.0.0.1", Some(a.get_port()))
        .unwrap();
    a.start().await.unwrap();

    let url = a.invite(None, "baz").unwrap();

    let b = open(&dir, "b", "tmpb", "invreplay");
    b.join(&url).await.unwrap();

    // The same URL must not work twice.
    let c = open(&dir, "c", "tmpc", "invreplay");
    assert!(c.join(&url).await.is_err());

    a.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_routing_through_relay() {
    let dir = TempDir::new().unwrap();
    let a = open(&dir, "a", "nodea", "relaytest");
    let b = open(&dir, "b", "nodeb", "relaytest");
    let c = open(&dir, "c", "nodec", "relaytest");

    let (rx_tx, mut rx_rx) = tokio::sync::mpsc::unbounded_channel();
    c.set_receive_cb(move |from, data| {
        let _ = rx_tx.send((from.to_string(), data.to_vec()));
    });

    // A and C only know B.
    pair(&a, &b);
    pair(&c, &b);

    a.start().await.unwrap();
    b.start().await.unwrap();
    c.start().await.unwrap();

    // Edge flooding makes A and C learn about each other through B.
    assert!(wait_reachable(&a, "nodec", 30).await, "relay never linked a to c");
    assert!(wait_reachable(&c, "nodea", 30).await, "relay never linked c to a");

    let payload = b"across the relay".to_vec();
    let mut received = None;

    for _ in 0..50 {
        if a.send("nodec", &payload).is_ok() {
            if let Ok(Some(got)) =
                tokio::time::timeout(Duration::from_millis(500), rx_rx.recv()).await
            {
                received = Some(got);
                break;
            }
        }
    }

    let (from, data) = received.expect("no datagram arrived across the relay");
    assert_eq!(from, "nodea");
    assert_eq!(data, payload);

    a.stop().await;
    b.stop().await;
    c.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_confbase_lock_collision() {
    let dir = TempDir::new().unwrap();
    let _a = open(&dir, "same", "foo", "locktest");

    let result = Mesh::open(params(&dir, "same", "foo", "locktest"));
    assert!(matches!(result, Err(Error::Busy)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_persistence_across_reopen() {
    let dir = TempDir::new().unwrap();
    let key_a;

    {
        let a = open(&dir, "a", "foo", "persisttest");
        let b = open(&dir, "b", "bar", "persisttest");
        pair(&a, &b);
        key_a = a.get_self().public_key;
    }

    // Reopening keeps our key and the imported peer.
    let a = open(&dir, "a", "foo", "persisttest");
    assert_eq!(a.get_self().public_key, key_a);

    let bar = a.get_node("bar").expect("peer survived reopen");
    assert!(bar.public_key.is_some());
    assert_eq!(
        bar.canonical_address.as_deref().map(|c| c.starts_with("127.0.0.1")),
        Some(true)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_open_wrong_name_fails() {
    let dir = TempDir::new().unwrap();

    {
        let _a = open(&dir, "a", "foo", "nametest");
    }

    let result = Mesh::open(params(&dir, "a", "other", "nametest"));
    assert!(matches!(result, Err(Error::Inval)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_encrypted_confbase() {
    let dir = TempDir::new().unwrap();

    let mut p = params(&dir, "enc", "foo", "enctest");
    p.storage_key = Some(b"super secret".to_vec());
    let a = Mesh::open(p).unwrap();
    let key = a.get_self().public_key;
    drop(a);

    // Wrong key cannot open it.
    let mut p = params(&dir, "enc", "foo", "enctest");
    p.storage_key = Some(b"wrong secret".to_vec());
    assert!(Mesh::open(p).is_err());

    // The right key can.
    let mut p = params(&dir, "enc", "foo", "enctest");
    p.storage_key = Some(b"super secret".to_vec());
    let a = Mesh::open(p).unwrap();
    assert_eq!(a.get_self().public_key, key);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_storage_key_rotation() {
    let dir = TempDir::new().unwrap();

    {
        let mut p = params(&dir, "rot", "foo", "rotatetest");
        p.storage_key = Some(b"old key".to_vec());
        let a = Mesh::open(p).unwrap();
        a.encrypted_key_rotate(b"new key").unwrap();
    }

    // Only the new key opens the store now.
    let mut p = params(&dir, "rot", "foo", "rotatetest");
    p.storage_key = Some(b"old key".to_vec());
    assert!(Mesh::open(p).is_err());

    let mut p = params(&dir, "rot", "foo", "rotatetest");
    p.storage_key = Some(b"new key".to_vec());
    assert!(Mesh::open(p).is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_blacklist_self_rejected() {
    let dir = TempDir::new().unwrap();
    let a = open(&dir, "a", "foo", "blacklisttest");
    assert_eq!(a.blacklist("foo"), Err(Error::Inval));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_blacklist_blocks_send() {
    let dir = TempDir::new().unwrap();
    let a = open(&dir, "a", "foo", "blocksend");
    let b = open(&dir, "b", "bar", "blocksend");
    pair(&a, &b);

    a.start().await.unwrap();
    a.blacklist("bar").unwrap();
    assert_eq!(a.send("bar", b"nope"), Err(Error::Blacklisted));

    a.whitelist("bar").unwrap();
    assert!(a.send("bar", b"yes").is_ok());

    a.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_send_to_unknown_node() {
    let dir = TempDir::new().unwrap();
    let a = open(&dir, "a", "foo", "unknowntest");
    a.start().await.unwrap();
    assert_eq!(a.send("ghost", b"hello"), Err(Error::Noent));
    a.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ephemeral_mode() {
    let a = Mesh::open(OpenParams::new(None, Some("foo"), "ephemtest", DevClass::Portable))
        .unwrap();
    a.enable_discovery(false);
    a.start().await.unwrap();
    assert_ne!(a.get_port(), 0);
    assert_eq!(a.get_self().name, "foo");
    a.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_export_import_roundtrip() {
    let dir = TempDir::new().unwrap();
    let a = open(&dir, "a", "foo", "exporttest");
    let b = open(&dir, "b", "bar", "exporttest");

    a.set_canonical_address("foo", "198.51.100.1", Some(655)).unwrap();
    let blob = a.export().unwrap();
    b.import(&blob).unwrap();

    let foo = b.get_node("foo").expect("imported node exists");
    assert_eq!(foo.public_key, a.get_self().public_key);
    assert_eq!(foo.devclass, DevClass::Stationary);
    assert_eq!(foo.canonical_address.as_deref(), Some("198.51.100.1 655"));
    assert!(!foo.blacklisted);

    // Importing the same node twice is refused.
    assert_eq!(b.import(&blob), Err(Error::Exist));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_storage_policy_disabled_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let mut p = params(&dir, "quiet", "foo", "policytest");
    p.storage_policy = StoragePolicy::Disabled;
    let _a = Mesh::open(p).unwrap();

    assert!(!dir.path().join("quiet/current/meshlink.conf").exists());
}
