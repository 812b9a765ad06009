//! On-disk config store
//!
//! Each mesh instance owns `confbase/<sub>/{meshlink.conf, hosts/<name>,
//! invitations/<cookie>[.used]}` where `<sub>` is `current`, with `new`
//! and `old` existing only during storage-key rotation. Every file is one
//! packmsg blob, optionally whole-file encrypted as
//! `random 12-byte IV || ChaCha20Poly1305(key, IV, plaintext)`.
//!
//! Writes are atomic: the blob goes to `<file>.tmp`, is fsync'd, renamed
//! into place, and the directory is fsync'd. Concurrent opens of the same
//! confbase are excluded by an exclusive flock on `meshlink.lock`.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use lib_crypto::{decrypt_file, encrypt_file, Keypair, PublicKey};
use lib_packmsg::{Reader, Writer};
use nix::fcntl::{Flock, FlockArg};
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::node::{DevClass, Node};
use crate::submesh::CORE_MESH;

pub(crate) const CONFIG_VERSION: u32 = 1;
pub(crate) const INVITATION_VERSION: u32 = 1;

const LOCK_FILENAME: &str = "meshlink.lock";

/// How much the store is allowed to persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoragePolicy {
    /// Keys, host configs, and invitations are all written.
    Enabled,
    /// Only our own keys are written.
    KeysOnly,
    /// Nothing is written.
    Disabled,
}

/// The decoded main config file.
pub(crate) struct MainConfig {
    pub name: String,
    pub private_key: Keypair,
    pub invitation_key: Keypair,
    pub port: u16,
}

/// The decoded form of a host config blob.
#[derive(Debug, Clone)]
pub(crate) struct HostConfig {
    pub name: String,
    pub submesh: Option<String>,
    pub devclass: DevClass,
    pub blacklisted: bool,
    pub public_key: Option<PublicKey>,
    pub canonical_address: Option<String>,
    pub recent: Vec<SocketAddr>,
    pub last_reachable: i64,
    pub last_unreachable: i64,
}

impl HostConfig {
    pub fn from_node(node: &Node) -> Self {
        Self {
            name: node.name.clone(),
            submesh: node.submesh.clone(),
            devclass: node.devclass,
            blacklisted: node.blacklisted,
            public_key: node.public_key,
            canonical_address: node.canonical_address.clone(),
            recent: node.recent.clone(),
            last_reachable: node.last_reachable,
            last_unreachable: node.last_unreachable,
        }
    }

    /// Copy the persistent fields onto a node record.
    pub fn apply(&self, node: &mut Node) {
        node.submesh = self.submesh.clone();
        node.devclass = self.devclass;
        node.blacklisted = self.blacklisted;

        if node.public_key.is_none() {
            node.public_key = self.public_key;
        }

        if node.canonical_address.is_none() {
            node.canonical_address = self.canonical_address.clone();
        }

        for addr in self.recent.iter().rev() {
            if !node.recent.contains(addr) && node.recent.len() < crate::node::MAX_RECENT {
                node.recent.push(*addr);
            }
        }

        if node.last_reachable == 0 {
            node.last_reachable = self.last_reachable;
        }

        if node.last_unreachable == 0 {
            node.last_unreachable = self.last_unreachable;
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.add_u32(CONFIG_VERSION);
        w.add_str(&self.name);
        w.add_str(self.submesh.as_deref().unwrap_or(CORE_MESH));
        w.add_i32(self.devclass as i32);
        w.add_bool(self.blacklisted);

        match &self.public_key {
            Some(key) => w.add_bin(key.as_bytes()),
            None => w.add_bin(&[]),
        }

        w.add_str(self.canonical_address.as_deref().unwrap_or(""));
        w.add_array(self.recent.len() as u32);

        for addr in &self.recent {
            w.add_sockaddr(addr);
        }

        w.add_i64(self.last_reachable);
        w.add_i64(self.last_unreachable);
        w.into_vec()
    }

    pub fn decode(blob: &[u8]) -> Result<Self> {
        let mut r = Reader::new(blob);

        let version = r.get_u32().map_err(|_| Error::Storage)?;

        if version != CONFIG_VERSION {
            return Err(Error::Storage);
        }

        let name = r.get_str().map_err(|_| Error::Storage)?.to_string();
        let submesh_name = r.get_str().map_err(|_| Error::Storage)?.to_string();
        let submesh = (submesh_name != CORE_MESH).then_some(submesh_name);
        let devclass = DevClass::from_i32(r.get_i32().map_err(|_| Error::Storage)?)
            .ok_or(Error::Storage)?;
        let blacklisted = r.get_bool().map_err(|_| Error::Storage)?;

        let key_bytes = r.get_bin().map_err(|_| Error::Storage)?;
        let public_key = if key_bytes.is_empty() {
            None
        } else {
            Some(PublicKey::from_bytes(key_bytes).map_err(|_| Error::Storage)?)
        };

        let canonical = r.get_str().map_err(|_| Error::Storage)?.to_string();
        let canonical_address = (!canonical.is_empty()).then_some(canonical);

        let count = r.get_array().map_err(|_| Error::Storage)?;
        let mut recent = Vec::new();

        for _ in 0..count {
            if recent.len() < crate::node::MAX_RECENT {
                recent.push(r.get_sockaddr().map_err(|_| Error::Storage)?);
            } else {
                r.skip_element().map_err(|_| Error::Storage)?;
            }
        }

        let last_reachable = r.get_i64().map_err(|_| Error::Storage)?;
        let last_unreachable = r.get_i64().map_err(|_| Error::Storage)?;

        if !r.done() {
            return Err(Error::Storage);
        }

        Ok(Self {
            name,
            submesh,
            devclass,
            blacklisted,
            public_key,
            canonical_address,
            recent,
            last_reachable,
            last_unreachable,
        })
    }
}

pub(crate) struct ConfStore {
    confbase: PathBuf,
    key: Option<[u8; 32]>,
    policy: StoragePolicy,
    lock: Option<Flock<File>>,
}

impl ConfStore {
    pub fn new(confbase: PathBuf, key: Option<[u8; 32]>, policy: StoragePolicy) -> Self {
        Self {
            confbase,
            key,
            policy,
            lock: None,
        }
    }

    pub fn confbase(&self) -> &Path {
        &self.confbase
    }

    pub fn policy(&self) -> StoragePolicy {
        self.policy
    }

    pub fn key(&self) -> Option<&[u8; 32]> {
        self.key.as_ref()
    }

    // Paths

    fn sub_dir(&self, sub: &str) -> PathBuf {
        self.confbase.join(sub)
    }

    fn main_path(&self, sub: &str) -> PathBuf {
        self.sub_dir(sub).join("meshlink.conf")
    }

    fn host_path(&self, sub: &str, name: &str) -> PathBuf {
        self.sub_dir(sub).join("hosts").join(name)
    }

    fn invitation_path(&self, sub: &str, name: &str) -> PathBuf {
        self.sub_dir(sub).join("invitations").join(name)
    }

    // Locking

    /// Take the exclusive instance lock. Fails with `Busy` when another
    /// instance already owns this confbase.
    pub fn lock(&mut self, lock_filename: Option<&str>) -> Result<()> {
        fs::create_dir_all(&self.confbase).map_err(|_| Error::Storage)?;

        let path = match lock_filename {
            Some(name) => self.confbase.join(name),
            None => self.confbase.join(LOCK_FILENAME),
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|_| Error::Storage)?;

        set_cloexec(&file);

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                self.lock = Some(lock);
                Ok(())
            }
            Err(_) => {
                warn!(path = %path.display(), "confbase is locked by another instance");
                Err(Error::Busy)
            }
        }
    }

    // Raw file I/O

    fn read_raw(&self, path: &Path) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        File::open(path)
            .and_then(|mut f| f.read_to_end(&mut buf))
            .map_err(|_| Error::Storage)?;

        match &self.key {
            Some(key) => decrypt_file(key, &buf).map_err(|_| Error::Storage),
            None => Ok(buf),
        }
    }

    fn write_raw(&self, path: &Path, plaintext: &[u8]) -> Result<()> {
        self.write_raw_with_key(path, plaintext, self.key.as_ref())
    }

    fn write_raw_with_key(
        &self,
        path: &Path,
        plaintext: &[u8],
        key: Option<&[u8; 32]>,
    ) -> Result<()> {
        let contents = match key {
            Some(key) => encrypt_file(key, plaintext),
            None => plaintext.to_vec(),
        };

        let tmp = path.with_extension("tmp");

        let write = || -> std::io::Result<()> {
            let mut f = File::create(&tmp)?;
            f.write_all(&contents)?;
            f.sync_all()?;
            fs::rename(&tmp, path)?;

            if let Some(dir) = path.parent() {
                File::open(dir)?.sync_all()?;
            }

            Ok(())
        };

        write().map_err(|e| {
            error!(path = %path.display(), error = %e, "failed to write config file");
            let _ = fs::remove_file(&tmp);
            Error::Storage
        })
    }

    // Directory lifecycle

    /// Create a fresh `<sub>` tree, wiping whatever was there.
    pub fn init(&self, sub: &str) -> Result<()> {
        fs::create_dir_all(&self.confbase).map_err(|_| Error::Storage)?;
        let dir = self.sub_dir(sub);
        let _ = fs::remove_dir_all(&dir);

        fs::create_dir_all(dir.join("hosts"))
            .and_then(|_| fs::create_dir_all(dir.join("invitations")))
            .map_err(|_| Error::Storage)
    }

    pub fn destroy_sub(&self, sub: &str) -> Result<()> {
        let dir = self.sub_dir(sub);

        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(_) => Err(Error::Storage),
        }
    }

    pub fn sync_all(&self, sub: &str) -> Result<()> {
        for dir in [
            self.sub_dir(sub),
            self.sub_dir(sub).join("hosts"),
            self.sub_dir(sub).join("invitations"),
        ] {
            if let Ok(f) = File::open(&dir) {
                let _ = f.sync_all();
            }
        }

        if let Ok(f) = File::open(&self.confbase) {
            let _ = f.sync_all();
        }

        Ok(())
    }

    // Main config

    pub fn main_exists(&self, sub: &str) -> bool {
        self.main_path(sub).exists()
    }

    fn main_decrypts(&self, sub: &str) -> bool {
        match self.read_raw(&self.main_path(sub)) {
            Ok(blob) => {
                let mut r = Reader::new(&blob);
                r.get_u32().map(|v| v == CONFIG_VERSION).unwrap_or(false)
            }
            Err(_) => false,
        }
    }

    /// Check for an existing configuration, committing a half-finished key
    /// rotation if `current` no longer decrypts but `new` or `old` does.
    pub fn recover(&self) -> Result<bool> {
        let mut exists = false;
        let mut usable = false;

        if self.main_exists("current") {
            exists = true;
            usable = self.key.is_none() || self.main_decrypts("current");
        }

        if self.key.is_some() && !usable {
            for sub in ["new", "old"] {
                if self.main_exists(sub) {
                    exists = true;

                    if self.main_decrypts(sub) {
                        debug!(sub, "recovering configuration from rotation subtree");
                        self.destroy_sub("current")?;
                        fs::rename(self.sub_dir(sub), self.sub_dir("current"))
                            .map_err(|_| Error::Storage)?;
                        usable = true;
                        break;
                    }
                }
            }
        }

        if exists && usable {
            let _ = self.destroy_sub("old");
            let _ = self.destroy_sub("new");
        }

        Ok(exists)
    }

    pub fn main_read(&self, sub: &str) -> Result<MainConfig> {
        let blob = self.read_raw(&self.main_path(sub))?;
        let mut r = Reader::new(&blob);

        let version = r.get_u32().map_err(|_| Error::Storage)?;

        if version != CONFIG_VERSION {
            return Err(Error::Storage);
        }

        let name = r.get_str().map_err(|_| Error::Storage)?.to_string();
        let private_key =
            Keypair::from_blob(r.get_bin().map_err(|_| Error::Storage)?).map_err(|_| Error::Storage)?;
        let invitation_key =
            Keypair::from_blob(r.get_bin().map_err(|_| Error::Storage)?).map_err(|_| Error::Storage)?;
        let port = r.get_u16().map_err(|_| Error::Storage)?;

        Ok(MainConfig {
            name,
            private_key,
            invitation_key,
            port,
        })
    }

    pub fn main_write(&self, sub: &str, config: &MainConfig) -> Result<()> {
        if self.policy == StoragePolicy::Disabled {
            return Ok(());
        }

        let mut w = Writer::new();
        w.add_u32(CONFIG_VERSION);
        w.add_str(&config.name);
        w.add_bin(&config.private_key.to_blob());
        w.add_bin(&config.invitation_key.to_blob());
        w.add_u16(config.port);

        self.write_raw(&self.main_path(sub), &w.into_vec())
    }

    // Host configs

    pub fn host_exists(&self, sub: &str, name: &str) -> bool {
        self.host_path(sub, name).exists()
    }

    pub fn host_read(&self, sub: &str, name: &str) -> Result<Vec<u8>> {
        self.read_raw(&self.host_path(sub, name))
    }

    pub fn host_write(&self, sub: &str, name: &str, blob: &[u8]) -> Result<()> {
        if self.policy != StoragePolicy::Enabled {
            return Ok(());
        }

        self.write_raw(&self.host_path(sub, name), blob)
    }

    pub fn host_delete(&self, sub: &str, name: &str) -> Result<()> {
        match fs::remove_file(self.host_path(sub, name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(_) => Err(Error::Storage),
        }
    }

    pub fn scan_hosts(&self, sub: &str) -> Vec<String> {
        let mut names = Vec::new();

        if let Ok(entries) = fs::read_dir(self.sub_dir(sub).join("hosts")) {
            for entry in entries.flatten() {
                if let Some(name) = entry.file_name().to_str() {
                    if !name.starts_with('.') && !name.ends_with(".tmp") {
                        names.push(name.to_string());
                    }
                }
            }
        }

        names.sort();
        names
    }

    // Invitations

    pub fn invitation_write(&self, name: &str, blob: &[u8]) -> Result<()> {
        if self.policy != StoragePolicy::Enabled {
            return Err(Error::Storage);
        }

        self.write_raw(&self.invitation_path("current", name), blob)
    }

    /// Atomically consume an invitation file: rename it to `.used`, check
    /// its age, read it, and delete it. A second consume of the same name
    /// fails with `Noent`.
    pub fn invitation_consume(&self, name: &str, timeout: i64) -> Result<Vec<u8>> {
        let path = self.invitation_path("current", name);
        let used = self.invitation_path("current", &format!("{}.used", name));

        if fs::rename(&path, &used).is_err() {
            debug!(name, "invitation does not exist or was already used");
            return Err(Error::Noent);
        }

        let result = (|| {
            let meta = fs::metadata(&used).map_err(|_| Error::Storage)?;
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);

            if crate::state::unix_now() > mtime + timeout {
                warn!(name, "invitation has expired");
                return Err(Error::Noent);
            }

            self.read_raw(&used)
        })();

        let _ = fs::remove_file(&used);
        result
    }

    /// Delete invitations older than the deadline; returns how many
    /// remain.
    pub fn invitation_purge(&self, deadline: i64) -> usize {
        let dir = self.sub_dir("current").join("invitations");
        let mut left = 0;

        let Ok(entries) = fs::read_dir(&dir) else {
            return 0;
        };

        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };

            if name.len() != 24 && !name.ends_with(".used") {
                continue;
            }

            let mtime = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);

            if mtime < deadline {
                let _ = fs::remove_file(entry.path());
            } else {
                left += 1;
            }
        }

        left
    }

    // Storage-key rotation

    /// Re-encrypt the whole store under a new key: copy `current` to
    /// `new` under the new key, swap directories, delete the leftovers.
    /// Recovery after a crash between any two steps is handled by
    /// [`ConfStore::recover`] on the next open.
    pub fn rotate_key(&mut self, new_key: Option<[u8; 32]>) -> Result<()> {
        let current = self.sub_dir("current");
        let new_dir = self.sub_dir("new");
        let old_dir = self.sub_dir("old");

        let _ = fs::remove_dir_all(&new_dir);
        self.copy_tree(&current, &new_dir, new_key.as_ref())?;
        self.sync_all("new")?;

        fs::rename(&current, &old_dir).map_err(|_| Error::Storage)?;
        sync_dir(&self.confbase);

        fs::rename(&new_dir, &current).map_err(|_| Error::Storage)?;
        sync_dir(&self.confbase);

        let _ = fs::remove_dir_all(&old_dir);
        sync_dir(&self.confbase);

        self.key = new_key;
        Ok(())
    }

    fn copy_tree(&self, src: &Path, dst: &Path, dst_key: Option<&[u8; 32]>) -> Result<()> {
        fs::create_dir_all(dst).map_err(|_| Error::Storage)?;

        let entries = fs::read_dir(src).map_err(|_| Error::Storage)?;

        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name_str) = name.to_str() else { continue };

            if name_str.starts_with('.') || name_str == LOCK_FILENAME {
                continue;
            }

            let src_path = entry.path();
            let dst_path = dst.join(&name);
            let file_type = entry.file_type().map_err(|_| Error::Storage)?;

            if file_type.is_dir() {
                self.copy_tree(&src_path, &dst_path, dst_key)?;
            } else if file_type.is_file() {
                let plaintext = self.read_raw(&src_path)?;
                self.write_raw_with_key(&dst_path, &plaintext, dst_key)?;
            }
        }

        Ok(())
    }
}

fn sync_dir(path: &Path) {
    if let Ok(f) = File::open(path) {
        let _ = f.sync_all();
    }
}

fn set_cloexec(file: &File) {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};
    let _ = fcntl(file, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC));
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn host_config(name: &str) -> HostConfig {
        HostConfig {
            name: name.into(),
            submesh: None,
            devclass: DevClass::Stationary,
            blacklisted: false,
            public_key: Some(Keypair::generate().public()),
            canonical_address: Some("example.org 655".into()),
            recent: vec!["192.0.2.7:655".parse().unwrap()],
            last_reachable: 100,
            last_unreachable: 50,
        }
    }

    #[test]
    fn test_host_config_roundtrip() {
        let hc = host_config("peer");
        let blob = hc.encode();
        let parsed = HostConfig::decode(&blob).unwrap();
        assert_eq!(parsed.name, "peer");
        assert_eq!(parsed.public_key, hc.public_key);
        assert_eq!(parsed.recent, hc.recent);
        assert_eq!(parsed.canonical_address, hc.canonical_address);

        // Byte-identical re-encode.
        assert_eq!(parsed.encode(), blob);
    }

    #[test]
    fn test_store_write_read_plaintext() {
        let dir = tempdir().unwrap();
        let store = ConfStore::new(dir.path().into(), None, StoragePolicy::Enabled);
        store.init("current").unwrap();

        let blob = host_config("peer").encode();
        store.host_write("current", "peer", &blob).unwrap();
        assert_eq!(store.host_read("current", "peer").unwrap(), blob);
        assert_eq!(store.scan_hosts("current"), vec!["peer".to_string()]);
    }

    #[test]
    fn test_store_encryption_and_wrong_key() {
        let dir = tempdir().unwrap();
        let key = [7u8; 32];
        let store = ConfStore::new(dir.path().into(), Some(key), StoragePolicy::Enabled);
        store.init("current").unwrap();

        let blob = host_config("peer").encode();
        store.host_write("current", "peer", &blob).unwrap();
        assert_eq!(store.host_read("current", "peer").unwrap(), blob);

        let wrong = ConfStore::new(dir.path().into(), Some([8u8; 32]), StoragePolicy::Enabled);
        assert!(wrong.host_read("current", "peer").is_err());
    }

    #[test]
    fn test_lock_collision() {
        let dir = tempdir().unwrap();
        let mut a = ConfStore::new(dir.path().into(), None, StoragePolicy::Enabled);
        a.lock(None).unwrap();

        let mut b = ConfStore::new(dir.path().into(), None, StoragePolicy::Enabled);
        assert_eq!(b.lock(None), Err(Error::Busy));

        // Releasing the first lock lets the second through.
        drop(a);
        let mut c = ConfStore::new(dir.path().into(), None, StoragePolicy::Enabled);
        c.lock(None).unwrap();
    }

    #[test]
    fn test_invitation_single_use() {
        let dir = tempdir().unwrap();
        let store = ConfStore::new(dir.path().into(), None, StoragePolicy::Enabled);
        store.init("current").unwrap();

        store.invitation_write("cookiehash", b"invitation blob").unwrap();
        assert_eq!(
            store.invitation_consume("cookiehash", 3600).unwrap(),
            b"invitation blob"
        );

        // Second use fails.
        assert_eq!(
            store.invitation_consume("cookiehash", 3600),
            Err(Error::Noent)
        );
    }

    #[test]
    fn test_invitation_expiry() {
        let dir = tempdir().unwrap();
        let store = ConfStore::new(dir.path().into(), None, StoragePolicy::Enabled);
        store.init("current").unwrap();

        store.invitation_write("stale", b"blob").unwrap();
        assert_eq!(store.invitation_consume("stale", -1), Err(Error::Noent));
    }

    #[test]
    fn test_key_rotation_and_recovery() {
        let dir = tempdir().unwrap();
        let old_key = [1u8; 32];
        let new_key = [2u8; 32];

        let mut store = ConfStore::new(dir.path().into(), Some(old_key), StoragePolicy::Enabled);
        store.init("current").unwrap();

        let main = MainConfig {
            name: "self".into(),
            private_key: Keypair::generate(),
            invitation_key: Keypair::generate(),
            port: 655,
        };
        store.main_write("current", &main).unwrap();
        store.host_write("current", "peer", &host_config("peer").encode()).unwrap();

        store.rotate_key(Some(new_key)).unwrap();

        // The old key no longer works; the new one does.
        let old_store = ConfStore::new(dir.path().into(), Some(old_key), StoragePolicy::Enabled);
        assert!(old_store.main_read("current").is_err());

        let new_store = ConfStore::new(dir.path().into(), Some(new_key), StoragePolicy::Enabled);
        assert!(new_store.recover().unwrap());
        assert_eq!(new_store.main_read("current").unwrap().name, "self");
        assert_eq!(
            HostConfig::decode(&new_store.host_read("current", "peer").unwrap())
                .unwrap()
                .name,
            "peer"
        );
    }

    #[test]
    fn test_recovery_from_interrupted_rotation() {
        let dir = tempdir().unwrap();
        let old_key = [1u8; 32];
        let new_key = [2u8; 32];

        let store = ConfStore::new(dir.path().into(), Some(old_key), StoragePolicy::Enabled);
        store.init("current").unwrap();
        let main = MainConfig {
            name: "self".into(),
            private_key: Keypair::generate(),
            invitation_key: Keypair::generate(),
            port: 655,
        };
        store.main_write("current", &main).unwrap();

        // Simulate a crash after "new" was fully written under the new
        // key but before the directory swap: current still under the old
        // key, new under the new key.
        store
            .copy_tree(
                &dir.path().join("current"),
                &dir.path().join("new"),
                Some(&new_key),
            )
            .unwrap();

        // An open with the new key must commit "new".
        let recovered = ConfStore::new(dir.path().into(), Some(new_key), StoragePolicy::Enabled);
        assert!(recovered.recover().unwrap());
        assert_eq!(recovered.main_read("current").unwrap().name, "self");
        assert!(!dir.path().join("new").exists());
    }

    #[test]
    fn test_storage_policy_gates_writes() {
        let dir = tempdir().unwrap();
        let store = ConfStore::new(dir.path().into(), None, StoragePolicy::KeysOnly);
        store.init("current").unwrap();

        store.host_write("current", "peer", b"blob").unwrap();
        assert!(!store.host_exists("current", "peer"));

        let main = MainConfig {
            name: "self".into(),
            private_key: Keypair::generate(),
            invitation_key: Keypair::generate(),
            port: 1,
        };
        store.main_write("current", &main).unwrap();
        assert!(store.main_exists("current"));
    }
}
