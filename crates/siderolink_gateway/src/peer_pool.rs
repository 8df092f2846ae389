//! Reference-counted peer pool and the WireGuard device handler interface
//! it drives. The device itself is an external collaborator; this
//! module only pins down the interface and the owner-tracked map in front
//! of it.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};

use crate::error::GatewayError;

/// Desired state of one WireGuard peer, keyed by `(node_public_key, virtual_addr_port)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PeerKey {
    pub node_public_key: String,
    pub virtual_addr_port: Option<SocketAddr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SiderolinkSpec {
    pub key: PeerKey,
    pub node_subnet: ipnetwork::Ipv6Network,
    pub preshared_key: Option<[u8; 32]>,
}

/// Identifies the resource (Link, PendingMachine, ...) that requested a peer,
/// so the pool can reference-count without caring which controller called it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OwnerId {
    pub namespace: String,
    pub kind: &'static str,
    pub id: String,
}

/// A point-in-time read of one programmed peer, as reported by the device.
#[derive(Clone, Debug, PartialEq)]
pub struct PeerSnapshot {
    pub node_public_key: String,
    pub endpoint: Option<SocketAddr>,
    pub last_handshake: Option<DateTime<Utc>>,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

/// Configuration handed to the device once, at startup.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceConfig {
    pub private_key: [u8; 32],
    pub bind_endpoint: SocketAddr,
}

/// The six operations a WireGuard device is abstracted behind, implemented
/// as a capability interface with one production implementation and a test
/// double, no inheritance.
#[trait_variant::make(WgHandler: Send)]
pub trait LocalWgHandler: Send + Sync + 'static {
    async fn setup_device(&self, config: DeviceConfig) -> Result<(), GatewayError>;

    async fn shutdown(&self);

    /// Blocks until cancelled, draining the `peer_event` buffer and
    /// reconciling the device's peer set against it.
    async fn run(&self, cancel: tokio_util::sync::CancellationToken) -> Result<(), GatewayError>;

    /// Enqueues a peer add/remove. Must not block: it buffers into a channel
    /// drained by `run`.
    fn peer_event(&self, spec: SiderolinkSpec, removed: bool) -> Result<(), GatewayError>;

    async fn peers(&self) -> Vec<PeerSnapshot>;
}

struct Entry {
    spec: SiderolinkSpec,
    owners: std::collections::HashSet<OwnerId>,
}

/// Process-wide reference-counted map from peer key to the set of owners
/// (controllers) that want that peer present. `Add`/`Remove` are idempotent:
/// concurrent callers for the Link controller, the pending-machine
/// controller, and provisioning never double-program or prematurely tear
/// down a peer.
pub struct PeerPool {
    handler: Arc<dyn WgHandler>,
    entries: Mutex<HashMap<PeerKey, Entry>>,
}

impl PeerPool {
    #[must_use]
    pub fn new(handler: Arc<dyn WgHandler>) -> Self {
        Self {
            handler,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PeerKey, Entry>> {
        self.entries.lock().expect("peer pool lock poisoned")
    }

    /// Adds `owner` as a referent of `spec.key`. Issues `peer_event(spec,
    /// removed=false)` only the first time the key appears.
    pub fn add(&self, spec: SiderolinkSpec, owner: OwnerId) -> Result<(), GatewayError> {
        let mut entries = self.lock();
        match entries.get_mut(&spec.key) {
            Some(entry) => {
                entry.owners.insert(owner);
                Ok(())
            }
            None => {
                self.handler.peer_event(spec.clone(), false)?;
                let mut owners = std::collections::HashSet::new();
                owners.insert(owner);
                entries.insert(spec.key.clone(), Entry { spec, owners });
                Ok(())
            }
        }
    }

    /// Removes `owner` from `key`'s owner set. Issues `peer_event(spec,
    /// removed=true)` and drops the entry once the owner set is empty.
    pub fn remove(&self, key: &PeerKey, owner: &OwnerId) -> Result<(), GatewayError> {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(key) else {
            return Ok(());
        };
        entry.owners.remove(owner);
        if entry.owners.is_empty() {
            let entry = entries.remove(key).expect("just checked present");
            self.handler.peer_event(entry.spec, true)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, key: &PeerKey) -> bool {
        self.lock().contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn peers(&self) -> Vec<PeerSnapshot> {
        self.handler.peers().await
    }

    #[must_use]
    pub fn handler(&self) -> &Arc<dyn WgHandler> {
        &self.handler
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeHandler {
        adds: AtomicUsize,
        removes: AtomicUsize,
    }

    impl LocalWgHandler for FakeHandler {
        async fn setup_device(&self, _config: DeviceConfig) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn shutdown(&self) {}

        async fn run(&self, _cancel: tokio_util::sync::CancellationToken) -> Result<(), GatewayError> {
            Ok(())
        }

        fn peer_event(&self, _spec: SiderolinkSpec, removed: bool) -> Result<(), GatewayError> {
            if removed {
                self.removes.fetch_add(1, Ordering::SeqCst);
            } else {
                self.adds.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }

        async fn peers(&self) -> Vec<PeerSnapshot> {
            Vec::new()
        }
    }

    fn spec(pk: &str) -> SiderolinkSpec {
        SiderolinkSpec {
            key: PeerKey {
                node_public_key: pk.to_string(),
                virtual_addr_port: None,
            },
            node_subnet: "fd00::/64".parse().unwrap(),
            preshared_key: None,
        }
    }

    fn owner(id: &str) -> OwnerId {
        OwnerId {
            namespace: "default".to_string(),
            kind: "Link",
            id: id.to_string(),
        }
    }

    #[test]
    fn duplicate_add_does_not_reprogram_the_device() {
        let handler = Arc::new(FakeHandler::default());
        let pool = PeerPool::new(Arc::clone(&handler));
        let key = spec("K1").key.clone();

        pool.add(spec("K1"), owner("u1")).unwrap();
        pool.add(spec("K1"), owner("u2")).unwrap();

        assert_eq!(handler.adds.load(Ordering::SeqCst), 1);
        assert!(pool.contains(&key));
    }

    #[test]
    fn peer_is_only_removed_once_every_owner_has_released_it() {
        let handler = Arc::new(FakeHandler::default());
        let pool = PeerPool::new(Arc::clone(&handler));
        let key = spec("K1").key.clone();

        pool.add(spec("K1"), owner("u1")).unwrap();
        pool.add(spec("K1"), owner("u2")).unwrap();
        pool.remove(&key, &owner("u1")).unwrap();
        assert!(pool.contains(&key));
        assert_eq!(handler.removes.load(Ordering::SeqCst), 0);

        pool.remove(&key, &owner("u2")).unwrap();
        assert!(!pool.contains(&key));
        assert_eq!(handler.removes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn n_adds_followed_by_n_removes_with_the_same_owners_empties_the_pool() {
        let handler = Arc::new(FakeHandler::default());
        let pool = PeerPool::new(Arc::clone(&handler));
        let key = spec("K1").key.clone();
        let owners: Vec<_> = (0..5).map(|i| owner(&i.to_string())).collect();

        for owner in &owners {
            pool.add(spec("K1"), owner.clone()).unwrap();
        }
        for owner in &owners {
            pool.remove(&key, owner).unwrap();
        }

        assert!(pool.is_empty());
        assert_eq!(handler.adds.load(Ordering::SeqCst), 1);
        assert_eq!(handler.removes.load(Ordering::SeqCst), 1);
    }
}
