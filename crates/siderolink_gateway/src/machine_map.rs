//! Bidirectional, lazily-populated cache mapping a machine's source IP to
//! its object-store id, used by the log and event sinks to resolve
//! an inbound connection to a machine without a store round-trip per line.

use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{Arc, Mutex},
};

use siderolink_common::{LabelQuery, ObjectStore, StoreError, WatchEvent};
use siderolink_common::model::{Machine, MACHINE_ADDRESS_LABEL};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::GatewayError;

const WATCH_CHANNEL_CAPACITY: usize = 64;

struct Inner {
    by_addr: HashMap<IpAddr, String>,
    by_id: HashMap<String, IpAddr>,
}

pub struct MachineMap {
    store: Arc<dyn ObjectStore<Machine>>,
    namespace: String,
    inner: Mutex<Inner>,
}

impl MachineMap {
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore<Machine>>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            inner: Mutex::new(Inner {
                by_addr: HashMap::new(),
                by_id: HashMap::new(),
            }),
        }
    }

    /// Resolves `addr` to a machine id, querying the store on a cache miss.
    pub async fn resolve(&self, addr: IpAddr) -> Result<Option<String>, StoreError> {
        if let Some(id) = self.inner.lock().expect("machine map lock poisoned").by_addr.get(&addr)
        {
            return Ok(Some(id.clone()));
        }

        let query = LabelQuery(vec![(MACHINE_ADDRESS_LABEL.to_string(), addr.to_string())]);
        let matches = self.store.list(&self.namespace, query).await?;
        let Some(resource) = matches.into_iter().next() else {
            return Ok(None);
        };

        let mut inner = self.inner.lock().expect("machine map lock poisoned");
        inner.by_addr.insert(addr, resource.meta.id.clone());
        inner.by_id.insert(resource.meta.id.clone(), addr);
        Ok(Some(resource.meta.id))
    }

    /// Drops both directions of the mapping for `id`, called when a
    /// `Machine` teardown event is observed.
    pub fn invalidate(&self, id: &str) {
        let mut inner = self.inner.lock().expect("machine map lock poisoned");
        if let Some(addr) = inner.by_id.remove(id) {
            inner.by_addr.remove(&addr);
        }
    }

    /// Watches every `Machine` for teardown and drops its cache entry as
    /// soon as the resource is destroyed, so a reused address never
    /// resolves to a machine id that no longer exists.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), GatewayError> {
        let (tx, mut rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        self.store.watch_kind(false, tx).await.map_err(GatewayError::from_store)?;
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                event = rx.recv() => event,
            };
            match event {
                Some(WatchEvent::Destroyed(resource)) => self.invalidate(&resource.meta.id),
                Some(_) => {}
                None => return Err(GatewayError::Internal("machine watch channel closed".to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use siderolink_common::store::memory::InMemoryStore;
    use siderolink_common::Metadata;

    #[tokio::test]
    async fn resolves_then_caches_and_invalidate_drops_both_directions() {
        let store: Arc<InMemoryStore<Machine>> = Arc::new(InMemoryStore::new());
        let addr: IpAddr = "10.0.0.5".parse().unwrap();
        store
            .create(
                Metadata::new("default", "machine-1")
                    .with_label(MACHINE_ADDRESS_LABEL, &addr.to_string()),
                Machine { address: addr },
            )
            .await
            .unwrap();

        let map = MachineMap::new(store, "default");
        assert_eq!(map.resolve(addr).await.unwrap(), Some("machine-1".to_string()));
        // second call must hit the in-memory cache, not the store
        assert_eq!(map.resolve(addr).await.unwrap(), Some("machine-1".to_string()));

        map.invalidate("machine-1");
        assert!(map.inner.lock().unwrap().by_addr.is_empty());
    }

    #[tokio::test]
    async fn run_invalidates_the_cache_when_the_store_destroys_the_machine() {
        let store: Arc<InMemoryStore<Machine>> = Arc::new(InMemoryStore::new());
        let addr: IpAddr = "10.0.0.5".parse().unwrap();
        store
            .create(
                Metadata::new("default", "machine-1")
                    .with_label(MACHINE_ADDRESS_LABEL, &addr.to_string()),
                Machine { address: addr },
            )
            .await
            .unwrap();

        let map = Arc::new(MachineMap::new(Arc::clone(&store), "default"));
        assert_eq!(map.resolve(addr).await.unwrap(), Some("machine-1".to_string()));

        let cancel = CancellationToken::new();
        let watcher = Arc::clone(&map);
        let watcher_cancel = cancel.clone();
        let handle = tokio::spawn(async move { watcher.run(watcher_cancel).await });

        store.destroy("default", "machine-1").await.unwrap();

        for _ in 0..100 {
            if map.inner.lock().unwrap().by_addr.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(map.inner.lock().unwrap().by_addr.is_empty());

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
