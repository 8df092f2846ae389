//! In-memory reference implementation of [`ObjectStore`], used so the core
//! compiles and is unit-testable without a real backend. Not itself part of
//! the specified surface: the production store is an external collaborator.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Duration,
};

use tokio::{sync::mpsc, time::sleep};

use crate::{
    resource::{Kind, Metadata, Phase, Resource},
    store::{LabelQuery, LocalObjectStore, StoreError, WatchEvent},
};

type Watchers<T> = Vec<mpsc::Sender<WatchEvent<T>>>;

struct Inner<T> {
    by_id: HashMap<(String, String), Resource<T>>,
    kind_watchers: Watchers<T>,
    id_watchers: HashMap<(String, String), Watchers<T>>,
}

impl<T> Default for Inner<T> {
    fn default() -> Self {
        Self {
            by_id: HashMap::new(),
            kind_watchers: Vec::new(),
            id_watchers: HashMap::new(),
        }
    }
}

/// A single-process object store backed by a `HashMap`, broadcasting
/// watch events to any live receivers. Each `InMemoryStore<T>` holds exactly
/// one resource kind, mirroring how `WatchKind` is typed per kind upstream.
pub struct InMemoryStore<T> {
    inner: RwLock<Inner<T>>,
}

impl<T> Default for InMemoryStore<T> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl<T: Kind + Clone + Send + Sync + 'static> InMemoryStore<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::RwLockWriteGuard<'_, Inner<T>> {
        self.inner.write().expect("object store lock poisoned")
    }

    fn notify(inner: &mut Inner<T>, key: &(String, String), event: &WatchEvent<T>) {
        inner.kind_watchers.retain(|tx| tx.try_send(event.clone()).is_ok());
        if let Some(watchers) = inner.id_watchers.get_mut(key) {
            watchers.retain(|tx| tx.try_send(event.clone()).is_ok());
        }
    }
}

impl<T: Kind + Clone + Send + Sync + 'static> LocalObjectStore<T> for InMemoryStore<T> {
    async fn get(&self, namespace: &str, id: &str) -> Result<Resource<T>, StoreError> {
        let inner = self.inner.read().expect("object store lock poisoned");
        inner
            .by_id
            .get(&(namespace.to_string(), id.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                namespace: namespace.to_string(),
                kind: T::KIND,
                id: id.to_string(),
            })
    }

    async fn list(
        &self,
        namespace: &str,
        query: LabelQuery,
    ) -> Result<Vec<Resource<T>>, StoreError> {
        let inner = self.inner.read().expect("object store lock poisoned");
        Ok(inner
            .by_id
            .values()
            .filter(|r| r.meta.namespace == namespace && query.matches(&r.meta))
            .cloned()
            .collect())
    }

    async fn create(&self, mut meta: Metadata, spec: T) -> Result<Resource<T>, StoreError> {
        let key = (meta.namespace.clone(), meta.id.clone());
        let mut inner = self.lock();
        if inner.by_id.contains_key(&key) {
            return Err(StoreError::Conflict {
                namespace: meta.namespace,
                kind: T::KIND,
                id: meta.id,
            });
        }
        meta.version = 1;
        let resource = Resource::new(meta, spec);
        inner.by_id.insert(key.clone(), resource.clone());
        Self::notify(&mut inner, &key, &WatchEvent::Created(resource.clone()));
        Ok(resource)
    }

    async fn update(&self, meta: Metadata, spec: T) -> Result<Resource<T>, StoreError> {
        let key = (meta.namespace.clone(), meta.id.clone());
        let mut inner = self.lock();
        let Some(existing) = inner.by_id.get(&key) else {
            return Err(StoreError::NotFound {
                namespace: meta.namespace,
                kind: T::KIND,
                id: meta.id,
            });
        };
        if existing.meta.version != meta.version {
            return Err(StoreError::Conflict {
                namespace: meta.namespace,
                kind: T::KIND,
                id: meta.id,
            });
        }
        if existing.meta.phase == Phase::TearingDown {
            return Err(StoreError::PhaseConflict {
                namespace: meta.namespace,
                kind: T::KIND,
                id: meta.id,
            });
        }
        let mut meta = meta;
        meta.version += 1;
        let resource = Resource::new(meta, spec);
        inner.by_id.insert(key.clone(), resource.clone());
        Self::notify(&mut inner, &key, &WatchEvent::Updated(resource.clone()));
        Ok(resource)
    }

    async fn destroy(&self, namespace: &str, id: &str) -> Result<(), StoreError> {
        let key = (namespace.to_string(), id.to_string());
        let mut inner = self.lock();
        let Some(resource) = inner.by_id.remove(&key) else {
            return Err(StoreError::NotFound {
                namespace: namespace.to_string(),
                kind: T::KIND,
                id: id.to_string(),
            });
        };
        Self::notify(&mut inner, &key, &WatchEvent::Destroyed(resource));
        Ok(())
    }

    async fn teardown(&self, namespace: &str, id: &str) -> Result<(), StoreError> {
        let key = (namespace.to_string(), id.to_string());
        let mut inner = self.lock();
        let Some(resource) = inner.by_id.get_mut(&key) else {
            return Err(StoreError::NotFound {
                namespace: namespace.to_string(),
                kind: T::KIND,
                id: id.to_string(),
            });
        };
        resource.meta.phase = Phase::TearingDown;
        let updated = resource.clone();
        Self::notify(&mut inner, &key, &WatchEvent::Updated(updated));
        Ok(())
    }

    async fn watch(
        &self,
        namespace: &str,
        id: &str,
        tx: mpsc::Sender<WatchEvent<T>>,
    ) -> Result<(), StoreError> {
        let key = (namespace.to_string(), id.to_string());
        let mut inner = self.lock();
        inner.id_watchers.entry(key).or_default().push(tx);
        Ok(())
    }

    async fn watch_kind(
        &self,
        bootstrap: bool,
        tx: mpsc::Sender<WatchEvent<T>>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if bootstrap {
            for resource in inner.by_id.values() {
                // Best-effort: a full channel here just means the caller
                // will pick up the state via a subsequent Created/Updated.
                let _ = tx.try_send(WatchEvent::Bootstrapped(resource.clone()));
            }
        }
        inner.kind_watchers.push(tx);
        Ok(())
    }

    async fn watch_for(
        &self,
        namespace: &str,
        id: &str,
        predicate: Box<dyn Fn(&Resource<T>) -> bool + Send + Sync>,
    ) -> Result<Resource<T>, StoreError> {
        loop {
            match self.get(namespace, id).await {
                Ok(resource) if predicate(&resource) => return Ok(resource),
                Ok(resource) => {
                    let _ = resource;
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
            sleep(Duration::from_millis(20)).await;
        }
    }
}

/// Convenience alias used by callers that share one store instance across tasks.
pub type SharedStore<T> = Arc<InMemoryStore<T>>;
