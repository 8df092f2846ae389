//! The object-store contract the core consumes. The store itself — a
//! typed, watchable, optimistically-concurrent resource state akin to a
//! Kubernetes/COSI resource API — is an external collaborator; this module
//! only pins down the interface the gateway and OIDC subsystems are written
//! against, plus the typed error taxonomy every store operation can
//! raise.

use thiserror::Error;
use tokio::sync::mpsc;

use crate::resource::{Kind, Metadata, Resource};

pub mod memory;

/// Errors the store surfaces. Distinguishable so callers can apply the
/// recovery (swallow not-found/phase-conflict, retry conflict once).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("resource {namespace}/{kind}/{id} already exists or was modified concurrently")]
    Conflict {
        namespace: String,
        kind: &'static str,
        id: String,
    },
    #[error("resource {namespace}/{kind}/{id} is tearing down")]
    PhaseConflict {
        namespace: String,
        kind: &'static str,
        id: String,
    },
    #[error("resource {namespace}/{kind}/{id} not found")]
    NotFound {
        namespace: String,
        kind: &'static str,
        id: String,
    },
    #[error("object store error: {0}")]
    Internal(String),
}

impl StoreError {
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    #[must_use]
    pub const fn is_phase_conflict(&self) -> bool {
        matches!(self, Self::PhaseConflict { .. })
    }

    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// A label selector for `List`. Empty matches every resource of the kind.
#[derive(Clone, Debug, Default)]
pub struct LabelQuery(pub Vec<(String, String)>);

impl LabelQuery {
    #[must_use]
    pub fn matches(&self, meta: &Metadata) -> bool {
        self.0
            .iter()
            .all(|(k, v)| meta.labels.get(k).is_some_and(|existing| existing == v))
    }
}

/// Watch notifications delivered on `Watch`/`WatchKind` channels.
#[derive(Clone, Debug)]
pub enum WatchEvent<T> {
    Created(Resource<T>),
    Updated(Resource<T>),
    Destroyed(Resource<T>),
    /// Replays existing state when a watch is first established with bootstrap.
    Bootstrapped(Resource<T>),
    /// A keepalive tick carrying no state change.
    Noop,
    Errored(String),
}

/// The asynchronous object-store contract consumed by the gateway and OIDC
/// subsystems. A single production backend and an in-memory test
/// double (`memory::InMemoryStore`) both implement it.
#[trait_variant::make(ObjectStore: Send)]
pub trait LocalObjectStore<T>: Send + Sync
where
    T: Kind + Clone + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, id: &str) -> Result<Resource<T>, StoreError>;

    async fn list(
        &self,
        namespace: &str,
        query: LabelQuery,
    ) -> Result<Vec<Resource<T>>, StoreError>;

    async fn create(&self, meta: Metadata, spec: T) -> Result<Resource<T>, StoreError>;

    /// Optimistic update: fails with `Conflict` if `meta.version` does not
    /// match the stored version.
    async fn update(&self, meta: Metadata, spec: T) -> Result<Resource<T>, StoreError>;

    async fn destroy(&self, namespace: &str, id: &str) -> Result<(), StoreError>;

    /// Marks a resource `TearingDown`; the store (or a finalizer-aware
    /// controller) is responsible for eventually calling `destroy`.
    async fn teardown(&self, namespace: &str, id: &str) -> Result<(), StoreError>;

    async fn watch(
        &self,
        namespace: &str,
        id: &str,
        tx: mpsc::Sender<WatchEvent<T>>,
    ) -> Result<(), StoreError>;

    async fn watch_kind(
        &self,
        bootstrap: bool,
        tx: mpsc::Sender<WatchEvent<T>>,
    ) -> Result<(), StoreError>;

    /// Blocks (bounded by the caller's own timeout) until `predicate` holds
    /// for the resource, or returns its last known state if it never does.
    async fn watch_for(
        &self,
        namespace: &str,
        id: &str,
        predicate: Box<dyn Fn(&Resource<T>) -> bool + Send + Sync>,
    ) -> Result<Resource<T>, StoreError>;
}
