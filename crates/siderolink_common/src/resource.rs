use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle phase of a resource in the object store.
///
/// A resource is created in `Running`; `TearingDown` is set once a finalizer
/// has requested teardown but before the store has actually destroyed it.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Running,
    TearingDown,
}

/// Identity and bookkeeping shared by every resource kind, independent of its body.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Metadata {
    pub namespace: String,
    pub id: String,
    pub version: u64,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub finalizers: HashSet<String>,
    pub phase: Phase,
}

impl Metadata {
    #[must_use]
    pub fn new(namespace: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            id: id.into(),
            version: 0,
            labels: HashMap::new(),
            annotations: HashMap::new(),
            finalizers: HashSet::new(),
            phase: Phase::Running,
        }
    }

    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

/// A `(namespace, kind, id)`-addressed object together with its typed body.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Resource<T> {
    pub meta: Metadata,
    pub spec: T,
}

impl<T> Resource<T> {
    pub const fn new(meta: Metadata, spec: T) -> Self {
        Self { meta, spec }
    }
}

/// The kind discriminator used by `List`/`WatchKind`. Each resource body implements
/// this so the store can be generic over kind without reflection.
pub trait Kind {
    const KIND: &'static str;
}

pub type Timestamp = DateTime<Utc>;
