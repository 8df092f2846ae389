//! Bounded LRU + TTL cache over upstream discovery-service gRPC clients,
//! guarded by a single-flight barrier so concurrent requests for the same
//! endpoint construct the client exactly once.

#[macro_use]
extern crate tracing;

use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use futures::future::{FutureExt, Shared};
use thiserror::Error;
use tokio::time::timeout;

const DEFAULT_CAPACITY: usize = 16;
const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);
const AFFILIATE_DELETE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to construct discovery client for {endpoint}: {source}")]
    Construct {
        endpoint: String,
        source: Arc<dyn std::error::Error + Send + Sync>,
    },
    #[error("affiliate delete on {endpoint} timed out")]
    Timeout { endpoint: String },
    #[error("affiliate delete on {endpoint} failed: {source}")]
    Rpc {
        endpoint: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Capability a cached client must provide so the cache can close it on
/// eviction and drive `AffiliateDelete` through it.
#[trait_variant::make(DiscoveryClient: Send)]
pub trait LocalDiscoveryClient: Clone + Send + Sync + 'static {
    /// Releases any held connection/resources. Called on LRU or TTL eviction.
    async fn close(&self);

    async fn affiliate_delete(
        &self,
        cluster: &str,
        affiliate: &str,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

type ConstructFuture<C> =
    Shared<Pin<Box<dyn Future<Output = Result<C, Arc<dyn std::error::Error + Send + Sync>>> + Send>>>;

struct Entry<C> {
    client: C,
    inserted_at: Instant,
}

enum Action<C> {
    Hit(C),
    Await(ConstructFuture<C>),
    Construct(ConstructFuture<C>),
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CacheMetrics {
    pub size: usize,
    pub active_clients: usize,
    pub hits: u64,
    pub misses: u64,
}

struct State<C> {
    entries: HashMap<String, Entry<C>>,
    /// Most-recently-used endpoint is at the back.
    lru_order: VecDeque<String>,
    inflight: HashMap<String, ConstructFuture<C>>,
    hits: u64,
    misses: u64,
}

impl<C> Default for State<C> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            lru_order: VecDeque::new(),
            inflight: HashMap::new(),
            hits: 0,
            misses: 0,
        }
    }
}

impl<C> State<C> {
    fn touch(&mut self, endpoint: &str) {
        self.lru_order.retain(|e| e != endpoint);
        self.lru_order.push_back(endpoint.to_string());
    }
}

/// `F` constructs a fresh client for a given endpoint URL.
pub struct DiscoveryCache<C, F> {
    capacity: usize,
    ttl: Duration,
    factory: F,
    state: Mutex<State<C>>,
}

impl<C, F, Fut> DiscoveryCache<C, F>
where
    C: DiscoveryClient,
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<C, Box<dyn std::error::Error + Send + Sync>>> + Send + 'static,
{
    pub fn new(factory: F) -> Self {
        Self::with_limits(factory, DEFAULT_CAPACITY, DEFAULT_TTL)
    }

    pub fn with_limits(factory: F, capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            factory,
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State<C>> {
        self.state.lock().expect("discovery cache lock poisoned")
    }

    /// Returns a live client for `endpoint`, constructing (at most once,
    /// across concurrent callers) if absent or expired.
    pub async fn get_or_construct(&self, endpoint: &str) -> Result<C, DiscoveryError> {
        let action = {
            let mut state = self.lock();
            if let Some(entry) = state.entries.get(endpoint) {
                if entry.inserted_at.elapsed() < self.ttl {
                    let client = entry.client.clone();
                    state.touch(endpoint);
                    state.hits += 1;
                    Action::Hit(client)
                } else {
                    let stale = state.entries.remove(endpoint);
                    state.lru_order.retain(|e| e != endpoint);
                    if let Some(stale) = stale {
                        let endpoint = endpoint.to_string();
                        tokio::spawn(async move {
                            debug!(endpoint, "discovery cache entry expired, closing client");
                            stale.client.close().await;
                        });
                    }
                    Self::begin_construct(&mut state, endpoint, &self.factory)
                }
            } else if let Some(fut) = state.inflight.get(endpoint) {
                state.hits += 1;
                Action::Await(fut.clone())
            } else {
                Self::begin_construct(&mut state, endpoint, &self.factory)
            }
        };

        match action {
            Action::Hit(client) => Ok(client),
            Action::Await(fut) => self.finish_construct(endpoint, fut, false).await,
            Action::Construct(fut) => self.finish_construct(endpoint, fut, true).await,
        }
    }

    fn begin_construct(state: &mut State<C>, endpoint: &str, factory: &F) -> Action<C> {
        let fut = factory(endpoint.to_string());
        let shared: ConstructFuture<C> = fut.map(|r| r.map_err(Arc::from)).boxed().shared();
        state.inflight.insert(endpoint.to_string(), shared.clone());
        state.misses += 1;
        Action::Construct(shared)
    }

    async fn finish_construct(
        &self,
        endpoint: &str,
        fut: ConstructFuture<C>,
        is_owner: bool,
    ) -> Result<C, DiscoveryError> {
        let result = fut.await;
        if is_owner {
            let mut state = self.lock();
            state.inflight.remove(endpoint);
            if let Ok(client) = &result {
                self.insert_locked(&mut state, endpoint, client.clone());
            }
        }
        result.map_err(|source| DiscoveryError::Construct {
            endpoint: endpoint.to_string(),
            source,
        })
    }

    fn insert_locked(&self, state: &mut State<C>, endpoint: &str, client: C) {
        if !state.entries.contains_key(endpoint) && state.entries.len() >= self.capacity {
            if let Some(oldest) = state.lru_order.pop_front() {
                if let Some(evicted) = state.entries.remove(&oldest) {
                    let oldest = oldest.clone();
                    tokio::spawn(async move {
                        debug!(endpoint = oldest, "discovery cache evicted client (LRU)");
                        evicted.client.close().await;
                    });
                }
            }
        }
        state.entries.insert(
            endpoint.to_string(),
            Entry {
                client,
                inserted_at: Instant::now(),
            },
        );
        state.touch(endpoint);
    }

    /// Acquires (or constructs) the client for `endpoint` and invokes
    /// `AffiliateDelete` against it with a 5 s timeout.
    pub async fn affiliate_delete(
        &self,
        endpoint: &str,
        cluster: &str,
        affiliate: &str,
    ) -> Result<(), DiscoveryError> {
        let client = self.get_or_construct(endpoint).await?;
        match timeout(AFFILIATE_DELETE_TIMEOUT, client.affiliate_delete(cluster, affiliate)).await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(DiscoveryError::Rpc {
                endpoint: endpoint.to_string(),
                source,
            }),
            Err(_) => Err(DiscoveryError::Timeout {
                endpoint: endpoint.to_string(),
            }),
        }
    }

    pub fn metrics(&self) -> CacheMetrics {
        let state = self.lock();
        CacheMetrics {
            size: state.entries.len(),
            active_clients: state.entries.len(),
            hits: state.hits,
            misses: state.misses,
        }
    }

    /// Purges and closes every cached client.
    pub async fn close(&self) {
        let drained: Vec<C> = {
            let mut state = self.lock();
            state.lru_order.clear();
            state.entries.drain().map(|(_, entry)| entry.client).collect()
        };
        for client in drained {
            client.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    struct FakeClient {
        closed: Arc<AtomicUsize>,
    }

    impl LocalDiscoveryClient for FakeClient {
        async fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }

        async fn affiliate_delete(
            &self,
            _cluster: &str,
            _affiliate: &str,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn constructs_once_per_endpoint_under_concurrent_callers() {
        let builds = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let builds_for_factory = Arc::clone(&builds);
        let closed_for_factory = Arc::clone(&closed);
        let cache = Arc::new(DiscoveryCache::new(move |_endpoint: String| {
            let builds = Arc::clone(&builds_for_factory);
            let closed = Arc::clone(&closed_for_factory);
            async move {
                builds.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Box<dyn std::error::Error + Send + Sync>>(FakeClient { closed })
            }
        }));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache.get_or_construct("https://upstream.example").await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(cache.metrics().hits, 7);
        assert_eq!(cache.metrics().misses, 1);
    }

    #[tokio::test]
    async fn lru_eviction_closes_the_evicted_client() {
        let closed = Arc::new(AtomicUsize::new(0));
        let closed_for_factory = Arc::clone(&closed);
        let cache = DiscoveryCache::with_limits(
            move |_endpoint: String| {
                let closed = Arc::clone(&closed_for_factory);
                async move { Ok::<_, Box<dyn std::error::Error + Send + Sync>>(FakeClient { closed }) }
            },
            2,
            Duration::from_secs(3600),
        );

        cache.get_or_construct("a").await.unwrap();
        cache.get_or_construct("b").await.unwrap();
        cache.get_or_construct("c").await.unwrap();

        // give the spawned close() task a chance to run
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(cache.metrics().size, 2);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }
}
