//! Periodic peer-statistics reconciliation: joins the WireGuard device's
//! live peer snapshots against stored `Link`s, reports byte-count deltas and
//! persists connectivity/endpoint changes under optimistic concurrency.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use siderolink_common::{LabelQuery, ObjectStore, model::Link};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{error::GatewayError, peer_pool::{PeerPool, PeerSnapshot}};

const STATS_NAMESPACE: &str = "default";

/// Byte-count delta observed for one peer between two ticks.
#[derive(Clone, Debug, PartialEq)]
pub struct PeerDelta {
    pub node_public_key: String,
    pub delta_bytes_received: u64,
    pub delta_bytes_sent: u64,
}

struct LastSeen {
    bytes_received: u64,
    bytes_sent: u64,
}

pub struct StatsLoop {
    links: Arc<dyn ObjectStore<Link>>,
    pool: Arc<PeerPool>,
    interval: Duration,
    peer_down_interval: Duration,
    expose_last_endpoint: bool,
    deltas: Option<mpsc::Sender<PeerDelta>>,
}

impl StatsLoop {
    #[must_use]
    pub fn new(
        links: Arc<dyn ObjectStore<Link>>,
        pool: Arc<PeerPool>,
        interval: Duration,
        peer_down_interval: Duration,
        expose_last_endpoint: bool,
        deltas: Option<mpsc::Sender<PeerDelta>>,
    ) -> Self {
        Self { links, pool, interval, peer_down_interval, expose_last_endpoint, deltas }
    }

    /// Ticks every `interval` until `cancel` fires. The first two ticks only
    /// warm the last-seen snapshot map: a Link's `connected`/`last_endpoint`
    /// is never written before the third tick, so a gateway restart never
    /// flaps every Link to disconnected on its very first observation.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), GatewayError> {
        let mut ticker = tokio::time::interval(self.interval);
        let mut last_seen: HashMap<String, LastSeen> = HashMap::new();
        let mut tick = 0u64;

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            let peers = self.pool.peers().await;
            let links = self.links.list(STATS_NAMESPACE, LabelQuery::default()).await?;
            let by_pubkey: HashMap<&str, &siderolink_common::Resource<Link>> = links
                .iter()
                .map(|link| (link.spec.node_public_key.as_str(), link))
                .collect();

            for peer in &peers {
                self.observe_peer(peer, &mut last_seen, &by_pubkey, tick).await?;
            }

            tick = tick.saturating_add(1);
        }
    }

    async fn observe_peer(
        &self,
        peer: &PeerSnapshot,
        last_seen: &mut HashMap<String, LastSeen>,
        by_pubkey: &HashMap<&str, &siderolink_common::Resource<Link>>,
        tick: u64,
    ) -> Result<(), GatewayError> {
        let previous = last_seen.get(&peer.node_public_key);
        let delta_bytes_received = previous.map_or(0, |p| peer.bytes_received.saturating_sub(p.bytes_received));
        let delta_bytes_sent = previous.map_or(0, |p| peer.bytes_sent.saturating_sub(p.bytes_sent));
        last_seen.insert(
            peer.node_public_key.clone(),
            LastSeen { bytes_received: peer.bytes_received, bytes_sent: peer.bytes_sent },
        );

        if let Some(tx) = &self.deltas {
            let _ = tx.send(PeerDelta {
                node_public_key: peer.node_public_key.clone(),
                delta_bytes_received,
                delta_bytes_sent,
            }).await;
        }

        if tick < 2 {
            return Ok(());
        }

        let Some(link) = by_pubkey.get(peer.node_public_key.as_str()) else {
            return Ok(());
        };

        let connected = peer
            .last_handshake
            .is_some_and(|handshake| Utc::now().signed_duration_since(handshake).to_std().unwrap_or(Duration::MAX) < self.peer_down_interval);

        if link.spec.connected == connected && link.spec.last_endpoint == peer.endpoint {
            return Ok(());
        }

        self.persist_link_observation(link, connected, peer.endpoint).await
    }

    async fn persist_link_observation(
        &self,
        link: &siderolink_common::Resource<Link>,
        connected: bool,
        last_endpoint: Option<SocketAddr>,
    ) -> Result<(), GatewayError> {
        let mut body = link.spec.clone();
        body.connected = connected;
        if self.expose_last_endpoint {
            body.last_endpoint = last_endpoint;
        }
        if connected {
            body.last_alive = Some(Utc::now());
        }

        match self.links.update(link.meta.clone(), body).await {
            Ok(_) | Err(siderolink_common::StoreError::NotFound { .. }) => Ok(()),
            Err(err) if err.is_phase_conflict() => Ok(()),
            Err(err) if err.is_conflict() => Ok(()),
            Err(err) => Err(GatewayError::from_store(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer_pool::{DeviceConfig, LocalWgHandler, OwnerId, PeerKey, SiderolinkSpec};
    use siderolink_common::{store::memory::InMemoryStore, Metadata};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct ScriptedHandler {
        snapshots: StdMutex<Vec<Vec<PeerSnapshot>>>,
    }

    impl LocalWgHandler for ScriptedHandler {
        async fn setup_device(&self, _config: DeviceConfig) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn shutdown(&self) {}

        async fn run(&self, _cancel: CancellationToken) -> Result<(), GatewayError> {
            Ok(())
        }

        fn peer_event(&self, _spec: SiderolinkSpec, _removed: bool) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn peers(&self) -> Vec<PeerSnapshot> {
            self.snapshots.lock().unwrap().pop().unwrap_or_default()
        }
    }

    #[tokio::test]
    async fn grace_window_skips_persisting_the_first_two_ticks() {
        let handler = Arc::new(ScriptedHandler::default());
        // peers() is called once per tick; pop() drains from the end, so push
        // the *last* tick's snapshot first.
        handler.snapshots.lock().unwrap().push(vec![PeerSnapshot {
            node_public_key: "pk1".to_string(),
            endpoint: Some("10.0.0.1:51820".parse().unwrap()),
            last_handshake: Some(Utc::now()),
            bytes_received: 100,
            bytes_sent: 50,
        }]);
        let pool = Arc::new(PeerPool::new(handler));

        let links: Arc<InMemoryStore<Link>> = Arc::new(InMemoryStore::new());
        links
            .create(
                Metadata::new("default", "node-1"),
                Link {
                    node_public_key: "pk1".to_string(),
                    node_subnet: "fd00::/64".parse().unwrap(),
                    virtual_addr_port: None,
                    last_endpoint: None,
                    connected: false,
                    node_unique_token: None,
                    bytes_sent: 0,
                    bytes_received: 0,
                    last_alive: None,
                },
            )
            .await
            .unwrap();

        let stats = StatsLoop::new(links.clone(), pool, Duration::from_millis(1), Duration::from_secs(120), true, None);
        let mut last_seen = HashMap::new();
        let link_list = links.list("default", LabelQuery::default()).await.unwrap();
        let by_pubkey: HashMap<&str, &siderolink_common::Resource<Link>> =
            link_list.iter().map(|l| (l.spec.node_public_key.as_str(), l)).collect();
        let peer = PeerSnapshot {
            node_public_key: "pk1".to_string(),
            endpoint: Some("10.0.0.1:51820".parse().unwrap()),
            last_handshake: Some(Utc::now()),
            bytes_received: 100,
            bytes_sent: 50,
        };

        stats.observe_peer(&peer, &mut last_seen, &by_pubkey, 0).await.unwrap();
        let fetched = links.get("default", "node-1").await.unwrap();
        assert!(!fetched.spec.connected, "tick 0 is inside the grace window");

        stats.observe_peer(&peer, &mut last_seen, &by_pubkey, 2).await.unwrap();
        let fetched = links.get("default", "node-1").await.unwrap();
        assert!(fetched.spec.connected, "tick 2 is outside the grace window");
    }

    #[tokio::test]
    async fn expose_last_endpoint_false_leaves_the_stored_endpoint_untouched() {
        let handler = Arc::new(ScriptedHandler::default());
        let pool = Arc::new(PeerPool::new(handler));

        let links: Arc<InMemoryStore<Link>> = Arc::new(InMemoryStore::new());
        links
            .create(
                Metadata::new("default", "node-1"),
                Link {
                    node_public_key: "pk1".to_string(),
                    node_subnet: "fd00::/64".parse().unwrap(),
                    virtual_addr_port: None,
                    last_endpoint: None,
                    connected: false,
                    node_unique_token: None,
                    bytes_sent: 0,
                    bytes_received: 0,
                    last_alive: None,
                },
            )
            .await
            .unwrap();

        let stats =
            StatsLoop::new(links.clone(), pool, Duration::from_millis(1), Duration::from_secs(120), false, None);
        let link = links.get("default", "node-1").await.unwrap();
        stats
            .persist_link_observation(&link, true, Some("10.0.0.1:51820".parse().unwrap()))
            .await
            .unwrap();

        let fetched = links.get("default", "node-1").await.unwrap();
        assert!(fetched.spec.connected);
        assert_eq!(fetched.spec.last_endpoint, None, "expose_last_endpoint=false must not persist the endpoint");
    }

    #[test]
    fn delta_is_computed_against_the_previous_tick_not_cumulative_total() {
        let mut last_seen = HashMap::new();
        last_seen.insert("pk1".to_string(), LastSeen { bytes_received: 100, bytes_sent: 50 });
        let previous = last_seen.get("pk1");
        let delta = previous.map_or(0, |p: &LastSeen| 180u64.saturating_sub(p.bytes_received));
        assert_eq!(delta, 80);
    }
}
