//! Tears down `PendingMachine` resources that have gone quiet: a node that
//! never returns with a node-unique token leaves behind a shadow record that
//! would otherwise never expire.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use siderolink_common::{LabelQuery, ObjectStore, model::PendingMachine};
use tokio_util::sync::CancellationToken;

use crate::error::GatewayError;

const PENDING_NAMESPACE: &str = "default";
const PENDING_TTL: Duration = Duration::from_secs(30);
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

pub struct PendingCleanup {
    pending: Arc<dyn ObjectStore<PendingMachine>>,
}

impl PendingCleanup {
    #[must_use]
    pub fn new(pending: Arc<dyn ObjectStore<PendingMachine>>) -> Self {
        Self { pending }
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<(), GatewayError> {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }
            self.sweep().await?;
        }
    }

    async fn sweep(&self) -> Result<(), GatewayError> {
        let machines = self.pending.list(PENDING_NAMESPACE, LabelQuery::default()).await?;
        let now = Utc::now();
        for machine in machines {
            let stale = machine
                .spec
                .last_alive
                .is_none_or(|last_alive| now.signed_duration_since(last_alive).to_std().unwrap_or(Duration::MAX) >= PENDING_TTL);
            if !stale {
                continue;
            }
            match self.pending.destroy(PENDING_NAMESPACE, &machine.meta.id).await {
                Ok(()) | Err(siderolink_common::StoreError::NotFound { .. }) => {}
                Err(err) if err.is_phase_conflict() => {}
                Err(err) => return Err(GatewayError::from_store(err)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use siderolink_common::{Metadata, store::memory::InMemoryStore};

    fn machine(last_alive: Option<chrono::DateTime<Utc>>) -> PendingMachine {
        PendingMachine {
            node_subnet: "fd00::/64".parse().unwrap(),
            virtual_addr_port: None,
            last_endpoint: None,
            connected: false,
            last_alive,
        }
    }

    #[tokio::test]
    async fn stale_pending_machines_are_destroyed_fresh_ones_survive() {
        let store: Arc<InMemoryStore<PendingMachine>> = Arc::new(InMemoryStore::new());
        store
            .create(Metadata::new("default", "stale"), machine(Some(Utc::now() - chrono::Duration::seconds(60))))
            .await
            .unwrap();
        store
            .create(Metadata::new("default", "fresh"), machine(Some(Utc::now())))
            .await
            .unwrap();
        store
            .create(Metadata::new("default", "never-seen"), machine(None))
            .await
            .unwrap();

        let cleanup = PendingCleanup::new(store.clone());
        cleanup.sweep().await.unwrap();

        assert!(store.get("default", "stale").await.is_err());
        assert!(store.get("default", "fresh").await.is_ok());
        assert!(store.get("default", "never-seen").await.is_err());
    }
}
