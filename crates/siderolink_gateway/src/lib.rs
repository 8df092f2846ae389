//! Mesh gateway: node provisioning, the WireGuard peer pool, machine event
//! and log ingestion, and peer-statistics reconciliation.

#[macro_use]
extern crate tracing;

pub mod error;
pub mod event_sink;
pub mod log_sink;
pub mod machine_map;
pub mod manager;
pub mod pending_cleanup;
pub mod peer_pool;
pub mod provisioning;
pub mod stats_loop;

pub use error::GatewayError;
pub use machine_map::MachineMap;
pub use manager::Gateway;
pub use peer_pool::{DeviceConfig, LocalWgHandler, OwnerId, PeerKey, PeerPool, PeerSnapshot, SiderolinkSpec, WgHandler};
pub use provisioning::ProvisioningService;
