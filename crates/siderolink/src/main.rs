//! Entry point: wires the gateway (provisioning, peer pool, telemetry
//! sinks, peer-statistics loop) and the OIDC signing-key manager onto a
//! shared object store and runs both under one cancellable root context
//! until interrupted.

#[macro_use]
extern crate tracing;

use std::sync::Arc;

use clap::Parser;
use rand::RngCore;
use siderolink_common::{
    Metadata, ObjectStore,
    config::{GatewayConfig, OidcConfig},
    model::{
        Link, LinkStatus, MachineStatusSnapshot, Machine, PendingMachine, SiderolinkConfig,
        SIDEROLINK_CONFIG_ID, AddressReservation, JwtPublicKey,
    },
    store::memory::InMemoryStore,
};
use siderolink_gateway::{
    DeviceConfig, Gateway, LocalWgHandler, MachineMap, PeerPool, PeerSnapshot,
    ProvisioningService, SiderolinkSpec,
    error::GatewayError,
    event_sink::EventSinkService,
    log_sink::{LocalLogStore, LogSink},
    pending_cleanup::PendingCleanup,
    stats_loop::StatsLoop,
};
use siderolink_oidc::KeyManager;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, prelude::*};

#[derive(Parser)]
#[command(name = "siderolink", version, about = "SideroLink mesh gateway and OIDC signing-key manager")]
struct Cli {
    #[command(flatten)]
    gateway: GatewayConfig,

    #[command(flatten)]
    oidc: OidcConfig,

    /// Subnet the gateway assigns node addresses from.
    #[arg(long, env = "SIDEROLINK_NODE_SUBNET", default_value = "fdae:41e4:649b:9303::/64")]
    node_subnet: ipnetwork::Ipv6Network,

    /// Shared join token accepted by the legacy enrollment flow.
    #[arg(long, env = "SIDEROLINK_JOIN_TOKEN")]
    join_token: String,
}

/// No-op WireGuard device used until a real kernel device is wired in.
/// Accepts every peer event and never reports a peer as connected; enough
/// to exercise the gateway's own reconciliation loops standalone.
struct NullWgHandler;

impl LocalWgHandler for NullWgHandler {
    async fn setup_device(&self, config: DeviceConfig) -> Result<(), GatewayError> {
        info!(bind_endpoint = %config.bind_endpoint, "wireguard device setup (no-op handler)");
        Ok(())
    }

    async fn shutdown(&self) {}

    async fn run(&self, cancel: CancellationToken) -> Result<(), GatewayError> {
        cancel.cancelled().await;
        Ok(())
    }

    fn peer_event(&self, spec: SiderolinkSpec, removed: bool) -> Result<(), GatewayError> {
        debug!(node_public_key = %spec.key.node_public_key, removed, "peer event (no-op handler)");
        Ok(())
    }

    async fn peers(&self) -> Vec<PeerSnapshot> {
        Vec::new()
    }
}

/// Logs machine lines instead of persisting them; the real log store is an
/// external collaborator (bounded buffering plus eventual persistence).
struct StderrLogStore;

impl LocalLogStore for StderrLogStore {
    async fn write_line(&self, machine_id: &str, line: &[u8]) -> Result<(), GatewayError> {
        info!(%machine_id, line = %String::from_utf8_lossy(line), "machine log line");
        Ok(())
    }
}

fn server_keypair() -> ([u8; 32], [u8; 32]) {
    let secret = x25519_dalek::StaticSecret::random_from_rng(rand::thread_rng());
    let public = x25519_dalek::PublicKey::from(&secret);
    (secret.to_bytes(), public.to_bytes())
}

async fn seed_config(
    store: &Arc<InMemoryStore<SiderolinkConfig>>,
    cli: &Cli,
) -> anyhow::Result<()> {
    let (server_private_key, server_public_key) = server_keypair();
    let mut server_mesh_address_bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut server_mesh_address_bytes);
    server_mesh_address_bytes[0] = 0xfd;

    store
        .create(
            Metadata::new("default", SIDEROLINK_CONFIG_ID),
            SiderolinkConfig {
                server_private_key,
                server_public_key,
                server_mesh_address: std::net::Ipv6Addr::from(server_mesh_address_bytes),
                node_subnet_prefix: cli.node_subnet,
                virtual_subnet_prefix: None,
                wireguard_bind_endpoint: cli.gateway.wireguard_bind_endpoint,
                advertised_endpoints: vec![cli.gateway.wireguard_bind_endpoint],
                join_token: cli.join_token.clone(),
            },
        )
        .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    // The object store and the WireGuard device are external collaborators;
    // this binary wires the in-memory store and a no-op device so the
    // gateway runs standalone. A real deployment substitutes both.
    let config_store: Arc<InMemoryStore<SiderolinkConfig>> = Arc::new(InMemoryStore::new());
    seed_config(&config_store, &cli).await?;

    let link_store: Arc<InMemoryStore<Link>> = Arc::new(InMemoryStore::new());
    let link_status_store: Arc<InMemoryStore<LinkStatus>> = Arc::new(InMemoryStore::new());
    let pending_store: Arc<InMemoryStore<PendingMachine>> = Arc::new(InMemoryStore::new());
    let reservation_store: Arc<InMemoryStore<AddressReservation>> = Arc::new(InMemoryStore::new());
    let snapshot_store: Arc<InMemoryStore<MachineStatusSnapshot>> = Arc::new(InMemoryStore::new());
    let machine_store: Arc<InMemoryStore<Machine>> = Arc::new(InMemoryStore::new());
    let jwt_key_store: Arc<InMemoryStore<JwtPublicKey>> = Arc::new(InMemoryStore::new());

    let pool = Arc::new(PeerPool::new(Arc::new(NullWgHandler)));
    let machines = Arc::new(MachineMap::new(machine_store, "default"));

    let provisioning = ProvisioningService::new(
        config_store,
        Arc::clone(&link_store),
        link_status_store,
        pending_store.clone(),
        reservation_store,
        Arc::clone(&pool),
        cli.gateway.clone(),
    );
    let event_sink = EventSinkService::new(snapshot_store, Arc::clone(&machines));
    let log_sink = Arc::new(LogSink::new(Arc::new(StderrLogStore), Arc::clone(&machines)));
    let pending_cleanup = Arc::new(PendingCleanup::new(pending_store));
    let stats = Arc::new(StatsLoop::new(
        link_store,
        Arc::clone(&pool),
        cli.gateway.stats_interval(),
        cli.gateway.peer_down_interval(),
        cli.gateway.expose_last_endpoint,
        None,
    ));

    let grpc_bind: std::net::SocketAddr = ([0, 0, 0, 0], 50000).into();
    let log_bind: std::net::SocketAddr = ([0, 0, 0, 0], cli.gateway.log_server_port).into();
    let gateway = Gateway::new(
        pool,
        provisioning,
        event_sink,
        log_sink,
        pending_cleanup,
        stats,
        machines,
        grpc_bind,
        log_bind,
    );

    let key_manager = Arc::new(KeyManager::new(jwt_key_store, cli.oidc));

    let cancel = CancellationToken::new();

    let gateway_cancel = cancel.clone();
    let gateway_handle = tokio::spawn(async move { gateway.run(gateway_cancel).await });

    let rotator = Arc::clone(&key_manager);
    let rotator_cancel = cancel.clone();
    let rotator_handle = tokio::spawn(async move { rotator.run(rotator_cancel).await });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    cancel.cancel();

    if let Err(err) = gateway_handle.await {
        error!(%err, "gateway task panicked");
    }
    if let Err(err) = rotator_handle.await {
        error!(%err, "key rotator task panicked");
    }

    Ok(())
}
