//! The `Provision` RPC: node authorization, mesh-address assignment, and
//! Link/PendingMachine reconciliation.

use std::{net::SocketAddr, time::Duration};

use chrono::Utc;
use ipnetwork::Ipv6Network;
use rand::RngCore;
use semver::Version;
use siderolink_common::{
    config::{GatewayConfig, JoinTokensMode, SECURE_TOKENS_MIN_VERSION},
    model::{
        ADDRESS_RESERVATION_NAMESPACE, ANNOTATION_FORCE_VALID_NODE_UNIQUE_TOKEN,
        ANNOTATION_PENDING_UUID_CONFLICT, AddressReservation, Link, LinkStatus, LinkStatusPhase,
        PendingMachine, SiderolinkConfig, SIDEROLINK_CONFIG_ID,
    },
    token::NodeUniqueToken,
    Kind, Metadata, ObjectStore,
};
use tonic::{Request, Response, Status};

use crate::{
    error::GatewayError,
    peer_pool::{OwnerId, PeerKey, PeerPool, SiderolinkSpec},
};

const MAX_ADDRESS_ATTEMPTS: u32 = 16;
const PROVISION_NAMESPACE: &str = "default";
const LINK_STATUS_WAIT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Target {
    Link,
    PendingMachine,
}

/// Outcome of validating a request's credentials against the current
/// `JoinTokensMode`'s enrollment mode table.
fn authorize(
    mode: JoinTokensMode,
    version: Option<&Version>,
    join_token_ok: bool,
    has_node_unique_token: bool,
    has_existing_link: bool,
) -> Result<Target, GatewayError> {
    let secure_capable = version.is_some_and(|v| {
        (v.major, v.minor, v.patch) >= SECURE_TOKENS_MIN_VERSION
    });

    if !secure_capable {
        return match mode {
            JoinTokensMode::Strict => Err(GatewayError::FailedPrecondition(
                "strict join-tokens mode does not support nodes below the secure-tokens version"
                    .to_string(),
            )),
            JoinTokensMode::LegacyOnly | JoinTokensMode::Both if join_token_ok => {
                Ok(Target::Link)
            }
            JoinTokensMode::LegacyOnly | JoinTokensMode::Both => {
                Err(GatewayError::Unauthorized("join token mismatch".to_string()))
            }
        };
    }

    match mode {
        JoinTokensMode::LegacyOnly if join_token_ok => Ok(Target::Link),
        JoinTokensMode::LegacyOnly => {
            Err(GatewayError::Unauthorized("join token mismatch".to_string()))
        }
        JoinTokensMode::Both | JoinTokensMode::Strict if !has_node_unique_token => {
            Ok(Target::PendingMachine)
        }
        // A node-unique token was presented. With no existing Link there is
        // no stored token to validate it against (that happens in
        // `provision`, against `link.spec.node_unique_token`), so only the
        // join token can accept the request here; otherwise it falls back
        // to the PendingMachine flow, same as the no-token case above.
        JoinTokensMode::Both | JoinTokensMode::Strict if join_token_ok || has_existing_link => {
            Ok(Target::Link)
        }
        JoinTokensMode::Both | JoinTokensMode::Strict => Ok(Target::PendingMachine),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TokenUpdateOutcome {
    Accept,
    Reject,
    UuidConflict,
}

/// The node-unique-token update rules for an existing Link whose stored
/// token is non-empty.
fn evaluate_token_update(stored: &str, incoming: &str, force_valid: bool) -> TokenUpdateOutcome {
    if stored == incoming {
        return TokenUpdateOutcome::Accept;
    }
    match (NodeUniqueToken::parse(stored), NodeUniqueToken::parse(incoming)) {
        (Some(stored), Some(incoming)) if stored.same_fingerprint(&incoming) => {
            if force_valid {
                TokenUpdateOutcome::Reject
            } else {
                TokenUpdateOutcome::Accept
            }
        }
        _ => TokenUpdateOutcome::UuidConflict,
    }
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

fn random_host_address(prefix: Ipv6Network) -> Ipv6Network {
    let base = u128::from(prefix.ip());
    let host_bits = 128 - u32::from(prefix.prefix());
    let mask: u128 = if host_bits >= 128 {
        u128::MAX
    } else {
        (1u128 << host_bits) - 1
    };
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    let random = u128::from_be_bytes(bytes) & mask;
    let addr = std::net::Ipv6Addr::from(base | random);
    Ipv6Network::new(addr, 128).expect("single-address network is always valid")
}

#[derive(Clone)]
pub struct ProvisioningService {
    config_store: std::sync::Arc<dyn ObjectStore<SiderolinkConfig>>,
    link_store: std::sync::Arc<dyn ObjectStore<Link>>,
    link_status_store: std::sync::Arc<dyn ObjectStore<LinkStatus>>,
    pending_store: std::sync::Arc<dyn ObjectStore<PendingMachine>>,
    reservation_store: std::sync::Arc<dyn ObjectStore<AddressReservation>>,
    pool: std::sync::Arc<PeerPool>,
    config: GatewayConfig,
}

impl ProvisioningService {
    #[must_use]
    pub fn new(
        config_store: std::sync::Arc<dyn ObjectStore<SiderolinkConfig>>,
        link_store: std::sync::Arc<dyn ObjectStore<Link>>,
        link_status_store: std::sync::Arc<dyn ObjectStore<LinkStatus>>,
        pending_store: std::sync::Arc<dyn ObjectStore<PendingMachine>>,
        reservation_store: std::sync::Arc<dyn ObjectStore<AddressReservation>>,
        pool: std::sync::Arc<PeerPool>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            config_store,
            link_store,
            link_status_store,
            pending_store,
            reservation_store,
            pool,
            config,
        }
    }

    fn join_token_ok(&self, presented: Option<&str>, authoritative: &str) -> bool {
        let dev_token = self.config.dev_join_token();
        match presented {
            Some(token) if token == authoritative => true,
            Some(token) => dev_token.is_some_and(|dev| dev == token),
            None => false,
        }
    }

    /// Picks a pseudo-random address in `prefix`, guaranteed collision-free
    /// by reserving it through the store's create-conflict detection and
    /// retrying with a fresh candidate on collision.
    async fn assign_address(&self, prefix: Ipv6Network) -> Result<Ipv6Network, GatewayError> {
        for _ in 0..MAX_ADDRESS_ATTEMPTS {
            let candidate = random_host_address(prefix);
            match self
                .reservation_store
                .create(
                    Metadata::new(ADDRESS_RESERVATION_NAMESPACE, candidate.to_string()),
                    AddressReservation,
                )
                .await
            {
                Ok(_) => return Ok(candidate),
                Err(err) if err.is_conflict() => continue,
                Err(err) => return Err(GatewayError::from_store(err)),
            }
        }
        Err(GatewayError::AddressSpaceExhausted(prefix, MAX_ADDRESS_ATTEMPTS))
    }

    async fn wait_for_running(&self, node_uuid: &str) -> Result<(), GatewayError> {
        let predicate: Box<dyn Fn(&siderolink_common::Resource<LinkStatus>) -> bool + Send + Sync> =
            Box::new(|resource| resource.spec.phase == LinkStatusPhase::Running);
        match tokio::time::timeout(
            LINK_STATUS_WAIT,
            self.link_status_store.watch_for(PROVISION_NAMESPACE, node_uuid, predicate),
        )
        .await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => Err(GatewayError::from_store(err)),
            Err(_) => Err(GatewayError::FailedPrecondition(format!(
                "timed out waiting for LinkStatus of {node_uuid} to become running"
            ))),
        }
    }

    async fn program_peer(
        &self,
        node_uuid: &str,
        node_public_key: &str,
        node_subnet: Ipv6Network,
        virtual_addr_port: Option<SocketAddr>,
    ) -> Result<(), GatewayError> {
        let owner = OwnerId {
            namespace: PROVISION_NAMESPACE.to_string(),
            kind: Link::KIND,
            id: node_uuid.to_string(),
        };
        self.pool.add(
            SiderolinkSpec {
                key: PeerKey {
                    node_public_key: node_public_key.to_string(),
                    virtual_addr_port,
                },
                node_subnet,
                preshared_key: None,
            },
            owner,
        )?;
        self.link_status_store
            .update(
                Metadata::new(PROVISION_NAMESPACE, node_uuid),
                LinkStatus { phase: LinkStatusPhase::Running },
            )
            .await
            .map_err(GatewayError::from_store)?;
        Ok(())
    }

    async fn release_peer(&self, node_uuid: &str, key: &PeerKey) -> Result<(), GatewayError> {
        let owner = OwnerId {
            namespace: PROVISION_NAMESPACE.to_string(),
            kind: Link::KIND,
            id: node_uuid.to_string(),
        };
        self.pool.remove(key, &owner)
    }

    async fn config(&self) -> Result<siderolink_common::Resource<SiderolinkConfig>, GatewayError> {
        self.config_store
            .get(PROVISION_NAMESPACE, SIDEROLINK_CONFIG_ID)
            .await
            .map_err(GatewayError::from_store)
    }

    /// Implements the five-step enrollment reconciliation: authorize the
    /// request, assign or reuse an address, upsert the Link or
    /// PendingMachine, and program the peer pool before replying.
    pub async fn provision(&self, req: ProvisionRequest) -> Result<ProvisionResponse, GatewayError> {
        let config = self.config().await?;
        let join_token_ok = self.join_token_ok(req.join_token.as_deref(), &config.spec.join_token);
        let version = req.talos_version.as_deref().and_then(|v| Version::parse(v).ok());

        let existing_link = self.link_store.get(PROVISION_NAMESPACE, &req.node_uuid).await.ok();
        let existing_pending =
            self.pending_store.get(PROVISION_NAMESPACE, &req.node_public_key).await.ok();

        let target = authorize(
            self.config.join_tokens_mode,
            version.as_ref(),
            join_token_ok,
            req.node_unique_token.is_some(),
            existing_link.is_some(),
        )?;

        let virtual_addr_port = if req.use_grpc_tunnel {
            Some(self.assign_virtual_address(&config.spec).await?)
        } else {
            None
        };

        // An existing Link's stored node-unique token governs acceptance
        // once one has been presented, overriding the coarse table result.
        // A UUID conflict demotes the Link and responds immediately: the
        // demoted PendingMachine already carries the full body, so falling
        // through to the generic upsert below would double-create it.
        if let (Target::Link, Some(link), Some(incoming)) =
            (target, existing_link.as_ref(), req.node_unique_token.as_deref())
        {
            if let Some(stored) = link.spec.node_unique_token.as_deref().filter(|s| !s.is_empty()) {
                let force_valid = link
                    .meta
                    .annotation(ANNOTATION_FORCE_VALID_NODE_UNIQUE_TOKEN)
                    .is_some();
                match evaluate_token_update(stored, incoming, force_valid) {
                    TokenUpdateOutcome::Accept => {}
                    TokenUpdateOutcome::Reject => {
                        return Err(GatewayError::Unauthorized(
                            "node-unique token fingerprint mismatch with force_valid set"
                                .to_string(),
                        ));
                    }
                    TokenUpdateOutcome::UuidConflict => {
                        let node_subnet = link.spec.node_subnet;
                        self.demote_to_pending(&req, Some(link)).await?;
                        return Ok(self.response(&config.spec, node_subnet, virtual_addr_port));
                    }
                }
            }
        }

        match target {
            Target::Link => {
                let node_subnet = match existing_link.as_ref() {
                    Some(link) => link.spec.node_subnet,
                    None => self.assign_address(config.spec.node_subnet_prefix).await?,
                };
                self.upsert_link(&req, node_subnet, virtual_addr_port, existing_link).await?;
                self.program_peer(&req.node_uuid, &req.node_public_key, node_subnet, virtual_addr_port)
                    .await?;
                self.wait_for_running(&req.node_uuid).await?;
                Ok(self.response(&config.spec, node_subnet, virtual_addr_port))
            }
            Target::PendingMachine => {
                let node_subnet = match existing_pending.as_ref() {
                    Some(pending) => pending.spec.node_subnet,
                    None => self.assign_address(config.spec.node_subnet_prefix).await?,
                };
                self.upsert_pending(&req, node_subnet, virtual_addr_port, existing_pending).await?;
                Ok(self.response(&config.spec, node_subnet, virtual_addr_port))
            }
        }
    }

    async fn assign_virtual_address(&self, config: &SiderolinkConfig) -> Result<SocketAddr, GatewayError> {
        let prefix = config
            .virtual_subnet_prefix
            .ok_or_else(|| GatewayError::FailedPrecondition("virtual gRPC transport is not configured".to_string()))?;
        let net = self.assign_address(prefix).await?;
        Ok(SocketAddr::new(net.ip().into(), 0))
    }

    async fn upsert_link(
        &self,
        req: &ProvisionRequest,
        node_subnet: Ipv6Network,
        virtual_addr_port: Option<SocketAddr>,
        existing: Option<siderolink_common::Resource<Link>>,
    ) -> Result<(), GatewayError> {
        let body = Link {
            node_public_key: req.node_public_key.clone(),
            node_subnet,
            virtual_addr_port,
            last_endpoint: existing.as_ref().and_then(|l| l.spec.last_endpoint),
            connected: true,
            node_unique_token: req.node_unique_token.clone().or_else(|| {
                existing.as_ref().and_then(|l| l.spec.node_unique_token.clone())
            }),
            bytes_sent: existing.as_ref().map_or(0, |l| l.spec.bytes_sent),
            bytes_received: existing.as_ref().map_or(0, |l| l.spec.bytes_received),
            last_alive: Some(Utc::now()),
        };
        match existing {
            Some(existing) => self.retry_update(self.link_store.as_ref(), existing.meta, body).await,
            None => self
                .link_store
                .create(Metadata::new(PROVISION_NAMESPACE, &req.node_uuid), body)
                .await
                .map(|_| ())
                .map_err(GatewayError::from_store),
        }
    }

    async fn upsert_pending(
        &self,
        req: &ProvisionRequest,
        node_subnet: Ipv6Network,
        virtual_addr_port: Option<SocketAddr>,
        existing: Option<siderolink_common::Resource<PendingMachine>>,
    ) -> Result<(), GatewayError> {
        let body = PendingMachine {
            node_subnet,
            virtual_addr_port,
            last_endpoint: existing.as_ref().and_then(|p| p.spec.last_endpoint),
            connected: true,
            last_alive: Some(Utc::now()),
        };
        match existing {
            Some(existing) => self.retry_update(self.pending_store.as_ref(), existing.meta, body).await,
            None => self
                .pending_store
                .create(Metadata::new(PROVISION_NAMESPACE, &req.node_public_key), body)
                .await
                .map(|_| ())
                .map_err(GatewayError::from_store),
        }
    }

    /// One retry on `Conflict` (store version race): re-fetches the current
    /// metadata and applies the update a second time before giving up.
    async fn retry_update<T: siderolink_common::Kind + Clone + Send + Sync + 'static>(
        &self,
        store: &(dyn ObjectStore<T>),
        meta: Metadata,
        body: T,
    ) -> Result<(), GatewayError> {
        match store.update(meta.clone(), body.clone()).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_conflict() => {
                let current = store.get(&meta.namespace, &meta.id).await.map_err(GatewayError::from_store)?;
                store
                    .update(current.meta, body)
                    .await
                    .map(|_| ())
                    .map_err(GatewayError::from_store)
            }
            Err(err) => Err(GatewayError::from_store(err)),
        }
    }

    /// Handles the UUID-collision branch of the node-unique-token update
    /// rules: demote the existing Link to a PendingMachine flagged with
    /// `pending_uuid_conflict`, releasing its peer.
    async fn demote_to_pending(
        &self,
        req: &ProvisionRequest,
        existing_link: Option<&siderolink_common::Resource<Link>>,
    ) -> Result<(), GatewayError> {
        let Some(link) = existing_link else { return Ok(()) };
        self.release_peer(
            &req.node_uuid,
            &PeerKey {
                node_public_key: link.spec.node_public_key.clone(),
                virtual_addr_port: link.spec.virtual_addr_port,
            },
        )
        .await?;
        self.link_store
            .destroy(PROVISION_NAMESPACE, &req.node_uuid)
            .await
            .map_err(GatewayError::from_store)?;
        let meta = Metadata::new(PROVISION_NAMESPACE, &req.node_public_key)
            .with_annotation(ANNOTATION_PENDING_UUID_CONFLICT, "true");
        self.pending_store
            .create(
                meta,
                PendingMachine {
                    node_subnet: link.spec.node_subnet,
                    virtual_addr_port: link.spec.virtual_addr_port,
                    last_endpoint: link.spec.last_endpoint,
                    connected: false,
                    last_alive: link.spec.last_alive,
                },
            )
            .await
            .map(|_| ())
            .map_err(GatewayError::from_store)
    }

    fn response(
        &self,
        config: &SiderolinkConfig,
        node_subnet: Ipv6Network,
        virtual_addr_port: Option<SocketAddr>,
    ) -> ProvisionResponse {
        ProvisionResponse {
            server_endpoints: config.advertised_endpoints.iter().map(SocketAddr::to_string).collect(),
            server_public_key: to_hex(&config.server_public_key),
            node_address_prefix: node_subnet.to_string(),
            server_address: config.server_mesh_address.to_string(),
            grpc_peer_addrport: virtual_addr_port.map(|a| a.to_string()),
        }
    }
}

/// Framing-independent view of a `Provision` call.
#[derive(Clone, Debug)]
pub struct ProvisionRequest {
    pub node_uuid: String,
    pub node_public_key: String,
    pub join_token: Option<String>,
    pub node_unique_token: Option<String>,
    pub talos_version: Option<String>,
    pub use_grpc_tunnel: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProvisionResponse {
    pub server_endpoints: Vec<String>,
    pub server_public_key: String,
    pub node_address_prefix: String,
    pub server_address: String,
    pub grpc_peer_addrport: Option<String>,
}

impl From<siderolink_proto::ProvisionRequest> for ProvisionRequest {
    fn from(value: siderolink_proto::ProvisionRequest) -> Self {
        Self {
            node_uuid: value.node_uuid,
            node_public_key: value.node_public_key,
            join_token: value.join_token,
            node_unique_token: value.node_unique_token,
            talos_version: value.talos_version,
            use_grpc_tunnel: value.use_grpc_tunnel,
        }
    }
}

impl From<ProvisionResponse> for siderolink_proto::ProvisionResponse {
    fn from(value: ProvisionResponse) -> Self {
        Self {
            server_endpoints: value.server_endpoints,
            server_public_key: value.server_public_key,
            node_address_prefix: value.node_address_prefix,
            server_address: value.server_address,
            grpc_peer_addrport: value.grpc_peer_addrport,
        }
    }
}

impl siderolink_proto::provision_service_server::ProvisionService for ProvisioningService {
    async fn provision(
        &self,
        request: Request<siderolink_proto::ProvisionRequest>,
    ) -> Result<Response<siderolink_proto::ProvisionResponse>, Status> {
        let req = ProvisionRequest::from(request.into_inner());
        let response = self.provision(req).await.map_err(Status::from)?;
        Ok(Response::new(response.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_mode_requires_matching_join_token_regardless_of_version() {
        assert_eq!(
            authorize(JoinTokensMode::LegacyOnly, None, true, false, false).unwrap(),
            Target::Link
        );
        assert!(authorize(JoinTokensMode::LegacyOnly, None, false, false, false).is_err());
    }

    #[test]
    fn strict_mode_rejects_nodes_below_the_secure_tokens_version() {
        let old = Version::parse("1.5.0").unwrap();
        let err = authorize(JoinTokensMode::Strict, Some(&old), true, false, false).unwrap_err();
        assert!(matches!(err, GatewayError::FailedPrecondition(msg) if msg.contains("strict")));
    }

    #[test]
    fn both_mode_without_a_node_unique_token_creates_a_pending_machine() {
        let new = Version::parse("1.7.0").unwrap();
        assert_eq!(
            authorize(JoinTokensMode::Both, Some(&new), false, false, false).unwrap(),
            Target::PendingMachine
        );
    }

    #[test]
    fn both_mode_with_a_node_unique_token_but_no_join_token_and_no_existing_link_falls_back_to_pending() {
        let new = Version::parse("1.7.0").unwrap();
        assert_eq!(
            authorize(JoinTokensMode::Both, Some(&new), false, true, false).unwrap(),
            Target::PendingMachine,
            "first contact from a node presenting only a node-unique token has nothing stored to validate it against"
        );
    }

    #[test]
    fn both_mode_with_a_node_unique_token_and_an_existing_link_is_accepted_for_validation() {
        let new = Version::parse("1.7.0").unwrap();
        assert_eq!(
            authorize(JoinTokensMode::Both, Some(&new), false, true, true).unwrap(),
            Target::Link
        );
    }

    #[test]
    fn both_mode_with_a_node_unique_token_and_a_valid_join_token_is_accepted() {
        let new = Version::parse("1.7.0").unwrap();
        assert_eq!(
            authorize(JoinTokensMode::Both, Some(&new), true, true, false).unwrap(),
            Target::Link
        );
    }

    #[test]
    fn identical_token_resubmission_is_accepted() {
        assert_eq!(
            evaluate_token_update("fp.rand-a", "fp.rand-a", true),
            TokenUpdateOutcome::Accept
        );
    }

    #[test]
    fn rotation_with_same_fingerprint_is_accepted_unless_force_valid_is_set() {
        assert_eq!(
            evaluate_token_update("fp.rand-a", "fp.rand-b", false),
            TokenUpdateOutcome::Accept
        );
        assert_eq!(
            evaluate_token_update("fp.rand-a", "fp.rand-b", true),
            TokenUpdateOutcome::Reject
        );
    }

    #[test]
    fn different_fingerprint_is_a_uuid_conflict() {
        assert_eq!(
            evaluate_token_update("fp-a.rand", "fp-b.rand", false),
            TokenUpdateOutcome::UuidConflict
        );
    }

    #[test]
    fn random_host_address_stays_within_the_prefix() {
        let prefix: Ipv6Network = "fd00::/32".parse().unwrap();
        for _ in 0..100 {
            let addr = random_host_address(prefix);
            assert!(prefix.contains(addr.ip()));
        }
    }
}
