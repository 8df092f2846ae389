//! Typed bodies for every resource kind the gateway and OIDC subsystems
//! read or write through the object store.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::resource::{Kind, Timestamp};

/// Singleton holding the server's own identity and enrollment policy.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct SiderolinkConfig {
    pub server_private_key: [u8; 32],
    pub server_public_key: [u8; 32],
    pub server_mesh_address: std::net::Ipv6Addr,
    pub node_subnet_prefix: ipnetwork::Ipv6Network,
    pub virtual_subnet_prefix: Option<ipnetwork::Ipv6Network>,
    pub wireguard_bind_endpoint: SocketAddr,
    pub advertised_endpoints: Vec<SocketAddr>,
    pub join_token: String,
}

impl Kind for SiderolinkConfig {
    const KIND: &'static str = "SiderolinkConfig";
}

pub const SIDEROLINK_CONFIG_ID: &str = "singleton";

/// One per enrolled node. Id = node UUID.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Link {
    pub node_public_key: String,
    pub node_subnet: ipnetwork::Ipv6Network,
    pub virtual_addr_port: Option<SocketAddr>,
    pub last_endpoint: Option<SocketAddr>,
    pub connected: bool,
    pub node_unique_token: Option<String>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub last_alive: Option<Timestamp>,
}

impl Kind for Link {
    const KIND: &'static str = "Link";
}

/// Derived readiness resource: flips to `running` once the peer pool has
/// actually programmed the corresponding peer on the WireGuard device.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum LinkStatusPhase {
    Pending,
    Running,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct LinkStatus {
    pub phase: LinkStatusPhase,
}

impl Kind for LinkStatus {
    const KIND: &'static str = "LinkStatus";
}

/// Transient shadow of a Link for nodes that have not yet presented a
/// node-unique token. Id = node public key.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct PendingMachine {
    pub node_subnet: ipnetwork::Ipv6Network,
    pub virtual_addr_port: Option<SocketAddr>,
    pub last_endpoint: Option<SocketAddr>,
    pub connected: bool,
    pub last_alive: Option<Timestamp>,
}

impl Kind for PendingMachine {
    const KIND: &'static str = "PendingMachine";
}

/// Derived resource exposing the join arguments (kernel command line) to clients.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ConnectionParams {
    pub kernel_args: Vec<String>,
}

impl Kind for ConnectionParams {
    const KIND: &'static str = "ConnectionParams";
}

pub const CONNECTION_PARAMS_ID: &str = "singleton";

/// One per historical OIDC signing key.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct JwtPublicKey {
    pub der: Vec<u8>,
    pub expiration: Timestamp,
}

impl Kind for JwtPublicKey {
    const KIND: &'static str = "JWTPublicKey";
}

/// A user's role, used by OIDC claims assembly to decide default
/// impersonation groups. Id = user id.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Operator,
    Member,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Identity {
    pub role: Role,
}

impl Kind for Identity {
    const KIND: &'static str = "Identity";
}

/// One rule of the declarative access policy: grants `groups` to `user` for
/// `cluster`. Either field may be `"*"` to match any value.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct AccessPolicyRule {
    pub user: String,
    pub cluster: String,
    pub groups: Vec<String>,
}

/// Singleton holding every access-policy rule.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct AccessPolicy {
    pub rules: Vec<AccessPolicyRule>,
}

impl Kind for AccessPolicy {
    const KIND: &'static str = "AccessPolicy";
}

pub const ACCESS_POLICY_ID: &str = "singleton";

/// A user's impersonation group granted implicitly by the operator role.
pub const OPERATOR_DEFAULT_GROUP: &str = "system:masters";

/// A machine's last known telemetry snapshot, keyed by machine id and
/// written by the event sink.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct MachineStatusSnapshot {
    pub stage: String,
    pub last_event_at: Timestamp,
}

impl Kind for MachineStatusSnapshot {
    const KIND: &'static str = "MachineStatusSnapshot";
}

/// Minimal view of a cluster-joined machine, used by the log sink's
/// address-resolution cache to map `machine_address_label` to an id.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Machine {
    pub address: std::net::IpAddr,
}

impl Kind for Machine {
    const KIND: &'static str = "Machine";
}

pub const MACHINE_ADDRESS_LABEL: &str = "machine_address";

/// Internal bookkeeping resource, not part of the specified data model:
/// its sole purpose is to get atomic, collision-free address assignment
/// out of the store's create-conflict detection, keyed by the
/// candidate address itself rather than by node identity.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct AddressReservation;

impl Kind for AddressReservation {
    const KIND: &'static str = "AddressReservation";
}

pub const ADDRESS_RESERVATION_NAMESPACE: &str = "address-reservations";

/// Annotation set on a Link once Talos has been installed; once present the
/// stored node-unique token must match exactly rather than by fingerprint.
pub const ANNOTATION_FORCE_VALID_NODE_UNIQUE_TOKEN: &str = "force_valid_node_unique_token";

/// Annotation set on a demoted PendingMachine when a node-unique-token
/// fingerprint mismatch indicates a UUID collision.
pub const ANNOTATION_PENDING_UUID_CONFLICT: &str = "pending_uuid_conflict";
