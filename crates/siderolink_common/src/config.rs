use std::{net::SocketAddr, time::Duration};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Governs which credentials `Provision` accepts.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, ValueEnum, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[clap(rename_all = "snake_case")]
pub enum JoinTokensMode {
    /// Only the shared config join token is accepted, regardless of node version.
    LegacyOnly,
    /// Both the legacy join token and the newer node-unique-token flow are accepted.
    #[default]
    Both,
    /// Nodes below `SECURE_TOKENS_MIN_VERSION` are rejected outright.
    Strict,
}

pub const SECURE_TOKENS_MIN_VERSION: (u64, u64, u64) = (1, 6, 0);

/// Gateway runtime configuration. Loading this from a config file or
/// environment is out of scope; only the typed surface is specified.
#[derive(Clone, Debug, clap::Parser)]
pub struct GatewayConfig {
    #[arg(long, value_enum, env = "JOIN_TOKENS_MODE", default_value = "both")]
    pub join_tokens_mode: JoinTokensMode,

    #[arg(long, env = "WIREGUARD_BIND_ENDPOINT", default_value = "0.0.0.0:50180")]
    pub wireguard_bind_endpoint: SocketAddr,

    #[arg(long, env = "LOG_SERVER_PORT", default_value_t = 8092)]
    pub log_server_port: u16,

    #[arg(long, env = "PEER_DOWN_INTERVAL_SECS", default_value_t = 120)]
    pub peer_down_interval_secs: u64,

    #[arg(long, env = "STATS_INTERVAL_SECS", default_value_t = 30)]
    pub stats_interval_secs: u64,

    /// Resolved open question: a single switch controlling whether the
    /// stats loop persists `last_endpoint` onto the Link record.
    #[arg(long, env = "EXPOSE_LAST_ENDPOINT", default_value_t = true)]
    pub expose_last_endpoint: bool,

    /// Honoured only in debug builds.
    #[arg(long, env = "SIDEROLINK_DEV_JOIN_TOKEN")]
    pub dev_join_token: Option<String>,
}

impl GatewayConfig {
    #[must_use]
    pub fn peer_down_interval(&self) -> Duration {
        Duration::from_secs(self.peer_down_interval_secs)
    }

    #[must_use]
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    /// Returns the development override token, but only outside release builds.
    #[must_use]
    pub fn dev_join_token(&self) -> Option<&str> {
        if cfg!(debug_assertions) {
            self.dev_join_token.as_deref()
        } else {
            None
        }
    }
}

/// OIDC key-manager / token-store configuration.
#[derive(Clone, Debug, clap::Parser)]
pub struct OidcConfig {
    #[arg(long, env = "OIDC_ROTATION_INTERVAL_DAYS", default_value_t = 30)]
    pub rotation_interval_days: u64,

    #[arg(long, env = "OIDC_MAX_TOKEN_LIFETIME_SECS", default_value_t = 300)]
    pub max_token_lifetime_secs: u64,

    #[arg(long, env = "OIDC_KEY_GEN_BACKOFF_SECS", default_value_t = 10)]
    pub key_gen_backoff_secs: u64,
}

impl OidcConfig {
    #[must_use]
    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_interval_days * 24 * 60 * 60)
    }

    #[must_use]
    pub fn max_token_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_token_lifetime_secs)
    }

    #[must_use]
    pub fn key_gen_backoff(&self) -> Duration {
        Duration::from_secs(self.key_gen_backoff_secs)
    }

    /// The minimum expiration a freshly rotated key must carry.
    #[must_use]
    pub fn min_key_expiration_horizon(&self) -> Duration {
        2 * self.rotation_interval() + self.max_token_lifetime()
    }
}
