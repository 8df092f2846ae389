use siderolink_common::StoreError;
use thiserror::Error;
use tonic::{Code, Status};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("peer event channel closed")]
    PeerEventChannelClosed,
    #[error("no address available in subnet {0} after {1} attempts")]
    AddressSpaceExhausted(ipnetwork::Ipv6Network, u32),
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Maps a store error onto the recovery the caller should apply:
    /// conflicts are retried once by the caller, not-found/phase-conflict are
    /// swallowed by long-running loops, everything else is `internal`.
    #[must_use]
    pub fn from_store(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl From<GatewayError> for Status {
    fn from(value: GatewayError) -> Self {
        match value {
            GatewayError::Unauthorized(msg) => Self::new(Code::PermissionDenied, msg),
            GatewayError::FailedPrecondition(msg) => Self::new(Code::FailedPrecondition, msg),
            GatewayError::Store(ref err) if err.is_conflict() => {
                Self::new(Code::Aborted, err.to_string())
            }
            GatewayError::Store(ref err) if err.is_not_found() => {
                Self::new(Code::NotFound, err.to_string())
            }
            other => Self::new(Code::Internal, other.to_string()),
        }
    }
}
