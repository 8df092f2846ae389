use siderolink_common::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OidcError {
    #[error("unknown or expired token")]
    InvalidToken,
    #[error("invalid_client")]
    InvalidClient,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("key generation failed: {0}")]
    KeyGeneration(String),
}
