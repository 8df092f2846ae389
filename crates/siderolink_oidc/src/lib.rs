//! OIDC signing-key rotation and token storage: short-lived Kubernetes
//! impersonation credentials issued against the same object store the
//! gateway uses.

#[macro_use]
extern crate tracing;

pub mod claims;
pub mod error;
pub mod keys;
pub mod tokens;

pub use claims::{ClaimsBuilder, UserInfo, is_recognized_scope};
pub use error::OidcError;
pub use keys::{KeyManager, KeySetSnapshot, SigningMaterial};
pub use tokens::{CreateTokenRequest, IntrospectionResult, TokenStore};
