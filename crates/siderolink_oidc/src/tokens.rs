//! In-memory access-token storage and the userinfo/introspection/revocation
//! operations the OIDC HTTP layer calls into.

use std::{collections::HashMap, sync::Mutex};

use chrono::Utc;
use siderolink_common::resource::Timestamp;
use uuid::Uuid;

use crate::{claims::{ClaimsBuilder, UserInfo}, error::OidcError};

#[derive(Clone, Debug)]
pub struct CreateTokenRequest {
    pub client_id: String,
    pub subject: String,
    pub audience: Vec<String>,
    pub scopes: Vec<String>,
}

#[derive(Clone, Debug)]
struct TokenRecord {
    client_id: String,
    subject: String,
    audience: Vec<String>,
    scopes: Vec<String>,
    expiration: Timestamp,
}

impl TokenRecord {
    fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expiration
    }
}

#[derive(Clone, Debug, Default)]
pub struct IntrospectionResult {
    pub active: bool,
    pub subject: Option<String>,
    pub client_id: Option<String>,
    pub scopes: Vec<String>,
}

pub struct TokenStore {
    tokens: Mutex<HashMap<String, TokenRecord>>,
    lifetime: std::time::Duration,
    claims: ClaimsBuilder,
}

impl TokenStore {
    #[must_use]
    pub fn new(lifetime: std::time::Duration, claims: ClaimsBuilder) -> Self {
        Self { tokens: Mutex::new(HashMap::new()), lifetime, claims }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, TokenRecord>> {
        self.tokens.lock().expect("token store lock poisoned")
    }

    /// Issues a fresh access token, returning its id and expiration.
    pub fn create_access_token(&self, request: CreateTokenRequest) -> (String, Timestamp) {
        let id = Uuid::new_v4().to_string();
        let expiration = Utc::now() + self.lifetime;
        self.lock().insert(
            id.clone(),
            TokenRecord {
                client_id: request.client_id,
                subject: request.subject,
                audience: request.audience,
                scopes: request.scopes,
                expiration,
            },
        );
        (id, expiration)
    }

    /// Assembles userinfo directly from a set of scopes, independent of any
    /// stored token (used by flows that already know the grant's scopes).
    pub async fn userinfo_from_scopes(&self, user_id: &str, scopes: &[String]) -> UserInfo {
        self.claims.assemble(user_id, scopes).await
    }

    /// Assembles userinfo from a stored token, rejecting it if unknown or expired.
    pub async fn userinfo_from_token(&self, token_id: &str) -> Result<UserInfo, OidcError> {
        let record = {
            let tokens = self.lock();
            let record = tokens.get(token_id).ok_or(OidcError::InvalidToken)?;
            if record.is_expired(Utc::now()) {
                return Err(OidcError::InvalidToken);
            }
            record.clone()
        };
        Ok(self.claims.assemble(&record.subject, &record.scopes).await)
    }

    /// Introspects a stored token, additionally requiring `client_id` be
    /// within the token's audience.
    pub fn introspect_from_token(&self, token_id: &str, client_id: &str) -> Result<IntrospectionResult, OidcError> {
        let tokens = self.lock();
        let Some(record) = tokens.get(token_id) else {
            return Ok(IntrospectionResult::default());
        };
        if record.is_expired(Utc::now()) {
            return Ok(IntrospectionResult::default());
        }
        if !record.audience.iter().any(|aud| aud == client_id) {
            return Err(OidcError::InvalidClient);
        }
        Ok(IntrospectionResult {
            active: true,
            subject: Some(record.subject.clone()),
            client_id: Some(record.client_id.clone()),
            scopes: record.scopes.clone(),
        })
    }

    /// Revokes `token_id`. Succeeds silently if unknown; rejects if it was
    /// issued to a different client.
    pub fn revoke_token(&self, token_id: &str, client_id: &str) -> Result<(), OidcError> {
        let mut tokens = self.lock();
        let Some(record) = tokens.get(token_id) else {
            return Ok(());
        };
        if record.client_id != client_id {
            return Err(OidcError::InvalidClient);
        }
        tokens.remove(token_id);
        Ok(())
    }

    /// Deletes the first token matching `(user_id, client_id)`, if any.
    pub fn terminate_session(&self, user_id: &str, client_id: &str) {
        let mut tokens = self.lock();
        if let Some(id) = tokens
            .iter()
            .find(|(_, record)| record.subject == user_id && record.client_id == client_id)
            .map(|(id, _)| id.clone())
        {
            tokens.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use siderolink_common::{model::{AccessPolicy, Identity}, store::memory::InMemoryStore};
    use std::sync::Arc;

    fn store() -> TokenStore {
        let identities: Arc<InMemoryStore<Identity>> = Arc::new(InMemoryStore::new());
        let policies: Arc<InMemoryStore<AccessPolicy>> = Arc::new(InMemoryStore::new());
        TokenStore::new(std::time::Duration::from_secs(300), ClaimsBuilder::new(identities, policies))
    }

    fn request() -> CreateTokenRequest {
        CreateTokenRequest {
            client_id: "client-a".to_string(),
            subject: "alice".to_string(),
            audience: vec!["client-a".to_string()],
            scopes: vec!["openid".to_string()],
        }
    }

    #[tokio::test]
    async fn a_freshly_issued_token_validates_via_userinfo() {
        let store = store();
        let (id, _expiration) = store.create_access_token(request());
        let info = store.userinfo_from_token(&id).await.unwrap();
        assert_eq!(info.subject.as_deref(), Some("alice"));
    }

    #[test]
    fn unknown_token_is_rejected() {
        let store = store();
        assert!(store.introspect_from_token("missing", "client-a").is_ok());
        assert!(!store.introspect_from_token("missing", "client-a").unwrap().active);
    }

    #[test]
    fn introspection_requires_the_client_be_in_the_audience() {
        let store = store();
        let (id, _) = store.create_access_token(request());
        assert!(matches!(store.introspect_from_token(&id, "other-client"), Err(OidcError::InvalidClient)));
    }

    #[test]
    fn revoking_with_the_wrong_client_is_rejected_unknown_tokens_are_silent() {
        let store = store();
        let (id, _) = store.create_access_token(request());
        assert!(matches!(store.revoke_token(&id, "other-client"), Err(OidcError::InvalidClient)));
        assert!(store.revoke_token("missing", "client-a").is_ok());
        assert!(store.revoke_token(&id, "client-a").is_ok());
    }

    #[test]
    fn terminate_session_removes_one_matching_token() {
        let store = store();
        let (id, _) = store.create_access_token(request());
        store.terminate_session("alice", "client-a");
        assert!(matches!(store.introspect_from_token(&id, "client-a"), Ok(IntrospectionResult { active: false, .. })));
    }
}
