//! RSA signing-key rotation with overlap: the active set always retains
//! every key that could still validate a token issued before its rotation.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::Utc;
use jsonwebtoken::EncodingKey;
use rsa::{RsaPrivateKey, pkcs1::EncodeRsaPrivateKey, pkcs8::EncodePublicKey};
use siderolink_common::{
    LabelQuery, Metadata, ObjectStore,
    config::OidcConfig,
    model::JwtPublicKey,
    resource::Timestamp,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::OidcError;

const RSA_KEY_BITS: usize = 2048;
const KEY_NAMESPACE: &str = "default";
const KEY_GEN_BACKOFF_ON_ERROR: Duration = Duration::from_secs(10);

/// Material needed to sign a token with the current key.
#[derive(Clone)]
pub struct SigningMaterial {
    pub key_id: Uuid,
    pub encoding_key: Arc<EncodingKey>,
}

/// A consistent, point-in-time view of the active key set.
#[derive(Clone, Default)]
pub struct KeySetSnapshot {
    /// Public key DER, keyed by key id, for every still-valid key.
    pub keys: HashMap<Uuid, Vec<u8>>,
    pub current_signing_key: Option<Uuid>,
}

struct State {
    snapshot: KeySetSnapshot,
    signing: Option<SigningMaterial>,
}

/// Rotates an RSA-2048 signing key every `rotation_interval`, keeping prior
/// keys active until any token they signed could no longer be valid.
pub struct KeyManager {
    store: Arc<dyn ObjectStore<JwtPublicKey>>,
    config: OidcConfig,
    state: std::sync::Mutex<State>,
    signing_tx: watch::Sender<Option<SigningMaterial>>,
}

impl KeyManager {
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore<JwtPublicKey>>, config: OidcConfig) -> Self {
        let (signing_tx, _) = watch::channel(None);
        Self {
            store,
            config,
            state: std::sync::Mutex::new(State { snapshot: KeySetSnapshot::default(), signing: None }),
            signing_tx,
        }
    }

    /// A consistent snapshot of every currently-active public key.
    #[must_use]
    pub fn key_set(&self) -> KeySetSnapshot {
        self.state.lock().expect("key manager lock poisoned").snapshot.clone()
    }

    /// The key currently used to sign new tokens, if rotation has run once.
    #[must_use]
    pub fn current_signing_key(&self) -> Option<SigningMaterial> {
        self.state.lock().expect("key manager lock poisoned").signing.clone()
    }

    /// Subscribes to be notified every time rotation produces a new signing key.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<SigningMaterial>> {
        self.signing_tx.subscribe()
    }

    /// Rotates on boot and thereafter every `rotation_interval`. Never
    /// returns on error: generation/store failures back off 10 s and retry.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), OidcError> {
        loop {
            match self.rotate().await {
                Ok(()) => {
                    tokio::select! {
                        () = cancel.cancelled() => return Ok(()),
                        () = tokio::time::sleep(self.config.rotation_interval()) => {}
                    }
                }
                Err(err) => {
                    error!(%err, "key rotation failed, retrying after backoff");
                    tokio::select! {
                        () = cancel.cancelled() => return Ok(()),
                        () = tokio::time::sleep(KEY_GEN_BACKOFF_ON_ERROR) => {}
                    }
                }
            }
        }
    }

    async fn rotate(&self) -> Result<(), OidcError> {
        let key_id = Uuid::new_v4();
        let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), RSA_KEY_BITS)
            .map_err(|err| OidcError::KeyGeneration(err.to_string()))?;
        let public_der = private_key
            .to_public_key()
            .to_public_key_der()
            .map_err(|err| OidcError::KeyGeneration(err.to_string()))?
            .into_vec();
        let private_der = private_key
            .to_pkcs1_der()
            .map_err(|err| OidcError::KeyGeneration(err.to_string()))?
            .to_bytes()
            .to_vec();

        let expiration: Timestamp = Utc::now() + self.config.min_key_expiration_horizon();
        self.store
            .create(
                Metadata::new(KEY_NAMESPACE, key_id.to_string()),
                JwtPublicKey { der: public_der.clone(), expiration },
            )
            .await?;

        let all = self.store.list(KEY_NAMESPACE, LabelQuery::default()).await?;
        let now = Utc::now();
        let mut keys = HashMap::new();
        for resource in all {
            if resource.spec.expiration < now {
                let _ = self.store.destroy(KEY_NAMESPACE, &resource.meta.id).await;
                continue;
            }
            if let Ok(id) = Uuid::parse_str(&resource.meta.id) {
                keys.insert(id, resource.spec.der);
            }
        }
        keys.insert(key_id, public_der);

        let signing = SigningMaterial {
            key_id,
            encoding_key: Arc::new(EncodingKey::from_rsa_der(&private_der)),
        };

        let mut state = self.state.lock().expect("key manager lock poisoned");
        state.snapshot = KeySetSnapshot { keys, current_signing_key: Some(key_id) };
        state.signing = Some(signing.clone());
        drop(state);

        let _ = self.signing_tx.send(Some(signing));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use siderolink_common::store::memory::InMemoryStore;

    fn config() -> OidcConfig {
        OidcConfig { rotation_interval_days: 30, max_token_lifetime_secs: 300, key_gen_backoff_secs: 10 }
    }

    #[tokio::test]
    async fn rotation_keeps_the_previous_key_active_alongside_the_new_one() {
        let store: Arc<InMemoryStore<JwtPublicKey>> = Arc::new(InMemoryStore::new());
        let manager = KeyManager::new(store, config());

        manager.rotate().await.unwrap();
        let first = manager.key_set().current_signing_key.unwrap();

        manager.rotate().await.unwrap();
        let snapshot = manager.key_set();
        let second = snapshot.current_signing_key.unwrap();

        assert_ne!(first, second);
        assert!(snapshot.keys.contains_key(&first), "previous key must still be active");
        assert!(snapshot.keys.contains_key(&second));
        assert_eq!(manager.current_signing_key().unwrap().key_id, second);
    }
}
