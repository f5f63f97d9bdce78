//! BYOK Key Bridge (`spec.md` §4.7.a).
//!
//! Resolves a workspace's active provider key, decrypting it only for the
//! duration of the call. The plaintext is never logged and never returned
//! in a serializable response type — callers consume it and drop it.

use crate::crypto::{decrypt_parts, CryptoError, EncryptionKey};
use crate::store::{Store, StoreError};
use crate::types::SecretProvider;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum ByokError {
    #[error("no active {0:?} key configured for this workspace")]
    Forbidden(SecretProvider),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("decryption failed: {0}")]
    Crypto(#[from] CryptoError),
}

pub struct KeyBridge {
    store: Arc<Store>,
    key: EncryptionKey,
}

impl KeyBridge {
    pub fn new(store: Arc<Store>, key: EncryptionKey) -> Self {
        Self { store, key }
    }

    /// Returns the decrypted key material. `ByokError::Forbidden` if the
    /// workspace has no active key for `provider`.
    pub async fn resolve(&self, workspace_id: &str, provider: SecretProvider) -> Result<String, ByokError> {
        let secret = self
            .store
            .find_active_secret(workspace_id, provider)
            .await?
            .ok_or(ByokError::Forbidden(provider))?;
        let plaintext = decrypt_parts(&self.key, &secret.encryption_iv, &secret.encrypted_key)?;
        self.store.touch_secret_last_used(secret.id).await?;
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::encrypt_parts;
    use crate::types::Secret;
    use chrono::Utc;
    use uuid::Uuid;

    #[tokio::test]
    async fn resolves_active_key_and_touches_last_used() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let key = EncryptionKey::generate().unwrap();
        let (iv, ct) = encrypt_parts(&key, "sk-ant-workspace-key").unwrap();
        let now = Utc::now();
        store
            .save_secret(Secret {
                id: Uuid::new_v4(),
                workspace_id: "W1".to_string(),
                key_name: "primary".to_string(),
                provider: SecretProvider::Anthropic,
                encrypted_key: ct,
                encryption_iv: iv,
                created_by_user_id: Uuid::new_v4(),
                created_at: now,
                updated_at: now,
                last_used_at: None,
                is_active: true,
            })
            .await
            .unwrap();

        let bridge = KeyBridge::new(store, key);
        let resolved = bridge.resolve("W1", SecretProvider::Anthropic).await.unwrap();
        assert_eq!(resolved, "sk-ant-workspace-key");
    }

    #[tokio::test]
    async fn missing_key_is_forbidden() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let bridge = KeyBridge::new(store, EncryptionKey::generate().unwrap());
        let err = bridge.resolve("W1", SecretProvider::Anthropic).await;
        assert!(matches!(err, Err(ByokError::Forbidden(_))));
    }
}
