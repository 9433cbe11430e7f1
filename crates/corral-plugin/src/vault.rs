use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chrono::Utc;
use corral_store::{DocumentStore, PluginBlob, StoreOps};
use rand::RngCore;
use serde_json::Value;
use tracing::debug;

use crate::error::PluginError;

const PBKDF2_ROUNDS: u32 = 100_000;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
pub const DEFAULT_QUOTA_BYTES: u64 = 100 * 1024 * 1024;

/// Encrypted per-plugin configuration storage.
///
/// Every write derives a fresh data key (PBKDF2-SHA256 over the configured
/// secret with a random salt) and seals the serialized config with
/// AES-256-GCM under a random nonce. The quota is enforced on the plaintext
/// before anything is persisted.
pub struct ConfigVault {
    store: Arc<dyn DocumentStore>,
    secret: String,
    quota_bytes: u64,
}

impl ConfigVault {
    pub fn new(store: Arc<dyn DocumentStore>, secret: impl Into<String>, quota_bytes: u64) -> Self {
        Self { store, secret: secret.into(), quota_bytes }
    }

    pub async fn get(&self, plugin_id: &str) -> Result<Option<Value>, PluginError> {
        let Some(blob) = self.store.get_plugin_blob(plugin_id).await? else {
            return Ok(None);
        };
        let salt = B64
            .decode(&blob.salt)
            .map_err(|e| PluginError::Crypto(format!("bad salt encoding: {e}")))?;
        let nonce = B64
            .decode(&blob.nonce)
            .map_err(|e| PluginError::Crypto(format!("bad nonce encoding: {e}")))?;
        let ciphertext = B64
            .decode(&blob.ciphertext)
            .map_err(|e| PluginError::Crypto(format!("bad ciphertext encoding: {e}")))?;
        if nonce.len() != NONCE_LEN {
            return Err(PluginError::Crypto("bad nonce length".to_string()));
        }

        let key = self.derive_key(&salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| PluginError::Crypto("config decryption failed".to_string()))?;
        Ok(Some(serde_json::from_slice(&plaintext)?))
    }

    pub async fn set(&self, plugin_id: &str, config: &Value) -> Result<(), PluginError> {
        let plaintext = serde_json::to_vec(config)?;
        if plaintext.len() as u64 > self.quota_bytes {
            return Err(PluginError::QuotaExceeded {
                size: plaintext.len() as u64,
                quota: self.quota_bytes,
            });
        }

        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut nonce);

        let key = self.derive_key(&salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|_| PluginError::Crypto("config encryption failed".to_string()))?;

        let blob = PluginBlob {
            plugin_id: plugin_id.to_string(),
            salt: B64.encode(salt),
            nonce: B64.encode(nonce),
            ciphertext: B64.encode(ciphertext),
            updated_at: Utc::now(),
        };
        self.store.put_plugin_blob(&blob).await?;
        debug!(plugin_id, bytes = plaintext.len(), "plugin config sealed");
        Ok(())
    }

    fn derive_key(&self, salt: &[u8]) -> [u8; 32] {
        let mut key = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<sha2::Sha256>(self.secret.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_store::MemoryStore;
    use serde_json::json;

    fn vault(quota: u64) -> (Arc<dyn DocumentStore>, ConfigVault) {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let vault = ConfigVault::new(Arc::clone(&store), "vault-secret", quota);
        (store, vault)
    }

    #[tokio::test]
    async fn round_trips_config() {
        let (_store, vault) = vault(DEFAULT_QUOTA_BYTES);
        let cfg = json!({"poll_interval_ms": 250, "targets": ["a", "b"]});
        vault.set("plugin-a", &cfg).await.unwrap();
        assert_eq!(vault.get("plugin-a").await.unwrap(), Some(cfg));
        assert_eq!(vault.get("plugin-b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn ciphertext_is_salted_per_write() {
        let (store, vault) = vault(DEFAULT_QUOTA_BYTES);
        let cfg = json!({"k": "v"});
        vault.set("p", &cfg).await.unwrap();
        let first = store.get_plugin_blob("p").await.unwrap().unwrap();
        vault.set("p", &cfg).await.unwrap();
        let second = store.get_plugin_blob("p").await.unwrap().unwrap();
        assert_ne!(first.salt, second.salt);
        assert_ne!(first.ciphertext, second.ciphertext);
    }

    #[tokio::test]
    async fn quota_is_enforced_before_persisting() {
        let (store, vault) = vault(16);
        let cfg = json!({"blob": "x".repeat(64)});
        let err = vault.set("p", &cfg).await.unwrap_err();
        assert!(matches!(err, PluginError::QuotaExceeded { .. }));
        assert!(store.get_plugin_blob("p").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn wrong_secret_fails_decryption() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let writer = ConfigVault::new(Arc::clone(&store), "secret-a", DEFAULT_QUOTA_BYTES);
        writer.set("p", &json!({"k": 1})).await.unwrap();

        let reader = ConfigVault::new(Arc::clone(&store), "secret-b", DEFAULT_QUOTA_BYTES);
        assert!(matches!(
            reader.get("p").await.unwrap_err(),
            PluginError::Crypto(_)
        ));
    }
}
