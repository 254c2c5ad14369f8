//! Vendor master credentials: sealed at rest with AES-256-GCM, opened per
//! request through a short-lived cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use aes_gcm::{Aes256Gcm, Nonce};
use aes_gcm::aead::{Aead, KeyInit};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use sha2::Digest as _;
use thiserror::Error;

use super::GatewayError;
use super::store::GatewayStore;
use crate::providers::{Credential, ProviderKind};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("encryption secret is empty")]
    EmptySecret,
    #[error("sealed credential is not valid base64")]
    Encoding,
    #[error("sealed credential is too short")]
    Truncated,
    #[error("credential could not be decrypted (wrong key or tampered data)")]
    Decrypt,
    #[error("credential encryption failed")]
    Encrypt,
    #[error("random nonce unavailable")]
    Nonce,
    #[error("decrypted credential is not utf-8")]
    Utf8,
}

/// Seals and opens credentials as `base64(nonce || ciphertext || tag)`. The
/// AES key is the SHA-256 of the configured secret.
#[derive(Clone)]
pub struct CredentialVault {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CredentialVault(<redacted>)")
    }
}

impl CredentialVault {
    pub fn from_secret(secret: &str) -> Result<Self, CredentialError> {
        if secret.trim().is_empty() {
            return Err(CredentialError::EmptySecret);
        }
        let key: [u8; 32] = sha2::Sha256::digest(secret.as_bytes()).into();
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CredentialError::EmptySecret)?;
        Ok(Self { cipher })
    }

    pub fn seal(&self, plaintext: &str) -> Result<String, CredentialError> {
        let mut nonce = [0u8; NONCE_LEN];
        getrandom::fill(&mut nonce).map_err(|_| CredentialError::Nonce)?;
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| CredentialError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(out))
    }

    pub fn open(&self, sealed: &str) -> Result<String, CredentialError> {
        let raw = STANDARD
            .decode(sealed.trim())
            .map_err(|_| CredentialError::Encoding)?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(CredentialError::Truncated);
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CredentialError::Decrypt)?;
        String::from_utf8(plaintext).map_err(|_| CredentialError::Utf8)
    }
}

#[derive(Clone)]
struct CacheEntry {
    credential: Credential,
    expires_at_ms: i64,
}

/// Decrypted credentials keyed by provider, each kept for `ttl_ms`. Rotating
/// a credential must be followed by `invalidate`.
pub struct CredentialCache {
    vault: CredentialVault,
    store: Arc<dyn GatewayStore>,
    ttl_ms: i64,
    entries: Mutex<HashMap<ProviderKind, CacheEntry>>,
}

impl std::fmt::Debug for CredentialCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCache")
            .field("ttl_ms", &self.ttl_ms)
            .finish_non_exhaustive()
    }
}

impl CredentialCache {
    pub fn new(vault: CredentialVault, store: Arc<dyn GatewayStore>, ttl_seconds: u64) -> Self {
        Self {
            vault,
            store,
            ttl_ms: i64::try_from(ttl_seconds)
                .unwrap_or(i64::MAX / 1_000)
                .saturating_mul(1_000),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn vault(&self) -> &CredentialVault {
        &self.vault
    }

    /// The active credential for `provider`, or `None` when none is
    /// configured or it cannot be opened.
    pub async fn resolve(
        &self,
        provider: ProviderKind,
        now_ms: i64,
    ) -> Result<Option<Credential>, GatewayError> {
        if let Some(credential) = self.cached(provider, now_ms) {
            return Ok(Some(credential));
        }

        let Some(sealed) = self.store.provider_credential(provider.as_str()).await? else {
            return Ok(None);
        };
        let credential = match self.vault.open(&sealed) {
            Ok(secret) => Credential::new(secret),
            Err(err) => {
                tracing::error!(provider = %provider, error = %err, "failed to open provider credential");
                return Ok(None);
            }
        };

        if self.ttl_ms > 0 {
            if let Ok(mut entries) = self.entries.lock() {
                entries.insert(
                    provider,
                    CacheEntry {
                        credential: credential.clone(),
                        expires_at_ms: now_ms.saturating_add(self.ttl_ms),
                    },
                );
            }
        }
        Ok(Some(credential))
    }

    pub fn invalidate(&self, provider: ProviderKind) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(&provider);
        }
    }

    fn cached(&self, provider: ProviderKind, now_ms: i64) -> Option<Credential> {
        let mut entries = self.entries.lock().ok()?;
        let entry = entries.get(&provider)?;
        if now_ms >= entry.expires_at_ms {
            entries.remove(&provider);
            return None;
        }
        Some(entry.credential.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_then_open_recovers_the_secret() {
        let vault = CredentialVault::from_secret("master secret").expect("vault");
        let sealed = vault.seal("sk-live-abc").expect("seal");
        assert!(!sealed.contains("sk-live-abc"));
        assert_eq!(vault.open(&sealed).expect("open"), "sk-live-abc");
        assert_ne!(sealed, vault.seal("sk-live-abc").expect("second seal"));
    }

    #[test]
    fn wrong_key_and_tampering_are_detected() {
        let vault = CredentialVault::from_secret("one").expect("vault");
        let other = CredentialVault::from_secret("two").expect("vault");
        let sealed = vault.seal("sk-live-abc").expect("seal");
        assert_eq!(other.open(&sealed), Err(CredentialError::Decrypt));

        let mut raw = STANDARD.decode(&sealed).expect("base64");
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        assert_eq!(
            vault.open(&STANDARD.encode(raw)),
            Err(CredentialError::Decrypt)
        );
        assert_eq!(vault.open("AAAA"), Err(CredentialError::Truncated));
        assert_eq!(vault.open("%%%"), Err(CredentialError::Encoding));
    }

    #[test]
    fn empty_secret_is_rejected() {
        assert!(matches!(
            CredentialVault::from_secret("  "),
            Err(CredentialError::EmptySecret)
        ));
    }

    #[cfg(feature = "store-sqlite")]
    #[tokio::test]
    async fn cache_serves_until_ttl_or_invalidation() {
        use crate::gateway::sqlite_store::SqliteStore;

        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("creds.sqlite"));
        let vault = CredentialVault::from_secret("master").expect("vault");
        store
            .upsert_provider_credential("openai", &vault.seal("sk-one").expect("seal"), true)
            .await
            .expect("upsert");

        let cache = CredentialCache::new(vault.clone(), Arc::new(store.clone()), 60);
        let first = cache.resolve(ProviderKind::OpenAi, 0).await.expect("resolve");
        assert_eq!(first.as_ref().map(Credential::expose), Some("sk-one"));

        store
            .upsert_provider_credential("openai", &vault.seal("sk-two").expect("seal"), true)
            .await
            .expect("rotate");
        let cached = cache.resolve(ProviderKind::OpenAi, 1_000).await.expect("cached");
        assert_eq!(cached.as_ref().map(Credential::expose), Some("sk-one"));

        cache.invalidate(ProviderKind::OpenAi);
        let fresh = cache.resolve(ProviderKind::OpenAi, 2_000).await.expect("fresh");
        assert_eq!(fresh.as_ref().map(Credential::expose), Some("sk-two"));

        assert!(cache.resolve(ProviderKind::Google, 0).await.expect("none").is_none());
    }

    #[cfg(feature = "store-sqlite")]
    #[tokio::test]
    async fn undecryptable_credential_is_treated_as_unconfigured() {
        use crate::gateway::sqlite_store::SqliteStore;

        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("creds.sqlite"));
        let sealed = CredentialVault::from_secret("old")
            .expect("vault")
            .seal("sk-one")
            .expect("seal");
        store
            .upsert_provider_credential("anthropic", &sealed, true)
            .await
            .expect("upsert");

        let cache = CredentialCache::new(
            CredentialVault::from_secret("new").expect("vault"),
            Arc::new(store),
            60,
        );
        assert!(
            cache
                .resolve(ProviderKind::Anthropic, 0)
                .await
                .expect("resolve")
                .is_none()
        );
    }
}
