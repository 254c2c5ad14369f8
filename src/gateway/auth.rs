use std::sync::Arc;

use sha2::Digest as _;

use super::GatewayError;
use super::store::GatewayStore;

pub const API_KEY_PREFIX: &str = "vz-";
pub const KEY_PREFIX_LEN: usize = 8;

/// Identity attached to an admitted request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: String,
    pub api_key_id: String,
    /// First 8 characters of the key; the rate-limit scope.
    pub key_prefix: String,
    pub rate_limit_rpm: Option<u32>,
}

#[derive(Clone)]
pub struct Authenticator {
    store: Arc<dyn GatewayStore>,
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator").finish_non_exhaustive()
    }
}

impl Authenticator {
    pub fn new(store: Arc<dyn GatewayStore>) -> Self {
        Self { store }
    }

    /// Resolves a bearer token to its key and user. Every rejection reads the
    /// same to the caller.
    pub async fn authenticate(&self, token: &str, now_ms: i64) -> Result<AuthContext, GatewayError> {
        let token = token.trim();
        if !token.starts_with(API_KEY_PREFIX) || token.len() < KEY_PREFIX_LEN {
            return Err(unauthorized());
        }
        let Some(key_prefix) = token.get(..KEY_PREFIX_LEN) else {
            return Err(unauthorized());
        };

        let key_hash = hash_api_key(token);
        let candidates = self.store.api_keys_by_prefix(key_prefix).await?;
        let Some(key) = candidates
            .into_iter()
            .find(|key| constant_time_eq(key.key_hash.as_bytes(), key_hash.as_bytes()))
        else {
            return Err(unauthorized());
        };
        if !key.active {
            return Err(unauthorized());
        }

        let user = self.store.user(&key.user_id).await?;
        if !user.is_some_and(|user| user.active) {
            return Err(unauthorized());
        }

        if let Err(err) = self.store.touch_api_key(&key.id, now_ms).await {
            tracing::warn!(api_key_id = %key.id, error = %err, "failed to update api key last_used_at");
        }

        Ok(AuthContext {
            user_id: key.user_id,
            api_key_id: key.id,
            key_prefix: key_prefix.to_string(),
            rate_limit_rpm: key.rate_limit_rpm,
        })
    }
}

fn unauthorized() -> GatewayError {
    GatewayError::Unauthorized {
        message: "invalid or expired api key".to_string(),
    }
}

/// Lowercase hex SHA-256 of the full key, as stored in `api_keys.key_hash`.
pub fn hash_api_key(key: &str) -> String {
    let digest = sha2::Sha256::digest(key.as_bytes());
    hex_lower(&digest)
}

/// The rate-limit scope for `key`: its first 8 characters.
pub fn key_prefix(key: &str) -> Option<&str> {
    key.get(..KEY_PREFIX_LEN)
}

fn hex_lower(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(char::from(HEX[usize::from(byte >> 4)]));
        out.push(char::from(HEX[usize::from(byte & 0x0f)]));
    }
    out
}

fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    left.iter()
        .zip(right)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}
