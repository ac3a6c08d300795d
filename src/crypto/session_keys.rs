use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::clock::SharedClock;
use crate::config::KeyConfig;
use crate::crypto::aes::KEY_SIZE;
use crate::error::{AppError, Result};

/// Symmetric key bundle of one relay session.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    #[zeroize(skip)]
    pub session_id: String,
    pub encryption_key: [u8; KEY_SIZE],
    pub mac_key: [u8; KEY_SIZE],
    #[zeroize(skip)]
    pub key_id: String,
    #[zeroize(skip)]
    pub created_at: DateTime<Utc>,
    #[zeroize(skip)]
    pub expires_at: DateTime<Utc>,
}

impl SessionKeys {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys")
            .field("session_id", &self.session_id)
            .field("key_id", &self.key_id)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Issues, serves and expires per-session key material.
///
/// At most one unexpired key set exists per session.
pub struct KeyExchangeManager {
    keys: RwLock<HashMap<String, Arc<SessionKeys>>>,
    key_ttl: chrono::Duration,
    clock: SharedClock,
}

impl KeyExchangeManager {
    /// Creates a new `KeyExchangeManager`.
    pub fn new(config: &KeyConfig, clock: SharedClock) -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
            key_ttl: chrono::Duration::from_std(config.key_ttl)
                .unwrap_or_else(|_| chrono::Duration::hours(48)),
            clock,
        }
    }

    /// Returns the session's live keys, generating them if needed.
    ///
    /// # Arguments
    ///
    /// * `session_id` - The session the keys belong to.
    ///
    /// # Returns
    ///
    /// The existing unexpired key set, or a freshly generated one.
    pub async fn generate_session_keys(&self, session_id: &str) -> Result<Arc<SessionKeys>> {
        if session_id.is_empty() {
            return Err(AppError::Validation("Session id must not be empty".to_string()));
        }

        {
            let keys = self.keys.read().await;
            if let Some(existing) = keys.get(session_id) {
                if !existing.is_expired(self.clock.now()) {
                    return Ok(existing.clone());
                }
            }
        }

        let mut keys = self.keys.write().await;
        let now = self.clock.now();
        // another task may have generated while we waited for the write lock
        if let Some(existing) = keys.get(session_id) {
            if !existing.is_expired(now) {
                return Ok(existing.clone());
            }
        }

        let mut fresh = SessionKeys {
            session_id: session_id.to_string(),
            encryption_key: [0u8; KEY_SIZE],
            mac_key: [0u8; KEY_SIZE],
            key_id: derive_key_id(session_id, now),
            created_at: now,
            expires_at: now + self.key_ttl,
        };
        OsRng.fill_bytes(&mut fresh.encryption_key);
        OsRng.fill_bytes(&mut fresh.mac_key);
        let generated = Arc::new(fresh);
        keys.insert(session_id.to_string(), generated.clone());

        tracing::info!(
            session_id,
            key_id = %generated.key_id,
            "🔑 Session keys generated"
        );
        Ok(generated)
    }

    /// Looks up the session's keys.
    ///
    /// # Returns
    ///
    /// `NotFound` when no keys were issued, `Expired` when they are past their lifetime.
    pub async fn get_session_keys(&self, session_id: &str) -> Result<Arc<SessionKeys>> {
        let keys = self.keys.read().await;
        let found = keys
            .get(session_id)
            .ok_or_else(|| AppError::NotFound(format!("No keys for session {}", session_id)))?;
        if found.is_expired(self.clock.now()) {
            return Err(AppError::Expired(format!("Keys for session {} expired", session_id)));
        }
        Ok(found.clone())
    }

    /// Invalidates the session's keys. Returns whether any were present.
    pub async fn revoke_session_keys(&self, session_id: &str) -> bool {
        let removed = self.keys.write().await.remove(session_id).is_some();
        if removed {
            tracing::info!(session_id, "🗑️ Session keys revoked");
        }
        removed
    }

    /// Drops every key set past its expiry.
    ///
    /// # Returns
    ///
    /// The number of key sets removed.
    pub async fn cleanup_expired_keys(&self) -> usize {
        let now = self.clock.now();
        let mut keys = self.keys.write().await;
        let before = keys.len();
        keys.retain(|_, k| !k.is_expired(now));
        let removed = before - keys.len();
        if removed > 0 {
            tracing::info!(removed, remaining = keys.len(), "🧹 Expired session keys cleaned up");
        }
        removed
    }

    /// Number of key sets currently held, expired or not.
    pub async fn key_count(&self) -> usize {
        self.keys.read().await.len()
    }
}

/// `key_` + the first 8 bytes of SHA-256(`{session}:{nanos}`), hex.
fn derive_key_id(session_id: &str, now: DateTime<Utc>) -> String {
    let nanos = now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp_micros() * 1000);
    let digest = Sha256::digest(format!("{}:{}", session_id, nanos).as_bytes());
    format!("key_{}", hex::encode(&digest[..8]))
}
