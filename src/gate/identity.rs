//! Identity cache: token and user lookups over a [`KeyValueStore`].
//!
//! # Key layout
//!
//! | Key | Value |
//! |-----|-------|
//! | `sha256("token_" + token)` | `{"uid": ..}` |
//! | `expiration_<uid>` | `{"expiration": <RFC 3339>}` |
//! | `originalExpiration_<uid>` | `{"originalExpiration": <RFC 3339>}` |
//! | `permissionGrant_<uid>` | `{"permissionGrant": ..}` |
//!
//! Raw tokens never reach the store; only their fingerprint does.
//!
//! Reads are lenient: a store error or an undecodable value is logged and
//! reported as a miss, which sends the caller down the revalidation path.
//! Writes and deletes propagate store errors.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::Result;
use crate::cache::KeyValueStore;

const TOKEN_KEY_PREFIX: &str = "token_";
const EXPIRATION_KEY_PREFIX: &str = "expiration_";
const ORIGINAL_EXPIRATION_KEY_PREFIX: &str = "originalExpiration_";
const GRANT_KEY_PREFIX: &str = "permissionGrant_";

/// Cache key for a raw token (SHA-256, lowercase hex)
#[must_use]
pub fn fingerprint(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(TOKEN_KEY_PREFIX.as_bytes());
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

fn expiration_key(user_id: &str) -> String {
    format!("{EXPIRATION_KEY_PREFIX}{user_id}")
}

fn original_expiration_key(user_id: &str) -> String {
    format!("{ORIGINAL_EXPIRATION_KEY_PREFIX}{user_id}")
}

fn grant_key(user_id: &str) -> String {
    format!("{GRANT_KEY_PREFIX}{user_id}")
}

#[derive(Serialize, Deserialize)]
struct UserIdEntry {
    uid: String,
}

#[derive(Serialize, Deserialize)]
struct ExpirationEntry {
    expiration: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OriginalExpirationEntry {
    original_expiration: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GrantEntry {
    permission_grant: String,
}

/// Outcome of a successful introspection, as written to the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedIdentity {
    /// Token owner
    pub user_id: String,
    /// Cache freshness deadline (validation time + configured lifetime)
    pub expires_at: DateTime<Utc>,
    /// Provider's own `exp` claim, kept for diagnostics only
    pub provider_expires_at: Option<DateTime<Utc>>,
    /// Grant conferred by group membership, if any
    pub grant: Option<String>,
}

/// Semantic view over the key/value store
#[derive(Clone)]
pub struct IdentityCache {
    store: Arc<dyn KeyValueStore>,
}

impl IdentityCache {
    /// Wrap a store handle
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// User id previously resolved for `token`
    pub async fn lookup_user_id(&self, token: &str) -> Option<String> {
        self.read::<UserIdEntry>(&fingerprint(token))
            .await
            .map(|entry| entry.uid)
    }

    /// Cache freshness deadline for `user_id`
    pub async fn lookup_expiration(&self, user_id: &str) -> Option<DateTime<Utc>> {
        self.read::<ExpirationEntry>(&expiration_key(user_id))
            .await
            .map(|entry| entry.expiration)
    }

    /// Provider-reported expiry for `user_id` (diagnostic)
    pub async fn lookup_informational_expiration(&self, user_id: &str) -> Option<DateTime<Utc>> {
        self.read::<OriginalExpirationEntry>(&original_expiration_key(user_id))
            .await
            .map(|entry| entry.original_expiration)
    }

    /// Grant cached for `user_id`
    pub async fn lookup_permission_grant(&self, user_id: &str) -> Option<String> {
        self.read::<GrantEntry>(&grant_key(user_id))
            .await
            .map(|entry| entry.permission_grant)
    }

    /// Delete every entry tied to `user_id` and `token`.
    ///
    /// All four deletes are attempted even if one fails; the first failure is
    /// returned.
    pub async fn invalidate(&self, user_id: &str, token: &str) -> Result<()> {
        let keys = [
            fingerprint(token),
            expiration_key(user_id),
            grant_key(user_id),
            original_expiration_key(user_id),
        ];

        let mut first_error = None;
        for key in &keys {
            if let Err(e) = self.store.delete(key).await {
                warn!(error = %e, "Failed to delete identity cache entry");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Write a validated identity.
    ///
    /// The grant goes before the expiration and the token mapping goes last.
    /// A reader that finds a fresh expiration, through this token or another
    /// token of the same user, therefore also finds the grant that belongs
    /// with it.
    pub async fn store(&self, token: &str, identity: &ValidatedIdentity) -> Result<()> {
        let user_id = &identity.user_id;

        if let Some(original_expiration) = identity.provider_expires_at {
            self.write(
                &original_expiration_key(user_id),
                &OriginalExpirationEntry { original_expiration },
            )
            .await?;
        }
        if let Some(ref grant) = identity.grant {
            self.write(
                &grant_key(user_id),
                &GrantEntry {
                    permission_grant: grant.clone(),
                },
            )
            .await?;
        }
        self.write(
            &expiration_key(user_id),
            &ExpirationEntry {
                expiration: identity.expires_at,
            },
        )
        .await?;
        self.write(
            &fingerprint(token),
            &UserIdEntry {
                uid: user_id.clone(),
            },
        )
        .await
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.store.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(error = %e, "Undecodable identity cache entry, treating as miss");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Identity cache read failed, treating as miss");
                None
            }
        }
    }

    async fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.store.set(key, raw).await
    }
}
