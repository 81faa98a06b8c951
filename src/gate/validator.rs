//! Token validator: introspection and cache population.
//!
//! # Validation flow
//!
//! 1. Introspect the token; no `active` field, or a falsy one, rejects.
//! 2. Compute the cache deadline as `now + token_lifetime`. The provider's
//!    `exp` is kept only for diagnostics.
//! 3. Clear every cached entry for the token and user.
//! 4. Fetch user info; membership in the required group earns the grant.
//! 5. Write the new entries.
//!
//! # Concurrency
//!
//! Revalidations of the same token are serialised by a per-fingerprint async
//! mutex, so their clear/write sequences never interleave within a process.
//! A request that waited on the lock re-reads the cache first and reuses a
//! fresh entry instead of calling the provider again. Processes that share a
//! remote store can still interleave; the store offers no multi-key
//! transaction to prevent it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::audit::{AuditEvent, AuditSink};
use super::identity::{IdentityCache, ValidatedIdentity, fingerprint};
use crate::error::AuthError;
use crate::provider::IdentityProvider;
use crate::{Error, Result};

/// Group membership required for the grant, and the grant it confers
#[derive(Debug, Clone)]
pub struct GrantPolicy {
    /// Group the user must belong to
    pub required_group: String,
    /// Grant stored for members
    pub required_grant: String,
}

/// Validates tokens against the identity provider and fills the cache
pub struct TokenValidator {
    provider: Arc<dyn IdentityProvider>,
    cache: IdentityCache,
    policy: GrantPolicy,
    token_lifetime: TimeDelta,
    provider_timeout: Duration,
    audit: Arc<dyn AuditSink>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl TokenValidator {
    /// Create a validator
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `token_lifetime` does not fit a timestamp delta.
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        cache: IdentityCache,
        policy: GrantPolicy,
        token_lifetime: Duration,
        provider_timeout: Duration,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        let token_lifetime = TimeDelta::from_std(token_lifetime)
            .map_err(|e| Error::Config(format!("token_lifetime out of range: {e}")))?;

        Ok(Self {
            provider,
            cache,
            policy,
            token_lifetime,
            provider_timeout,
            audit,
            locks: DashMap::new(),
        })
    }

    /// Validate `token` and refresh its cache entries.
    ///
    /// If another request refreshed the same token while this one waited,
    /// the fresh cached identity is returned without a provider call.
    pub async fn validate(
        &self,
        token: &str,
    ) -> std::result::Result<ValidatedIdentity, AuthError> {
        let entry = LockEntry::acquire(&self.locks, fingerprint(token));
        let _guard = entry.mutex().lock().await;

        match self.fresh_cached(token).await {
            Some(identity) => {
                debug!(
                    user_id = %identity.user_id,
                    "Token refreshed concurrently, reusing cache"
                );
                Ok(identity)
            }
            None => self.introspect_and_store(token).await,
        }
    }

    /// Number of tokens with a revalidation in flight or queued
    #[must_use]
    pub fn pending(&self) -> usize {
        self.locks.len()
    }

    async fn fresh_cached(&self, token: &str) -> Option<ValidatedIdentity> {
        let user_id = self.cache.lookup_user_id(token).await?;
        let expires_at = self.cache.lookup_expiration(&user_id).await?;
        if expires_at <= Utc::now() {
            return None;
        }
        Some(ValidatedIdentity {
            grant: self.cache.lookup_permission_grant(&user_id).await,
            provider_expires_at: self.cache.lookup_informational_expiration(&user_id).await,
            user_id,
            expires_at,
        })
    }

    async fn introspect_and_store(
        &self,
        token: &str,
    ) -> std::result::Result<ValidatedIdentity, AuthError> {
        let introspection = self
            .call("introspection", self.provider.introspect(token))
            .await?;
        let data = introspection.data;

        if data.active.is_none() {
            warn!("Introspection response has no 'active' field");
            return Err(AuthError::invalid("token could not be validated"));
        }
        if !data.is_active() {
            debug!("Provider reports token inactive");
            return Err(AuthError::invalid("token is not active"));
        }
        let Some(user_id) = data.user_id() else {
            warn!("Introspection response has no 'uid'");
            return Err(AuthError::invalid("token could not be validated"));
        };

        let expires_at = Utc::now() + self.token_lifetime;
        let provider_expires_at = data.expires_at();

        self.cache
            .invalidate(&user_id, token)
            .await
            .map_err(store_failure)?;

        let user_info = self.call("user info", self.provider.user_info(token)).await?;
        let grant = user_info
            .data
            .is_member_of(&self.policy.required_group)
            .then(|| self.policy.required_grant.clone());

        let identity = ValidatedIdentity {
            user_id,
            expires_at,
            provider_expires_at,
            grant,
        };
        self.cache
            .store(token, &identity)
            .await
            .map_err(store_failure)?;

        info!(
            user_id = %identity.user_id,
            expires_at = %identity.expires_at,
            granted = identity.grant.is_some(),
            "Token validated"
        );
        self.audit.record(&AuditEvent::validated(&identity));
        Ok(identity)
    }

    /// Run a provider call under the configured timeout
    async fn call<T>(
        &self,
        what: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> std::result::Result<T, AuthError> {
        match tokio::time::timeout(self.provider_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!(call = what, error = %e, "Identity provider call failed");
                Err(AuthError::invalid(format!("{what} failed")))
            }
            Err(_) => {
                warn!(
                    call = what,
                    timeout = ?self.provider_timeout,
                    "Identity provider call timed out"
                );
                Err(AuthError::invalid(format!("{what} timed out")))
            }
        }
    }
}

/// Handle on a fingerprint's lock entry.
///
/// Dropping it (on completion or when the request future is cancelled)
/// removes the map entry once no other request holds or awaits it.
struct LockEntry<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    key: String,
    mutex: Arc<Mutex<()>>,
}

impl<'a> LockEntry<'a> {
    fn acquire(locks: &'a DashMap<String, Arc<Mutex<()>>>, key: String) -> Self {
        let mutex = Arc::clone(locks.entry(key.clone()).or_default().value());
        Self { locks, key, mutex }
    }

    fn mutex(&self) -> &Mutex<()> {
        &self.mutex
    }
}

impl Drop for LockEntry<'_> {
    fn drop(&mut self) {
        // Two references left: the map's and this handle's
        self.locks.remove_if(&self.key, |_, mutex| {
            Arc::ptr_eq(mutex, &self.mutex) && Arc::strong_count(mutex) == 2
        });
    }
}

fn store_failure(e: Error) -> AuthError {
    warn!(error = %e, "Identity cache write failed");
    AuthError::invalid("identity could not be cached")
}
