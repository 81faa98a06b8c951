//! Permission gate: exact match of the cached grant against the required one.

use tracing::debug;

use super::identity::IdentityCache;
use crate::error::AuthError;

/// Checks a resolved user's cached grant
#[derive(Clone)]
pub struct PermissionGate {
    cache: IdentityCache,
}

impl PermissionGate {
    /// Create a gate reading grants from `cache`
    #[must_use]
    pub fn new(cache: IdentityCache) -> Self {
        Self { cache }
    }

    /// Allow only if `user_id` holds exactly `required_grant`.
    ///
    /// A missing grant entry fails closed.
    pub async fn check(&self, user_id: &str, required_grant: &str) -> Result<(), AuthError> {
        match self.cache.lookup_permission_grant(user_id).await {
            Some(grant) if grant == required_grant => Ok(()),
            Some(_) => {
                debug!(user_id = %user_id, "Cached grant does not match required grant");
                Err(AuthError::forbidden("grant mismatch"))
            }
            None => {
                debug!(user_id = %user_id, "No grant cached for user");
                Err(AuthError::forbidden("no grant for user"))
            }
        }
    }
}
