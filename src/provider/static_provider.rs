//! In-process identity provider with a fixed token table.
//!
//! Useful for local development and for exercising the gate without a
//! network. Call counters make provider traffic observable.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Value, json};

use super::{
    IdentityProvider, IntrospectionData, IntrospectionResponse, UserInfoData, UserInfoResponse,
};
use crate::{Error, Result};

/// A token known to [`StaticIdentityProvider`]
#[derive(Debug, Clone)]
pub struct StaticToken {
    /// Reported `active` flag
    pub active: bool,
    /// Reported `uid`
    pub user_id: String,
    /// Reported `exp` (Unix seconds)
    pub expires_at: Option<i64>,
    /// Reported group memberships
    pub groups: Vec<String>,
}

impl StaticToken {
    /// An active token owned by `user_id` with the given groups
    pub fn active(user_id: impl Into<String>, groups: &[&str]) -> Self {
        Self {
            active: true,
            user_id: user_id.into(),
            expires_at: None,
            groups: groups.iter().map(ToString::to_string).collect(),
        }
    }

    /// An inactive (revoked or expired) token
    pub fn inactive(user_id: impl Into<String>) -> Self {
        Self {
            active: false,
            user_id: user_id.into(),
            expires_at: None,
            groups: Vec::new(),
        }
    }

    /// Set the provider-side expiry
    #[must_use]
    pub fn expiring_at(mut self, unix_secs: i64) -> Self {
        self.expires_at = Some(unix_secs);
        self
    }
}

/// Identity provider answering from a token table
#[derive(Default)]
pub struct StaticIdentityProvider {
    tokens: DashMap<String, StaticToken>,
    introspections: AtomicUsize,
    user_infos: AtomicUsize,
}

impl StaticIdentityProvider {
    /// Empty provider: every token is inactive
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`insert`](Self::insert)
    #[must_use]
    pub fn with_token(self, token: impl Into<String>, entry: StaticToken) -> Self {
        self.insert(token, entry);
        self
    }

    /// Add or replace a token
    pub fn insert(&self, token: impl Into<String>, entry: StaticToken) {
        self.tokens.insert(token.into(), entry);
    }

    /// Forget a token; it introspects as inactive afterwards
    pub fn remove(&self, token: &str) {
        self.tokens.remove(token);
    }

    /// Number of `introspect` calls served
    #[must_use]
    pub fn introspection_count(&self) -> usize {
        self.introspections.load(Ordering::SeqCst)
    }

    /// Number of `user_info` calls served
    #[must_use]
    pub fn user_info_count(&self) -> usize {
        self.user_infos.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn introspect(&self, token: &str) -> Result<IntrospectionResponse> {
        self.introspections.fetch_add(1, Ordering::SeqCst);

        let data = match self.tokens.get(token) {
            Some(entry) => IntrospectionData {
                active: Some(Value::Bool(entry.active)),
                exp: entry.expires_at.map(|exp| json!(exp)),
                uid: Some(Value::String(entry.user_id.clone())),
            },
            None => IntrospectionData {
                active: Some(Value::Bool(false)),
                ..IntrospectionData::default()
            },
        };
        Ok(IntrospectionResponse { data })
    }

    async fn user_info(&self, token: &str) -> Result<UserInfoResponse> {
        self.user_infos.fetch_add(1, Ordering::SeqCst);

        let entry = self
            .tokens
            .get(token)
            .ok_or_else(|| Error::Provider("unknown token".to_string()))?;
        Ok(UserInfoResponse {
            data: UserInfoData {
                groups: entry.groups.clone(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn known_token_introspects_active() {
        let provider = StaticIdentityProvider::new().with_token(
            "abc",
            StaticToken::active("u1", &["na-readers"]).expiring_at(1_700_000_000),
        );

        let response = provider.introspect("abc").await.unwrap();

        assert!(response.data.is_active());
        assert_eq!(response.data.user_id().as_deref(), Some("u1"));
        assert_eq!(response.data.expires_at().unwrap().timestamp(), 1_700_000_000);
        assert_eq!(provider.introspection_count(), 1);
    }

    #[tokio::test]
    async fn unknown_token_is_inactive() {
        let provider = StaticIdentityProvider::new();

        let response = provider.introspect("nope").await.unwrap();

        assert!(!response.data.is_active());
        assert!(provider.user_info("nope").await.is_err());
        assert_eq!(provider.user_info_count(), 1);
    }

    #[tokio::test]
    async fn removed_token_becomes_inactive() {
        let provider =
            StaticIdentityProvider::new().with_token("abc", StaticToken::active("u1", &[]));
        provider.remove("abc");

        assert!(!provider.introspect("abc").await.unwrap().data.is_active());
    }
}
