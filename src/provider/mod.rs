//! Identity provider client contract
//!
//! The gate talks to the SSO provider through two calls:
//!
//! | Call | Response shape |
//! |------|----------------|
//! | `introspect(token)` | `{"data": {"active": .., "exp": .., "uid": ..}}` |
//! | `user_info(token)` | `{"data": {"groups": [..]}}` |
//!
//! Retries, if any, belong to the implementation; the gate calls each method
//! once per validation and treats every error as a rejected credential.

mod http;
mod static_provider;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Result;

pub use http::HttpIdentityProvider;
pub use static_provider::{StaticIdentityProvider, StaticToken};

/// Remote identity provider.
#[async_trait]
pub trait IdentityProvider: Send + Sync + 'static {
    /// Ask the provider whether `token` is active and who it belongs to.
    async fn introspect(&self, token: &str) -> Result<IntrospectionResponse>;

    /// Fetch the attributes (group membership) of the token's owner.
    async fn user_info(&self, token: &str) -> Result<UserInfoResponse>;
}

/// Introspection envelope
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntrospectionResponse {
    /// Payload; absent is treated like an empty payload
    #[serde(default)]
    pub data: IntrospectionData,
}

/// Introspection claims.
///
/// Fields are kept loosely typed: providers report `active` as a bool or as
/// `0`/`1`, and `uid`/`exp` as strings or numbers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntrospectionData {
    /// Whether the token is active
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<Value>,
    /// Provider-side expiry (Unix seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<Value>,
    /// Owner of the token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<Value>,
}

impl IntrospectionData {
    /// `true` when the provider reported the token as active.
    ///
    /// `false`, `0`, `"0"`, `""`, `null`, empty arrays/objects and a missing
    /// field all count as inactive.
    #[must_use]
    pub fn is_active(&self) -> bool {
        match &self.active {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().is_some_and(|v| v != 0.0),
            Some(Value::String(s)) => !s.is_empty() && s != "0",
            Some(Value::Array(a)) => !a.is_empty(),
            Some(Value::Object(o)) => !o.is_empty(),
        }
    }

    /// The token owner's id, if present and non-empty
    #[must_use]
    pub fn user_id(&self) -> Option<String> {
        match self.uid.as_ref()? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Provider-side expiry, if present and representable
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let secs = match self.exp.as_ref()? {
            Value::Number(n) => n.as_i64()?,
            Value::String(s) => s.trim().parse().ok()?,
            _ => return None,
        };
        DateTime::from_timestamp(secs, 0)
    }
}

/// User-info envelope
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserInfoResponse {
    /// Payload
    #[serde(default)]
    pub data: UserInfoData,
}

/// User attributes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserInfoData {
    /// Group memberships
    #[serde(default)]
    pub groups: Vec<String>,
}

impl UserInfoData {
    /// Whether the user belongs to `group` (exact match)
    #[must_use]
    pub fn is_member_of(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }
}
