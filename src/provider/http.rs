//! HTTP identity provider client.
//!
//! Introspection follows RFC 7662: a form-encoded `POST` authenticated with
//! the client credentials. User info is a `GET` authorized by the token being
//! inspected.

use async_trait::async_trait;
use reqwest::{Client, Response};
use tracing::debug;

use super::{IdentityProvider, IntrospectionResponse, UserInfoResponse};
use crate::config::ProviderConfig;
use crate::{Error, Result};

/// `reqwest`-backed provider client
pub struct HttpIdentityProvider {
    http: Client,
    introspection_url: String,
    userinfo_url: String,
    client_id: String,
    client_secret: String,
    redirect_uri: Option<String>,
}

impl HttpIdentityProvider {
    /// Build a client for the configured environment
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the environment has no base URL, or
    /// [`Error::Http`] if the HTTP client cannot be built.
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let base = config.base_url()?.trim_end_matches('/');
        let http = Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            http,
            introspection_url: format!("{base}{}", config.introspection_path),
            userinfo_url: format!("{base}{}", config.userinfo_path),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_uri: config.redirect_uri.clone(),
        })
    }

    /// Introspection endpoint URL
    #[must_use]
    pub fn introspection_url(&self) -> &str {
        &self.introspection_url
    }

    /// User-info endpoint URL
    #[must_use]
    pub fn userinfo_url(&self) -> &str {
        &self.userinfo_url
    }
}

/// Turn a non-2xx response into [`Error::Provider`]
fn ensure_success(response: Response, call: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(Error::Provider(format!("{call} returned HTTP {status}")))
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn introspect(&self, token: &str) -> Result<IntrospectionResponse> {
        let mut form = vec![("token", token), ("token_type_hint", "access_token")];
        if let Some(ref redirect_uri) = self.redirect_uri {
            form.push(("redirect_uri", redirect_uri.as_str()));
        }

        debug!(url = %self.introspection_url, "Introspecting token");
        let response = self
            .http
            .post(&self.introspection_url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&form)
            .send()
            .await?;

        Ok(ensure_success(response, "introspection")?.json().await?)
    }

    async fn user_info(&self, token: &str) -> Result<UserInfoResponse> {
        debug!(url = %self.userinfo_url, "Fetching user info");
        let response = self
            .http
            .get(&self.userinfo_url)
            .bearer_auth(token)
            .send()
            .await?;

        Ok(ensure_success(response, "user info")?.json().await?)
    }
}
