//! JWT access-token verification.
//!
//! # Key sources
//!
//! - **Shared secret**: HS256 tokens signed with `oauth.hmac_secret`.
//! - **JWKS**: RS*/ES* tokens signed by a key published at `oauth.jwks_uri`.
//!   The key set is cached for one hour and refreshed once when a token
//!   names an unknown `kid`.
//!
//! `exp` is always required and checked with the configured leeway. `iss`
//! and `aud` are checked when configured.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::http::request::Parts;
use dashmap::DashMap;
use jsonwebtoken::{
    Algorithm, DecodingKey, Header, Validation,
    jwk::{AlgorithmParameters, JwkSet},
};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{BearerVerifier, extract_bearer};
use crate::config::OAuthConfig;
use crate::{Error, Result};

/// Error variants for bearer verification failures.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    /// No bearer token on the request
    #[error("No bearer token presented")]
    MissingToken,

    /// JWT decode / signature / claim validation failed
    #[error("JWT verification failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// The JWT header has no `kid` but a JWKS is configured
    #[error("JWT missing 'kid' field in header")]
    MissingKeyId,

    /// The `kid` is not in the issuer's JWKS
    #[error("Unknown key ID: {0}")]
    UnknownKeyId(String),

    /// The token verified but names no subject
    #[error("JWT has no 'sub' claim")]
    MissingSubject,

    /// Network or HTTP error while fetching JWKS
    #[error("JWKS fetch error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Access-token claims the gate reads
#[derive(Debug, Deserialize)]
struct AccessTokenClaims {
    #[serde(default)]
    sub: Option<String>,
}

/// Cached JWKS entry
struct CachedJwks {
    keys: JwkSet,
    fetched_at: Instant,
}

/// JWKS cache keyed by JWKS URI
pub struct JwksCache {
    inner: DashMap<String, CachedJwks>,
    http: reqwest::Client,
    ttl: Duration,
}

impl JwksCache {
    /// Create with default 1-hour TTL
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
            http: reqwest::Client::builder()
                .https_only(true)
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            ttl: Duration::from_secs(3600),
        }
    }

    /// Return the cached JWKS for `jwks_uri`, fetching if stale or forced
    pub async fn get_or_fetch(
        &self,
        jwks_uri: &str,
        force_refresh: bool,
    ) -> std::result::Result<JwkSet, VerifyError> {
        if !force_refresh {
            if let Some(cached) = self.inner.get(jwks_uri) {
                if cached.fetched_at.elapsed() < self.ttl {
                    return Ok(cached.keys.clone());
                }
            }
        }

        debug!("Fetching JWKS from {jwks_uri}");
        let jwks: JwkSet = self.http.get(jwks_uri).send().await?.json().await?;
        self.inner.insert(
            jwks_uri.to_string(),
            CachedJwks {
                keys: jwks.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(jwks)
    }
}

impl Default for JwksCache {
    fn default() -> Self {
        Self::new()
    }
}

enum KeySource {
    Secret(DecodingKey),
    Jwks { uri: String, cache: JwksCache },
}

/// Verifies JWT bearer tokens
pub struct JwtBearerVerifier {
    keys: KeySource,
    issuer: Option<String>,
    audiences: Vec<String>,
    leeway: u64,
}

impl JwtBearerVerifier {
    /// Build from the `oauth` configuration section. The shared secret takes
    /// precedence when both key sources are configured.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if neither key source is configured.
    pub fn from_config(config: &OAuthConfig) -> Result<Self> {
        let keys = match (&config.hmac_secret, &config.jwks_uri) {
            (Some(secret), _) => KeySource::Secret(DecodingKey::from_secret(secret.as_bytes())),
            (None, Some(uri)) => KeySource::Jwks {
                uri: uri.clone(),
                cache: JwksCache::new(),
            },
            (None, None) => {
                return Err(Error::Config(
                    "OAuth verification needs oauth.hmac_secret or oauth.jwks_uri".to_string(),
                ));
            }
        };

        Ok(Self {
            keys,
            issuer: config.issuer.clone(),
            audiences: config.audiences.clone(),
            leeway: config.leeway_secs,
        })
    }

    /// Verify a raw JWT and return its subject (empty if the token has no `sub`)
    pub async fn verify_token(&self, token: &str) -> std::result::Result<String, VerifyError> {
        let header = jsonwebtoken::decode_header(token)?;

        let (key, mut validation) = match &self.keys {
            KeySource::Secret(key) => (key.clone(), Validation::new(Algorithm::HS256)),
            KeySource::Jwks { uri, cache } => {
                let kid = header.kid.clone().ok_or(VerifyError::MissingKeyId)?;
                let key = find_decoding_key(cache, uri, &kid).await?;
                (key, build_validation(&header))
            }
        };

        validation.leeway = self.leeway;
        if let Some(ref issuer) = self.issuer {
            validation.set_issuer(&[issuer]);
        }
        if self.audiences.is_empty() {
            validation.validate_aud = false;
        } else {
            validation.set_audience(&self.audiences);
        }

        let data = jsonwebtoken::decode::<AccessTokenClaims>(token, &key, &validation)?;
        data.claims
            .sub
            .filter(|sub| !sub.is_empty())
            .ok_or(VerifyError::MissingSubject)
    }
}

#[async_trait]
impl BearerVerifier for JwtBearerVerifier {
    async fn verify(
        &self,
        parts: &Parts,
        form: Option<&[u8]>,
    ) -> std::result::Result<String, VerifyError> {
        let token = extract_bearer(parts, form).ok_or(VerifyError::MissingToken)?;
        self.verify_token(&token).await
    }
}

/// Find a decoding key by `kid`, refreshing the JWKS once if not found
async fn find_decoding_key(
    cache: &JwksCache,
    jwks_uri: &str,
    kid: &str,
) -> std::result::Result<DecodingKey, VerifyError> {
    let jwks = cache.get_or_fetch(jwks_uri, false).await?;
    if let Some(key) = find_key_in_jwks(&jwks, kid) {
        return Ok(key);
    }

    debug!(kid = %kid, "Key not found in cached JWKS, refreshing");
    let jwks = cache.get_or_fetch(jwks_uri, true).await?;
    find_key_in_jwks(&jwks, kid).ok_or_else(|| VerifyError::UnknownKeyId(kid.to_string()))
}

/// Find a JWK by `kid` and convert it to a `DecodingKey`
fn find_key_in_jwks(jwks: &JwkSet, kid: &str) -> Option<DecodingKey> {
    let jwk = jwks
        .keys
        .iter()
        .find(|jwk| jwk.common.key_id.as_deref() == Some(kid))?;

    match &jwk.algorithm {
        AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
        AlgorithmParameters::EllipticCurve(ec) => {
            DecodingKey::from_ec_components(&ec.x, &ec.y).ok()
        }
        AlgorithmParameters::OctetKey(_) | AlgorithmParameters::OctetKeyPair(_) => None,
    }
}

/// Build a [`Validation`] for an asymmetric algorithm from the JWT header
fn build_validation(header: &Header) -> Validation {
    let alg = match header.alg {
        alg @ (Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::ES256
        | Algorithm::ES384) => alg,
        other => {
            warn!(alg = ?other, "Unsupported JWT algorithm, defaulting to RS256");
            Algorithm::RS256
        }
    };
    Validation::new(alg)
}
