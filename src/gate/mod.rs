//! Request-time authentication gate
//!
//! [`AuthGate`] decides, for one request, whether it may reach the protected
//! handler:
//!
//! ```text
//! classify ─┬─ Bypass ───────────────────────────────────────────► bypassed
//!           ├─ SsoToken ─┬─ sentinel ─────────────────────────────► bypassed
//!           │            ├─ cached + fresh ─────────► grant check ─► allowed
//!           │            ├─ cached + expired ─ policy ─┐
//!           │            └─ not cached ─── validate ───┴► grant check ─► allowed
//!           ├─ OAuthBearer ─── verifier ──────────────────────────► allowed
//!           └─ NoCredential ──────────────────────────────────────► 401
//! ```
//!
//! Every failure is an [`AuthError`]; the gate stamps it with a reference,
//! records it on the audit sink and hands it back as a [`Rejection`]. The
//! axum adapter in [`crate::gateway`] turns that into the response.

pub mod audit;
pub mod credential;
pub mod identity;
pub mod permission;
pub mod validator;

use std::sync::Arc;

use axum::http::request::Parts;
use chrono::Utc;
use serde::Serialize;
use subtle::ConstantTimeEq;
use tracing::debug;
use uuid::Uuid;

use crate::cache::{InMemoryStore, KeyValueStore};
use crate::config::{Config, ExpiredTokenPolicy};
use crate::error::AuthError;
use crate::oauth::{BearerVerifier, JwtBearerVerifier};
use crate::provider::{HttpIdentityProvider, IdentityProvider};
use crate::Result;

pub use audit::{AuditEvent, AuditSink, TracingAuditSink};
pub use credential::{Credential, CredentialExtractor, TrustedCaller};
pub use identity::{IdentityCache, ValidatedIdentity, fingerprint};
pub use permission::PermissionGate;
pub use validator::{GrantPolicy, TokenValidator};

/// Scheme under which a request was admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthScheme {
    /// SSO token from the configured header
    Sso,
    /// Verified OAuth2 bearer token
    #[serde(rename = "oauth")]
    OAuth,
}

/// Why a request skipped authentication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassKind {
    /// Upstream set the trusted-caller marker
    TrustedCaller,
    /// SSO token equal to the configured sentinel
    SentinelToken,
}

impl BypassKind {
    /// Stable name used in audit records
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TrustedCaller => "trusted_caller",
            Self::SentinelToken => "sentinel_token",
        }
    }
}

/// Identity admitted by the gate, inserted into request extensions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    /// SSO user id, or the OAuth2 `sub` claim
    pub subject: String,
    /// Scheme the credential was presented under
    pub scheme: AuthScheme,
    /// Grant that was checked (SSO only)
    pub grant: Option<String>,
}

/// Successful gate decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// No checks were run
    Bypassed(BypassKind),
    /// Credential verified (and, for SSO, the grant checked)
    Allowed(AuthenticatedUser),
}

/// Failed gate decision, already recorded on the audit sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Rejection kind
    pub error: AuthError,
    /// Correlation reference, also in the audit record
    pub reference: String,
}

/// The authentication gate
pub struct AuthGate {
    extractor: CredentialExtractor,
    cache: IdentityCache,
    validator: TokenValidator,
    permissions: PermissionGate,
    bearer: Option<Arc<dyn BearerVerifier>>,
    audit: Arc<dyn AuditSink>,
    required_grant: String,
    bypass_token: Option<String>,
    expired_policy: ExpiredTokenPolicy,
    form_body_limit: usize,
    public_paths: Vec<String>,
}

impl AuthGate {
    /// Assemble a gate over the given store and identity provider.
    ///
    /// When `oauth.enabled` is set a [`JwtBearerVerifier`] is built from the
    /// `oauth` section.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] for an invalid SSO header name, an
    /// unresolved `env:` bypass token, an out-of-range token lifetime or an
    /// incomplete `oauth` section.
    pub fn new(
        config: &Config,
        store: Arc<dyn KeyValueStore>,
        provider: Arc<dyn IdentityProvider>,
    ) -> Result<Self> {
        let gate = &config.gate;
        if gate
            .bypass_token
            .as_deref()
            .is_some_and(|t| t.starts_with("env:"))
        {
            return Err(crate::Error::Config(
                "gate.bypass_token is an unresolved env: reference".to_string(),
            ));
        }
        let audit: Arc<dyn AuditSink> = Arc::new(TracingAuditSink);
        let cache = IdentityCache::new(store);

        let validator = TokenValidator::new(
            provider,
            cache.clone(),
            GrantPolicy {
                required_group: gate.required_group.clone(),
                required_grant: gate.required_grant.clone(),
            },
            gate.token_lifetime,
            config.provider.timeout,
            Arc::clone(&audit),
        )?;

        let bearer: Option<Arc<dyn BearerVerifier>> = if config.oauth.enabled {
            Some(Arc::new(JwtBearerVerifier::from_config(&config.oauth)?))
        } else {
            None
        };

        Ok(Self {
            extractor: CredentialExtractor::new(&gate.sso_header)?,
            permissions: PermissionGate::new(cache.clone()),
            cache,
            validator,
            bearer,
            audit,
            required_grant: gate.required_grant.clone(),
            bypass_token: gate.bypass_token.clone().filter(|t| !t.is_empty()),
            expired_policy: gate.expired_policy,
            form_body_limit: gate.form_body_limit,
            public_paths: gate.public_paths.clone(),
        })
    }

    /// Gate backed by an [`InMemoryStore`] and the configured HTTP provider
    ///
    /// # Errors
    ///
    /// See [`AuthGate::new`] and [`HttpIdentityProvider::new`].
    pub fn from_config(config: &Config) -> Result<Self> {
        let provider = HttpIdentityProvider::new(&config.provider)?;
        Self::new(config, Arc::new(InMemoryStore::new()), Arc::new(provider))
    }

    /// Replace the OAuth2 verifier (enables the OAuth2 path)
    #[must_use]
    pub fn with_bearer_verifier(mut self, verifier: Arc<dyn BearerVerifier>) -> Self {
        self.bearer = Some(verifier);
        self
    }

    /// Replace the audit sink for gate decisions
    ///
    /// Validation events keep going to the sink the gate was built with.
    #[must_use]
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = sink;
        self
    }

    /// Identity cache the gate reads
    #[must_use]
    pub fn cache(&self) -> &IdentityCache {
        &self.cache
    }

    /// Check if a path is public (bypasses the gate)
    #[must_use]
    pub fn is_public_path(&self, path: &str) -> bool {
        self.public_paths.iter().any(|p| path.starts_with(p.as_str()))
    }

    /// Revalidations currently in flight or queued
    #[must_use]
    pub fn pending_validations(&self) -> usize {
        self.validator.pending()
    }

    /// Whether the form body must be read before classifying this request
    #[must_use]
    pub fn needs_form_body(&self, parts: &Parts) -> bool {
        self.extractor.needs_form_body(parts)
    }

    /// Largest form body buffered for classification
    #[must_use]
    pub fn form_body_limit(&self) -> usize {
        self.form_body_limit
    }

    /// Decide whether the request may proceed.
    ///
    /// Every outcome is recorded on the audit sink before it is returned.
    pub async fn authenticate(
        &self,
        parts: &Parts,
        form: Option<&[u8]>,
    ) -> std::result::Result<AuthOutcome, Rejection> {
        match self.resolve(parts, form).await {
            Ok(outcome) => {
                match &outcome {
                    AuthOutcome::Bypassed(kind) => {
                        self.audit.record(&AuditEvent::bypassed(*kind, parts));
                    }
                    AuthOutcome::Allowed(user) => {
                        self.audit.record(&AuditEvent::allowed(user, parts));
                    }
                }
                Ok(outcome)
            }
            Err(error) => Err(self.reject(parts, error)),
        }
    }

    /// Stamp `error` with a fresh reference and record it
    #[must_use]
    pub fn reject(&self, parts: &Parts, error: AuthError) -> Rejection {
        let reference = Uuid::new_v4().to_string();
        self.audit
            .record(&AuditEvent::rejected(&error, &reference, parts));
        Rejection { error, reference }
    }

    async fn resolve(
        &self,
        parts: &Parts,
        form: Option<&[u8]>,
    ) -> std::result::Result<AuthOutcome, AuthError> {
        match self.extractor.classify(parts, form) {
            Credential::Bypass => Ok(AuthOutcome::Bypassed(BypassKind::TrustedCaller)),
            Credential::SsoToken(token) => self.resolve_sso(&token).await,
            Credential::OAuthBearer => match self.bearer {
                Some(ref verifier) => {
                    let subject = verifier.verify(parts, form).await.map_err(|e| {
                        debug!(error = %e, "Bearer verification failed");
                        AuthError::invalid("bearer token rejected")
                    })?;
                    Ok(AuthOutcome::Allowed(AuthenticatedUser {
                        subject,
                        scheme: AuthScheme::OAuth,
                        grant: None,
                    }))
                }
                None => Err(AuthError::MissingCredential),
            },
            Credential::NoCredential => Err(AuthError::MissingCredential),
        }
    }

    async fn resolve_sso(&self, token: &str) -> std::result::Result<AuthOutcome, AuthError> {
        if self.is_sentinel(token) {
            return Ok(AuthOutcome::Bypassed(BypassKind::SentinelToken));
        }

        let cached = match self.cache.lookup_user_id(token).await {
            Some(user_id) => self
                .cache
                .lookup_expiration(&user_id)
                .await
                .map(|expires_at| (user_id, expires_at)),
            None => None,
        };

        let user_id = match cached {
            Some((user_id, expires_at)) if expires_at > Utc::now() => user_id,
            Some((user_id, _)) if self.expired_policy == ExpiredTokenPolicy::Reject => {
                debug!(user_id = %user_id, "Cached identity expired");
                return Err(AuthError::invalid("token expired"));
            }
            _ => self.revalidate(token).await?,
        };

        self.permissions
            .check(&user_id, &self.required_grant)
            .await?;

        Ok(AuthOutcome::Allowed(AuthenticatedUser {
            subject: user_id,
            scheme: AuthScheme::Sso,
            grant: Some(self.required_grant.clone()),
        }))
    }

    /// Run the validator, then read the user back from the cache
    async fn revalidate(&self, token: &str) -> std::result::Result<String, AuthError> {
        self.validator.validate(token).await?;
        self.cache
            .lookup_user_id(token)
            .await
            .ok_or_else(|| AuthError::invalid("token could not be resolved"))
    }

    fn is_sentinel(&self, token: &str) -> bool {
        self.bypass_token
            .as_deref()
            .is_some_and(|sentinel| bool::from(token.as_bytes().ct_eq(sentinel.as_bytes())))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use chrono::TimeDelta;

    use super::*;
    use crate::provider::{StaticIdentityProvider, StaticToken};

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<AuditEvent>>);

    impl AuditSink for RecordingSink {
        fn record(&self, event: &AuditEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    fn config(policy: ExpiredTokenPolicy) -> Config {
        let mut config = Config::default();
        config.gate.required_group = "na-readers".to_string();
        config.gate.required_grant = "GET".to_string();
        config.gate.bypass_token = Some("let-me-in".to_string());
        config.gate.expired_policy = policy;
        config.gate.token_lifetime = Duration::from_secs(3600);
        config
    }

    struct Fixture {
        gate: AuthGate,
        store: Arc<InMemoryStore>,
        provider: Arc<StaticIdentityProvider>,
        sink: Arc<RecordingSink>,
    }

    fn fixture(policy: ExpiredTokenPolicy) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let provider = Arc::new(
            StaticIdentityProvider::new()
                .with_token("abc", StaticToken::active("u1", &["na-readers"]))
                .with_token("outsider", StaticToken::active("u2", &["staff"]))
                .with_token("dead", StaticToken::inactive("u3")),
        );
        let sink = Arc::new(RecordingSink::default());
        let gate = AuthGate::new(&config(policy), store.clone(), provider.clone())
            .unwrap()
            .with_audit_sink(sink.clone());
        Fixture { gate, store, provider, sink }
    }

    fn sso(token: &str) -> Parts {
        Request::builder()
            .uri("/orders")
            .header("nauth-sso", token)
            .body(Body::empty())
            .unwrap()
            .into_parts()
            .0
    }

    async fn expire(f: &Fixture, token: &str) {
        let user_id = f.gate.cache().lookup_user_id(token).await.unwrap();
        let identity = ValidatedIdentity {
            grant: f.gate.cache().lookup_permission_grant(&user_id).await,
            provider_expires_at: None,
            expires_at: Utc::now() - TimeDelta::minutes(5),
            user_id,
        };
        f.gate.cache().store(token, &identity).await.unwrap();
    }

    #[tokio::test]
    async fn unseen_member_token_is_validated_then_allowed() {
        // GIVEN: an empty cache
        let f = fixture(ExpiredTokenPolicy::Revalidate);

        // WHEN: the token is presented twice
        let first = f.gate.authenticate(&sso("abc"), None).await.unwrap();
        let second = f.gate.authenticate(&sso("abc"), None).await.unwrap();

        // THEN: both are allowed, the provider was asked once
        let expected = AuthOutcome::Allowed(AuthenticatedUser {
            subject: "u1".to_string(),
            scheme: AuthScheme::Sso,
            grant: Some("GET".to_string()),
        });
        assert_eq!(first, expected);
        assert_eq!(second, expected);
        assert_eq!(f.provider.introspection_count(), 1);
    }

    #[tokio::test]
    async fn non_member_is_forbidden() {
        let f = fixture(ExpiredTokenPolicy::Revalidate);

        let rejection = f.gate.authenticate(&sso("outsider"), None).await.unwrap_err();

        assert!(matches!(rejection.error, AuthError::InsufficientPermission(_)));
        assert_eq!(rejection.error.status().as_u16(), 403);
    }

    #[tokio::test]
    async fn inactive_token_is_unauthorized_and_uncached() {
        let f = fixture(ExpiredTokenPolicy::Revalidate);

        let rejection = f.gate.authenticate(&sso("dead"), None).await.unwrap_err();

        assert!(matches!(rejection.error, AuthError::InvalidCredential(_)));
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn sentinel_skips_cache_entirely() {
        // GIVEN: the configured bypass sentinel
        let f = fixture(ExpiredTokenPolicy::Revalidate);

        // WHEN: presented as an SSO token
        let outcome = f.gate.authenticate(&sso("let-me-in"), None).await.unwrap();

        // THEN: bypassed without a single store read or provider call
        assert_eq!(outcome, AuthOutcome::Bypassed(BypassKind::SentinelToken));
        let stats = f.store.stats();
        assert_eq!(stats.hits + stats.misses, 0);
        assert_eq!(f.provider.introspection_count(), 0);
    }

    #[tokio::test]
    async fn trusted_marker_skips_everything() {
        let f = fixture(ExpiredTokenPolicy::Revalidate);
        let mut parts = sso("abc");
        parts.extensions.insert(TrustedCaller(true));

        let outcome = f.gate.authenticate(&parts, None).await.unwrap();

        assert_eq!(outcome, AuthOutcome::Bypassed(BypassKind::TrustedCaller));
        assert_eq!(f.store.stats().misses, 0);
        assert_eq!(f.provider.introspection_count(), 0);
    }

    #[tokio::test]
    async fn expired_entry_is_rejected_under_reject_policy() {
        // GIVEN: a validated token whose cache entry has expired
        let f = fixture(ExpiredTokenPolicy::Reject);
        f.gate.authenticate(&sso("abc"), None).await.unwrap();
        expire(&f, "abc").await;

        // WHEN: presented again
        let rejection = f.gate.authenticate(&sso("abc"), None).await.unwrap_err();

        // THEN: 401 without contacting the provider again
        assert_eq!(rejection.error, AuthError::invalid("token expired"));
        assert_eq!(f.provider.introspection_count(), 1);
    }

    #[tokio::test]
    async fn expired_entry_is_revalidated_under_revalidate_policy() {
        let f = fixture(ExpiredTokenPolicy::Revalidate);
        f.gate.authenticate(&sso("abc"), None).await.unwrap();
        expire(&f, "abc").await;

        let outcome = f.gate.authenticate(&sso("abc"), None).await.unwrap();

        assert!(matches!(outcome, AuthOutcome::Allowed(_)));
        assert_eq!(f.provider.introspection_count(), 2);
        let fresh = f.gate.cache().lookup_expiration("u1").await.unwrap();
        assert!(fresh > Utc::now());
    }

    #[tokio::test]
    async fn no_credential_is_missing_credential() {
        let f = fixture(ExpiredTokenPolicy::Revalidate);
        let (parts, _) = Request::builder().uri("/").body(Body::empty()).unwrap().into_parts();

        let rejection = f.gate.authenticate(&parts, None).await.unwrap_err();

        assert_eq!(rejection.error, AuthError::MissingCredential);
        assert_eq!(
            rejection.error.message(),
            "Authentication failed, due to missing or invalid credentials."
        );
    }

    #[tokio::test]
    async fn bearer_without_verifier_is_missing_credential() {
        let f = fixture(ExpiredTokenPolicy::Revalidate);
        let (parts, _) = Request::builder()
            .uri("/")
            .header("authorization", "Bearer x")
            .body(Body::empty())
            .unwrap()
            .into_parts();

        let rejection = f.gate.authenticate(&parts, None).await.unwrap_err();

        assert_eq!(rejection.error, AuthError::MissingCredential);
    }

    #[tokio::test]
    async fn rejection_reference_matches_audit_record() {
        let f = fixture(ExpiredTokenPolicy::Revalidate);

        let rejection = f.gate.authenticate(&sso("dead"), None).await.unwrap_err();

        let events = f.sink.0.lock().unwrap();
        let last = events.last().unwrap();
        assert_eq!(last.event, audit::EVENT_REJECTED);
        assert_eq!(last.reference.as_deref(), Some(rejection.reference.as_str()));
        assert!(Uuid::parse_str(&rejection.reference).is_ok());
    }

    #[test]
    fn unresolved_env_bypass_token_is_refused() {
        let mut config = config(ExpiredTokenPolicy::Revalidate);
        config.gate.bypass_token = Some("env:SSO_GATE_TEST_BYPASS_UNSET".to_string());

        let result = AuthGate::new(
            &config,
            Arc::new(InMemoryStore::new()),
            Arc::new(StaticIdentityProvider::new()),
        );

        assert!(matches!(result, Err(crate::Error::Config(_))));
    }

    #[test]
    fn public_paths_match_by_prefix() {
        let f = fixture(ExpiredTokenPolicy::Revalidate);

        assert!(f.gate.is_public_path("/health"));
        assert!(f.gate.is_public_path("/health/live"));
        assert!(!f.gate.is_public_path("/orders"));
    }
}
