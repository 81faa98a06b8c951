//! Configuration management

use std::{collections::HashMap, env, net::IpAddr, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Gate (SSO path, cache lifetime, grant) configuration
    pub gate: GateConfig,
    /// Identity provider client configuration
    pub provider: ProviderConfig,
    /// OAuth2 bearer verification
    pub oauth: OAuthConfig,
    /// Upstream network trust
    pub network: NetworkConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 39500,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// What to do when a cached identity has passed its expiration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExpiredTokenPolicy {
    /// Introspect the token again and refresh the cache
    #[default]
    Revalidate,
    /// Reject the request with 401 without contacting the provider
    Reject,
}

/// Gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Header carrying the SSO token
    pub sso_header: String,
    /// Group a user must belong to at validation time to receive the grant
    pub required_group: String,
    /// Grant value stored for members of `required_group` and checked on every request
    pub required_grant: String,
    /// How long a validated identity is trusted without re-introspection
    #[serde(with = "humantime_serde")]
    pub token_lifetime: Duration,
    /// SSO token value that skips every check (supports `env:VAR_NAME`)
    pub bypass_token: Option<String>,
    /// Behaviour when the cached expiration is in the past
    pub expired_policy: ExpiredTokenPolicy,
    /// Maximum form body buffered while looking for an `authorization` field
    pub form_body_limit: usize,
    /// Paths that bypass authentication (prefix match)
    pub public_paths: Vec<String>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            sso_header: "nauth-sso".to_string(),
            required_group: String::new(),
            required_grant: String::new(),
            token_lifetime: Duration::from_secs(8 * 3600),
            bypass_token: None,
            expired_policy: ExpiredTokenPolicy::default(),
            form_body_limit: 64 * 1024,
            public_paths: vec!["/health".to_string()],
        }
    }
}

/// Identity provider client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// OAuth client id used for introspection
    pub client_id: String,
    /// OAuth client secret (supports `env:VAR_NAME`)
    pub client_secret: String,
    /// Redirect URI registered for the client, forwarded on introspection
    pub redirect_uri: Option<String>,
    /// Selected environment (key of `environments`)
    pub environment: String,
    /// Provider base URL per environment
    pub environments: HashMap<String, String>,
    /// Introspection endpoint path
    pub introspection_path: String,
    /// User-info endpoint path
    pub userinfo_path: String,
    /// Per-call timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            redirect_uri: None,
            environment: "production".to_string(),
            environments: HashMap::new(),
            introspection_path: "/oauth/introspect".to_string(),
            userinfo_path: "/oauth/userinfo".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

impl ProviderConfig {
    /// Base URL of the selected environment
    pub fn base_url(&self) -> Result<&str> {
        self.environments
            .get(&self.environment)
            .map(String::as_str)
            .ok_or_else(|| {
                Error::Config(format!(
                    "Unknown provider environment '{}'",
                    self.environment
                ))
            })
    }
}

/// OAuth2 bearer verification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    /// Accept OAuth2 bearer tokens in addition to SSO tokens
    pub enabled: bool,
    /// Expected `iss` claim
    pub issuer: Option<String>,
    /// Accepted `aud` values (empty = audience not checked)
    pub audiences: Vec<String>,
    /// JWKS endpoint for asymmetric keys
    pub jwks_uri: Option<String>,
    /// Shared secret for HS256 tokens (supports `env:VAR_NAME`)
    pub hmac_secret: Option<String>,
    /// Clock skew tolerance in seconds
    pub leeway_secs: u64,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            issuer: None,
            audiences: Vec::new(),
            jwks_uri: None,
            hmac_secret: None,
            leeway_secs: 60,
        }
    }
}

/// Upstream network trust configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NetworkConfig {
    /// Peer addresses whose requests are marked as trusted callers
    pub trusted_callers: Vec<IpAddr>,
}

/// Resolve a secret value: `env:VAR_NAME` reads the variable, anything else is literal.
///
/// # Errors
///
/// Returns [`Error::Config`] if `VAR_NAME` is unset or not valid Unicode. The
/// raw reference is never used as the secret itself.
pub fn resolve_secret(value: &str) -> Result<String> {
    match value.strip_prefix("env:") {
        Some(var_name) => env::var(var_name)
            .map_err(|e| Error::Config(format!("Secret reference '{value}' unresolved: {e}"))),
        None => Ok(value.to_string()),
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (SSO_GATE_ prefix)
        figment = figment.merge(Env::prefixed("SSO_GATE_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Env files first, so both expansion and secret resolution can see them
        config.load_env_files();
        config.expand_env_vars()?;
        config.resolve_secrets()?;

        Ok(config)
    }

    /// Check the settings the gate cannot run without
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.gate.required_grant.trim().is_empty() {
            return Err(Error::Config("gate.required_grant must be set".to_string()));
        }
        if self.gate.required_group.trim().is_empty() {
            return Err(Error::Config("gate.required_group must be set".to_string()));
        }
        if self.gate.sso_header.trim().is_empty() {
            return Err(Error::Config("gate.sso_header must be set".to_string()));
        }
        if self.gate.token_lifetime.is_zero() {
            return Err(Error::Config(
                "gate.token_lifetime must be greater than zero".to_string(),
            ));
        }
        if self
            .gate
            .bypass_token
            .as_deref()
            .is_some_and(|t| t.starts_with("env:"))
        {
            return Err(Error::Config(
                "gate.bypass_token is an unresolved env: reference".to_string(),
            ));
        }
        self.provider.base_url()?;
        if self.oauth.enabled && self.oauth.jwks_uri.is_none() && self.oauth.hmac_secret.is_none()
        {
            return Err(Error::Config(
                "oauth.enabled requires oauth.jwks_uri or oauth.hmac_secret".to_string(),
            ));
        }
        Ok(())
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {expanded}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {expanded}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in endpoint settings
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Internal(e.to_string()))?;

        for url in self.provider.environments.values_mut() {
            *url = Self::expand_string(&re, url);
        }
        if let Some(uri) = self.provider.redirect_uri.as_mut() {
            *uri = Self::expand_string(&re, uri);
        }
        if let Some(issuer) = self.oauth.issuer.as_mut() {
            *issuer = Self::expand_string(&re, issuer);
        }
        if let Some(uri) = self.oauth.jwks_uri.as_mut() {
            *uri = Self::expand_string(&re, uri);
        }
        Ok(())
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }

    fn resolve_secrets(&mut self) -> Result<()> {
        self.provider.client_secret = resolve_secret(&self.provider.client_secret)?;
        if let Some(token) = self.gate.bypass_token.as_mut() {
            *token = resolve_secret(token)?;
        }
        if let Some(secret) = self.oauth.hmac_secret.as_mut() {
            *secret = resolve_secret(secret)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.gate.required_group = "na-readers".to_string();
        config.gate.required_grant = "GET".to_string();
        config
            .provider
            .environments
            .insert("production".to_string(), "https://sso.example.com".to_string());
        config
    }

    #[test]
    fn defaults_are_sensible() {
        let config = Config::default();
        assert_eq!(config.gate.sso_header, "nauth-sso");
        assert_eq!(config.gate.token_lifetime, Duration::from_secs(8 * 3600));
        assert_eq!(config.gate.expired_policy, ExpiredTokenPolicy::Revalidate);
        assert_eq!(config.gate.public_paths, vec!["/health".to_string()]);
        assert!(!config.oauth.enabled);
    }

    #[test]
    fn validate_accepts_complete_config() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn validate_rejects_missing_grant() {
        let mut config = valid_config();
        config.gate.required_grant = " ".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("required_grant"));
    }

    #[test]
    fn validate_rejects_zero_lifetime() {
        let mut config = valid_config();
        config.gate.token_lifetime = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_unknown_environment() {
        let mut config = valid_config();
        config.provider.environment = "staging".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("staging"));
    }

    #[test]
    fn validate_rejects_oauth_without_key_source() {
        let mut config = valid_config();
        config.oauth.enabled = true;
        assert!(config.validate().is_err());

        config.oauth.hmac_secret = Some("shh".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn resolve_secret_reads_env() {
        let path = env::var("PATH").unwrap();
        assert_eq!(resolve_secret("env:PATH").unwrap(), path);
        assert_eq!(resolve_secret("literal").unwrap(), "literal");
    }

    #[test]
    fn resolve_secret_rejects_unset_variable() {
        let err = resolve_secret("env:SSO_GATE_TEST_SECRET_UNSET").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn load_rejects_unresolved_bypass_token() {
        // GIVEN: a bypass token pointing at a variable nobody set
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "gate:\n  bypass_token: env:SSO_GATE_TEST_BYPASS_UNSET\n"
        )
        .unwrap();

        // WHEN: loaded
        let err = Config::load(Some(file.path())).unwrap_err();

        // THEN: loading fails instead of using the reference as the sentinel
        assert!(err.to_string().contains("SSO_GATE_TEST_BYPASS_UNSET"));
    }

    #[test]
    fn validate_rejects_unresolved_bypass_token() {
        let mut config = valid_config();
        config.gate.bypass_token = Some("env:SSO_GATE_TEST_BYPASS_UNSET".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn expand_string_uses_default() {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").unwrap();
        let expanded = Config::expand_string(&re, "${SSO_GATE_TEST_UNSET_HOST:-localhost}:8080");
        assert_eq!(expanded, "localhost:8080");
    }

    #[test]
    fn load_reads_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r"
gate:
  required_group: na-readers
  required_grant: GET
  token_lifetime: 2h
  expired_policy: reject
provider:
  client_id: gate-client
  environment: sandbox
  environments:
    sandbox: https://sandbox.sso.example.com
"
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();

        assert_eq!(config.gate.token_lifetime, Duration::from_secs(7200));
        assert_eq!(config.gate.expired_policy, ExpiredTokenPolicy::Reject);
        assert_eq!(config.provider.client_id, "gate-client");
        assert_eq!(
            config.provider.base_url().unwrap(),
            "https://sandbox.sso.example.com"
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn load_rejects_bare_integer_lifetime() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "gate:\n  token_lifetime: 8\n").unwrap();

        assert!(Config::load(Some(file.path())).is_err());
    }

    #[test]
    fn load_fails_for_missing_file() {
        let err = Config::load(Some(Path::new("/nonexistent/sso-gate.yaml"))).unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }
}
