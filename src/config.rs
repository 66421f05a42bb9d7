//! Engine configuration.
//!
//! `AuthConfig` names the authorization server, the client registration and
//! every tunable of the token lifecycle. Only `issuer_url`, `client_id` and
//! `redirect_uri` are required; everything else has a default, so a config can
//! be deserialized from a partial JSON/TOML document.

use crate::error::AuthError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default OAuth scope requested at login.
pub const DEFAULT_SCOPE: &str = "openid profile email";

/// Default storage key holding the serialized token record.
pub const DEFAULT_STORAGE_KEY: &str = "auth_sdk_tokens";

/// Where the token record is persisted between page loads.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StorageBackend {
    /// `window.localStorage` (survives browser restarts)
    #[default]
    LocalStorage,
    /// `window.sessionStorage` (scoped to the tab)
    SessionStorage,
    /// `document.cookie`
    Cookie(CookieOptions),
    /// Process memory only; nothing survives a reload
    Memory,
}

/// Attributes written with the token cookie.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CookieOptions {
    pub domain: Option<String>,
    pub path: String,
    pub secure: bool,
    pub same_site: Option<SameSite>,
}

impl Default for CookieOptions {
    fn default() -> Self {
        Self {
            domain: None,
            path: "/".to_string(),
            secure: true,
            same_site: Some(SameSite::Strict),
        }
    }
}

/// `SameSite` cookie attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

impl SameSite {
    pub fn as_str(&self) -> &'static str {
        match self {
            SameSite::Strict => "strict",
            SameSite::Lax => "lax",
            SameSite::None => "none",
        }
    }
}

/// Configuration for the authentication engine.
///
/// # Fields
///
/// - `issuer_url`: base URL of the authorization server; also the expected `iss`
/// - `client_id`: public client identifier; also the expected ID-token `aud`
/// - `redirect_uri`: callback page loaded in the popup
///
/// # Security
///
/// `token_validation` controls access-token validation and JWT signature
/// verification. Turning it off means tokens are trusted on the strength of
/// TLS alone; it is an explicit opt-out and never the default.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Authorization server base URL (e.g. "https://id.example.com/realms/app")
    pub issuer_url: String,

    /// OAuth client identifier
    pub client_id: String,

    /// Redirect URI registered for this client
    pub redirect_uri: String,

    /// Space-separated scopes requested at login
    #[serde(default = "default_scope")]
    pub scope: String,

    /// Extra query parameters appended to the authorization URL (e.g. `audience`)
    #[serde(default)]
    pub extra_authorize_params: Vec<(String, String)>,

    /// Token persistence backend
    #[serde(default)]
    pub storage: StorageBackend,

    /// Key under which the token record is stored
    #[serde(default = "default_storage_key")]
    pub storage_key: String,

    /// Header carrying the access token on guarded requests
    #[serde(default = "default_auth_header")]
    pub auth_header: String,

    /// Scheme placed before the access token
    #[serde(default = "default_token_prefix")]
    pub token_prefix: String,

    /// Header carrying the anti-CSRF token on state-mutating requests
    #[serde(default = "default_csrf_header")]
    pub csrf_header: String,

    /// Refresh proactively before the access token expires
    #[serde(default = "default_true")]
    pub auto_refresh: bool,

    /// How many seconds before expiry the proactive refresh fires
    #[serde(default = "default_refresh_threshold")]
    pub refresh_threshold_secs: u64,

    /// Validate access tokens and verify signatures against the JWKS
    #[serde(default = "default_true")]
    pub token_validation: bool,

    /// Path of the JWKS document relative to `issuer_url`
    #[serde(default = "default_jwks_path")]
    pub jwks_path: String,

    /// How long fetched signing keys are trusted before refetching
    #[serde(default = "default_jwks_ttl")]
    pub jwks_cache_ttl_secs: u64,

    /// Path of the revocation endpoint relative to `issuer_url`
    #[serde(default = "default_revocation_path")]
    pub revocation_path: String,

    /// Login popup width in pixels
    #[serde(default = "default_popup_width")]
    pub popup_width: u32,

    /// Login popup height in pixels
    #[serde(default = "default_popup_height")]
    pub popup_height: u32,

    /// How often the opener checks whether the popup was closed
    #[serde(default = "default_poll_interval")]
    pub popup_poll_interval_ms: u64,

    /// Give up on a login popup after this many seconds (none = wait for the user)
    #[serde(default)]
    pub login_timeout_secs: Option<u64>,
}

fn default_scope() -> String {
    DEFAULT_SCOPE.to_string()
}

fn default_storage_key() -> String {
    DEFAULT_STORAGE_KEY.to_string()
}

fn default_auth_header() -> String {
    "Authorization".to_string()
}

fn default_token_prefix() -> String {
    "Bearer".to_string()
}

fn default_csrf_header() -> String {
    "X-CSRF-TOKEN".to_string()
}

fn default_true() -> bool {
    true
}

fn default_refresh_threshold() -> u64 {
    300
}

fn default_jwks_path() -> String {
    "/.well-known/jwks.json".to_string()
}

fn default_jwks_ttl() -> u64 {
    3600
}

fn default_revocation_path() -> String {
    "/revoke".to_string()
}

fn default_popup_width() -> u32 {
    500
}

fn default_popup_height() -> u32 {
    600
}

fn default_poll_interval() -> u64 {
    500
}

impl AuthConfig {
    /// Creates a config with the three required values and defaults elsewhere.
    ///
    /// # Example
    ///
    /// ```
    /// # use dxauth::AuthConfig;
    /// let config = AuthConfig::new(
    ///     "https://id.example.com".to_string(),
    ///     "spa-client".to_string(),
    ///     "https://app.example.com/callback".to_string(),
    /// );
    /// assert_eq!(config.refresh_threshold_secs, 300);
    /// assert!(config.token_validation);
    /// ```
    pub fn new(issuer_url: String, client_id: String, redirect_uri: String) -> Self {
        Self {
            issuer_url: issuer_url.trim_end_matches('/').to_string(),
            client_id,
            redirect_uri,
            scope: default_scope(),
            extra_authorize_params: Vec::new(),
            storage: StorageBackend::default(),
            storage_key: default_storage_key(),
            auth_header: default_auth_header(),
            token_prefix: default_token_prefix(),
            csrf_header: default_csrf_header(),
            auto_refresh: true,
            refresh_threshold_secs: default_refresh_threshold(),
            token_validation: true,
            jwks_path: default_jwks_path(),
            jwks_cache_ttl_secs: default_jwks_ttl(),
            revocation_path: default_revocation_path(),
            popup_width: default_popup_width(),
            popup_height: default_popup_height(),
            popup_poll_interval_ms: default_poll_interval(),
            login_timeout_secs: None,
        }
    }

    /// Loads the config from compile-time environment variables.
    ///
    /// Expected variables (see `build.rs`):
    /// - `AUTH_SDK_ISSUER_URL`
    /// - `AUTH_SDK_CLIENT_ID`
    /// - `AUTH_SDK_REDIRECT_URI`
    /// - `AUTH_SDK_SCOPE` (optional)
    ///
    /// Returns `None` if any required variable was not set at compile time.
    pub fn from_env() -> Option<Self> {
        let issuer_url = option_env!("AUTH_SDK_ISSUER_URL")?;
        let client_id = option_env!("AUTH_SDK_CLIENT_ID")?;
        let redirect_uri = option_env!("AUTH_SDK_REDIRECT_URI")?;

        let mut config = Self::new(
            issuer_url.to_string(),
            client_id.to_string(),
            redirect_uri.to_string(),
        );
        if let Some(scope) = option_env!("AUTH_SDK_SCOPE") {
            config.scope = scope.to_string();
        }
        Some(config)
    }

    /// Loads the config from compile-time environment variables or panics.
    ///
    /// # Panics
    ///
    /// Panics with a descriptive message if a required variable is missing.
    /// Intended for application entry points where configuration is mandatory.
    pub fn from_env_or_panic() -> Self {
        Self::from_env().expect(
            "Auth configuration not found. Please set the following environment variables at compile time:\n\
             - AUTH_SDK_ISSUER_URL\n\
             - AUTH_SDK_CLIENT_ID\n\
             - AUTH_SDK_REDIRECT_URI\n\n\
             For local development, construct the config with AuthConfig::new() instead.",
        )
    }

    /// Checks the values the engine cannot work without.
    pub fn validate(&self) -> Result<(), AuthError> {
        if self.client_id.trim().is_empty() {
            return Err(AuthError::Configuration("client_id is empty".to_string()));
        }
        if self.redirect_uri.trim().is_empty() {
            return Err(AuthError::Configuration("redirect_uri is empty".to_string()));
        }
        if self.popup_poll_interval_ms == 0 {
            return Err(AuthError::Configuration(
                "popup_poll_interval_ms must be positive".to_string(),
            ));
        }
        self.authorization_origin().map(|_| ())
    }

    /// Returns the issuer base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        self.issuer_url.trim_end_matches('/')
    }

    /// Returns the expected `iss` claim.
    ///
    /// # Example
    ///
    /// ```
    /// # use dxauth::AuthConfig;
    /// let config = AuthConfig::new(
    ///     "https://id.example.com/".to_string(),
    ///     "spa".to_string(),
    ///     "https://app.example.com/callback".to_string(),
    /// );
    /// assert_eq!(config.issuer(), "https://id.example.com");
    /// ```
    pub fn issuer(&self) -> &str {
        self.base_url()
    }

    /// Returns the authorization endpoint URL.
    pub fn authorize_url(&self) -> String {
        format!("{}/authorize", self.base_url())
    }

    /// Returns the token endpoint URL.
    pub fn token_url(&self) -> String {
        format!("{}/token", self.base_url())
    }

    /// Returns the revocation endpoint URL.
    pub fn revocation_url(&self) -> String {
        join_path(self.base_url(), &self.revocation_path)
    }

    /// Returns the JWKS endpoint URL.
    pub fn jwks_url(&self) -> String {
        join_path(self.base_url(), &self.jwks_path)
    }

    /// Returns the origin (`scheme://host[:port]`) of the authorization server.
    ///
    /// Cross-window messages are only trusted when they come from this origin.
    pub fn authorization_origin(&self) -> Result<String, AuthError> {
        let url = url::Url::parse(self.base_url()).map_err(|e| {
            AuthError::Configuration(format!("issuer_url is not a valid URL: {}", e))
        })?;
        match url.origin() {
            origin @ url::Origin::Tuple(..) => Ok(origin.ascii_serialization()),
            url::Origin::Opaque(_) => Err(AuthError::Configuration(
                "issuer_url has no usable origin".to_string(),
            )),
        }
    }

    /// Returns the proactive refresh lead time.
    pub fn refresh_threshold(&self) -> Duration {
        Duration::from_secs(self.refresh_threshold_secs)
    }

    /// Returns the popup poll interval.
    pub fn popup_poll_interval(&self) -> Duration {
        Duration::from_millis(self.popup_poll_interval_ms)
    }

    /// Returns the login timeout, if one is configured.
    pub fn login_timeout(&self) -> Option<Duration> {
        self.login_timeout_secs.map(Duration::from_secs)
    }
}

fn join_path(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    format!("{}/{}", base, path.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AuthConfig {
        AuthConfig::new(
            "https://id.example.com/realms/app".to_string(),
            "spa-client".to_string(),
            "https://app.example.com/callback".to_string(),
        )
    }

    #[test]
    fn test_new_applies_defaults() {
        let config = test_config();
        assert_eq!(config.scope, "openid profile email");
        assert_eq!(config.storage, StorageBackend::LocalStorage);
        assert_eq!(config.storage_key, "auth_sdk_tokens");
        assert_eq!(config.auth_header, "Authorization");
        assert_eq!(config.token_prefix, "Bearer");
        assert_eq!(config.csrf_header, "X-CSRF-TOKEN");
        assert!(config.auto_refresh);
        assert!(config.token_validation);
        assert_eq!(config.popup_width, 500);
        assert_eq!(config.popup_height, 600);
        assert_eq!(config.popup_poll_interval(), Duration::from_millis(500));
        assert!(config.login_timeout().is_none());
    }

    #[test]
    fn test_endpoint_urls() {
        let config = test_config();
        assert_eq!(
            config.authorize_url(),
            "https://id.example.com/realms/app/authorize"
        );
        assert_eq!(config.token_url(), "https://id.example.com/realms/app/token");
        assert_eq!(
            config.revocation_url(),
            "https://id.example.com/realms/app/revoke"
        );
        assert_eq!(
            config.jwks_url(),
            "https://id.example.com/realms/app/.well-known/jwks.json"
        );
        assert_eq!(config.issuer(), "https://id.example.com/realms/app");
    }

    #[test]
    fn test_absolute_jwks_path_is_used_verbatim() {
        let mut config = test_config();
        config.jwks_path = "https://keys.example.com/jwks".to_string();
        assert_eq!(config.jwks_url(), "https://keys.example.com/jwks");
    }

    #[test]
    fn test_authorization_origin() {
        let config = test_config();
        assert_eq!(
            config.authorization_origin().unwrap(),
            "https://id.example.com"
        );

        let config = AuthConfig::new(
            "http://localhost:8081/realms/master".to_string(),
            "profile".to_string(),
            "http://localhost:3000".to_string(),
        );
        assert_eq!(
            config.authorization_origin().unwrap(),
            "http://localhost:8081"
        );
    }

    #[test]
    fn test_validate() {
        assert!(test_config().validate().is_ok());

        let mut config = test_config();
        config.client_id = "  ".to_string();
        assert!(matches!(
            config.validate(),
            Err(AuthError::Configuration(_))
        ));

        let mut config = test_config();
        config.issuer_url = "not a url".to_string();
        assert!(config.validate().is_err());

        let mut config = test_config();
        config.popup_poll_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial_config() {
        let json = r#"{
            "issuer_url": "https://id.example.com",
            "client_id": "spa",
            "redirect_uri": "https://app.example.com/cb",
            "refresh_threshold_secs": 60,
            "storage": { "kind": "cookie", "path": "/app", "secure": true },
            "token_validation": false
        }"#;

        let config: AuthConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.refresh_threshold_secs, 60);
        assert!(!config.token_validation);
        assert_eq!(config.scope, DEFAULT_SCOPE);
        match config.storage {
            StorageBackend::Cookie(options) => {
                assert_eq!(options.path, "/app");
                assert!(options.domain.is_none());
            }
            other => panic!("unexpected backend: {:?}", other),
        }
    }

    #[test]
    fn test_serialization_roundtrip() {
        let config = test_config();
        let json = serde_json::to_string(&config).unwrap();
        let back: AuthConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn test_from_env() {
        // Only meaningful when AUTH_SDK_* variables were present at build time.
        if let Some(config) = AuthConfig::from_env() {
            assert!(!config.issuer_url.is_empty());
            assert!(!config.client_id.is_empty());
        }
    }
}
