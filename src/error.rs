//! Error types shared by every stage of the token lifecycle.
//!
//! `AuthError` is what callers of `login`, `refresh` and `with_auth` receive.
//! It is `Clone` because a single refresh outcome is handed to every caller
//! that joined the in-flight exchange, and serializable because the popup
//! window reports failures to its opener as a message.

use serde::{Deserialize, Serialize};

/// Failures while decoding or verifying a JWT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ValidationError {
    /// The token is not a three-segment JWT with a JSON payload
    #[error("Malformed token: {0}")]
    MalformedToken(String),

    /// A token the exchange must return was absent (e.g. `id_token`)
    #[error("Token response is missing '{0}'")]
    MissingToken(String),

    /// The `exp` claim is missing or lies in the past
    #[error("Token has expired")]
    Expired,

    /// The `iss` claim does not match the configured issuer
    #[error("Invalid issuer claim")]
    InvalidIssuer,

    /// The `aud` claim does not contain the expected audience
    #[error("Invalid audience claim")]
    InvalidAudience,

    /// No key in the JWKS matches the token's `kid`
    #[error("No signing key found for kid {0:?}")]
    UnknownSigningKey(Option<String>),

    /// The delegated verifier rejected the signature
    #[error("Invalid token signature: {0}")]
    InvalidSignature(String),

    /// The key or token uses an algorithm the verifier cannot handle
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
}

/// Failures of the key/value persistence layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum StorageError {
    /// The storage substrate is not available in this context
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// The browser refused the write because the quota is exhausted
    #[error("Storage quota exceeded")]
    QuotaExceeded,

    /// The stored record could not be serialized or parsed
    #[error("Failed to serialize stored record: {0}")]
    Serialization(String),

    /// Any other backend failure
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Every failure a caller of the engine can observe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum AuthError {
    /// Token persistence failed
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Token decoding or verification failed
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The browser refused to open the login popup
    #[error("Popup blocked. Please allow popups for this site.")]
    PopupBlocked,

    /// The user closed the popup before the flow completed
    #[error("Popup closed by user")]
    PopupClosedByUser,

    /// The configured login timeout elapsed
    #[error("Login timed out")]
    LoginTimedOut,

    /// The login attempt was cancelled (e.g. by `logout`)
    #[error("Login cancelled")]
    LoginCancelled,

    /// Another login attempt is already waiting for its popup
    #[error("A login attempt is already in progress")]
    LoginInProgress,

    /// The authorization server redirected back with an `error` parameter
    #[error("Authorization denied: {error}")]
    AuthorizationDenied {
        error: String,
        description: Option<String>,
    },

    /// The redirect callback lacked `code` or `state`
    #[error("Missing authorization parameters")]
    MissingParameters,

    /// The callback `state` matches no pending exchange (possible CSRF)
    #[error("Invalid state parameter")]
    InvalidState,

    /// The token endpoint answered with a non-success status
    #[error("Token endpoint returned {status}: {error}")]
    TokenEndpoint {
        status: u16,
        error: String,
        description: Option<String>,
    },

    /// The request never produced a usable HTTP response
    #[error("Network error: {0}")]
    Network(String),

    /// A refresh was requested but no refresh token is held
    #[error("No refresh token available")]
    NoRefreshToken,

    /// A logout or a newer login replaced the session while this refresh
    /// was in flight; its tokens were discarded
    #[error("Session changed during refresh")]
    SessionSuperseded,

    /// The secure random source failed
    #[error("Secure random source unavailable: {0}")]
    Randomness(String),

    /// The engine or one of its collaborators is misconfigured
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl AuthError {
    /// Returns true when the caller should send the user through login again
    /// rather than showing the error in place.
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            AuthError::Validation(_)
                | AuthError::Storage(_)
                | AuthError::InvalidState
                | AuthError::NoRefreshToken
                | AuthError::TokenEndpoint { .. }
        )
    }

    /// Returns true for failures caused by the user walking away from the popup.
    pub fn is_abandoned_login(&self) -> bool {
        matches!(
            self,
            AuthError::PopupBlocked
                | AuthError::PopupClosedByUser
                | AuthError::LoginTimedOut
                | AuthError::LoginCancelled
        )
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        AuthError::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(AuthError::InvalidState.to_string(), "Invalid state parameter");
        assert_eq!(
            AuthError::Validation(ValidationError::Expired).to_string(),
            "Token has expired"
        );
        assert_eq!(
            AuthError::TokenEndpoint {
                status: 400,
                error: "invalid_grant".to_string(),
                description: None,
            }
            .to_string(),
            "Token endpoint returned 400: invalid_grant"
        );
    }

    #[test]
    fn test_validation_error_converts() {
        let err: AuthError = ValidationError::InvalidIssuer.into();
        assert!(matches!(
            err,
            AuthError::Validation(ValidationError::InvalidIssuer)
        ));
        assert!(err.requires_login());
    }

    #[test]
    fn test_abandoned_login_kinds() {
        assert!(AuthError::PopupClosedByUser.is_abandoned_login());
        assert!(AuthError::PopupBlocked.is_abandoned_login());
        assert!(!AuthError::InvalidState.is_abandoned_login());
        assert!(!AuthError::PopupClosedByUser.requires_login());
    }

    #[test]
    fn test_error_survives_serialization() {
        let err = AuthError::AuthorizationDenied {
            error: "access_denied".to_string(),
            description: Some("User cancelled".to_string()),
        };
        let json = serde_json::to_string(&err).unwrap();
        let back: AuthError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, back);

        let nested: AuthError = ValidationError::UnknownSigningKey(Some("k1".into())).into();
        let json = serde_json::to_value(&nested).unwrap();
        assert_eq!(json["kind"], "validation");
        assert_eq!(json["detail"]["kind"], "unknown_signing_key");
    }
}
