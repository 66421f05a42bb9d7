//! Token and revocation endpoint calls.

use crate::client::http_client::{HttpRequest, HttpTransport};
use crate::client::token_storage::TokenRecord;
use crate::config::AuthConfig;
use crate::error::AuthError;
use serde::{Deserialize, Serialize};

/// Successful token endpoint response.
///
/// Also the payload of the `AUTH_SUCCESS` cross-window message.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Access token lifetime in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("has_id_token", &self.id_token.is_some())
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_in", &self.expires_in)
            .field("token_type", &self.token_type)
            .finish()
    }
}

impl TokenResponse {
    /// Converts the response into a record, keeping the refresh and ID tokens
    /// of `previous` when the server did not rotate them.
    pub fn into_record(self, now: i64, previous: Option<&TokenRecord>) -> TokenRecord {
        let mut record = TokenRecord::new(self.access_token);
        record.refresh_token = self
            .refresh_token
            .or_else(|| previous.and_then(|p| p.refresh_token.clone()));
        record.id_token = self
            .id_token
            .or_else(|| previous.and_then(|p| p.id_token.clone()));
        match self.expires_in {
            Some(secs) => record.expiring_in(secs, now),
            None => record,
        }
    }
}

/// OAuth error body (RFC 6749 §5.2).
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Exchanges an authorization code and its PKCE verifier for tokens.
pub async fn exchange_code(
    transport: &dyn HttpTransport,
    config: &AuthConfig,
    code: &str,
    code_verifier: &str,
) -> Result<TokenResponse, AuthError> {
    tracing::trace!("Exchanging authorization code for tokens");

    let request = HttpRequest::post_form(
        config.token_url(),
        [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", config.client_id.as_str()),
            ("redirect_uri", config.redirect_uri.as_str()),
            ("code_verifier", code_verifier),
        ],
    );
    post_token_request(transport, request).await
}

/// Exchanges a refresh token for a new token set.
pub async fn refresh_tokens(
    transport: &dyn HttpTransport,
    config: &AuthConfig,
    refresh_token: &str,
) -> Result<TokenResponse, AuthError> {
    tracing::trace!("Refreshing tokens");

    let request = HttpRequest::post_form(
        config.token_url(),
        [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", config.client_id.as_str()),
        ],
    );
    post_token_request(transport, request).await
}

async fn post_token_request(
    transport: &dyn HttpTransport,
    request: HttpRequest,
) -> Result<TokenResponse, AuthError> {
    let response = transport.execute(request).await?;

    if !response.is_success() {
        let (error, description) = match response.json::<ErrorResponse>() {
            Ok(body) => (body.error, body.error_description),
            Err(_) => ("http_error".to_string(), None),
        };
        tracing::error!(
            "Token endpoint returned {}: {} - {}",
            response.status,
            error,
            description.as_deref().unwrap_or_default()
        );
        return Err(AuthError::TokenEndpoint {
            status: response.status,
            error,
            description,
        });
    }

    response.json::<TokenResponse>().map_err(|e| {
        tracing::error!("Failed to parse token response: {}", e);
        AuthError::TokenEndpoint {
            status: response.status,
            error: "invalid_response".to_string(),
            description: Some(e.to_string()),
        }
    })
}

/// Revokes a token (RFC 7009).
///
/// `token_type_hint` is `"refresh_token"` or `"access_token"`.
pub async fn revoke_token(
    transport: &dyn HttpTransport,
    config: &AuthConfig,
    token: &str,
    token_type_hint: &str,
) -> Result<(), AuthError> {
    let request = HttpRequest::post_form(
        config.revocation_url(),
        [
            ("token", token),
            ("token_type_hint", token_type_hint),
            ("client_id", config.client_id.as_str()),
        ],
    );

    let response = transport.execute(request).await?;
    if response.is_success() {
        tracing::trace!("Revoked {}", token_type_hint);
        Ok(())
    } else {
        Err(AuthError::Network(format!(
            "revocation endpoint returned {}",
            response.status
        )))
    }
}
