//! PKCE (Proof Key for Code Exchange) utilities for the OAuth 2.0
//! authorization code flow.
//!
//! This module provides functions to generate code verifiers and code
//! challenges as specified in RFC 7636, plus the `state` and anti-CSRF values
//! that travel with a login attempt. Every random value comes from the
//! operating system's secure generator; if that fails the attempt fails.

use crate::config::AuthConfig;
use crate::error::AuthError;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Length of the code verifier in bytes (encodes to 43 characters)
const CODE_VERIFIER_LENGTH: usize = 32;

/// Entropy of the `state` parameter in bytes
const STATE_LENGTH: usize = 32;

/// Entropy of the anti-CSRF request token in bytes
const CSRF_TOKEN_LENGTH: usize = 32;

/// A code verifier and the challenge derived from it.
#[derive(Clone, PartialEq, Eq)]
pub struct PkcePair {
    pub code_verifier: String,
    pub code_challenge: String,
}

impl PkcePair {
    /// Generates a fresh verifier/challenge pair.
    pub fn generate() -> Result<Self, AuthError> {
        Ok(Self::from_verifier(generate_code_verifier()?))
    }

    /// Derives the pair for an existing verifier.
    pub fn from_verifier(code_verifier: String) -> Self {
        let code_challenge = generate_code_challenge(&code_verifier);
        Self {
            code_verifier,
            code_challenge,
        }
    }
}

impl std::fmt::Debug for PkcePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkcePair")
            .field("code_verifier", &"<redacted>")
            .field("code_challenge", &self.code_challenge)
            .finish()
    }
}

fn random_bytes(len: usize) -> Result<Vec<u8>, AuthError> {
    let mut bytes = vec![0u8; len];
    rand::rngs::OsRng.try_fill_bytes(&mut bytes).map_err(|e| {
        tracing::error!("Secure random source failed: {}", e);
        AuthError::Randomness(e.to_string())
    })?;
    Ok(bytes)
}

/// Generates a cryptographically random code verifier.
///
/// The verifier uses only the unreserved characters
/// `[A-Z] / [a-z] / [0-9] / "-" / "_"`.
pub fn generate_code_verifier() -> Result<String, AuthError> {
    Ok(URL_SAFE_NO_PAD.encode(random_bytes(CODE_VERIFIER_LENGTH)?))
}

/// Generates a code challenge from a code verifier using SHA-256.
///
/// The challenge is the base64url (no padding) encoding of the SHA-256
/// digest of the verifier.
pub fn generate_code_challenge(code_verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code_verifier.as_bytes());
    let hash = hasher.finalize();

    URL_SAFE_NO_PAD.encode(hash)
}

/// Generates a random `state` parameter binding a callback to its request.
pub fn generate_state() -> Result<String, AuthError> {
    Ok(URL_SAFE_NO_PAD.encode(random_bytes(STATE_LENGTH)?))
}

/// Generates a hex-encoded anti-CSRF token for state-mutating requests.
pub fn generate_csrf_token() -> Result<String, AuthError> {
    Ok(hex::encode(random_bytes(CSRF_TOKEN_LENGTH)?))
}

/// Builds the authorization endpoint URL for a login attempt.
pub fn build_authorization_url(config: &AuthConfig, code_challenge: &str, state: &str) -> String {
    let mut url = format!(
        "{}?response_type=code&client_id={}&redirect_uri={}&scope={}&code_challenge={}&code_challenge_method=S256&state={}",
        config.authorize_url(),
        urlencoding::encode(&config.client_id),
        urlencoding::encode(&config.redirect_uri),
        urlencoding::encode(&config.scope),
        urlencoding::encode(code_challenge),
        urlencoding::encode(state),
    );

    for (key, value) in &config.extra_authorize_params {
        url.push('&');
        url.push_str(&urlencoding::encode(key));
        url.push('=');
        url.push_str(&urlencoding::encode(value));
    }

    url
}
