//! JWT validation.
//!
//! Claims are checked in a fixed order, stopping at the first failure:
//!
//! 1. `exp` present and not in the past, else `Expired`
//! 2. `iss` equals the expected issuer, else `InvalidIssuer`
//! 3. `aud` equals (or, for a list, contains) the expected audience, else
//!    `InvalidAudience`
//!
//! Signature verification is delegated: the validator looks up the token's
//! `kid` in the JWKS cache and hands token and key to a `SignatureVerifier`.
//! On native targets `JwtSignatureVerifier` (built on `jsonwebtoken`) is the
//! default; browser builds plug in their own.
//!
//! # Security
//!
//! `AuthConfig::token_validation = false` turns off access-token validation
//! and every signature check. That is an explicit opt-out; with it on, a
//! validator cannot be built without a verifier.

use crate::client::exchange::TokenResponse;
use crate::client::http_client::HttpTransport;
use crate::client::jwks::{JwksCache, Jwk};
use crate::client::jwt::{self, Claims, DecodedJwt};
use crate::client::runtime::MaybeSend;
use crate::config::AuthConfig;
use crate::error::{AuthError, ValidationError};
use std::sync::Arc;

/// Verifies a JWT signature against a single JWK.
pub trait SignatureVerifier: MaybeSend {
    fn verify(&self, token: &str, key: &Jwk) -> Result<(), ValidationError>;
}

/// Checks `exp`, `iss` and `aud`, in that order.
///
/// `now` is Unix time in seconds. `None` skips the issuer or audience check.
pub fn check_claims(
    claims: &Claims,
    expected_issuer: Option<&str>,
    expected_audience: Option<&str>,
    now: i64,
) -> Result<(), ValidationError> {
    match claims.exp() {
        Some(exp) if exp >= now => {}
        _ => return Err(ValidationError::Expired),
    }

    if let Some(issuer) = expected_issuer
        && claims.iss() != Some(issuer)
    {
        return Err(ValidationError::InvalidIssuer);
    }

    if let Some(audience) = expected_audience
        && !claims.aud().is_some_and(|aud| aud.contains(audience))
    {
        return Err(ValidationError::InvalidAudience);
    }

    Ok(())
}

/// Validates ID and access tokens for one client registration.
pub struct TokenValidator {
    issuer: String,
    audience: String,
    verify_signatures: bool,
    jwks: JwksCache,
    verifier: Option<Arc<dyn SignatureVerifier>>,
}

impl TokenValidator {
    /// Builds a validator for `config`.
    ///
    /// Fails with `AuthError::Configuration` when `token_validation` is on
    /// and no verifier is supplied.
    pub fn from_config(
        config: &AuthConfig,
        transport: Arc<dyn HttpTransport>,
        verifier: Option<Arc<dyn SignatureVerifier>>,
    ) -> Result<Self, AuthError> {
        if config.token_validation && verifier.is_none() {
            return Err(AuthError::Configuration(
                "token_validation is enabled but no signature verifier is available".to_string(),
            ));
        }
        if !config.token_validation {
            tracing::warn!("Token signature verification is disabled");
        }

        Ok(Self {
            issuer: config.issuer().to_string(),
            audience: config.client_id.clone(),
            verify_signatures: config.token_validation,
            jwks: JwksCache::new(
                config.jwks_url(),
                transport,
                std::time::Duration::from_secs(config.jwks_cache_ttl_secs),
            ),
            verifier,
        })
    }

    /// Returns true when signatures and access tokens are checked.
    pub fn verifies_signatures(&self) -> bool {
        self.verify_signatures
    }

    /// Validates an ID token's claims and, when enabled, its signature.
    pub async fn validate_id_token(
        &self,
        token: &str,
        expected_issuer: &str,
        expected_audience: &str,
        now: i64,
    ) -> Result<Claims, AuthError> {
        let decoded = jwt::decode(token)?;
        check_claims(
            &decoded.claims,
            Some(expected_issuer),
            Some(expected_audience),
            now,
        )?;
        self.verify_signature(token, &decoded).await?;
        tracing::trace!("ID token validated");
        Ok(decoded.claims)
    }

    /// Validates an access token's expiry and, when enabled, its signature.
    pub async fn validate_access_token(&self, token: &str, now: i64) -> Result<Claims, AuthError> {
        let decoded = jwt::decode(token)?;
        check_claims(&decoded.claims, None, None, now)?;
        self.verify_signature(token, &decoded).await?;
        tracing::trace!("Access token validated");
        Ok(decoded.claims)
    }

    /// Validates a token endpoint response.
    ///
    /// The ID token is checked against the configured issuer and client id;
    /// `require_id_token` makes its absence an error (authorization-code
    /// responses must carry one, refresh responses need not). The access
    /// token is only checked when signature verification is on, since it may
    /// be opaque otherwise.
    pub async fn validate_response(
        &self,
        tokens: &TokenResponse,
        now: i64,
        require_id_token: bool,
    ) -> Result<(), AuthError> {
        match &tokens.id_token {
            Some(id_token) => {
                self.validate_id_token(id_token, &self.issuer, &self.audience, now)
                    .await?;
            }
            None if require_id_token => {
                return Err(ValidationError::MissingToken("id_token".to_string()).into());
            }
            None => {}
        }

        if self.verify_signatures {
            self.validate_access_token(&tokens.access_token, now).await?;
        }
        Ok(())
    }

    async fn verify_signature(&self, token: &str, decoded: &DecodedJwt) -> Result<(), AuthError> {
        if !self.verify_signatures {
            return Ok(());
        }
        let Some(verifier) = &self.verifier else {
            return Err(AuthError::Configuration(
                "no signature verifier configured".to_string(),
            ));
        };

        let key = self.jwks.get_key(decoded.header.kid.as_deref()).await?;
        verifier.verify(token, &key)?;
        Ok(())
    }
}

/// `SignatureVerifier` backed by `jsonwebtoken`.
///
/// Only the signature is checked here; expiry, issuer and audience are
/// handled by `check_claims`.
#[cfg(not(target_arch = "wasm32"))]
#[derive(Debug, Clone, Copy, Default)]
pub struct JwtSignatureVerifier;

#[cfg(not(target_arch = "wasm32"))]
impl JwtSignatureVerifier {
    fn algorithm(
        key: &Jwk,
        header_alg: jsonwebtoken::Algorithm,
    ) -> Result<jsonwebtoken::Algorithm, ValidationError> {
        use jsonwebtoken::Algorithm;

        let algorithm = match key.alg.as_deref() {
            Some(alg) => alg
                .parse::<Algorithm>()
                .map_err(|_| ValidationError::UnsupportedAlgorithm(alg.to_string()))?,
            None => header_alg,
        };

        let compatible = match key.kty.as_str() {
            "RSA" => matches!(
                algorithm,
                Algorithm::RS256
                    | Algorithm::RS384
                    | Algorithm::RS512
                    | Algorithm::PS256
                    | Algorithm::PS384
                    | Algorithm::PS512
            ),
            "EC" => matches!(algorithm, Algorithm::ES256 | Algorithm::ES384),
            _ => false,
        };

        if compatible {
            Ok(algorithm)
        } else {
            Err(ValidationError::UnsupportedAlgorithm(format!(
                "{:?} with key type {}",
                algorithm, key.kty
            )))
        }
    }

    fn decoding_key(key: &Jwk) -> Result<jsonwebtoken::DecodingKey, ValidationError> {
        use jsonwebtoken::DecodingKey;

        match (key.kty.as_str(), &key.n, &key.e, &key.x, &key.y) {
            ("RSA", Some(n), Some(e), _, _) => DecodingKey::from_rsa_components(n, e)
                .map_err(|e| ValidationError::InvalidSignature(format!("invalid RSA key: {}", e))),
            ("EC", _, _, Some(x), Some(y)) => DecodingKey::from_ec_components(x, y)
                .map_err(|e| ValidationError::InvalidSignature(format!("invalid EC key: {}", e))),
            (kty, ..) => Err(ValidationError::UnsupportedAlgorithm(format!(
                "no usable key material for key type {}",
                kty
            ))),
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl SignatureVerifier for JwtSignatureVerifier {
    fn verify(&self, token: &str, key: &Jwk) -> Result<(), ValidationError> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| ValidationError::MalformedToken(e.to_string()))?;
        let algorithm = Self::algorithm(key, header.alg)?;
        let decoding_key = Self::decoding_key(key)?;

        let mut validation = jsonwebtoken::Validation::new(algorithm);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        jsonwebtoken::decode::<serde_json::Value>(token, &decoding_key, &validation).map_err(
            |e| {
                tracing::warn!("Token signature rejected: {}", e);
                ValidationError::InvalidSignature(e.to_string())
            },
        )?;

        tracing::trace!("Signature verified with kid {:?}", key.kid);
        Ok(())
    }
}
