//! Bearer-token validation.
//!
//! Tokens are three-segment JWTs. A token is accepted when its signature
//! verifies against the configured JWK set, the issuer and audience match,
//! `exp` lies in the future and `iat` not in the future (both within a 60 s
//! clock skew). The JWK set is fetched from the configured URI and refreshed
//! whenever no usable key is cached.

#[macro_use]
extern crate slog_scope;

use std::fmt;
use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use backtrace::Backtrace;
use http::StatusCode;
use jsonwebtoken::{
    decode, decode_header,
    errors::ErrorKind,
    jwk::{Jwk, JwkSet, KeyAlgorithm},
    Algorithm, DecodingKey, Validation,
};
use serde::Deserialize;
use thiserror::Error;

use sentinel_common::{impl_fmt_display, TenantContext};

/// Accepted clock skew for `exp` and `iat`, in seconds.
pub const CLOCK_SKEW_SECS: u64 = 60;

#[derive(Debug)]
pub struct AuthError {
    kind: AuthErrorKind,
    pub status: StatusCode,
    pub backtrace: Backtrace,
}

#[derive(Debug, Error)]
pub enum AuthErrorKind {
    #[error("malformed token: {}", _0)]
    Malformed(String),

    #[error("token signature could not be verified")]
    Signature,

    #[error("token has expired")]
    Expired,

    #[error("token issued in the future")]
    IssuedInFuture,

    #[error("issuer mismatch")]
    Issuer,

    #[error("audience mismatch")]
    Audience,

    #[error("token carries no tenant")]
    MissingTenant,

    #[error("no verification keys available")]
    NoKeys,

    #[error("signature enforcement is disabled but no alternate verifier exists")]
    EnforcementDisabled,

    #[error("key set fetch failed: {}", _0)]
    KeyFetch(String),
}

impl From<AuthErrorKind> for AuthError {
    fn from(kind: AuthErrorKind) -> Self {
        // Every validation failure renders as 401; the split into kinds only
        // feeds logs and metrics.
        Self {
            kind,
            status: StatusCode::UNAUTHORIZED,
            backtrace: Backtrace::new(),
        }
    }
}

impl AuthError {
    pub fn kind(&self) -> &AuthErrorKind {
        &self.kind
    }
}

impl std::error::Error for AuthError {}

impl_fmt_display!(AuthError, AuthErrorKind);

/// The claims the service reads out of an accepted token. Registered claims
/// used purely for validation (`exp`, `iss`, `aud`) stay inside the decoder.
#[derive(Debug, Deserialize)]
pub struct Claims {
    pub sub: Option<String>,
    pub iat: Option<i64>,
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub is_system: bool,
}

/// One decoding key plus the algorithm family it belongs to.
pub struct VerifyKey {
    pub kid: Option<String>,
    pub key: DecodingKey,
    pub algorithm: Algorithm,
}

#[async_trait]
pub trait VerifyToken: Sync + Send {
    async fn verify(&self, token: &str) -> Result<TenantContext, AuthError>;
}

pub struct Verifier {
    jwks_uri: url::Url,
    issuer: String,
    audience: String,
    enforce_signature: bool,
    client: reqwest::Client,
    keys: RwLock<Vec<VerifyKey>>,
}

impl Verifier {
    pub fn new(
        jwks_uri: &str,
        issuer: &str,
        audience: &str,
        enforce_signature: bool,
    ) -> Result<Self, AuthError> {
        Self::with_keys(jwks_uri, issuer, audience, enforce_signature, Vec::new())
    }

    /// Builds a verifier with pre-provisioned keys; the remote set is only
    /// consulted while no usable key is cached.
    pub fn with_keys(
        jwks_uri: &str,
        issuer: &str,
        audience: &str,
        enforce_signature: bool,
        keys: Vec<VerifyKey>,
    ) -> Result<Self, AuthError> {
        let jwks_uri = url::Url::parse(jwks_uri)
            .map_err(|e| AuthErrorKind::KeyFetch(format!("bad JWK set uri: {}", e)))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AuthErrorKind::KeyFetch(e.to_string()))?;

        Ok(Self {
            jwks_uri,
            issuer: issuer.to_owned(),
            audience: audience.to_owned(),
            enforce_signature,
            client,
            keys: RwLock::new(keys),
        })
    }

    async fn ensure_keys(&self) -> Result<(), AuthError> {
        if !self.keys.read().expect("key cache poisoned").is_empty() {
            return Ok(());
        }
        let fetched = self.fetch_keys().await?;
        if fetched.is_empty() {
            return Err(AuthErrorKind::NoKeys.into());
        }
        *self.keys.write().expect("key cache poisoned") = fetched;
        Ok(())
    }

    async fn fetch_keys(&self) -> Result<Vec<VerifyKey>, AuthError> {
        let jwks: JwkSet = self
            .client
            .get(self.jwks_uri.clone())
            .send()
            .await
            .map_err(|e| AuthErrorKind::KeyFetch(e.to_string()))?
            .error_for_status()
            .map_err(|e| AuthErrorKind::KeyFetch(e.to_string()))?
            .json()
            .await
            .map_err(|e| AuthErrorKind::KeyFetch(e.to_string()))?;

        Ok(jwks
            .keys
            .iter()
            .filter_map(|jwk| match DecodingKey::from_jwk(jwk) {
                Ok(key) => Some(VerifyKey {
                    kid: jwk.common.key_id.clone(),
                    key,
                    algorithm: algorithm_for(jwk),
                }),
                Err(e) => {
                    warn!("skipping unusable JWK: {}", e);
                    None
                }
            })
            .collect())
    }

    fn validation(&self, algorithm: Algorithm) -> Validation {
        let mut validation = Validation::new(algorithm);
        validation.leeway = CLOCK_SKEW_SECS;
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_audience(&[self.audience.as_str()]);
        validation
    }

    fn decode_claims(&self, token: &str) -> Result<Claims, AuthError> {
        let header = decode_header(token)
            .map_err(|e| AuthErrorKind::Malformed(format!("undecodable header: {}", e)))?;

        let keys = self.keys.read().expect("key cache poisoned");
        let candidates: Vec<&VerifyKey> = keys
            .iter()
            .filter(|key| match (&key.kid, &header.kid) {
                (Some(kid), Some(wanted)) => kid == wanted,
                // Keys without an id are tried against every token.
                (None, _) => true,
                (Some(_), None) => true,
            })
            .collect();
        if candidates.is_empty() {
            return Err(AuthErrorKind::NoKeys.into());
        }

        let mut last_signature_failure = None;
        for key in candidates {
            match decode::<Claims>(token, &key.key, &self.validation(key.algorithm)) {
                Ok(data) => return Ok(data.claims),
                Err(e) => match e.kind() {
                    // A wrong key is worth trying the next one; anything else
                    // is a verdict about the token itself.
                    ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
                        last_signature_failure = Some(AuthErrorKind::Signature)
                    }
                    ErrorKind::ExpiredSignature => return Err(AuthErrorKind::Expired.into()),
                    ErrorKind::InvalidIssuer => return Err(AuthErrorKind::Issuer.into()),
                    ErrorKind::InvalidAudience => return Err(AuthErrorKind::Audience.into()),
                    ErrorKind::ImmatureSignature => {
                        return Err(AuthErrorKind::IssuedInFuture.into())
                    }
                    other => {
                        return Err(
                            AuthErrorKind::Malformed(format!("validation failed: {:?}", other))
                                .into(),
                        )
                    }
                },
            }
        }
        Err(last_signature_failure
            .unwrap_or(AuthErrorKind::Signature)
            .into())
    }

    fn context_from(&self, claims: Claims) -> Result<TenantContext, AuthError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        if let Some(iat) = claims.iat {
            if iat > now + CLOCK_SKEW_SECS as i64 {
                return Err(AuthErrorKind::IssuedInFuture.into());
            }
        }

        let tenant_id = claims
            .tenant_id
            .filter(|t| !t.is_empty())
            .ok_or(AuthErrorKind::MissingTenant)?;

        Ok(TenantContext {
            tenant_id,
            user_id: claims.sub,
            roles: claims.roles,
            is_system: claims.is_system,
        })
    }
}

#[async_trait]
impl VerifyToken for Verifier {
    async fn verify(&self, token: &str) -> Result<TenantContext, AuthError> {
        if !self.enforce_signature {
            // The escape hatch exists in configuration only; running without
            // signature checks is unimplemented, so it fails closed.
            return Err(AuthErrorKind::EnforcementDisabled.into());
        }

        self.ensure_keys().await?;
        let claims = match self.decode_claims(token) {
            Ok(claims) => claims,
            Err(e) if matches!(e.kind(), AuthErrorKind::Signature) => {
                // The signing key may have rotated; refresh once and retry.
                // A failed refresh keeps the cached keys and the original
                // verdict.
                let previous =
                    std::mem::take(&mut *self.keys.write().expect("key cache poisoned"));
                if self.ensure_keys().await.is_err() {
                    *self.keys.write().expect("key cache poisoned") = previous;
                    return Err(e);
                }
                self.decode_claims(token)?
            }
            Err(e) => return Err(e),
        };
        self.context_from(claims)
    }
}

fn algorithm_for(jwk: &Jwk) -> Algorithm {
    match jwk.common.key_algorithm {
        Some(KeyAlgorithm::HS256) => Algorithm::HS256,
        Some(KeyAlgorithm::HS384) => Algorithm::HS384,
        Some(KeyAlgorithm::HS512) => Algorithm::HS512,
        Some(KeyAlgorithm::ES256) => Algorithm::ES256,
        Some(KeyAlgorithm::ES384) => Algorithm::ES384,
        Some(KeyAlgorithm::RS384) => Algorithm::RS384,
        Some(KeyAlgorithm::RS512) => Algorithm::RS512,
        Some(KeyAlgorithm::PS256) => Algorithm::PS256,
        Some(KeyAlgorithm::PS384) => Algorithm::PS384,
        Some(KeyAlgorithm::PS512) => Algorithm::PS512,
        Some(KeyAlgorithm::EdDSA) => Algorithm::EdDSA,
        _ => Algorithm::RS256,
    }
}

/// A verifier for tests: accepts or rejects everything.
pub struct MockVerifier {
    pub valid: bool,
    pub context: TenantContext,
}

#[async_trait]
impl VerifyToken for MockVerifier {
    async fn verify(&self, _token: &str) -> Result<TenantContext, AuthError> {
        if self.valid {
            Ok(self.context.clone())
        } else {
            Err(AuthErrorKind::Signature.into())
        }
    }
}
