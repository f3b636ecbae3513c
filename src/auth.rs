//! Bearer token handling.
//!
//! Tokens are issued by the DMS backend; the gateway only reads them. With a
//! configured secret the HS256 signature is checked as well, otherwise the
//! payload is decoded as-is and a token is only trusted with shared state
//! (cached bodies, event streams) once the backend has accepted it, see
//! [`VerifiedTokens`].

use std::collections::HashMap;

use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::models::{Role, TokenClaims};

/// Name of the session cookie set on login.
pub const SESSION_COOKIE: &str = "token";

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("Unauthorized")]
    Missing,
    #[error("Invalid token")]
    Invalid,
    #[error("Token expired")]
    Expired,
    #[error("Forbidden")]
    Forbidden,
}

impl AuthError {
    pub fn status(self) -> StatusCode {
        match self {
            AuthError::Forbidden => StatusCode::FORBIDDEN,
            _ => StatusCode::UNAUTHORIZED,
        }
    }
}

/// Plain-text rejection, used by the event stream endpoints.
impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

#[derive(Clone)]
pub struct TokenValidator {
    key: DecodingKey,
    validation: Validation,
    verifies_signature: bool,
}

impl TokenValidator {
    /// Decode-only validator: signature is not checked.
    pub fn unverified() -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_aud = false;
        Self {
            key: DecodingKey::from_secret(&[]),
            validation,
            verifies_signature: false,
        }
    }

    pub fn with_secret(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
            verifies_signature: true,
        }
    }

    pub fn from_secret(secret: Option<&str>) -> Self {
        match secret {
            Some(secret) => Self::with_secret(secret.as_bytes()),
            None => Self::unverified(),
        }
    }

    /// Whether a decoded token is known to come from the backend.
    pub fn verifies_signature(&self) -> bool {
        self.verifies_signature
    }

    /// Parse the payload. Returns `None` for anything malformed.
    pub fn decode_token(&self, token: &str) -> Option<TokenClaims> {
        decode::<TokenClaims>(token.trim(), &self.key, &self.validation)
            .ok()
            .map(|data| data.claims)
    }

    pub fn authenticate(&self, token: Option<&str>) -> Result<TokenClaims, AuthError> {
        let token = token.filter(|t| !t.trim().is_empty()).ok_or(AuthError::Missing)?;
        let claims = self.decode_token(token).ok_or(AuthError::Invalid)?;
        if is_expired(&claims) {
            return Err(AuthError::Expired);
        }
        Ok(claims)
    }
}

const VERIFIED_PRUNE_AT: usize = 1024;

/// Exact token strings the backend has answered successfully, kept until
/// they expire.
#[derive(Default)]
pub struct VerifiedTokens {
    tokens: RwLock<HashMap<String, i64>>,
}

impl VerifiedTokens {
    pub async fn contains(&self, token: &str) -> bool {
        let now = Utc::now().timestamp();
        self.tokens
            .read()
            .await
            .get(token)
            .is_some_and(|exp| *exp > now)
    }

    pub async fn record(&self, token: &str, exp: i64) {
        let mut tokens = self.tokens.write().await;
        if tokens.len() >= VERIFIED_PRUNE_AT {
            let now = Utc::now().timestamp();
            tokens.retain(|_, exp| *exp > now);
        }
        tokens.insert(token.to_string(), exp);
    }

    pub async fn len(&self) -> usize {
        self.tokens.read().await.len()
    }
}

pub fn is_expired(claims: &TokenClaims) -> bool {
    is_expired_at(claims, Utc::now().timestamp())
}

pub fn is_expired_at(claims: &TokenClaims, now: i64) -> bool {
    claims.exp <= now
}

pub fn authorize(claims: &TokenClaims, allowed: &[Role]) -> Result<(), AuthError> {
    if allowed.contains(&claims.role) {
        Ok(())
    } else {
        Err(AuthError::Forbidden)
    }
}

pub fn sign_token(claims: &TokenClaims, secret: &[u8]) -> Result<String, jsonwebtoken::errors::Error> {
    encode(&Header::default(), claims, &EncodingKey::from_secret(secret))
}

/// `Authorization: Bearer` first, then the session cookie.
pub fn token_from_headers(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty());

    bearer.or_else(|| cookie_value(headers, SESSION_COOKIE))
}

pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}

pub fn session_cookie(token: &str, max_age_secs: i64, secure: bool) -> String {
    let mut cookie = format!(
        "{SESSION_COOKIE}={token}; HttpOnly; Path=/; SameSite=Lax; Max-Age={}",
        max_age_secs.max(0)
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

pub fn clear_session_cookie() -> String {
    format!("{SESSION_COOKIE}=; HttpOnly; Path=/; SameSite=Lax; Max-Age=0")
}

#[cfg(test)]
pub(crate) fn test_token(role: Role, exp_offset_secs: i64) -> String {
    let claims = TokenClaims {
        id: format!("{}-1", role.as_str()),
        email: Some("user@example.com".to_string()),
        role,
        exp: Utc::now().timestamp() + exp_offset_secs,
        iat: Some(Utc::now().timestamp()),
    };
    sign_token(&claims, b"test-secret").unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn decodes_payload_without_secret() {
        let token = test_token(Role::Admin, 3600);
        let claims = TokenValidator::unverified().decode_token(&token).unwrap();
        assert_eq!(claims.role, Role::Admin);
        assert_eq!(claims.id, "admin-1");
        assert!(!is_expired(&claims));
    }

    #[test]
    fn malformed_tokens_decode_to_none() {
        let validator = TokenValidator::unverified();
        for token in ["", "abc", "a.b", "a.b.c", "not base64!.x.y", "eyJhbGciOiJIUzI1NiJ9.e30.sig"] {
            assert!(validator.decode_token(token).is_none(), "{token} should not decode");
        }
    }

    #[test]
    fn wrong_secret_is_rejected_when_verifying() {
        let token = test_token(Role::Client, 3600);
        assert!(TokenValidator::with_secret(b"other").decode_token(&token).is_none());
        assert!(TokenValidator::with_secret(b"test-secret").decode_token(&token).is_some());
    }

    #[test]
    fn expiry_is_reported_separately_from_decoding() {
        let token = test_token(Role::Client, -10);
        let validator = TokenValidator::unverified();
        let claims = validator.decode_token(&token).unwrap();
        assert!(is_expired(&claims));
        assert!(!is_expired_at(&claims, claims.exp - 1));
        assert_eq!(validator.authenticate(Some(&token)), Err(AuthError::Expired));
    }

    #[test]
    fn authenticate_classifies_failures() {
        let validator = TokenValidator::unverified();
        assert_eq!(validator.authenticate(None), Err(AuthError::Missing));
        assert_eq!(validator.authenticate(Some("  ")), Err(AuthError::Missing));
        assert_eq!(validator.authenticate(Some("garbage")), Err(AuthError::Invalid));
        assert_eq!(AuthError::Expired.to_string(), "Token expired");
    }

    #[test]
    fn authorize_checks_role_membership() {
        let claims = TokenValidator::unverified()
            .decode_token(&test_token(Role::Client, 60))
            .unwrap();
        assert_eq!(authorize(&claims, Role::STAFF), Err(AuthError::Forbidden));
        assert!(authorize(&claims, Role::ALL).is_ok());
    }

    #[test]
    fn only_secret_validators_verify_signatures() {
        assert!(!TokenValidator::unverified().verifies_signature());
        assert!(TokenValidator::from_secret(Some("s")).verifies_signature());
    }

    #[tokio::test]
    async fn verified_tokens_expire() {
        let verified = VerifiedTokens::default();
        let now = Utc::now().timestamp();
        verified.record("live", now + 60).await;
        verified.record("stale", now - 1).await;

        assert!(verified.contains("live").await);
        assert!(!verified.contains("stale").await);
        assert!(!verified.contains("never-seen").await);
        assert_eq!(verified.len().await, 2);
    }

    #[test]
    fn bearer_header_wins_over_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("theme=dark; token=from-cookie"));
        assert_eq!(token_from_headers(&headers).as_deref(), Some("from-cookie"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));
        assert_eq!(token_from_headers(&headers).as_deref(), Some("from-header"));
    }
}
