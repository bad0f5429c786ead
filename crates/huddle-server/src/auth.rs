//! Bearer tokens for the user API.
//!
//! Tokens are HS256 JSON Web Tokens carrying the user's id and name.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;

use crate::error::ApiError;
use crate::handlers::AppState;
use crate::users::User;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "HS256";

/// Token errors.
#[derive(Debug, Error)]
pub enum TokenError {
    /// Not three dot-separated segments.
    #[error("Malformed token")]
    Malformed,

    /// Header names an algorithm other than HS256.
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Signature does not match.
    #[error("Invalid signature")]
    BadSignature,

    /// Token is past its expiry.
    #[error("Token expired")]
    Expired,

    /// Segment is not valid base64url.
    #[error("Invalid encoding: {0}")]
    Encoding(#[from] base64::DecodeError),

    /// Segment is not valid JSON.
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Signing key was rejected.
    #[error("Invalid signing key")]
    InvalidKey,
}

/// Token header.
#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
}

/// Claims carried by a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub id: u64,
    /// User name.
    pub name: String,
    /// Issued at (seconds since epoch).
    pub iat: i64,
    /// Expires at (seconds since epoch).
    pub exp: i64,
}

/// Signs and verifies tokens with a shared secret.
#[derive(Clone)]
pub struct TokenIssuer {
    secret: Arc<[u8]>,
    ttl: Duration,
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl TokenIssuer {
    /// Create an issuer.
    #[must_use]
    pub fn new(secret: impl AsRef<[u8]>, ttl: Duration) -> Self {
        Self {
            secret: Arc::from(secret.as_ref()),
            ttl,
        }
    }

    /// Issue a token for a user.
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails.
    pub fn issue(&self, user: &User) -> Result<String, TokenError> {
        self.issue_at(user, Utc::now().timestamp())
    }

    fn issue_at(&self, user: &User, now: i64) -> Result<String, TokenError> {
        let header = Header {
            alg: ALGORITHM.to_string(),
            typ: "JWT".to_string(),
        };
        let claims = Claims {
            id: user.id,
            name: user.name.clone(),
            iat: now,
            exp: now + self.ttl.as_secs() as i64,
        };

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?),
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?)
        );
        let signature = URL_SAFE_NO_PAD.encode(self.mac(&signing_input)?.finalize().into_bytes());

        Ok(format!("{signing_input}.{signature}"))
    }

    /// Verify a token and return its claims.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is malformed, signed with another
    /// secret or algorithm, or expired.
    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        self.verify_at(token, Utc::now().timestamp())
    }

    fn verify_at(&self, token: &str, now: i64) -> Result<Claims, TokenError> {
        let mut parts = token.split('.');
        let (Some(header), Some(claims), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(TokenError::Malformed);
        };

        let decoded: Header = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(header)?)?;
        if decoded.alg != ALGORITHM {
            return Err(TokenError::UnsupportedAlgorithm(decoded.alg));
        }

        let signature = URL_SAFE_NO_PAD.decode(signature)?;
        self.mac(&format!("{header}.{claims}"))?
            .verify_slice(&signature)
            .map_err(|_| TokenError::BadSignature)?;

        let claims: Claims = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(claims)?)?;
        if now >= claims.exp {
            return Err(TokenError::Expired);
        }

        Ok(claims)
    }

    fn mac(&self, signing_input: &str) -> Result<HmacSha256, TokenError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).map_err(|_| TokenError::InvalidKey)?;
        mac.update(signing_input.as_bytes());
        Ok(mac)
    }
}

/// Extractor for requests carrying a valid bearer token.
#[derive(Debug, Clone)]
pub struct Authenticated(pub Claims);

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for Authenticated {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .ok_or(ApiError::Unauthorized("No token provided"))?;

        let token = header
            .to_str()
            .ok()
            .and_then(|value| value.split_whitespace().nth(1))
            .ok_or(ApiError::Unauthorized("Invalid or expired token"))?;

        let claims = state.tokens.verify(token).map_err(|e| {
            debug!(error = %e, "Rejected bearer token");
            ApiError::Unauthorized("Invalid or expired token")
        })?;

        Ok(Self(claims))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn user() -> User {
        User {
            id: 7,
            name: "Alice".to_string(),
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn issuer(secret: &str) -> TokenIssuer {
        TokenIssuer::new(secret, Duration::from_secs(3600))
    }

    #[test]
    fn test_issue_verify() {
        let tokens = issuer("secret");
        let token = tokens.issue(&user()).unwrap();

        assert_eq!(token.split('.').count(), 3);

        let claims = tokens.verify(&token).unwrap();
        assert_eq!(claims.id, 7);
        assert_eq!(claims.name, "Alice");
        assert_eq!(claims.exp - claims.iat, 3600);
    }

    #[test]
    fn test_wrong_secret() {
        let token = issuer("secret").issue(&user()).unwrap();
        assert!(matches!(
            issuer("other").verify(&token),
            Err(TokenError::BadSignature)
        ));
    }

    #[test]
    fn test_tampered_claims() {
        let tokens = issuer("secret");
        let token = tokens.issue(&user()).unwrap();
        let parts: Vec<&str> = token.split('.').collect();

        let forged = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&serde_json::json!({
                "id": 1, "name": "admin", "iat": 0, "exp": i64::MAX
            }))
            .unwrap(),
        );
        let tampered = format!("{}.{}.{}", parts[0], forged, parts[2]);

        assert!(matches!(
            tokens.verify(&tampered),
            Err(TokenError::BadSignature)
        ));
    }

    #[test]
    fn test_expired() {
        let tokens = issuer("secret");
        let issued_at = Utc::now().timestamp() - 7200;
        let token = tokens.issue_at(&user(), issued_at).unwrap();

        assert!(matches!(tokens.verify(&token), Err(TokenError::Expired)));
        assert!(tokens.verify_at(&token, issued_at + 10).is_ok());
    }

    #[test]
    fn test_malformed() {
        let tokens = issuer("secret");
        assert!(matches!(tokens.verify("abc"), Err(TokenError::Malformed)));
        assert!(matches!(tokens.verify("a.b.c.d"), Err(TokenError::Malformed)));
        assert!(matches!(
            tokens.verify("!!.??.**"),
            Err(TokenError::Encoding(_))
        ));
    }

    #[test]
    fn test_unsupported_algorithm() {
        let tokens = issuer("secret");
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
        let token = format!("{header}.e30.");
        assert!(matches!(
            tokens.verify(&token),
            Err(TokenError::UnsupportedAlgorithm(_))
        ));
    }
}
