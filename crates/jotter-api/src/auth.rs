//! Signed bearer credentials.
//!
//! A token is `base64url(claims_json) "." hex(hmac_sha256(key, base64url(claims_json)))`.
//! Tokens are issued by the account service that shares `AUTH_SECRET`; this
//! server only verifies them (and signs them in tests).

use axum::extract::{FromRequestParts, Query};
use axum::http::header;
use axum::http::request::Parts;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use jotter_core::{Error, Result};

use crate::error::ApiError;
use crate::state::AppState;

type HmacSha256 = Hmac<Sha256>;

/// Token claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: Uuid,
    /// Login id, used for the `user:{login}` topic.
    pub login: String,
    /// Expiry, epoch seconds.
    pub exp: i64,
}

pub struct TokenSigner {
    key: Vec<u8>,
}

impl TokenSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            key: secret.as_ref().to_vec(),
        }
    }

    fn mac(&self, payload: &str) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| Error::Config(format!("invalid auth secret: {e}")))?;
        mac.update(payload.as_bytes());
        Ok(mac)
    }

    pub fn sign(&self, claims: &Claims) -> Result<String> {
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
        let signature = hex::encode(self.mac(&payload)?.finalize().into_bytes());
        Ok(format!("{payload}.{signature}"))
    }

    /// Sign claims for `user_id` valid for `ttl`.
    pub fn issue(&self, user_id: Uuid, login: &str, ttl: chrono::Duration) -> Result<String> {
        self.sign(&Claims {
            sub: user_id,
            login: login.to_string(),
            exp: (Utc::now() + ttl).timestamp(),
        })
    }

    /// Check signature and expiry.
    pub fn verify(&self, token: &str) -> Result<Claims> {
        let invalid = || Error::Unauthorized("Invalid token".to_string());

        let (payload, signature) = token.split_once('.').ok_or_else(invalid)?;
        let signature = hex::decode(signature).map_err(|_| invalid())?;
        self.mac(payload)?
            .verify_slice(&signature)
            .map_err(|_| invalid())?;

        let raw = URL_SAFE_NO_PAD.decode(payload).map_err(|_| invalid())?;
        let claims: Claims = serde_json::from_slice(&raw).map_err(|_| invalid())?;
        if claims.exp <= Utc::now().timestamp() {
            return Err(Error::Unauthorized("Token expired".to_string()));
        }
        if claims.login.is_empty() {
            return Err(invalid());
        }
        Ok(claims)
    }
}

/// Authenticated caller.
///
/// Reads `Authorization: Bearer <token>`, falling back to a `?token=` query
/// parameter for WebSocket handshakes from browsers, which cannot set headers.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub login: String,
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

fn bearer_token(parts: &Parts) -> Option<String> {
    let from_header = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string());

    from_header.or_else(|| {
        Query::<TokenQuery>::try_from_uri(&parts.uri)
            .ok()
            .and_then(|q| q.0.token)
    })
}

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> std::result::Result<Self, Self::Rejection> {
        let token = bearer_token(parts)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::Unauthorized("Authentication required".to_string()))?;

        let claims = state.signer.verify(&token)?;
        Ok(AuthUser {
            user_id: claims.sub,
            login: claims.login,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let signer = TokenSigner::new("secret");
        let user = Uuid::new_v4();
        let token = signer
            .issue(user, "alice", chrono::Duration::hours(1))
            .unwrap();

        let claims = signer.verify(&token).unwrap();
        assert_eq!(claims.sub, user);
        assert_eq!(claims.login, "alice");
    }

    #[test]
    fn test_verify_rejects_other_secret() {
        let token = TokenSigner::new("secret")
            .issue(Uuid::new_v4(), "alice", chrono::Duration::hours(1))
            .unwrap();

        let err = TokenSigner::new("other").verify(&token).unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
    }

    #[test]
    fn test_verify_rejects_tampered_claims() {
        let signer = TokenSigner::new("secret");
        let token = signer
            .issue(Uuid::new_v4(), "alice", chrono::Duration::hours(1))
            .unwrap();
        let (_, signature) = token.split_once('.').unwrap();
        let forged = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&Claims {
                sub: Uuid::new_v4(),
                login: "mallory".into(),
                exp: i64::MAX,
            })
            .unwrap(),
        );

        assert!(signer.verify(&format!("{forged}.{signature}")).is_err());
    }

    #[test]
    fn test_verify_rejects_expired() {
        let signer = TokenSigner::new("secret");
        let token = signer
            .issue(Uuid::new_v4(), "alice", chrono::Duration::seconds(-5))
            .unwrap();

        match signer.verify(&token) {
            Err(Error::Unauthorized(msg)) => assert_eq!(msg, "Token expired"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_verify_rejects_garbage() {
        let signer = TokenSigner::new("secret");
        assert!(signer.verify("").is_err());
        assert!(signer.verify("abc").is_err());
        assert!(signer.verify("abc.zz").is_err());
    }
}
