//! Bearer credentials.
//!
//! Tokens are HS256 JWTs issued elsewhere with the shared secret. They
//! reach the server in an `Authorization: Bearer` header, a `token` query
//! parameter, or an in-band `authenticate` event.

use crate::handlers::AppState;
use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use huddle_core::{CredentialVerifier, Error, Identity, Result, UserId};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub username: String,
    pub exp: usize,
}

/// Verifies HS256 tokens against one secret.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    #[must_use]
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
        }
    }
}

impl CredentialVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<Identity> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            debug!(error = %e, "Token rejected");
            Error::Auth("invalid token".into())
        })?;

        let user_id = UserId::parse(data.claims.sub).map_err(|reason| {
            debug!(reason, "Token subject rejected");
            Error::Auth("invalid token".into())
        })?;
        Ok(Identity::new(user_id, data.claims.username))
    }
}

/// Token from an `Authorization: Bearer` header, if present.
#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Extract and validate the bearer token of an HTTP request.
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> std::result::Result<Response, StatusCode> {
    let token = bearer_token(req.headers()).ok_or(StatusCode::UNAUTHORIZED)?;

    let identity = state
        .hub
        .verifier()
        .verify(token)
        .map_err(|_| StatusCode::UNAUTHORIZED)?;

    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}

/// Mint a token. Issuance belongs to the account service; tests need one.
#[cfg(test)]
pub fn issue_token(secret: &str, user_id: &str, username: &str) -> String {
    use jsonwebtoken::{encode, EncodingKey, Header};

    let claims = Claims {
        sub: user_id.to_string(),
        username: username.to_string(),
        exp: (chrono::Utc::now() + chrono::Duration::days(30)).timestamp() as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_verify_round_trip() {
        let verifier = JwtVerifier::new("s3cret");
        let token = issue_token("s3cret", "u1", "alice");

        let identity = verifier.verify(&token).unwrap();
        assert_eq!(identity, Identity::new("u1", "alice"));
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let verifier = JwtVerifier::new("s3cret");
        let token = issue_token("other", "u1", "alice");
        assert_eq!(
            verifier.verify(&token),
            Err(Error::Auth("invalid token".into()))
        );
        assert!(verifier.verify("garbage").is_err());
    }

    #[test]
    fn test_subject_with_separator_is_rejected() {
        let verifier = JwtVerifier::new("s3cret");
        let token = issue_token("s3cret", "a:b", "mallory");
        assert_eq!(
            verifier.verify(&token),
            Err(Error::Auth("invalid token".into()))
        );
        assert!(verifier.verify(&issue_token("s3cret", " ", "blank")).is_err());
    }

    #[test]
    fn test_expired_token_is_rejected() {
        use jsonwebtoken::{encode, EncodingKey, Header};

        let claims = Claims {
            sub: "u1".into(),
            username: "alice".into(),
            exp: (chrono::Utc::now() - chrono::Duration::hours(1)).timestamp() as usize,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"s3cret"),
        )
        .unwrap();
        assert!(JwtVerifier::new("s3cret").verify(&token).is_err());
    }

    #[test]
    fn test_bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers), Some("abc.def"));
    }
}
