use axum::{
    extract::{Query, Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_JWT_ISSUER: &str = "signaling-gateway";

// JWT Claims structure
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String, // numeric user id
    pub username: String,
    pub exp: i64,
    pub iat: i64,
    pub iss: String,
}

/// Caller identity attached to the request by [`identify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: i64,
    pub username: String,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
    #[error("subject is not a user id: {0}")]
    Subject(String),
}

#[derive(Clone)]
pub struct AuthService {
    issuer: String,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl AuthService {
    pub fn new(secret: &str, issuer: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn generate_token(
        &self,
        user_id: i64,
        username: &str,
        ttl: Duration,
    ) -> Result<String, AuthError> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            username: username.to_string(),
            exp: (now + ttl).timestamp(),
            iat: now.timestamp(),
            iss: self.issuer.clone(),
        };
        Ok(encode(&Header::default(), &claims, &self.encoding_key)?)
    }

    pub fn verify_token(&self, token: &str) -> Result<Identity, AuthError> {
        let mut validation = Validation::default();
        validation.set_issuer(&[self.issuer.as_str()]);
        let data = decode::<Claims>(token, &self.decoding_key, &validation)?;
        let user_id = data
            .claims
            .sub
            .parse::<i64>()
            .map_err(|_| AuthError::Subject(data.claims.sub.clone()))?;
        Ok(Identity {
            user_id,
            username: data.claims.username,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Bearer header first, then the `token` query parameter (browsers cannot set
/// headers on a WebSocket upgrade).
fn bearer_token(request: &Request) -> Option<String> {
    if let Some(value) = request.headers().get(AUTHORIZATION) {
        if let Some(token) = value.to_str().ok().and_then(|s| s.strip_prefix("Bearer ")) {
            return Some(token.trim().to_string());
        }
    }
    Query::<TokenQuery>::try_from_uri(request.uri())
        .ok()
        .and_then(|Query(query)| query.token)
        .filter(|token| !token.is_empty())
}

/// Leaves the request anonymous on a missing or bad token; handlers decide
/// what anonymous means for them.
pub async fn identify(State(auth): State<AuthService>, mut request: Request, next: Next) -> Response {
    if let Some(token) = bearer_token(&request) {
        match auth.verify_token(&token) {
            Ok(identity) => {
                request.extensions_mut().insert(identity);
            }
            Err(err) => warn!(%err, "rejecting bearer token"),
        }
    }
    next.run(request).await
}
