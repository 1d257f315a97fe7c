use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
};
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use workfinder_core::types::{Identity, Role};

use crate::response::ApiError;
use crate::router::AppState;

/// Claims issued by the token collaborator.
#[derive(Debug, Deserialize, Serialize)]
pub struct Claims {
    pub id: Uuid,
    pub email: String,
    pub role: Role,
    pub exp: i64,
}

/// Verifies HS256 bearer tokens and turns their claims into an [`Identity`].
#[derive(Clone)]
pub struct TokenVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        // expiry is checked against the injected clock instead
        validation.validate_exp = false;
        validation.required_spec_claims.clear();
        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<Identity, AuthError> {
        let claims = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|err| AuthError::Invalid(err.to_string()))?
            .claims;
        if now.timestamp() >= claims.exp {
            return Err(AuthError::Expired);
        }
        Ok(Identity {
            id: claims.id,
            email: claims.email,
            role: claims.role,
        })
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    Missing,
    #[error("malformed authorization header")]
    Malformed,
    #[error("invalid token: {0}")]
    Invalid(String),
    #[error("token expired")]
    Expired,
}

impl From<AuthError> for ApiError {
    fn from(value: AuthError) -> Self {
        debug!(stage = "auth", error = %value, "request not authenticated");
        ApiError::new(StatusCode::UNAUTHORIZED, value.to_string())
    }
}

/// Caller identity extracted from the `Authorization: Bearer` header.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub Identity);

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .ok_or(AuthError::Missing)?;
        let value = header.to_str().map_err(|_| AuthError::Malformed)?;
        let token = value
            .strip_prefix("Bearer ")
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(AuthError::Malformed)?;

        let identity = state.tokens().verify(token, state.now())?;
        Ok(Self(identity))
    }
}

#[cfg(test)]
pub(crate) fn mint_token(secret: &[u8], identity: &Identity, exp: DateTime<Utc>) -> String {
    use jsonwebtoken::{encode, EncodingKey, Header};

    let claims = Claims {
        id: identity.id,
        email: identity.email.clone(),
        role: identity.role,
        exp: exp.timestamp(),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret),
    )
    .expect("encode token")
}
