use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use uuid::Uuid;

use crate::errors::{AppError, ErrorCode};
use crate::types::auth::{AuthUser, Claims, JwtSecret, SessionToken};

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: JwtSecret + Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let token = extract_bearer_token(&parts.headers)?;
        let claims = validate_jwt(&token, state.jwt_secret())?;

        if claims.is_expired() {
            return Err(AppError::new(ErrorCode::TokenExpired, "token has expired"));
        }

        Ok(AuthUser::from(claims))
    }
}

fn extract_bearer_token(headers: &HeaderMap) -> Result<String, AppError> {
    let auth_header = headers
        .get("Authorization")
        .ok_or_else(|| AppError::new(ErrorCode::Unauthorized, "missing authorization header"))?
        .to_str()
        .map_err(|_| AppError::new(ErrorCode::Unauthorized, "invalid authorization header"))?;

    match auth_header.strip_prefix("Bearer ") {
        Some(token) => Ok(token.to_string()),
        None => Err(AppError::new(ErrorCode::Unauthorized, "authorization header must use Bearer scheme")),
    }
}

/// Decode and verify an HS256 session token.
pub fn validate_jwt(token: &str, secret: &str) -> Result<Claims, AppError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;

    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
            AppError::new(ErrorCode::TokenExpired, "token has expired")
        }
        _ => AppError::new(ErrorCode::TokenInvalid, format!("invalid token: {e}")),
    })?;

    Ok(token_data.claims)
}

pub fn issue_session_token(user_id: Uuid, secret: &str, ttl_secs: i64) -> Result<SessionToken, AppError> {
    let claims = Claims::new(user_id, ttl_secs);
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::internal(format!("JWT encoding failed: {e}")))?;
    Ok(SessionToken::new(token, ttl_secs))
}

/// Optional auth extractor. A missing or invalid token yields `None`.
pub struct OptionalAuthUser(pub Option<AuthUser>);

impl OptionalAuthUser {
    /// Rejects a request whose token belongs to someone other than `claimed`.
    /// Anonymous requests pass through.
    pub fn ensure_acting_as(&self, claimed: Uuid) -> Result<(), AppError> {
        match &self.0 {
            Some(user) if user.id != claimed => Err(AppError::new(
                ErrorCode::Forbidden,
                "token does not belong to the requested user",
            )),
            _ => Ok(()),
        }
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for OptionalAuthUser
where
    S: JwtSecret + Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match AuthUser::from_request_parts(parts, state).await {
            Ok(user) => Ok(Self(Some(user))),
            Err(_) => Ok(Self(None)),
        }
    }
}
