use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use proxima_shared::errors::AppResult;
use proxima_shared::middleware::{issue_session_token, ApiJson};

use crate::models::{ProfileView, User};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub user: ProfileView,
    pub token: String,
    pub token_type: String,
    pub expires_in: i64,
}

fn session_for(state: &AppState, user: &User) -> AppResult<AuthResponse> {
    let session = issue_session_token(user.id, &state.config.jwt_secret, state.config.jwt_ttl_secs)?;
    Ok(AuthResponse {
        user: ProfileView::owner(user),
        token: session.token,
        token_type: session.token_type,
        expires_in: session.expires_in,
    })
}

/// POST /api/auth/register
pub async fn register(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<RegisterRequest>,
) -> AppResult<(StatusCode, Json<AuthResponse>)> {
    let user = state.identity.register(&req.name, &req.email, &req.password).await?;
    Ok((StatusCode::CREATED, Json(session_for(&state, &user)?)))
}

/// POST /api/auth/login
pub async fn login(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<LoginRequest>,
) -> AppResult<Json<AuthResponse>> {
    let user = state.identity.authenticate(&req.email, &req.password).await?;
    Ok(Json(session_for(&state, &user)?))
}
