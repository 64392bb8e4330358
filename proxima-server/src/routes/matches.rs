use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use proxima_shared::errors::AppResult;
use proxima_shared::middleware::{ApiJson, ApiPath, OptionalAuthUser};

use crate::models::MatchView;
use crate::socket;
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LikeRequest {
    pub user_id: Uuid,
    pub liked_user_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct LikeResponse {
    pub success: bool,
    pub liked: bool,
    #[serde(rename = "match")]
    pub matched: bool,
    pub message: String,
}

/// POST /api/matches/like
pub async fn like(
    auth: OptionalAuthUser,
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<LikeRequest>,
) -> AppResult<Json<LikeResponse>> {
    auth.ensure_acting_as(req.user_id)?;

    let outcome = state.matches.like(req.user_id, req.liked_user_id).await?;
    if outcome.new_match {
        socket::notify_new_match(&state.io, req.user_id, req.liked_user_id);
    }

    let message = if outcome.matched { "It's a match!" } else { "Like recorded" };
    Ok(Json(LikeResponse {
        success: true,
        liked: outcome.liked,
        matched: outcome.matched,
        message: message.to_string(),
    }))
}

/// GET /api/matches/:userId
pub async fn list_matches(
    auth: OptionalAuthUser,
    State(state): State<Arc<AppState>>,
    ApiPath(user_id): ApiPath<Uuid>,
) -> AppResult<Json<Vec<MatchView>>> {
    auth.ensure_acting_as(user_id)?;
    Ok(Json(state.matches.list_matches(user_id).await?))
}
