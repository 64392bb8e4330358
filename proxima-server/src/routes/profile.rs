use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use proxima_shared::errors::AppResult;
use proxima_shared::middleware::{ApiJson, ApiPath, OptionalAuthUser};

use crate::models::ProfileView;
use crate::services::ProfileUpdate;
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProfileRequest {
    pub user_id: Uuid,
    pub gender: Option<String>,
    pub age: Option<i32>,
    pub bio: Option<String>,
    #[serde(rename = "photo_url", alias = "photoUrl")]
    pub photo_url: Option<String>,
}

/// GET /api/profile/:userId
pub async fn get_profile(
    auth: OptionalAuthUser,
    State(state): State<Arc<AppState>>,
    ApiPath(user_id): ApiPath<Uuid>,
) -> AppResult<Json<ProfileView>> {
    let user = state.identity.get_profile(user_id).await?;
    let is_owner = auth.0.as_ref().is_some_and(|a| a.id == user_id);
    Ok(Json(if is_owner { ProfileView::owner(&user) } else { ProfileView::public(&user) }))
}

/// PUT /api/profile/update
pub async fn update_profile(
    auth: OptionalAuthUser,
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<UpdateProfileRequest>,
) -> AppResult<Json<ProfileView>> {
    auth.ensure_acting_as(req.user_id)?;

    let update = ProfileUpdate {
        gender: req.gender,
        age: req.age,
        bio: req.bio,
        photo_url: req.photo_url,
    };
    let user = state.identity.update_profile(req.user_id, update).await?;
    Ok(Json(ProfileView::owner(&user)))
}
