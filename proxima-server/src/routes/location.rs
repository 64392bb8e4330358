use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use proxima_shared::errors::AppResult;
use proxima_shared::middleware::{ApiJson, ApiQuery, OptionalAuthUser};
use proxima_shared::types::Ack;

use crate::geo::Coordinates;
use crate::models::UserWithPosition;
use crate::services::location::parse_gender_filter;
use crate::services::NearbyQuery;
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateLocationRequest {
    pub user_id: Uuid,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NearbyParams {
    pub latitude: f64,
    pub longitude: f64,
    pub user_id: Uuid,
    pub gender: Option<String>,
    pub radius_km: Option<f64>,
}

/// POST /api/location/update
pub async fn update_location(
    auth: OptionalAuthUser,
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<UpdateLocationRequest>,
) -> AppResult<Json<Ack>> {
    auth.ensure_acting_as(req.user_id)?;
    let ack = state
        .locations
        .update_position(req.user_id, req.latitude, req.longitude)
        .await?;
    Ok(Json(ack))
}

/// GET /api/location/nearby
pub async fn nearby(
    auth: OptionalAuthUser,
    State(state): State<Arc<AppState>>,
    ApiQuery(params): ApiQuery<NearbyParams>,
) -> AppResult<Json<Vec<UserWithPosition>>> {
    auth.ensure_acting_as(params.user_id)?;

    let query = NearbyQuery {
        center: Coordinates::new(params.latitude, params.longitude)?,
        exclude: params.user_id,
        gender: parse_gender_filter(params.gender.as_deref())?,
        radius_km: params.radius_km,
    };
    Ok(Json(state.locations.query_nearby(query).await?))
}
