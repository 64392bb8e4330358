use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use proxima_shared::errors::AppResult;
use proxima_shared::middleware::{ApiJson, ApiPath, OptionalAuthUser};

use crate::models::Message;
use crate::services::OutgoingMessage;
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub content: String,
    pub room: Option<String>,
}

/// GET /api/chat/:userId/:otherUserId - full history of the pair's room
pub async fn history(
    auth: OptionalAuthUser,
    State(state): State<Arc<AppState>>,
    ApiPath((user_id, other_user_id)): ApiPath<(Uuid, Uuid)>,
) -> AppResult<Json<Vec<Message>>> {
    auth.ensure_acting_as(user_id)?;
    Ok(Json(state.chat.history(user_id, other_user_id).await?))
}

/// POST /api/chat/send - same persist and broadcast path as the socket event
pub async fn send_message(
    auth: OptionalAuthUser,
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<SendMessageRequest>,
) -> AppResult<Json<Message>> {
    auth.ensure_acting_as(req.sender_id)?;

    let message = state
        .chat
        .send(OutgoingMessage {
            sender_id: req.sender_id,
            receiver_id: req.receiver_id,
            content: req.content,
            room: req.room,
        })
        .await?;
    Ok(Json(message))
}
