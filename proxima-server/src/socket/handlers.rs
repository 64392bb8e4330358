use std::sync::Arc;

use serde::{Deserialize, Serialize};
use socketioxide::extract::{AckSender, Data, SocketRef};
use socketioxide::SocketIo;
use uuid::Uuid;

use proxima_shared::errors::{AppError, ErrorCode};
use proxima_shared::middleware::validate_jwt;

use crate::models::Message;
use crate::services::OutgoingMessage;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

impl From<&AppError> for ErrorPayload {
    fn from(err: &AppError) -> Self {
        Self {
            code: err.code().code().to_string(),
            message: err.public_message(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessagePayload {
    sender_id: Uuid,
    receiver_id: Uuid,
    content: String,
    room: Option<String>,
}

#[derive(Debug, Serialize)]
struct SendAck<'a> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorPayload>,
}

impl<'a> SendAck<'a> {
    fn sent(message: &'a Message) -> Self {
        Self { success: true, message: Some(message), error: None }
    }

    fn failed(err: &AppError) -> Self {
        Self { success: false, message: None, error: Some(ErrorPayload::from(err)) }
    }
}

#[derive(Debug, Serialize)]
struct NewMatchPayload {
    user_id: Uuid,
    matched_user_id: Uuid,
}

fn get_user_id(socket: &SocketRef) -> Option<Uuid> {
    socket.extensions.get::<Uuid>()
}

fn emit_error(socket: &SocketRef, err: &AppError) {
    let _ = socket.emit("error", &ErrorPayload::from(err));
}

pub async fn on_connect(socket: SocketRef, state: Arc<AppState>) {
    let user_id = match authenticate_socket(&socket, &state) {
        Ok(user_id) => user_id,
        Err(err) => {
            tracing::warn!(error = %err, sid = %socket.id, "socket auth failed");
            emit_error(&socket, &err);
            socket.disconnect().ok();
            return;
        }
    };

    if let Some(user_id) = user_id {
        socket.extensions.insert(user_id);
        // Personal room for match notifications
        socket.join(format!("user:{user_id}")).ok();
    }

    let mut inbox = state.chat.connect(socket.id.to_string(), user_id);

    // Drains this connection's outbox until the channel drops it on disconnect.
    tokio::spawn({
        let socket = socket.clone();
        async move {
            while let Some(message) = inbox.recv().await {
                if socket.emit("receive_message", &message).is_err() {
                    break;
                }
            }
        }
    });

    tracing::info!(sid = %socket.id, user_id = ?user_id, "chat socket connected");

    socket.on("join_room", {
        let state = state.clone();
        move |socket: SocketRef, Data::<String>(room)| {
            let state = state.clone();
            async move {
                on_join_room(&socket, &room, &state);
            }
        }
    });

    socket.on("send_message", {
        let state = state.clone();
        move |socket: SocketRef, Data::<SendMessagePayload>(payload), ack: AckSender| {
            let state = state.clone();
            async move {
                on_send_message(socket, payload, ack, &state).await;
            }
        }
    });

    socket.on_disconnect({
        let state = state.clone();
        move |socket: SocketRef| {
            let state = state.clone();
            async move {
                state.chat.disconnect(&socket.id.to_string());
                tracing::info!(sid = %socket.id, "chat socket disconnected");
            }
        }
    });
}

fn on_join_room(socket: &SocketRef, room: &str, state: &AppState) {
    if let Err(err) = state.chat.join(&socket.id.to_string(), room) {
        tracing::debug!(sid = %socket.id, room, error = %err, "join_room rejected");
        emit_error(socket, &err);
    }
}

async fn on_send_message(socket: SocketRef, payload: SendMessagePayload, ack: AckSender, state: &AppState) {
    let result = match get_user_id(&socket) {
        Some(user_id) if user_id != payload.sender_id => Err(AppError::new(
            ErrorCode::Forbidden,
            "authenticated sockets can only send as themselves",
        )),
        _ => {
            state
                .chat
                .send(OutgoingMessage {
                    sender_id: payload.sender_id,
                    receiver_id: payload.receiver_id,
                    content: payload.content,
                    room: payload.room,
                })
                .await
        }
    };

    match result {
        Ok(message) => {
            let _ = ack.send(&SendAck::sent(&message));
        }
        Err(err) => {
            tracing::debug!(sid = %socket.id, error = %err, "send_message rejected");
            emit_error(&socket, &err);
            let _ = ack.send(&SendAck::failed(&err));
        }
    }
}

/// Tells both users about a freshly completed match.
pub fn notify_new_match(io: &SocketIo, a: Uuid, b: Uuid) {
    for (user_id, matched_user_id) in [(a, b), (b, a)] {
        let payload = NewMatchPayload { user_id, matched_user_id };
        if let Err(e) = io.to(format!("user:{user_id}")).emit("new_match", &payload) {
            tracing::warn!(error = %e, user_id = %user_id, "failed to emit new_match");
        }
    }
}

/// Reads the optional `?token=` query parameter. No token means an
/// anonymous socket; a bad token is an error.
fn authenticate_socket(socket: &SocketRef, state: &AppState) -> Result<Option<Uuid>, AppError> {
    let query = socket.req_parts().uri.query().unwrap_or_default();
    identify(token_from_query(query), &state.config.jwt_secret)
}

fn token_from_query(query: &str) -> Option<&str> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == "token" && !value.is_empty()).then_some(value)
    })
}

fn identify(token: Option<&str>, secret: &str) -> Result<Option<Uuid>, AppError> {
    let Some(token) = token else {
        return Ok(None);
    };
    let claims = validate_jwt(token, secret)?;
    if claims.is_expired() {
        return Err(AppError::new(ErrorCode::TokenExpired, "token has expired"));
    }
    Ok(Some(claims.sub))
}
