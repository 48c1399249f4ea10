//! HTTP API for message history and users.

use crate::handlers::AppState;
use axum::{
    extract::{rejection::JsonRejection, Extension, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use huddle_core::{
    list_by_room, ChatMessage, DayGroup, Error, Identity, NewMessage, PageRequest, RoomKey,
    UserIdentity, DEFAULT_PAGE_LIMIT,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};

/// A core error rendered as an HTTP response.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct ApiError(#[from] Error);

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.0 {
            Error::Auth(_) => StatusCode::UNAUTHORIZED,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Server(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self.0 {
            Error::Auth(m)
            | Error::Validation(m)
            | Error::NotFound(m)
            | Error::Conflict(m)
            | Error::Server(m) => m,
        };
        if status.is_server_error() {
            error!(%status, %message, "Request failed");
        }
        (status, Json(serde_json::json!({ "message": message }))).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct SentMessage {
    pub message: ChatMessage,
}

/// `POST /api/messages`
///
/// The sender defaults to the authenticated user. A body that does not
/// decode, including one with an invalid room key, is a validation error.
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    body: Result<Json<NewMessage>, JsonRejection>,
) -> Result<(StatusCode, Json<SentMessage>), ApiError> {
    let Json(mut req) = body.map_err(|rejection| Error::Validation(rejection.body_text()))?;
    if req.sender.is_none() {
        req.sender = Some(identity.user_id);
    }
    let message = state.hub.messages().append(req).await?;
    debug!(message = %message.id, room = %message.room, "Message stored");
    Ok((StatusCode::CREATED, Json(SentMessage { message })))
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub room: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

/// `GET /api/messages?room=&page=&limit=`
pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<DayGroup>>, ApiError> {
    let room = match query.room {
        Some(room) => RoomKey::parse(room)
            .map_err(|reason| Error::Validation(format!("room: {reason}")))?,
        None => RoomKey::global(),
    };
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_LIMIT)
        .min(state.config.limits.max_page_limit);
    let page = PageRequest::new(query.page.unwrap_or(1), limit)?;

    let groups = list_by_room(state.hub.messages().as_ref(), &room, page).await?;
    Ok(Json(groups))
}

/// `GET /api/users`
pub async fn list_users(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<UserIdentity>>, ApiError> {
    Ok(Json(state.hub.identities().list_users().await?))
}
