use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use serde::Deserialize;

use crate::{
    error::AppResult,
    models::{ConversationListItem, MessageView},
    realtime::Committed,
    services::{auth::Claims, messaging::ReadReceipt},
    AppState,
};

use super::super::middleware::identity;

pub async fn get_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> AppResult<Json<Vec<ConversationListItem>>> {
    let conversations = state
        .messaging()
        .list_conversations(&identity(&claims))
        .await?;

    Ok(Json(conversations))
}

/// A non-positive `take` falls back to the default page size.
#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    pub take: Option<i64>,
}

pub async fn get_messages(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(conversation_id): Path<i64>,
    Query(query): Query<MessagesQuery>,
) -> AppResult<Json<Vec<MessageView>>> {
    let messages = state
        .messaging()
        .list_messages(&identity(&claims), conversation_id, query.take)
        .await?;

    Ok(Json(messages))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(conversation_id): Path<i64>,
) -> AppResult<Json<Committed<ReadReceipt>>> {
    let receipt = state
        .messaging()
        .mark_conversation_read(&identity(&claims), conversation_id)
        .await?;

    Ok(Json(receipt))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingRequest {
    #[serde(default = "default_typing")]
    pub is_typing: bool,
}

fn default_typing() -> bool {
    true
}

pub async fn send_typing(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(conversation_id): Path<i64>,
    Json(req): Json<TypingRequest>,
) -> AppResult<Json<Committed<TypingAck>>> {
    let committed = state
        .messaging()
        .broadcast_typing(&identity(&claims), conversation_id, req.is_typing)
        .await?;

    Ok(Json(Committed::new(
        TypingAck {
            conversation_id,
            is_typing: req.is_typing,
        },
        committed.delivery,
    )))
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingAck {
    pub conversation_id: i64,
    pub is_typing: bool,
}
