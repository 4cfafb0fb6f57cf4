use axum::{extract::State, Extension, Json};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use crate::{
    error::{AppError, AppResult},
    models::{SentMessage, UnreadSummary},
    realtime::Committed,
    services::{auth::Claims, messaging::Destination},
    AppState,
};

use super::super::middleware::identity;

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub conversation_id: Option<i64>,
    #[serde(default)]
    pub recipient_ids: Vec<Uuid>,
    #[validate(length(max = 120))]
    pub title: Option<String>,
    #[validate(length(min = 1, max = 10000))]
    pub body: String,
}

impl SendMessageRequest {
    fn destination(self) -> AppResult<(Destination, String)> {
        let destination = match (self.conversation_id, self.recipient_ids.is_empty()) {
            (Some(id), _) => Destination::Existing(id),
            (None, false) => Destination::New {
                recipient_ids: self.recipient_ids,
                title: self.title,
            },
            (None, true) => {
                return Err(AppError::Validation(
                    "Either conversationId or recipientIds is required".to_string(),
                ))
            }
        };
        Ok((destination, self.body))
    }
}

pub async fn send_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> AppResult<Json<Committed<SentMessage>>> {
    req.validate()?;
    let (destination, body) = req.destination()?;

    let sent = state
        .messaging()
        .send_message(&identity(&claims), destination, &body)
        .await?;

    if !sent.delivery.is_complete() {
        tracing::warn!(
            "Message {} committed but {} notifications were not delivered",
            sent.value.message.id,
            sent.delivery.failed
        );
    }

    Ok(Json(sent))
}

pub async fn get_unread_summary(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> AppResult<Json<UnreadSummary>> {
    let summary = state
        .messaging()
        .unread_summary_for(&identity(&claims))
        .await?;

    Ok(Json(summary))
}
