use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::{ConversationType, UserSummary};

/// Stored message row. `author` is a snapshot of the sender's display name;
/// a `None` sender marks a system or legacy message.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i64,
    pub content: String,
    pub author: String,
    pub sender_id: Option<Uuid>,
    pub conversation_id: i64,
    pub created_at: DateTime<Utc>,
}

/// Shape shared by the send response and the `message:new` broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub id: i64,
    pub content: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
    pub sender: Option<UserSummary>,
}

impl MessageView {
    pub fn sender_id(&self) -> Option<Uuid> {
        self.sender.as_ref().map(|s| s.id)
    }
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub content: String,
    pub author: String,
    pub sender_id: Option<Uuid>,
    pub conversation_id: i64,
    pub created_at: DateTime<Utc>,
}

/// Result of a send: the conversation it landed in plus the rendered message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentMessage {
    pub conversation_id: i64,
    pub message: MessageView,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageFilter {
    pub conversation_id: Option<i64>,
    pub sender_id: Option<Uuid>,
    pub q: Option<String>,
    #[serde(default = "default_take")]
    pub take: i64,
    #[serde(default)]
    pub skip: i64,
}

fn default_take() -> i64 {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ModerationSender {
    pub id: Uuid,
    pub name: Option<String>,
    pub email: String,
    pub image: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRef {
    pub id: i64,
    #[serde(rename = "type")]
    pub conversation_type: ConversationType,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeratedMessage {
    pub id: i64,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub sender: Option<ModerationSender>,
    pub conversation: ConversationRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePage {
    pub items: Vec<ModeratedMessage>,
    pub total: i64,
    pub take: i64,
    pub skip: i64,
}
