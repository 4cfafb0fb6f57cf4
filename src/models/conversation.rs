use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::{MessageView, UserSummary};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: i64,
    #[serde(rename = "type")]
    #[sqlx(rename = "type")]
    pub conversation_type: ConversationType,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "conversation_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ConversationType {
    Direct,
    Group,
}

impl ConversationType {
    /// Fixed when the conversation is created and never re-derived.
    pub fn for_participant_count(count: usize) -> Self {
        if count > 2 {
            Self::Group
        } else {
            Self::Direct
        }
    }
}

/// A user's membership in a conversation together with their read watermark.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: i64,
    pub conversation_id: i64,
    pub user_id: Uuid,
    pub last_read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantWithUser {
    #[serde(flatten)]
    pub participant: Participant,
    pub user: Option<UserSummary>,
}

#[derive(Debug, Clone)]
pub struct ConversationWithParticipants {
    pub conversation: Conversation,
    pub participants: Vec<ParticipantWithUser>,
}

impl ConversationWithParticipants {
    pub fn participant_ids(&self) -> Vec<Uuid> {
        self.participants
            .iter()
            .map(|p| p.participant.user_id)
            .collect()
    }

    pub fn participant(&self, user_id: Uuid) -> Option<&Participant> {
        self.participants
            .iter()
            .map(|p| &p.participant)
            .find(|p| p.user_id == user_id)
    }
}

/// Row of the conversation list as seen by one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationListItem {
    pub id: i64,
    #[serde(rename = "type")]
    pub conversation_type: ConversationType,
    pub title: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub unread_count: i64,
    pub latest_message: Option<MessageView>,
    pub other_participants: Vec<UserSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_follows_participant_count() {
        assert_eq!(ConversationType::for_participant_count(1), ConversationType::Direct);
        assert_eq!(ConversationType::for_participant_count(2), ConversationType::Direct);
        assert_eq!(ConversationType::for_participant_count(3), ConversationType::Group);
    }
}
