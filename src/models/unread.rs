use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationUnread {
    pub conversation_id: i64,
    pub unread_count: i64,
}

/// Authoritative unread snapshot for one user. Always recomputed from the
/// store; never cached between requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadSummary {
    pub user_id: Uuid,
    pub total_unread: i64,
    pub conversations: Vec<ConversationUnread>,
}

impl UnreadSummary {
    pub fn new(user_id: Uuid, conversations: Vec<ConversationUnread>) -> Self {
        let total_unread = conversations.iter().map(|c| c.unread_count).sum();
        Self {
            user_id,
            total_unread,
            conversations,
        }
    }

    pub fn unread_for(&self, conversation_id: i64) -> Option<i64> {
        self.conversations
            .iter()
            .find(|c| c.conversation_id == conversation_id)
            .map(|c| c.unread_count)
    }

    /// True when the total agrees with the entries and nothing is negative.
    pub fn is_consistent(&self) -> bool {
        self.conversations.iter().all(|c| c.unread_count >= 0)
            && self.total_unread == self.conversations.iter().map(|c| c.unread_count).sum::<i64>()
    }
}
