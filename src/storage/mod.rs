//! Store gateway: the relational source of truth behind the fan-out core.
//!
//! Every operation is an independent write or read. Nothing here spans a
//! cross-table transaction; callers sequence the steps themselves.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    error::AppResult,
    models::{
        Conversation, ConversationType, ConversationWithParticipants, MessageFilter, MessagePage,
        MessageView, NewMessage, NewUser, Participant, User, UserChanges,
    },
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait Store: Send + Sync {
    // Users
    async fn find_user_by_id(&self, id: Uuid) -> AppResult<Option<User>>;
    async fn find_user_by_email(&self, email: &str) -> AppResult<Option<User>>;
    /// Returns the subset of `ids` that exist, in no particular order.
    async fn find_existing_user_ids(&self, ids: &[Uuid]) -> AppResult<Vec<Uuid>>;
    async fn list_users(&self) -> AppResult<Vec<User>>;
    async fn create_user(&self, user: NewUser) -> AppResult<User>;
    async fn update_user(&self, id: Uuid, changes: UserChanges) -> AppResult<Option<User>>;
    async fn delete_user(&self, id: Uuid) -> AppResult<bool>;
    async fn count_administrators(&self) -> AppResult<i64>;

    // Conversations and participants
    async fn create_conversation(
        &self,
        conversation_type: ConversationType,
        title: Option<&str>,
    ) -> AppResult<Conversation>;
    /// Bumps `updated_at` to `max(at, previous + 1µs)` and returns the new value.
    async fn touch_conversation(&self, conversation_id: i64, at: DateTime<Utc>)
        -> AppResult<DateTime<Utc>>;
    /// Loads the conversation only if `user_id` participates in it.
    async fn find_conversation_for_participant(
        &self,
        conversation_id: i64,
        user_id: Uuid,
    ) -> AppResult<Option<ConversationWithParticipants>>;
    async fn list_conversations_for_user(
        &self,
        user_id: Uuid,
    ) -> AppResult<Vec<ConversationWithParticipants>>;
    async fn create_participant(
        &self,
        conversation_id: i64,
        user_id: Uuid,
        last_read_at: Option<DateTime<Utc>>,
    ) -> AppResult<Participant>;
    async fn find_participant(
        &self,
        conversation_id: i64,
        user_id: Uuid,
    ) -> AppResult<Option<Participant>>;
    async fn list_participations(&self, user_id: Uuid) -> AppResult<Vec<Participant>>;
    async fn list_participants(&self, conversation_id: i64) -> AppResult<Vec<Participant>>;
    /// Forward-only: the stored watermark becomes `max(previous, at)`.
    async fn mark_participant_read(
        &self,
        conversation_id: i64,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> AppResult<Option<Participant>>;

    // Messages
    async fn create_message(&self, message: NewMessage) -> AppResult<MessageView>;
    async fn latest_message(&self, conversation_id: i64) -> AppResult<Option<MessageView>>;
    /// The newest `take` messages, returned oldest first.
    async fn list_messages(&self, conversation_id: i64, take: i64) -> AppResult<Vec<MessageView>>;
    /// Messages newer than `after` (all when `None`) whose sender is neither
    /// `viewer` nor null.
    async fn count_unread(
        &self,
        conversation_id: i64,
        viewer: Uuid,
        after: Option<DateTime<Utc>>,
    ) -> AppResult<i64>;
    async fn search_messages(&self, filter: &MessageFilter) -> AppResult<MessagePage>;
    /// Hard delete. Returns the deleted row's conversation id and sender.
    async fn delete_message(&self, message_id: i64) -> AppResult<Option<DeletedMessage>>;
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedMessage {
    pub conversation_id: i64,
    pub sender_id: Option<Uuid>,
}
