//! In-process store with the same contracts as [`PgStore`](super::PgStore).
//!
//! Used by the test suites.
//! Foreign-key and uniqueness rules are enforced the way the schema in
//! `migrations/` enforces them.

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{DeletedMessage, Store};
use crate::{
    error::{AppError, AppResult},
    models::{
        Conversation, ConversationRef, ConversationType, ConversationWithParticipants, Message,
        MessageFilter, MessagePage, MessageView, ModeratedMessage, ModerationSender, NewMessage,
        NewUser, Participant, ParticipantWithUser, Role, User, UserChanges,
    },
};

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, User>,
    conversations: BTreeMap<i64, Conversation>,
    participants: Vec<Participant>,
    messages: BTreeMap<i64, Message>,
    next_conversation_id: i64,
    next_participant_id: i64,
    next_message_id: i64,
    rejected_participants: HashSet<Uuid>,
    unlistable_conversations: HashSet<i64>,
}

impl Inner {
    fn view(&self, message: &Message) -> MessageView {
        MessageView {
            id: message.id,
            content: message.content.clone(),
            author: message.author.clone(),
            created_at: message.created_at,
            sender: message
                .sender_id
                .and_then(|id| self.users.get(&id))
                .map(User::summary),
        }
    }

    fn with_participants(&self, conversation: &Conversation) -> ConversationWithParticipants {
        let participants = self
            .participants
            .iter()
            .filter(|p| p.conversation_id == conversation.id)
            .map(|p| ParticipantWithUser {
                participant: p.clone(),
                user: self.users.get(&p.user_id).map(User::summary),
            })
            .collect();
        ConversationWithParticipants {
            conversation: conversation.clone(),
            participants,
        }
    }

    fn is_participant(&self, conversation_id: i64, user_id: Uuid) -> bool {
        self.participants
            .iter()
            .any(|p| p.conversation_id == conversation_id && p.user_id == user_id)
    }

    fn email_taken(&self, email: &str, except: Option<Uuid>) -> bool {
        self.users
            .values()
            .any(|u| u.email == email && Some(u.id) != except)
    }

    fn matches(&self, message: &Message, filter: &MessageFilter) -> bool {
        if let Some(conversation_id) = filter.conversation_id {
            if message.conversation_id != conversation_id {
                return false;
            }
        }
        if let Some(sender_id) = filter.sender_id {
            if message.sender_id != Some(sender_id) {
                return false;
            }
        }
        match filter.q.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
            Some(q) => message.content.to_lowercase().contains(&q.to_lowercase()),
            None => true,
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a user row directly, bypassing registration.
    pub async fn insert_user(&self, email: &str, name: Option<&str>, role: Role) -> User {
        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            email: email.to_string(),
            name: name.map(str::to_string),
            image: None,
            role,
            password_hash: None,
            created_at: now,
            updated_at: now,
        };
        self.inner.write().await.users.insert(user.id, user.clone());
        user
    }

    /// Makes every future participant insert for `user_id` fail.
    pub async fn reject_participant_inserts_for(&self, user_id: Uuid) {
        self.inner.write().await.rejected_participants.insert(user_id);
    }

    /// Makes every future participant listing for `conversation_id` fail.
    pub async fn reject_participant_listing_for(&self, conversation_id: i64) {
        self.inner
            .write()
            .await
            .unlistable_conversations
            .insert(conversation_id);
    }

    pub async fn conversation(&self, conversation_id: i64) -> Option<Conversation> {
        self.inner
            .read()
            .await
            .conversations
            .get(&conversation_id)
            .cloned()
    }

    pub async fn conversation_count(&self) -> usize {
        self.inner.read().await.conversations.len()
    }

    pub async fn messages_in(&self, conversation_id: i64) -> Vec<Message> {
        self.inner
            .read()
            .await
            .messages
            .values()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_user_by_id(&self, id: Uuid) -> AppResult<Option<User>> {
        Ok(self.inner.read().await.users.get(&id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> AppResult<Option<User>> {
        Ok(self
            .inner
            .read()
            .await
            .users
            .values()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn find_existing_user_ids(&self, ids: &[Uuid]) -> AppResult<Vec<Uuid>> {
        let inner = self.inner.read().await;
        Ok(ids
            .iter()
            .copied()
            .filter(|id| inner.users.contains_key(id))
            .collect())
    }

    async fn list_users(&self) -> AppResult<Vec<User>> {
        let mut users: Vec<User> = self.inner.read().await.users.values().cloned().collect();
        users.sort_by(|a, b| a.email.cmp(&b.email));
        Ok(users)
    }

    async fn create_user(&self, user: NewUser) -> AppResult<User> {
        let mut inner = self.inner.write().await;
        if inner.email_taken(&user.email, None) {
            return Err(AppError::UserAlreadyExists);
        }
        let now = Utc::now();
        let created = User {
            id: Uuid::new_v4(),
            email: user.email,
            name: user.name,
            image: None,
            role: user.role,
            password_hash: Some(user.password_hash),
            created_at: now,
            updated_at: now,
        };
        inner.users.insert(created.id, created.clone());
        Ok(created)
    }

    async fn update_user(&self, id: Uuid, changes: UserChanges) -> AppResult<Option<User>> {
        let mut inner = self.inner.write().await;
        if let Some(email) = changes.email.as_deref() {
            if inner.email_taken(email, Some(id)) {
                return Err(AppError::UserAlreadyExists);
            }
        }
        let Some(user) = inner.users.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(name) = changes.name {
            user.name = name;
        }
        if let Some(email) = changes.email {
            user.email = email;
        }
        if let Some(role) = changes.role {
            user.role = role;
        }
        if let Some(password_hash) = changes.password_hash {
            user.password_hash = Some(password_hash);
        }
        user.updated_at = Utc::now();
        Ok(Some(user.clone()))
    }

    async fn delete_user(&self, id: Uuid) -> AppResult<bool> {
        let mut inner = self.inner.write().await;
        if inner.users.remove(&id).is_none() {
            return Ok(false);
        }
        // Mirrors ON DELETE CASCADE / SET NULL in the schema.
        inner.participants.retain(|p| p.user_id != id);
        for message in inner.messages.values_mut() {
            if message.sender_id == Some(id) {
                message.sender_id = None;
            }
        }
        Ok(true)
    }

    async fn count_administrators(&self) -> AppResult<i64> {
        Ok(self
            .inner
            .read()
            .await
            .users
            .values()
            .filter(|u| u.role == Role::Administrator)
            .count() as i64)
    }

    async fn create_conversation(
        &self,
        conversation_type: ConversationType,
        title: Option<&str>,
    ) -> AppResult<Conversation> {
        let mut inner = self.inner.write().await;
        inner.next_conversation_id += 1;
        let now = Utc::now();
        let conversation = Conversation {
            id: inner.next_conversation_id,
            conversation_type,
            title: title.map(str::to_string),
            created_at: now,
            updated_at: now,
        };
        inner
            .conversations
            .insert(conversation.id, conversation.clone());
        Ok(conversation)
    }

    async fn touch_conversation(
        &self,
        conversation_id: i64,
        at: DateTime<Utc>,
    ) -> AppResult<DateTime<Utc>> {
        let mut inner = self.inner.write().await;
        let conversation = inner
            .conversations
            .get_mut(&conversation_id)
            .ok_or(AppError::ConversationNotFound)?;
        conversation.updated_at = at.max(conversation.updated_at + Duration::microseconds(1));
        Ok(conversation.updated_at)
    }

    async fn find_conversation_for_participant(
        &self,
        conversation_id: i64,
        user_id: Uuid,
    ) -> AppResult<Option<ConversationWithParticipants>> {
        let inner = self.inner.read().await;
        if !inner.is_participant(conversation_id, user_id) {
            return Ok(None);
        }
        Ok(inner
            .conversations
            .get(&conversation_id)
            .map(|c| inner.with_participants(c)))
    }

    async fn list_conversations_for_user(
        &self,
        user_id: Uuid,
    ) -> AppResult<Vec<ConversationWithParticipants>> {
        let inner = self.inner.read().await;
        let mut conversations: Vec<&Conversation> = inner
            .conversations
            .values()
            .filter(|c| inner.is_participant(c.id, user_id))
            .collect();
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        Ok(conversations
            .into_iter()
            .map(|c| inner.with_participants(c))
            .collect())
    }

    async fn create_participant(
        &self,
        conversation_id: i64,
        user_id: Uuid,
        last_read_at: Option<DateTime<Utc>>,
    ) -> AppResult<Participant> {
        let mut inner = self.inner.write().await;
        if inner.rejected_participants.contains(&user_id) {
            return Err(AppError::Internal(anyhow!(
                "participant insert rejected for {}",
                user_id
            )));
        }
        if !inner.conversations.contains_key(&conversation_id) || !inner.users.contains_key(&user_id)
        {
            return Err(AppError::Internal(anyhow!(
                "foreign key violation on conversation_participants"
            )));
        }
        if inner.is_participant(conversation_id, user_id) {
            return Err(AppError::Internal(anyhow!(
                "duplicate participant ({}, {})",
                conversation_id,
                user_id
            )));
        }
        inner.next_participant_id += 1;
        let participant = Participant {
            id: inner.next_participant_id,
            conversation_id,
            user_id,
            last_read_at,
        };
        inner.participants.push(participant.clone());
        Ok(participant)
    }

    async fn find_participant(
        &self,
        conversation_id: i64,
        user_id: Uuid,
    ) -> AppResult<Option<Participant>> {
        Ok(self
            .inner
            .read()
            .await
            .participants
            .iter()
            .find(|p| p.conversation_id == conversation_id && p.user_id == user_id)
            .cloned())
    }

    async fn list_participations(&self, user_id: Uuid) -> AppResult<Vec<Participant>> {
        let mut participations: Vec<Participant> = self
            .inner
            .read()
            .await
            .participants
            .iter()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        participations.sort_by_key(|p| p.conversation_id);
        Ok(participations)
    }

    async fn list_participants(&self, conversation_id: i64) -> AppResult<Vec<Participant>> {
        let inner = self.inner.read().await;
        if inner.unlistable_conversations.contains(&conversation_id) {
            return Err(AppError::Internal(anyhow!(
                "participant listing rejected for conversation {}",
                conversation_id
            )));
        }
        Ok(inner
            .participants
            .iter()
            .filter(|p| p.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn mark_participant_read(
        &self,
        conversation_id: i64,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> AppResult<Option<Participant>> {
        let mut inner = self.inner.write().await;
        let participant = inner
            .participants
            .iter_mut()
            .find(|p| p.conversation_id == conversation_id && p.user_id == user_id);
        Ok(participant.map(|p| {
            p.last_read_at = Some(p.last_read_at.map_or(at, |previous| previous.max(at)));
            p.clone()
        }))
    }

    async fn create_message(&self, message: NewMessage) -> AppResult<MessageView> {
        let mut inner = self.inner.write().await;
        if !inner.conversations.contains_key(&message.conversation_id) {
            return Err(AppError::Internal(anyhow!(
                "foreign key violation on messages.conversation_id"
            )));
        }
        if let Some(sender_id) = message.sender_id {
            if !inner.users.contains_key(&sender_id) {
                return Err(AppError::Internal(anyhow!(
                    "foreign key violation on messages.sender_id"
                )));
            }
        }
        inner.next_message_id += 1;
        let stored = Message {
            id: inner.next_message_id,
            content: message.content,
            author: message.author,
            sender_id: message.sender_id,
            conversation_id: message.conversation_id,
            created_at: message.created_at,
        };
        let view = inner.view(&stored);
        inner.messages.insert(stored.id, stored);
        Ok(view)
    }

    async fn latest_message(&self, conversation_id: i64) -> AppResult<Option<MessageView>> {
        let inner = self.inner.read().await;
        Ok(inner
            .messages
            .values()
            .filter(|m| m.conversation_id == conversation_id)
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
            .map(|m| inner.view(m)))
    }

    async fn list_messages(&self, conversation_id: i64, take: i64) -> AppResult<Vec<MessageView>> {
        let inner = self.inner.read().await;
        let mut messages: Vec<&Message> = inner
            .messages
            .values()
            .filter(|m| m.conversation_id == conversation_id)
            .collect();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        let skip = messages.len().saturating_sub(take.max(0) as usize);
        Ok(messages[skip..].iter().map(|m| inner.view(m)).collect())
    }

    async fn count_unread(
        &self,
        conversation_id: i64,
        viewer: Uuid,
        after: Option<DateTime<Utc>>,
    ) -> AppResult<i64> {
        let inner = self.inner.read().await;
        Ok(inner
            .messages
            .values()
            .filter(|m| m.conversation_id == conversation_id)
            .filter(|m| matches!(m.sender_id, Some(sender) if sender != viewer))
            .filter(|m| after.map_or(true, |watermark| m.created_at > watermark))
            .count() as i64)
    }

    async fn search_messages(&self, filter: &MessageFilter) -> AppResult<MessagePage> {
        let inner = self.inner.read().await;
        let mut matching: Vec<&Message> = inner
            .messages
            .values()
            .filter(|m| inner.matches(m, filter))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = matching.len() as i64;
        let items = matching
            .into_iter()
            .skip(filter.skip.max(0) as usize)
            .take(filter.take.max(0) as usize)
            .filter_map(|m| {
                let conversation = inner.conversations.get(&m.conversation_id)?;
                Some(ModeratedMessage {
                    id: m.id,
                    content: m.content.clone(),
                    created_at: m.created_at,
                    sender: m.sender_id.and_then(|id| inner.users.get(&id)).map(|u| {
                        ModerationSender {
                            id: u.id,
                            name: u.name.clone(),
                            email: u.email.clone(),
                            image: u.image.clone(),
                        }
                    }),
                    conversation: ConversationRef {
                        id: conversation.id,
                        conversation_type: conversation.conversation_type,
                        title: conversation.title.clone(),
                    },
                })
            })
            .collect();

        Ok(MessagePage {
            items,
            total,
            take: filter.take,
            skip: filter.skip,
        })
    }

    async fn delete_message(&self, message_id: i64) -> AppResult<Option<DeletedMessage>> {
        Ok(self
            .inner
            .write()
            .await
            .messages
            .remove(&message_id)
            .map(|m| DeletedMessage {
                conversation_id: m.conversation_id,
                sender_id: m.sender_id,
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_watermark_never_moves_backwards() {
        let store = MemoryStore::new();
        let user = store.insert_user("a@example.com", None, Role::User).await;
        let conversation = store
            .create_conversation(ConversationType::Direct, None)
            .await
            .unwrap();
        store
            .create_participant(conversation.id, user.id, None)
            .await
            .unwrap();

        let later = Utc::now();
        let earlier = later - Duration::seconds(30);
        store
            .mark_participant_read(conversation.id, user.id, later)
            .await
            .unwrap();
        let participant = store
            .mark_participant_read(conversation.id, user.id, earlier)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(participant.last_read_at, Some(later));
    }

    #[tokio::test]
    async fn touch_is_strictly_increasing_even_with_a_stale_clock() {
        let store = MemoryStore::new();
        let conversation = store
            .create_conversation(ConversationType::Direct, None)
            .await
            .unwrap();
        let stale = conversation.updated_at - Duration::seconds(5);

        let bumped = store.touch_conversation(conversation.id, stale).await.unwrap();

        assert!(bumped > conversation.updated_at);
    }

    #[tokio::test]
    async fn duplicate_participant_rows_are_rejected() {
        let store = MemoryStore::new();
        let user = store.insert_user("a@example.com", None, Role::User).await;
        let conversation = store
            .create_conversation(ConversationType::Direct, None)
            .await
            .unwrap();
        store
            .create_participant(conversation.id, user.id, None)
            .await
            .unwrap();

        let second = store.create_participant(conversation.id, user.id, None).await;

        assert!(second.is_err());
    }

    #[tokio::test]
    async fn deleting_a_user_keeps_their_messages_as_senderless() {
        let store = MemoryStore::new();
        let user = store.insert_user("gone@example.com", Some("Gone"), Role::User).await;
        let conversation = store
            .create_conversation(ConversationType::Direct, None)
            .await
            .unwrap();
        store
            .create_participant(conversation.id, user.id, None)
            .await
            .unwrap();
        store
            .create_message(NewMessage {
                content: "bye".to_string(),
                author: "Gone".to_string(),
                sender_id: Some(user.id),
                conversation_id: conversation.id,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        assert!(store.delete_user(user.id).await.unwrap());

        let messages = store.list_messages(conversation.id, 10).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].author, "Gone");
        assert!(messages[0].sender.is_none());
    }
}
