//! Fan-out core: turns committed store mutations into addressed realtime
//! events and keeps every participant's unread view authoritative.
//!
//! Store writes are sequential and independent; nothing here opens a
//! cross-table transaction. Relay delivery is best-effort and reported back
//! through [`Committed`] instead of failing the command.

use std::{collections::HashSet, sync::Arc};

use chrono::{DateTime, Utc};
use futures::future::{join_all, try_join_all};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    config::MessagingConfig,
    error::{AppError, AppResult},
    models::{
        Conversation, ConversationListItem, ConversationType, ConversationUnread, MessageView,
        NewMessage, SentMessage, UnreadSummary, User,
    },
    realtime::{
        events::{ConversationCreated, MessageNew, MessageSeen, Typing},
        fan_out, Committed, DeliveryReport, Notifier, RealtimeEvent, Room,
    },
    services::auth::{resolve_user, Identity},
    storage::Store,
};

/// Where a message goes: an existing conversation or a brand new one.
#[derive(Debug, Clone)]
pub enum Destination {
    Existing(i64),
    New {
        recipient_ids: Vec<Uuid>,
        title: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub conversation_id: i64,
    pub user_id: Uuid,
    pub last_read_at: DateTime<Utc>,
}

/// Recomputes a user's unread counts from the store. No side effects.
pub async fn unread_summary(store: &dyn Store, user_id: Uuid) -> AppResult<UnreadSummary> {
    let participations = store.list_participations(user_id).await?;
    let counts = try_join_all(
        participations
            .iter()
            .map(|p| store.count_unread(p.conversation_id, user_id, p.last_read_at)),
    )
    .await?;

    let conversations = participations
        .iter()
        .zip(counts)
        .map(|(p, unread_count)| ConversationUnread {
            conversation_id: p.conversation_id,
            unread_count,
        })
        .collect();
    Ok(UnreadSummary::new(user_id, conversations))
}

/// Computes and emits a fresh summary to each user's room. A summary that
/// cannot be computed counts as a failed delivery; the write it follows has
/// already committed.
pub async fn broadcast_unread_summaries(
    store: &dyn Store,
    notifier: &dyn Notifier,
    user_ids: &[Uuid],
) -> DeliveryReport {
    let summaries = join_all(user_ids.iter().map(|&id| unread_summary(store, id))).await;

    let mut skipped = DeliveryReport::default();
    let mut emissions = Vec::with_capacity(summaries.len());
    for (user_id, summary) in user_ids.iter().zip(summaries) {
        match summary {
            Ok(summary) => {
                emissions.push((Room::user(*user_id), RealtimeEvent::UnreadSummary(summary)))
            }
            Err(e) => {
                tracing::warn!("Failed to compute unread summary for {}: {}", user_id, e);
                skipped.failed += 1;
            }
        }
    }

    skipped.merge(fan_out(notifier, &emissions).await)
}

fn to_rooms(user_ids: &[Uuid], event: &RealtimeEvent) -> Vec<(Room, RealtimeEvent)> {
    user_ids
        .iter()
        .map(|&id| (Room::user(id), event.clone()))
        .collect()
}

pub struct MessagingService {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    limits: MessagingConfig,
}

impl MessagingService {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<dyn Notifier>, limits: MessagingConfig) -> Self {
        Self {
            store,
            notifier,
            limits,
        }
    }

    pub async fn resolve_sender(&self, identity: &Identity) -> AppResult<User> {
        resolve_user(self.store.as_ref(), identity)
            .await?
            .ok_or(AppError::UnknownSender)
    }

    pub async fn send_message(
        &self,
        identity: &Identity,
        destination: Destination,
        body: &str,
    ) -> AppResult<Committed<SentMessage>> {
        let content = body.trim();
        if content.is_empty() {
            return Err(AppError::Validation("Message content is required".to_string()));
        }

        let sender = self.resolve_sender(identity).await?;

        let (conversation_id, participant_ids, created) = match destination {
            Destination::Existing(conversation_id) => {
                let conversation = self
                    .store
                    .find_conversation_for_participant(conversation_id, sender.id)
                    .await?
                    .ok_or(AppError::ConversationNotFound)?;
                (conversation_id, conversation.participant_ids(), None)
            }
            Destination::New {
                recipient_ids,
                title,
            } => {
                let (conversation, participant_ids) =
                    self.open_conversation(&sender, recipient_ids, title).await?;
                let created = ConversationCreated {
                    conversation_id: conversation.id,
                    conversation_type: conversation.conversation_type,
                    title: conversation.title.clone(),
                    participant_ids: participant_ids.clone(),
                };
                (conversation.id, participant_ids, Some(created))
            }
        };

        let now = Utc::now();
        let message = self
            .store
            .create_message(NewMessage {
                content: content.to_string(),
                author: sender.author_name(),
                sender_id: Some(sender.id),
                conversation_id,
                created_at: now,
            })
            .await?;
        self.store.touch_conversation(conversation_id, now).await?;

        tracing::debug!(
            "Message {} stored in conversation {} by {}",
            message.id,
            conversation_id,
            sender.id
        );

        let mut delivery = DeliveryReport::default();
        if let Some(created) = created {
            let event = RealtimeEvent::ConversationCreated(created);
            let rooms = to_rooms(&participant_ids, &event);
            delivery = delivery.merge(fan_out(self.notifier.as_ref(), &rooms).await);
        }

        let event = RealtimeEvent::MessageNew(MessageNew {
            conversation_id,
            message: message.clone(),
        });
        let rooms = to_rooms(&participant_ids, &event);
        delivery = delivery.merge(fan_out(self.notifier.as_ref(), &rooms).await);

        let recipients: Vec<Uuid> = participant_ids
            .iter()
            .copied()
            .filter(|&id| id != sender.id)
            .collect();
        delivery = delivery.merge(
            broadcast_unread_summaries(self.store.as_ref(), self.notifier.as_ref(), &recipients).await,
        );

        Ok(Committed::new(
            SentMessage {
                conversation_id,
                message,
            },
            delivery,
        ))
    }

    /// Creates the conversation and its participant rows one by one. Returns
    /// the ids of the participants that were actually stored, sender first.
    async fn open_conversation(
        &self,
        sender: &User,
        recipient_ids: Vec<Uuid>,
        title: Option<String>,
    ) -> AppResult<(Conversation, Vec<Uuid>)> {
        let mut seen = HashSet::new();
        let candidates: Vec<Uuid> = recipient_ids
            .into_iter()
            .filter(|&id| id != sender.id && seen.insert(id))
            .collect();

        let existing: HashSet<Uuid> = self
            .store
            .find_existing_user_ids(&candidates)
            .await?
            .into_iter()
            .collect();
        let recipients: Vec<Uuid> = candidates
            .into_iter()
            .filter(|id| existing.contains(id))
            .collect();
        if recipients.is_empty() {
            return Err(AppError::Validation(
                "At least one valid recipient is required".to_string(),
            ));
        }
        // Unknown ids are dropped first so a stale list only counts what is left.
        if recipients.len() > self.limits.max_recipients {
            return Err(AppError::Validation(format!(
                "At most {} recipients are allowed",
                self.limits.max_recipients
            )));
        }

        let conversation_type = ConversationType::for_participant_count(recipients.len() + 1);
        let title = match conversation_type {
            ConversationType::Group => title
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string),
            ConversationType::Direct => None,
        };

        let conversation = self
            .store
            .create_conversation(conversation_type, title.as_deref())
            .await?;

        // The sender's row backs every message they post here.
        self.store
            .create_participant(conversation.id, sender.id, Some(Utc::now()))
            .await?;

        let mut participant_ids = vec![sender.id];
        for recipient in recipients {
            match self
                .store
                .create_participant(conversation.id, recipient, None)
                .await
            {
                Ok(_) => participant_ids.push(recipient),
                Err(e) => tracing::warn!(
                    "Skipping participant {} for conversation {}: {}",
                    recipient,
                    conversation.id,
                    e
                ),
            }
        }

        if participant_ids.len() == 1 {
            tracing::warn!(
                "Conversation {} was created without any recipients",
                conversation.id
            );
        }

        Ok((conversation, participant_ids))
    }

    pub async fn mark_conversation_read(
        &self,
        identity: &Identity,
        conversation_id: i64,
    ) -> AppResult<Committed<ReadReceipt>> {
        let user = self.resolve_sender(identity).await?;
        let conversation = self
            .store
            .find_conversation_for_participant(conversation_id, user.id)
            .await?
            .ok_or(AppError::ConversationNotFound)?;

        let now = Utc::now();
        let participant = self
            .store
            .mark_participant_read(conversation_id, user.id, now)
            .await?
            .ok_or(AppError::ConversationNotFound)?;

        let receipt = ReadReceipt {
            conversation_id,
            user_id: user.id,
            last_read_at: participant.last_read_at.unwrap_or(now),
        };

        let seen = RealtimeEvent::MessageSeen(MessageSeen {
            conversation_id,
            user_id: user.id,
            last_read_at: receipt.last_read_at,
        });
        let delivery = fan_out(
            self.notifier.as_ref(),
            &to_rooms(&conversation.participant_ids(), &seen),
        )
        .await
        .merge(
            broadcast_unread_summaries(self.store.as_ref(), self.notifier.as_ref(), &[user.id])
                .await,
        );

        Ok(Committed::new(receipt, delivery))
    }

    pub async fn compute_unread_summary(&self, user_id: Uuid) -> AppResult<UnreadSummary> {
        unread_summary(self.store.as_ref(), user_id).await
    }

    pub async fn unread_summary_for(&self, identity: &Identity) -> AppResult<UnreadSummary> {
        let user = self.resolve_sender(identity).await?;
        self.compute_unread_summary(user.id).await
    }

    pub async fn list_conversations(
        &self,
        identity: &Identity,
    ) -> AppResult<Vec<ConversationListItem>> {
        let user_id = self.resolve_sender(identity).await?.id;
        let conversations = self.store.list_conversations_for_user(user_id).await?;
        let store = self.store.as_ref();

        try_join_all(conversations.into_iter().map(|conversation| async move {
            let last_read_at = conversation
                .participant(user_id)
                .and_then(|p| p.last_read_at);
            let id = conversation.conversation.id;
            let (unread_count, latest_message) = futures::try_join!(
                store.count_unread(id, user_id, last_read_at),
                store.latest_message(id),
            )?;

            let other_participants = conversation
                .participants
                .iter()
                .filter(|p| p.participant.user_id != user_id)
                .filter_map(|p| p.user.clone())
                .collect();

            Ok::<_, AppError>(ConversationListItem {
                id,
                conversation_type: conversation.conversation.conversation_type,
                title: conversation.conversation.title,
                updated_at: conversation.conversation.updated_at,
                unread_count,
                latest_message,
                other_participants,
            })
        }))
        .await
    }

    pub async fn list_messages(
        &self,
        identity: &Identity,
        conversation_id: i64,
        take: Option<i64>,
    ) -> AppResult<Vec<MessageView>> {
        let user = self.resolve_sender(identity).await?;
        self.store
            .find_conversation_for_participant(conversation_id, user.id)
            .await?
            .ok_or(AppError::ConversationNotFound)?;

        let take = take
            .filter(|&take| take > 0)
            .unwrap_or(self.limits.default_page_size)
            .clamp(1, self.limits.max_page_size);
        self.store.list_messages(conversation_id, take).await
    }

    /// Relays a typing indicator to the other participants. Nothing is stored.
    pub async fn broadcast_typing(
        &self,
        identity: &Identity,
        conversation_id: i64,
        is_typing: bool,
    ) -> AppResult<Committed<()>> {
        let user = self.resolve_sender(identity).await?;
        let conversation = self
            .store
            .find_conversation_for_participant(conversation_id, user.id)
            .await?
            .ok_or(AppError::ConversationNotFound)?;

        let typing = Typing {
            conversation_id,
            user_id: user.id,
        };
        let event = if is_typing {
            RealtimeEvent::UserTyping(typing)
        } else {
            RealtimeEvent::UserStoppedTyping(typing)
        };
        let others: Vec<Uuid> = conversation
            .participant_ids()
            .into_iter()
            .filter(|&id| id != user.id)
            .collect();

        let delivery = fan_out(self.notifier.as_ref(), &to_rooms(&others, &event)).await;
        Ok(Committed::new((), delivery))
    }
}
