use std::sync::Arc;

use uuid::Uuid;

use crate::{
    config::MessagingConfig,
    error::{AppError, AppResult},
    models::{MessageFilter, MessagePage},
    realtime::{
        events::MessageDeleted, fan_out, Committed, DeliveryReport, Notifier, RealtimeEvent, Room,
    },
    services::{
        auth::{require_admin, Identity},
        messaging::broadcast_unread_summaries,
    },
    storage::{DeletedMessage, Store},
};

/// Administrator-only message listing and hard deletion.
pub struct ModerationService {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    limits: MessagingConfig,
}

impl ModerationService {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<dyn Notifier>, limits: MessagingConfig) -> Self {
        Self {
            store,
            notifier,
            limits,
        }
    }

    pub async fn search_messages(
        &self,
        admin: &Identity,
        mut filter: MessageFilter,
    ) -> AppResult<MessagePage> {
        require_admin(self.store.as_ref(), admin).await?;

        filter.take = filter.take.clamp(1, self.limits.max_page_size);
        filter.skip = filter.skip.max(0);
        filter.q = filter
            .q
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty());

        self.store.search_messages(&filter).await
    }

    /// Deletes the message, tells every participant, and refreshes the unread
    /// counts of everyone who could have had it unread.
    pub async fn delete_message(
        &self,
        admin: &Identity,
        message_id: i64,
    ) -> AppResult<Committed<DeletedMessage>> {
        let moderator = require_admin(self.store.as_ref(), admin).await?;
        if message_id <= 0 {
            return Err(AppError::Validation("Invalid message id".to_string()));
        }

        let deleted = self
            .store
            .delete_message(message_id)
            .await?
            .ok_or(AppError::MessageNotFound)?;

        tracing::info!(
            "Message {} in conversation {} deleted by {}",
            message_id,
            deleted.conversation_id,
            moderator.id
        );

        // The row is gone; a failed lookup only costs the notifications.
        let participant_ids: Vec<Uuid> = match self
            .store
            .list_participants(deleted.conversation_id)
            .await
        {
            Ok(participants) => participants.into_iter().map(|p| p.user_id).collect(),
            Err(e) => {
                tracing::warn!(
                    "Failed to load participants of conversation {} after deleting message {}: {}",
                    deleted.conversation_id,
                    message_id,
                    e
                );
                let delivery = DeliveryReport {
                    sent: 0,
                    failed: 1,
                };
                return Ok(Committed::new(deleted, delivery));
            }
        };

        let event = RealtimeEvent::MessageDeleted(MessageDeleted {
            conversation_id: deleted.conversation_id,
            message_id,
        });
        let emissions: Vec<(Room, RealtimeEvent)> = participant_ids
            .iter()
            .map(|&id| (Room::user(id), event.clone()))
            .collect();
        let delivery = fan_out(self.notifier.as_ref(), &emissions).await;

        let readers: Vec<Uuid> = participant_ids
            .into_iter()
            .filter(|&id| Some(id) != deleted.sender_id)
            .collect();
        let delivery = delivery.merge(
            broadcast_unread_summaries(self.store.as_ref(), self.notifier.as_ref(), &readers).await,
        );

        Ok(Committed::new(deleted, delivery))
    }
}
