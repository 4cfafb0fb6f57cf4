//! Per-tab reconciliation state. Pure: every input returns the [`Effect`]s the
//! driver has to perform, so the rules can be exercised without sockets.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    models::{ConversationListItem, MessageView, SentMessage, UnreadSummary},
    realtime::{
        events::{ConversationCreated, MessageDeleted, MessageNew, MessageSeen, Typing},
        Frame, RealtimeEvent,
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    JoinRoom(Uuid),
    ReloadConversations,
    LoadMessages { conversation_id: i64, activation: u64 },
    MarkRead { conversation_id: i64 },
    Notify(Notification),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub conversation_id: i64,
    pub author: String,
    pub preview: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ViewState {
    Closed,
    #[serde(rename_all = "camelCase")]
    Loading { conversation_id: i64, activation: u64 },
    #[serde(rename_all = "camelCase")]
    Loaded { conversation_id: i64, activation: u64 },
}

impl ViewState {
    pub fn conversation_id(&self) -> Option<i64> {
        match *self {
            Self::Closed => None,
            Self::Loading {
                conversation_id, ..
            }
            | Self::Loaded {
                conversation_id, ..
            } => Some(conversation_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Seen,
}

/// What a UI renders from.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub user_id: Uuid,
    pub connected: bool,
    pub conversations: Vec<ConversationListItem>,
    pub total_unread: i64,
    pub view: ViewState,
    pub messages: Vec<MessageView>,
    pub typing: Vec<Uuid>,
    pub last_error: Option<String>,
}

pub struct SessionRuntime {
    user_id: Uuid,
    connected: bool,
    conversations: Vec<ConversationListItem>,
    total_unread: i64,
    view: ViewState,
    activations: u64,
    messages: Vec<MessageView>,
    seen: HashMap<Uuid, DateTime<Utc>>,
    typing: HashSet<Uuid>,
    last_error: Option<String>,
}

impl SessionRuntime {
    pub fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            connected: false,
            conversations: Vec::new(),
            total_unread: 0,
            view: ViewState::Closed,
            activations: 0,
            messages: Vec::new(),
            seen: HashMap::new(),
            typing: HashSet::new(),
            last_error: None,
        }
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn view(&self) -> ViewState {
        self.view
    }

    pub fn total_unread(&self) -> i64 {
        self.total_unread
    }

    pub fn messages(&self) -> &[MessageView] {
        &self.messages
    }

    pub fn conversation(&self, conversation_id: i64) -> Option<&ConversationListItem> {
        self.conversations.iter().find(|c| c.id == conversation_id)
    }

    pub fn typing(&self) -> Vec<Uuid> {
        let mut typing: Vec<Uuid> = self.typing.iter().copied().collect();
        typing.sort();
        typing
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            user_id: self.user_id,
            connected: self.connected,
            conversations: self.conversations.clone(),
            total_unread: self.total_unread,
            view: self.view,
            messages: self.messages.clone(),
            typing: self.typing(),
            last_error: self.last_error.clone(),
        }
    }

    // Connection lifecycle

    /// Joins the user's room and refetches what may have been missed while
    /// disconnected. A view still `Loading` is retried under the same
    /// activation, so its mark-read is still requested once.
    pub fn on_connected(&mut self) -> Vec<Effect> {
        self.connected = true;
        let mut effects = vec![Effect::JoinRoom(self.user_id), Effect::ReloadConversations];
        match self.view {
            ViewState::Loading {
                conversation_id,
                activation,
            }
            | ViewState::Loaded {
                conversation_id,
                activation,
            } => effects.push(Effect::LoadMessages {
                conversation_id,
                activation,
            }),
            ViewState::Closed => {}
        }
        effects
    }

    pub fn on_disconnected(&mut self) -> Vec<Effect> {
        self.connected = false;
        self.typing.clear();
        Vec::new()
    }

    // Command results

    pub fn conversations_loaded(&mut self, conversations: Vec<ConversationListItem>) {
        self.conversations = conversations;
        self.sort_conversations();
        self.total_unread = self.conversations.iter().map(|c| c.unread_count).sum();
    }

    pub fn open_conversation(&mut self, conversation_id: i64) -> Vec<Effect> {
        self.activations += 1;
        self.view = ViewState::Loading {
            conversation_id,
            activation: self.activations,
        };
        self.messages.clear();
        self.seen.clear();
        self.typing.clear();
        vec![Effect::LoadMessages {
            conversation_id,
            activation: self.activations,
        }]
    }

    pub fn close_conversation(&mut self) {
        self.view = ViewState::Closed;
        self.messages.clear();
        self.seen.clear();
        self.typing.clear();
    }

    /// A message page arrived. Only the load that matches the current
    /// activation moves the view to `Loaded`, and only that transition asks
    /// for a mark-read.
    pub fn messages_loaded(
        &mut self,
        conversation_id: i64,
        activation: u64,
        messages: Vec<MessageView>,
    ) -> Vec<Effect> {
        match self.view {
            ViewState::Loading {
                conversation_id: current,
                activation: expected,
            } if current == conversation_id && expected == activation => {
                self.view = ViewState::Loaded {
                    conversation_id,
                    activation,
                };
                for message in messages {
                    self.upsert_message(message);
                }
                self.set_local_unread(conversation_id, 0);
                vec![Effect::MarkRead { conversation_id }]
            }
            ViewState::Loaded {
                conversation_id: current,
                activation: expected,
            } if current == conversation_id && expected == activation => {
                for message in messages {
                    self.upsert_message(message);
                }
                Vec::new()
            }
            _ => {
                tracing::debug!(
                    "Ignoring stale message page for conversation {}",
                    conversation_id
                );
                Vec::new()
            }
        }
    }

    /// Fast path: the HTTP response to our own send.
    pub fn message_sent(&mut self, sent: SentMessage) -> Vec<Effect> {
        self.last_error = None;
        if self.view.conversation_id() == Some(sent.conversation_id) {
            self.upsert_message(sent.message.clone());
        }
        if self.touch_row(sent.conversation_id, &sent.message) {
            Vec::new()
        } else {
            vec![Effect::ReloadConversations]
        }
    }

    pub fn read_confirmed(&mut self, conversation_id: i64) {
        self.set_local_unread(conversation_id, 0);
    }

    pub fn apply_summary(&mut self, summary: &UnreadSummary) -> Vec<Effect> {
        self.on_unread_summary(summary)
    }

    pub fn command_failed(&mut self, message: impl Into<String>) {
        self.last_error = Some(message.into());
    }

    // Relay traffic

    pub fn handle_frame(&mut self, frame: &Frame) -> Vec<Effect> {
        match RealtimeEvent::from_frame(frame) {
            Ok(event) => self.handle_event(event),
            Err(e) => {
                tracing::debug!("Ignoring relay frame: {}", e);
                Vec::new()
            }
        }
    }

    pub fn handle_event(&mut self, event: RealtimeEvent) -> Vec<Effect> {
        match event {
            RealtimeEvent::MessageNew(new) => self.on_message_new(new),
            RealtimeEvent::UnreadSummary(summary) => self.on_unread_summary(&summary),
            RealtimeEvent::ConversationCreated(created) => self.on_conversation_created(&created),
            RealtimeEvent::MessageSeen(seen) => self.on_message_seen(seen),
            RealtimeEvent::MessageDeleted(deleted) => self.on_message_deleted(deleted),
            RealtimeEvent::UserTyping(typing) => self.on_typing(typing, true),
            RealtimeEvent::UserStoppedTyping(typing) => self.on_typing(typing, false),
            RealtimeEvent::UserJoin(_) => Vec::new(),
        }
    }

    fn on_message_new(&mut self, new: MessageNew) -> Vec<Effect> {
        let own = new.message.sender_id() == Some(self.user_id);
        let viewing = self.view.conversation_id() == Some(new.conversation_id);

        if viewing {
            if let Some(sender) = new.message.sender_id() {
                self.typing.remove(&sender);
            }
            self.upsert_message(new.message.clone());
        }

        let known = self.touch_row(new.conversation_id, &new.message);
        if !known {
            return vec![Effect::ReloadConversations];
        }
        if own || viewing {
            return Vec::new();
        }

        // Optimistic; the next summary replaces it.
        let unread = self
            .conversation(new.conversation_id)
            .map_or(0, |c| c.unread_count);
        self.set_local_unread(new.conversation_id, unread + 1);

        vec![Effect::Notify(Notification {
            conversation_id: new.conversation_id,
            author: new.message.author.clone(),
            preview: preview(&new.message.content),
        })]
    }

    fn on_unread_summary(&mut self, summary: &UnreadSummary) -> Vec<Effect> {
        if summary.user_id != self.user_id {
            return Vec::new();
        }
        for conversation in &mut self.conversations {
            conversation.unread_count = summary.unread_for(conversation.id).unwrap_or(0);
        }
        self.total_unread = summary.total_unread;

        let missing = summary
            .conversations
            .iter()
            .any(|c| self.conversation(c.conversation_id).is_none());
        if missing {
            vec![Effect::ReloadConversations]
        } else {
            Vec::new()
        }
    }

    fn on_conversation_created(&mut self, created: &ConversationCreated) -> Vec<Effect> {
        if created.participant_ids.contains(&self.user_id) {
            vec![Effect::ReloadConversations]
        } else {
            Vec::new()
        }
    }

    fn on_message_seen(&mut self, seen: MessageSeen) -> Vec<Effect> {
        if seen.user_id == self.user_id {
            // Read in another tab.
            self.set_local_unread(seen.conversation_id, 0);
        } else if self.view.conversation_id() == Some(seen.conversation_id) {
            let watermark = self.seen.entry(seen.user_id).or_insert(seen.last_read_at);
            if seen.last_read_at > *watermark {
                *watermark = seen.last_read_at;
            }
        }
        Vec::new()
    }

    fn on_message_deleted(&mut self, deleted: MessageDeleted) -> Vec<Effect> {
        if self.view.conversation_id() == Some(deleted.conversation_id) {
            self.messages.retain(|m| m.id != deleted.message_id);
        }
        let was_latest = self
            .conversation(deleted.conversation_id)
            .and_then(|c| c.latest_message.as_ref())
            .is_some_and(|m| m.id == deleted.message_id);
        if was_latest {
            vec![Effect::ReloadConversations]
        } else {
            Vec::new()
        }
    }

    fn on_typing(&mut self, typing: Typing, is_typing: bool) -> Vec<Effect> {
        if typing.user_id != self.user_id
            && self.view.conversation_id() == Some(typing.conversation_id)
        {
            if is_typing {
                self.typing.insert(typing.user_id);
            } else {
                self.typing.remove(&typing.user_id);
            }
        }
        Vec::new()
    }

    /// `Seen` once any other participant's watermark covers one of our own
    /// messages; `None` for messages we did not send.
    pub fn delivery_status(&self, message: &MessageView) -> Option<DeliveryStatus> {
        if message.sender_id() != Some(self.user_id) {
            return None;
        }
        let seen = self
            .seen
            .values()
            .any(|&watermark| watermark >= message.created_at);
        Some(if seen {
            DeliveryStatus::Seen
        } else {
            DeliveryStatus::Sent
        })
    }

    fn upsert_message(&mut self, message: MessageView) {
        match self.messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => *existing = message,
            None => {
                self.messages.push(message);
                self.messages
                    .sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            }
        }
    }

    /// Moves the row to the top with `message` as its latest. Returns false
    /// when the conversation is not in the list yet.
    fn touch_row(&mut self, conversation_id: i64, message: &MessageView) -> bool {
        let Some(row) = self
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
        else {
            return false;
        };
        let newer = row
            .latest_message
            .as_ref()
            .map_or(true, |latest| (latest.created_at, latest.id) <= (message.created_at, message.id));
        if newer {
            row.latest_message = Some(message.clone());
        }
        if message.created_at > row.updated_at {
            row.updated_at = message.created_at;
        }
        self.sort_conversations();
        true
    }

    fn set_local_unread(&mut self, conversation_id: i64, unread: i64) {
        if let Some(row) = self
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
        {
            row.unread_count = unread.max(0);
        }
        self.total_unread = self.conversations.iter().map(|c| c.unread_count).sum();
    }

    fn sort_conversations(&mut self) {
        self.conversations
            .sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
    }
}

fn preview(content: &str) -> String {
    const LIMIT: usize = 80;
    match content.char_indices().nth(LIMIT) {
        Some((cut, _)) => format!("{}…", &content[..cut]),
        None => content.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConversationType, ConversationUnread, UserSummary};
    use chrono::Duration;

    fn message(id: i64, sender: Uuid, at: DateTime<Utc>) -> MessageView {
        MessageView {
            id,
            content: format!("message {}", id),
            author: "someone".to_string(),
            created_at: at,
            sender: Some(UserSummary {
                id: sender,
                name: None,
                image: None,
            }),
        }
    }

    fn row(id: i64, unread: i64) -> ConversationListItem {
        ConversationListItem {
            id,
            conversation_type: ConversationType::Direct,
            title: None,
            updated_at: Utc::now() - Duration::minutes(id),
            unread_count: unread,
            latest_message: None,
            other_participants: Vec::new(),
        }
    }

    fn runtime_with_rows(rows: Vec<ConversationListItem>) -> SessionRuntime {
        let mut runtime = SessionRuntime::new(Uuid::new_v4());
        runtime.conversations_loaded(rows);
        runtime
    }

    #[test]
    fn connecting_joins_own_room() {
        let mut runtime = SessionRuntime::new(Uuid::new_v4());
        let effects = runtime.on_connected();
        assert_eq!(effects[0], Effect::JoinRoom(runtime.user_id()));
        assert!(effects.contains(&Effect::ReloadConversations));
    }

    #[test]
    fn reconnect_retries_a_page_that_never_arrived() {
        let mut runtime = runtime_with_rows(vec![row(1, 2)]);
        runtime.open_conversation(1);
        // The first load failed; the view is still waiting.
        runtime.on_disconnected();

        let effects = runtime.on_connected();
        assert!(effects.contains(&Effect::LoadMessages { conversation_id: 1, activation: 1 }));

        let effects = runtime.messages_loaded(1, 1, vec![message(5, Uuid::new_v4(), Utc::now())]);
        assert_eq!(effects, vec![Effect::MarkRead { conversation_id: 1 }]);
        assert_eq!(runtime.view(), ViewState::Loaded { conversation_id: 1, activation: 1 });
    }

    #[test]
    fn mark_read_is_requested_once_per_activation() {
        let mut runtime = runtime_with_rows(vec![row(1, 3)]);
        let other = Uuid::new_v4();

        let effects = runtime.open_conversation(1);
        assert_eq!(
            effects,
            vec![Effect::LoadMessages { conversation_id: 1, activation: 1 }]
        );

        let effects = runtime.messages_loaded(1, 1, vec![message(10, other, Utc::now())]);
        assert_eq!(effects, vec![Effect::MarkRead { conversation_id: 1 }]);
        assert_eq!(runtime.total_unread(), 0);

        // Further traffic in the open conversation never asks again.
        let new = MessageNew {
            conversation_id: 1,
            message: message(11, other, Utc::now()),
        };
        assert!(runtime.handle_event(RealtimeEvent::MessageNew(new)).is_empty());
        assert!(runtime.messages_loaded(1, 1, Vec::new()).is_empty());
    }

    #[test]
    fn stale_loads_do_not_mark_read() {
        let mut runtime = runtime_with_rows(vec![row(1, 1), row(2, 1)]);
        runtime.open_conversation(1);
        runtime.open_conversation(2);

        let effects = runtime.messages_loaded(1, 1, Vec::new());

        assert!(effects.is_empty());
        assert_eq!(
            runtime.view(),
            ViewState::Loading { conversation_id: 2, activation: 2 }
        );
    }

    #[test]
    fn fast_and_slow_paths_converge() {
        let mut runtime = runtime_with_rows(vec![row(1, 0)]);
        let me = runtime.user_id();
        runtime.open_conversation(1);
        runtime.messages_loaded(1, 1, Vec::new());

        let sent = message(5, me, Utc::now());
        runtime.message_sent(SentMessage {
            conversation_id: 1,
            message: sent.clone(),
        });
        let effects = runtime.handle_event(RealtimeEvent::MessageNew(MessageNew {
            conversation_id: 1,
            message: sent,
        }));

        assert!(effects.is_empty());
        assert_eq!(runtime.messages().len(), 1);
        assert_eq!(runtime.total_unread(), 0);
    }

    #[test]
    fn background_messages_bump_then_yield_to_summary() {
        let mut runtime = runtime_with_rows(vec![row(1, 0), row(2, 0)]);
        let other = Uuid::new_v4();

        let effects = runtime.handle_event(RealtimeEvent::MessageNew(MessageNew {
            conversation_id: 2,
            message: message(7, other, Utc::now()),
        }));
        assert!(matches!(effects.as_slice(), [Effect::Notify(n)] if n.conversation_id == 2));
        assert_eq!(runtime.total_unread(), 1);
        assert_eq!(runtime.snapshot().conversations[0].id, 2);

        let summary = UnreadSummary::new(
            runtime.user_id(),
            vec![
                ConversationUnread { conversation_id: 1, unread_count: 0 },
                ConversationUnread { conversation_id: 2, unread_count: 4 },
            ],
        );
        runtime.handle_event(RealtimeEvent::UnreadSummary(summary));

        assert_eq!(runtime.total_unread(), 4);
        assert_eq!(runtime.conversation(2).unwrap().unread_count, 4);
    }

    #[test]
    fn own_messages_from_other_tabs_never_count_as_unread() {
        let mut runtime = runtime_with_rows(vec![row(1, 0)]);
        let me = runtime.user_id();

        let effects = runtime.handle_event(RealtimeEvent::MessageNew(MessageNew {
            conversation_id: 1,
            message: message(3, me, Utc::now()),
        }));

        assert!(effects.is_empty());
        assert_eq!(runtime.total_unread(), 0);
        assert_eq!(
            runtime.conversation(1).unwrap().latest_message.as_ref().map(|m| m.id),
            Some(3)
        );
    }

    #[test]
    fn unknown_conversations_trigger_reload() {
        let mut runtime = runtime_with_rows(Vec::new());
        let me = runtime.user_id();

        let created = RealtimeEvent::ConversationCreated(ConversationCreated {
            conversation_id: 9,
            conversation_type: ConversationType::Direct,
            title: None,
            participant_ids: vec![Uuid::new_v4(), me],
        });
        assert_eq!(runtime.handle_event(created), vec![Effect::ReloadConversations]);

        let new = RealtimeEvent::MessageNew(MessageNew {
            conversation_id: 9,
            message: message(1, Uuid::new_v4(), Utc::now()),
        });
        assert_eq!(runtime.handle_event(new), vec![Effect::ReloadConversations]);
    }

    #[test]
    fn summaries_for_other_users_are_ignored() {
        let mut runtime = runtime_with_rows(vec![row(1, 2)]);
        let summary = UnreadSummary::new(
            Uuid::new_v4(),
            vec![ConversationUnread { conversation_id: 1, unread_count: 9 }],
        );
        runtime.handle_event(RealtimeEvent::UnreadSummary(summary));
        assert_eq!(runtime.total_unread(), 2);
    }

    #[test]
    fn seen_watermarks_mark_own_messages_seen() {
        let mut runtime = runtime_with_rows(vec![row(1, 0)]);
        let me = runtime.user_id();
        let other = Uuid::new_v4();
        let at = Utc::now();
        runtime.open_conversation(1);
        runtime.messages_loaded(1, 1, vec![message(1, me, at), message(2, other, at)]);

        let mine = runtime.messages()[0].clone();
        assert_eq!(runtime.delivery_status(&mine), Some(DeliveryStatus::Sent));
        assert_eq!(runtime.delivery_status(&runtime.messages()[1].clone()), None);

        runtime.handle_event(RealtimeEvent::MessageSeen(MessageSeen {
            conversation_id: 1,
            user_id: other,
            last_read_at: at + Duration::seconds(1),
        }));
        // Older watermarks never move it back.
        runtime.handle_event(RealtimeEvent::MessageSeen(MessageSeen {
            conversation_id: 1,
            user_id: other,
            last_read_at: at - Duration::seconds(10),
        }));

        assert_eq!(runtime.delivery_status(&mine), Some(DeliveryStatus::Seen));
    }

    #[test]
    fn typing_and_deletions_apply_to_the_open_conversation() {
        let mut runtime = runtime_with_rows(vec![row(1, 0)]);
        let other = Uuid::new_v4();
        runtime.open_conversation(1);
        runtime.messages_loaded(1, 1, vec![message(1, other, Utc::now())]);

        let typing = Typing { conversation_id: 1, user_id: other };
        runtime.handle_event(RealtimeEvent::UserTyping(typing));
        assert_eq!(runtime.typing(), vec![other]);
        runtime.handle_event(RealtimeEvent::UserStoppedTyping(typing));
        assert!(runtime.typing().is_empty());

        runtime.handle_event(RealtimeEvent::MessageDeleted(MessageDeleted {
            conversation_id: 1,
            message_id: 1,
        }));
        assert!(runtime.messages().is_empty());
    }

    #[test]
    fn invalid_frames_are_dropped() {
        let mut runtime = runtime_with_rows(vec![row(1, 0)]);
        let frame = Frame {
            event: "messages:unreadSummary".to_string(),
            room: None,
            data: serde_json::json!({ "userId": runtime.user_id(), "totalUnread": -1, "conversations": [] }),
        };
        assert!(runtime.handle_frame(&frame).is_empty());
        assert_eq!(runtime.total_unread(), 0);
    }

    #[test]
    fn long_previews_are_cut() {
        let text = "x".repeat(200);
        assert_eq!(preview(&text).chars().count(), 81);
        assert_eq!(preview("short"), "short");
    }
}
