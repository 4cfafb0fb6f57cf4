//! Realtime event vocabulary shared by the application server, the relay and
//! client sessions.
//!
//! On the wire every event travels as a [`Frame`]:
//! `{"event": "<name>", "room": "<room>"?, "data": <payload>}`.
//! Typed events are decoded from frames with [`RealtimeEvent::from_frame`],
//! which rejects unknown names, malformed payloads and inconsistent summaries.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{ConversationType, MessageView, UnreadSummary};

pub const MESSAGE_NEW: &str = "message:new";
pub const MESSAGE_SEEN: &str = "message:seen";
pub const MESSAGE_DELETED: &str = "message:deleted";
pub const UNREAD_SUMMARY: &str = "messages:unreadSummary";
pub const CONVERSATION_CREATED: &str = "conversation:created";
pub const USER_JOIN: &str = "user:join";
pub const USER_TYPING: &str = "user:typing";
pub const USER_STOPPED_TYPING: &str = "user:stoppedTyping";

const KNOWN_EVENTS: [&str; 8] = [
    MESSAGE_NEW,
    MESSAGE_SEEN,
    MESSAGE_DELETED,
    UNREAD_SUMMARY,
    CONVERSATION_CREATED,
    USER_JOIN,
    USER_TYPING,
    USER_STOPPED_TYPING,
];

const USER_ROOM_PREFIX: &str = "user:";

#[derive(Debug, Error)]
pub enum EventError {
    #[error("malformed frame: {0}")]
    Frame(#[source] serde_json::Error),
    #[error("unknown event: {0}")]
    UnknownEvent(String),
    #[error("malformed payload for {event}: {source}")]
    Payload {
        event: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid {event}: {reason}")]
    Invalid { event: &'static str, reason: String },
}

/// Addressing unit on the relay. User rooms are `user:<uuid>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Room(String);

impl Room {
    pub fn user(user_id: Uuid) -> Self {
        Self(format!("{}{}", USER_ROOM_PREFIX, user_id))
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The user id behind a `user:<uuid>` room.
    pub fn user_id(&self) -> Option<Uuid> {
        self.0
            .strip_prefix(USER_ROOM_PREFIX)
            .and_then(|id| Uuid::parse_str(id).ok())
    }
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Untyped envelope. The relay only ever looks at `event` and `room`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    pub fn parse(text: &str) -> Result<Self, EventError> {
        serde_json::from_str(text).map_err(EventError::Frame)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn join(user_id: Uuid) -> Self {
        Self {
            event: USER_JOIN.to_string(),
            room: None,
            data: json!({ "userId": user_id }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageNew {
    pub conversation_id: i64,
    pub message: MessageView,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSeen {
    pub conversation_id: i64,
    pub user_id: Uuid,
    pub last_read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationCreated {
    pub conversation_id: i64,
    pub conversation_type: ConversationType,
    pub title: Option<String>,
    pub participant_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserJoin {
    pub user_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Typing {
    pub conversation_id: i64,
    pub user_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeleted {
    pub conversation_id: i64,
    pub message_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum RealtimeEvent {
    #[serde(rename = "message:new")]
    MessageNew(MessageNew),
    #[serde(rename = "message:seen")]
    MessageSeen(MessageSeen),
    #[serde(rename = "message:deleted")]
    MessageDeleted(MessageDeleted),
    #[serde(rename = "messages:unreadSummary")]
    UnreadSummary(UnreadSummary),
    #[serde(rename = "conversation:created")]
    ConversationCreated(ConversationCreated),
    #[serde(rename = "user:join")]
    UserJoin(UserJoin),
    #[serde(rename = "user:typing")]
    UserTyping(Typing),
    #[serde(rename = "user:stoppedTyping")]
    UserStoppedTyping(Typing),
}

impl RealtimeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MessageNew(_) => MESSAGE_NEW,
            Self::MessageSeen(_) => MESSAGE_SEEN,
            Self::MessageDeleted(_) => MESSAGE_DELETED,
            Self::UnreadSummary(_) => UNREAD_SUMMARY,
            Self::ConversationCreated(_) => CONVERSATION_CREATED,
            Self::UserJoin(_) => USER_JOIN,
            Self::UserTyping(_) => USER_TYPING,
            Self::UserStoppedTyping(_) => USER_STOPPED_TYPING,
        }
    }

    pub fn to_frame(&self, room: Option<&Room>) -> Result<Frame, serde_json::Error> {
        let mut tagged = serde_json::to_value(self)?;
        let data = tagged
            .get_mut("data")
            .map(Value::take)
            .unwrap_or(Value::Null);
        Ok(Frame {
            event: self.name().to_string(),
            room: room.map(|r| r.as_str().to_string()),
            data,
        })
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, EventError> {
        if !KNOWN_EVENTS.contains(&frame.event.as_str()) {
            return Err(EventError::UnknownEvent(frame.event.clone()));
        }
        let tagged = json!({ "event": frame.event, "data": frame.data });
        let event: Self = serde_json::from_value(tagged).map_err(|source| EventError::Payload {
            event: frame.event.clone(),
            source,
        })?;
        event.validate()?;
        Ok(event)
    }

    pub fn validate(&self) -> Result<(), EventError> {
        match self {
            Self::UnreadSummary(summary) if !summary.is_consistent() => Err(EventError::Invalid {
                event: UNREAD_SUMMARY,
                reason: format!(
                    "totalUnread {} does not match its {} entries",
                    summary.total_unread,
                    summary.conversations.len()
                ),
            }),
            Self::ConversationCreated(created) if created.participant_ids.is_empty() => {
                Err(EventError::Invalid {
                    event: CONVERSATION_CREATED,
                    reason: "participantIds is empty".to_string(),
                })
            }
            Self::MessageNew(new) if new.message.content.trim().is_empty() => {
                Err(EventError::Invalid {
                    event: MESSAGE_NEW,
                    reason: "message content is empty".to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ConversationUnread;

    #[test]
    fn user_rooms_round_trip_their_id() {
        let id = Uuid::new_v4();
        let room = Room::user(id);
        assert_eq!(room.as_str(), format!("user:{}", id));
        assert_eq!(room.user_id(), Some(id));
        assert_eq!(Room::named("lobby").user_id(), None);
    }

    #[test]
    fn frames_use_the_event_room_data_envelope() {
        let user_id = Uuid::new_v4();
        let event = RealtimeEvent::MessageDeleted(MessageDeleted {
            conversation_id: 42,
            message_id: 7,
        });

        let frame = event.to_frame(Some(&Room::user(user_id))).unwrap();
        let json = serde_json::to_value(&frame).unwrap();

        assert_eq!(json["event"], "message:deleted");
        assert_eq!(json["room"], format!("user:{}", user_id));
        assert_eq!(json["data"]["conversationId"], 42);
        assert_eq!(json["data"]["messageId"], 7);
    }

    #[test]
    fn join_frames_carry_no_room() {
        let text = Frame::join(Uuid::nil()).to_text().unwrap();
        assert!(!text.contains("\"room\""));
        assert!(text.contains("user:join"));
    }

    #[test]
    fn unknown_events_are_rejected() {
        let frame = Frame::parse(r#"{"event":"message:edited","data":{}}"#).unwrap();
        assert!(matches!(
            RealtimeEvent::from_frame(&frame),
            Err(EventError::UnknownEvent(name)) if name == "message:edited"
        ));
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        let frame = Frame::parse(r#"{"event":"message:seen","data":{"conversationId":"x"}}"#)
            .unwrap();
        assert!(matches!(
            RealtimeEvent::from_frame(&frame),
            Err(EventError::Payload { .. })
        ));
    }

    #[test]
    fn inconsistent_summaries_are_rejected() {
        let frame = Frame {
            event: UNREAD_SUMMARY.to_string(),
            room: None,
            data: json!({
                "userId": Uuid::new_v4(),
                "totalUnread": 3,
                "conversations": [{ "conversationId": 1, "unreadCount": 1 }]
            }),
        };
        assert!(matches!(
            RealtimeEvent::from_frame(&frame),
            Err(EventError::Invalid { .. })
        ));
    }

    #[test]
    fn summaries_decode_from_frames() {
        let summary = UnreadSummary::new(
            Uuid::new_v4(),
            vec![ConversationUnread { conversation_id: 5, unread_count: 2 }],
        );
        let frame = RealtimeEvent::UnreadSummary(summary.clone())
            .to_frame(None)
            .unwrap();

        let decoded = RealtimeEvent::from_frame(&frame).unwrap();

        assert_eq!(decoded, RealtimeEvent::UnreadSummary(summary));
    }
}
