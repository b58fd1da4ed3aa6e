use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{BodyType, ConversationId, MessageId, UserId},
    error::ApiError,
};

/// Frames the client writes to the event channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Announced immediately after every (re)connect so the server can
    /// attribute presence to this session.
    Join {
        user_id: UserId,
    },
    DirectMessage {
        temp_id: MessageId,
        receiver_id: UserId,
        body: String,
        body_type: BodyType,
    },
    MarkAsRead {
        message_id: MessageId,
        sender_id: UserId,
    },
    Typing {
        receiver_id: UserId,
    },
    StopTyping {
        receiver_id: UserId,
    },
    ChatActive {
        conversation_id: Option<ConversationId>,
    },
}

/// Frames the server pushes over the event channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Correlated reply to a `direct_message` frame. Exactly one of
    /// `message`/`error` is set.
    Ack {
        temp_id: MessageId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<MessagePayload>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ApiError>,
    },
    NewMessage {
        message: MessagePayload,
    },
    MessageDelivered {
        message_id: MessageId,
        conversation_id: ConversationId,
    },
    MessageRead {
        message_id: MessageId,
        conversation_id: ConversationId,
    },
    MessageDeleted {
        message_id: MessageId,
        conversation_id: ConversationId,
    },
    UserTyping {
        user_id: UserId,
    },
    UserStopTyping {
        user_id: UserId,
    },
    UserOnline {
        user_id: UserId,
    },
    UserOffline {
        user_id: UserId,
    },
    Error(ApiError),
}

/// A server-confirmed message as it travels on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_username: Option<String>,
    pub body: String,
    pub body_type: BodyType,
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
}

/// One row of `GET /conversations`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSeed {
    pub conversation_id: ConversationId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_kind: Option<BodyType>,
    #[serde(default)]
    pub unread_count: u32,
}

/// One row of `GET /suggestions`: a candidate conversation the user has not
/// messaged yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestionSeed {
    pub user_id: UserId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_ref: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_use_snake_case_event_names() {
        let frame = ClientFrame::DirectMessage {
            temp_id: MessageId::new("temp_1"),
            receiver_id: UserId::new("u2"),
            body: "hi".into(),
            body_type: BodyType::Text,
        };
        let json = serde_json::to_value(&frame).expect("serialize");
        assert_eq!(json["type"], "direct_message");
        assert_eq!(json["payload"]["temp_id"], "temp_1");
    }

    #[test]
    fn ack_without_message_deserializes_as_failure_shape() {
        let json = r#"{"type":"ack","payload":{"temp_id":"temp_9","error":{"code":"rate_limited","message":"slow down"}}}"#;
        let event: ServerEvent = serde_json::from_str(json).expect("deserialize");
        match event {
            ServerEvent::Ack {
                temp_id,
                message,
                error,
            } => {
                assert_eq!(temp_id, MessageId::new("temp_9"));
                assert!(message.is_none());
                assert!(error.is_some());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
