use std::collections::HashMap;

use chrono::{DateTime, Utc};
use shared::{
    domain::{BodyType, ConversationId, MessageId, UserId},
    protocol::MessagePayload,
};

pub const DELETED_BODY_PLACEHOLDER: &str = "message deleted";

/// Monotonic delivery lifecycle of a message.
///
/// `Failed` shares rank 0 with `Sending` and is reachable only from it; every
/// other transition must strictly increase the rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryStatus {
    fn rank(self) -> u8 {
        match self {
            DeliveryStatus::Sending | DeliveryStatus::Failed => 0,
            DeliveryStatus::Sent => 1,
            DeliveryStatus::Delivered => 2,
            DeliveryStatus::Read => 3,
        }
    }

    pub fn can_advance_to(self, next: DeliveryStatus) -> bool {
        match next {
            DeliveryStatus::Failed => self == DeliveryStatus::Sending,
            _ => next.rank() > self.rank(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub body: String,
    pub body_type: BodyType,
    pub created_at: DateTime<Utc>,
    pub delivery_status: DeliveryStatus,
    pub is_read: bool,
    pub is_deleted: bool,
}

impl Message {
    /// Map a wire payload into a stored record from `me`'s point of view.
    ///
    /// The conversation key is always the counterpart's identity; status is
    /// derived from direction and the server-side read flag.
    pub fn from_payload(payload: &MessagePayload, me: &UserId) -> Self {
        let outgoing = payload.sender_id == *me;
        let conversation_id = if outgoing {
            payload.receiver_id.clone()
        } else {
            payload.sender_id.clone()
        };
        let delivery_status = if payload.is_read {
            DeliveryStatus::Read
        } else if outgoing {
            DeliveryStatus::Sent
        } else {
            DeliveryStatus::Delivered
        };
        let is_deleted = payload.body_type == BodyType::Deleted;
        Self {
            id: payload.message_id.clone(),
            conversation_id,
            sender_id: payload.sender_id.clone(),
            receiver_id: payload.receiver_id.clone(),
            body: if is_deleted {
                DELETED_BODY_PLACEHOLDER.to_string()
            } else {
                payload.body.clone()
            },
            body_type: payload.body_type,
            created_at: payload.sent_at,
            delivery_status,
            is_read: payload.is_read,
            is_deleted,
        }
    }

    fn advance_status(&mut self, next: DeliveryStatus) -> bool {
        if !self.delivery_status.can_advance_to(next) {
            return false;
        }
        self.delivery_status = next;
        self.is_read = next == DeliveryStatus::Read;
        true
    }
}

/// What `apply_incoming` did with a live message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingApplied {
    Appended,
    /// A provisional record with identical body was collapsed in place
    /// (self-echo of an optimistic send).
    ReplacedProvisional,
    /// The confirmed id was already present; nothing changed.
    AlreadyKnown,
}

/// Per-conversation ordered message sequences plus the reconciliation and
/// status-transition rules. Pure and synchronous; the controller serializes
/// all access.
#[derive(Debug, Default)]
pub struct MessageStore {
    conversations: HashMap<ConversationId, Vec<Message>>,
}

impl MessageStore {
    pub fn conversation(&self, id: &ConversationId) -> &[Message] {
        self.conversations.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn last_message(&self, id: &ConversationId) -> Option<&Message> {
        self.conversations.get(id).and_then(|list| list.last())
    }

    /// Replace (not merge) the stored sequence for one conversation with a
    /// page from the history API.
    pub fn load_history(&mut self, id: ConversationId, page: Vec<Message>) {
        self.conversations.insert(id, page);
    }

    /// Insert a provisional outgoing record with status `Sending` and return
    /// its minted id.
    pub fn append_outgoing(
        &mut self,
        sender: &UserId,
        receiver: &UserId,
        body: impl Into<String>,
        body_type: BodyType,
    ) -> MessageId {
        let id = MessageId::provisional();
        let message = Message {
            id: id.clone(),
            conversation_id: receiver.clone(),
            sender_id: sender.clone(),
            receiver_id: receiver.clone(),
            body: body.into(),
            body_type,
            created_at: Utc::now(),
            delivery_status: DeliveryStatus::Sending,
            is_read: false,
            is_deleted: false,
        };
        self.conversations
            .entry(receiver.clone())
            .or_default()
            .push(message);
        id
    }

    /// Resolve an optimistic send. `Some(confirmed)` replaces the provisional
    /// record in place (position preserved, status at least `Sent`); `None`
    /// transitions it to `Failed` without removing it.
    pub fn reconcile_outgoing_ack(
        &mut self,
        conversation_id: &ConversationId,
        provisional_id: &MessageId,
        confirmed: Option<&MessagePayload>,
        me: &UserId,
    ) -> bool {
        let Some(list) = self.conversations.get_mut(conversation_id) else {
            return false;
        };

        match confirmed {
            Some(payload) => {
                if let Some(existing) = list.iter_mut().find(|m| m.id == *provisional_id) {
                    let mut replacement = Message::from_payload(payload, me);
                    // A status event may already have advanced the record.
                    if replacement
                        .delivery_status
                        .can_advance_to(existing.delivery_status)
                    {
                        replacement.delivery_status = existing.delivery_status;
                        replacement.is_read = existing.is_read;
                    }
                    *existing = replacement;
                    true
                } else if let Some(existing) =
                    list.iter_mut().find(|m| m.id == payload.message_id)
                {
                    // The channel echo already collapsed the provisional
                    // record; the ack only needs to advance the status.
                    existing.advance_status(DeliveryStatus::Sent);
                    true
                } else {
                    false
                }
            }
            None => list
                .iter_mut()
                .find(|m| m.id == *provisional_id)
                .map(|m| m.advance_status(DeliveryStatus::Failed))
                .unwrap_or(false),
        }
    }

    /// Apply a live message with the dedup rule: a record with the same
    /// confirmed id wins outright; a provisional record in the same
    /// conversation with identical body is collapsed in place; anything else
    /// appends.
    pub fn apply_incoming(&mut self, message: Message) -> IncomingApplied {
        let list = self
            .conversations
            .entry(message.conversation_id.clone())
            .or_default();

        if list.iter().any(|m| m.id == message.id) {
            return IncomingApplied::AlreadyKnown;
        }

        let echo_slot = list
            .iter()
            .position(|m| m.id.is_provisional() && m.body == message.body && !m.is_deleted);
        if let Some(slot) = echo_slot {
            let mut replacement = message;
            if replacement
                .delivery_status
                .can_advance_to(list[slot].delivery_status)
            {
                replacement.delivery_status = list[slot].delivery_status;
                replacement.is_read = list[slot].is_read;
            }
            list[slot] = replacement;
            return IncomingApplied::ReplacedProvisional;
        }

        list.push(message);
        IncomingApplied::Appended
    }

    /// Monotonic status transition; regressive updates are dropped.
    pub fn apply_status_update(
        &mut self,
        message_id: &MessageId,
        conversation_id: &ConversationId,
        status: DeliveryStatus,
    ) -> bool {
        self.conversations
            .get_mut(conversation_id)
            .and_then(|list| list.iter_mut().find(|m| m.id == *message_id))
            .map(|m| m.advance_status(status))
            .unwrap_or(false)
    }

    /// Tombstone a message in place; length and ordering are untouched.
    pub fn apply_deleted(&mut self, message_id: &MessageId, conversation_id: &ConversationId) -> bool {
        let Some(message) = self
            .conversations
            .get_mut(conversation_id)
            .and_then(|list| list.iter_mut().find(|m| m.id == *message_id))
        else {
            return false;
        };
        if message.is_deleted {
            return false;
        }
        message.is_deleted = true;
        message.body = DELETED_BODY_PLACEHOLDER.to_string();
        message.body_type = BodyType::Deleted;
        true
    }

    /// Flip every message addressed to `reader` to `Read` and return one
    /// `(message_id, sender_id)` receipt per affected message.
    pub fn mark_conversation_read(
        &mut self,
        conversation_id: &ConversationId,
        reader: &UserId,
    ) -> Vec<(MessageId, UserId)> {
        let Some(list) = self.conversations.get_mut(conversation_id) else {
            return Vec::new();
        };
        let mut receipts = Vec::new();
        for message in list.iter_mut() {
            if message.receiver_id == *reader && message.advance_status(DeliveryStatus::Read) {
                receipts.push((message.id.clone(), message.sender_id.clone()));
            }
        }
        receipts
    }
}
