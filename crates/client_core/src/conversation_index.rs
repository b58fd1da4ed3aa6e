use std::collections::HashMap;

use chrono::{DateTime, Utc};
use shared::{
    domain::{BodyType, ConversationId, UserId},
    protocol::{ConversationSeed, SuggestionSeed},
};

use crate::message_store::Message;

/// Chat-list row derived from store and channel events. Never deleted
/// in-session; every relevant event re-derives its mutable fields.
#[derive(Debug, Clone)]
pub struct ConversationSummary {
    pub id: ConversationId,
    /// Counterpart id until a real display name is learned from a seed or a
    /// wire `sender_username`.
    pub display_name: String,
    pub avatar_ref: Option<String>,
    pub last_message_preview: Option<String>,
    pub last_message_timestamp: Option<DateTime<Utc>>,
    pub last_message_kind: Option<BodyType>,
    pub unread_count: u32,
    pub is_typing: bool,
    pub is_online: bool,
}

impl ConversationSummary {
    fn placeholder(id: ConversationId) -> Self {
        let display_name = id.as_str().to_string();
        Self {
            id,
            display_name,
            avatar_ref: None,
            last_message_preview: None,
            last_message_timestamp: None,
            last_message_kind: None,
            unread_count: 0,
            is_typing: false,
            is_online: false,
        }
    }
}

/// Candidate conversation sourced independently of the chat list; promoted
/// implicitly once a message is exchanged.
#[derive(Debug, Clone)]
pub struct SuggestionEntry {
    pub user_id: UserId,
    pub display_name: String,
    pub avatar_ref: Option<String>,
    pub is_online: bool,
}

/// Projection of the chat list: summaries ordered by recency, presence and
/// typing state, and the suggestion pool.
#[derive(Debug, Default)]
pub struct ConversationIndex {
    summaries: HashMap<ConversationId, ConversationSummary>,
    /// Most recently active first; message-less conversations at the back.
    order: Vec<ConversationId>,
    suggestions: Vec<SuggestionEntry>,
}

impl ConversationIndex {
    /// Initial load from `GET /conversations`; replaces previous seeds but
    /// keeps ephemeral presence/typing state for ids that persist.
    pub fn apply_seeds(&mut self, seeds: Vec<ConversationSeed>) {
        for seed in seeds {
            let entry = self
                .summaries
                .entry(seed.conversation_id.clone())
                .or_insert_with(|| ConversationSummary::placeholder(seed.conversation_id.clone()));
            entry.display_name = seed.display_name;
            entry.avatar_ref = seed.avatar_ref;
            entry.last_message_preview = seed.last_message_preview;
            entry.last_message_timestamp = seed.last_message_timestamp;
            entry.last_message_kind = seed.last_message_kind;
            entry.unread_count = seed.unread_count;
            if !self.order.contains(&entry.id) {
                self.order.push(entry.id.clone());
            }
        }
        self.full_resort();
    }

    pub fn apply_suggestions(&mut self, seeds: Vec<SuggestionSeed>) {
        self.suggestions = seeds
            .into_iter()
            .map(|seed| {
                let is_online = self
                    .suggestions
                    .iter()
                    .find(|s| s.user_id == seed.user_id)
                    .map(|s| s.is_online)
                    .unwrap_or(false);
                SuggestionEntry {
                    user_id: seed.user_id,
                    display_name: seed.display_name,
                    avatar_ref: seed.avatar_ref,
                    is_online,
                }
            })
            .collect();
    }

    /// Recompute the affected summary for a message that was appended or
    /// collapsed in the store. Unread count grows only for incoming messages
    /// in a non-active conversation.
    pub fn on_message_event(&mut self, message: &Message, is_active: bool, me: &UserId) {
        let id = message.conversation_id.clone();
        let entry = self
            .summaries
            .entry(id.clone())
            .or_insert_with(|| ConversationSummary::placeholder(id.clone()));

        entry.last_message_preview = Some(message.body.clone());
        entry.last_message_timestamp = Some(message.created_at);
        entry.last_message_kind = Some(message.body_type);

        let incoming = message.sender_id != *me;
        if is_active {
            entry.unread_count = 0;
        } else if incoming && !message.is_read {
            entry.unread_count += 1;
        }

        self.move_to_front(&id);
    }

    /// Re-derive preview fields after a tombstone; `last` is the
    /// conversation's current last message, if any.
    pub fn on_message_deleted(&mut self, conversation_id: &ConversationId, last: Option<&Message>) {
        let Some(entry) = self.summaries.get_mut(conversation_id) else {
            return;
        };
        entry.last_message_preview = last.map(|m| m.body.clone());
        entry.last_message_timestamp = last.map(|m| m.created_at);
        entry.last_message_kind = last.map(|m| m.body_type);
    }

    /// Replace presence state from a full snapshot: listed users are online,
    /// everyone else is not.
    pub fn apply_presence_snapshot(&mut self, online: &[UserId]) {
        for summary in self.summaries.values_mut() {
            summary.is_online = online.contains(&summary.id);
        }
        for suggestion in &mut self.suggestions {
            suggestion.is_online = online.contains(&suggestion.user_id);
        }
    }

    pub fn on_presence_event(&mut self, user_id: &UserId, online: bool) {
        if let Some(entry) = self.summaries.get_mut(user_id) {
            entry.is_online = online;
        }
        for suggestion in &mut self.suggestions {
            if suggestion.user_id == *user_id {
                suggestion.is_online = online;
            }
        }
    }

    /// Typing state changes only on explicit events; there is no local
    /// expiry for incoming typing indicators.
    pub fn on_typing_event(&mut self, user_id: &UserId, typing: bool) {
        if let Some(entry) = self.summaries.get_mut(user_id) {
            entry.is_typing = typing;
        }
    }

    pub fn clear_unread(&mut self, conversation_id: &ConversationId) {
        if let Some(entry) = self.summaries.get_mut(conversation_id) {
            entry.unread_count = 0;
        }
    }

    /// Upgrade a placeholder display name learned from the wire. Returns
    /// whether anything changed.
    pub fn resolve_display_name(&mut self, user_id: &UserId, name: &str) -> bool {
        let mut changed = false;
        if let Some(entry) = self.summaries.get_mut(user_id) {
            if entry.display_name != name {
                entry.display_name = name.to_string();
                changed = true;
            }
        }
        changed
    }

    /// Chat list in display order.
    pub fn conversations(&self) -> Vec<ConversationSummary> {
        self.order
            .iter()
            .filter_map(|id| self.summaries.get(id))
            .cloned()
            .collect()
    }

    pub fn suggestions(&self) -> Vec<SuggestionEntry> {
        self.suggestions.clone()
    }

    pub fn summary(&self, id: &ConversationId) -> Option<&ConversationSummary> {
        self.summaries.get(id)
    }

    /// Incremental resort: the touched conversation moves to the front.
    fn move_to_front(&mut self, id: &ConversationId) {
        if let Some(position) = self.order.iter().position(|o| o == id) {
            self.order.remove(position);
        }
        self.order.insert(0, id.clone());
    }

    /// Full resort fallback used after bulk seed loads.
    fn full_resort(&mut self) {
        let summaries = &self.summaries;
        self.order.sort_by(|a, b| {
            let ts_a = summaries.get(a).and_then(|s| s.last_message_timestamp);
            let ts_b = summaries.get(b).and_then(|s| s.last_message_timestamp);
            match (ts_a, ts_b) {
                (Some(a), Some(b)) => b.cmp(&a),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            }
        });
    }
}
