//! Domain model structs persisted in the chat database.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use jive_shared::{ConversationId, MessageBody, MessageId, Role, UserId};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A directory user. Owned by the account system; the chat engine only
/// reads it and updates `last_seen`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub avatar_url: String,
    pub last_seen: Option<DateTime<Utc>>,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// Group metadata. Present iff the conversation is a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    pub name: String,
    pub avatar_url: String,
    pub admin: UserId,
    pub created_at: DateTime<Utc>,
}

/// A direct or group chat.
///
/// Direct conversations always have exactly two distinct participants.
/// A group with no participants is deleted rather than stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    /// Ordered; membership is unique.
    pub participants: Vec<UserId>,
    pub group: Option<GroupInfo>,
    pub last_message_at: DateTime<Utc>,
    /// How far each participant has read.
    pub last_read: HashMap<UserId, DateTime<Utc>>,
}

impl Conversation {
    pub fn is_group(&self) -> bool {
        self.group.is_some()
    }

    pub fn is_participant(&self, user: UserId) -> bool {
        self.participants.contains(&user)
    }

    pub fn is_admin(&self, user: UserId) -> bool {
        self.group.as_ref().is_some_and(|g| g.admin == user)
    }

    /// The participant's read marker, or the epoch if they never read.
    pub fn last_read_for(&self, user: UserId) -> DateTime<Utc> {
        self.last_read
            .get(&user)
            .copied()
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A message about to be appended to a conversation's log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender: UserId,
    pub body: MessageBody,
    pub timestamp: DateTime<Utc>,
}

/// A persisted message. Immutable apart from `read_by` growth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: UserId,
    pub body: MessageBody,
    pub timestamp: DateTime<Utc>,
    /// Users who have seen the message. Always includes the sender.
    pub read_by: Vec<UserId>,
}

impl Message {
    pub fn is_read_by(&self, user: UserId) -> bool {
        self.read_by.contains(&user)
    }
}

/// One page of history, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub total_count: u64,
    pub total_pages: u64,
    pub current_page: u32,
}

// ---------------------------------------------------------------------------
// Image removal
// ---------------------------------------------------------------------------

/// An image URL queued for deletion by the storage cleanup job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRemoval {
    pub id: Uuid,
    pub image_url: String,
    pub reference_id: String,
    pub marked_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Column helpers
// ---------------------------------------------------------------------------

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_default()
}

/// Truncate to the millisecond precision the database stores.
pub(crate) fn normalize(ts: DateTime<Utc>) -> DateTime<Utc> {
    from_millis(to_millis(ts))
}

pub(crate) fn conversion_err<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

pub(crate) fn parse_uuid(idx: usize, raw: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| conversion_err(idx, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_read_defaults_to_epoch() {
        let conversation = Conversation {
            id: ConversationId::new(),
            participants: vec![UserId::new(), UserId::new()],
            group: None,
            last_message_at: Utc::now(),
            last_read: HashMap::new(),
        };
        assert_eq!(
            conversation.last_read_for(conversation.participants[0]),
            DateTime::<Utc>::default()
        );
        assert!(!conversation.is_group());
        assert!(!conversation.is_admin(conversation.participants[0]));
    }

    #[test]
    fn test_normalize_truncates_to_millis() {
        let ts = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        let normalized = normalize(ts);
        assert_eq!(normalized.timestamp_subsec_nanos(), 123_000_000);
        assert_eq!(to_millis(normalized), to_millis(ts));
    }
}
