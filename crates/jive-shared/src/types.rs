use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::TEMP_CONVERSATION_PREFIX;
use crate::error::ProtocolError;

// User identity = directory UUID
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| ProtocolError::InvalidId {
                field: "userId",
                value: s.to_string(),
            })
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ConversationId(pub Uuid);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| ProtocolError::InvalidId {
                field: "conversationId",
                value: s.to_string(),
            })
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where an outgoing message should land, as named by the client.
///
/// Clients address a conversation that does not exist yet with a
/// placeholder id (`temp-chat-<target>`) or by naming the target user
/// directly. Everything else must be a real conversation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversationRef {
    Existing(ConversationId),
    Pending { target: UserId },
}

impl ConversationRef {
    pub fn resolve(
        conversation_id: Option<&str>,
        target: Option<UserId>,
    ) -> Result<Self, ProtocolError> {
        match conversation_id.map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) if is_temp_conversation_id(raw) => {
                let target = match target {
                    Some(target) => target,
                    None => UserId::parse(&raw[TEMP_CONVERSATION_PREFIX.len()..])?,
                };
                Ok(Self::Pending { target })
            }
            Some(raw) => Ok(Self::Existing(ConversationId::parse(raw)?)),
            None => target
                .map(|target| Self::Pending { target })
                .ok_or(ProtocolError::MissingField("conversationId or targetUserId")),
        }
    }

    /// Placeholder id a client uses for an unborn direct chat with `target`.
    pub fn temp_id_for(target: UserId) -> String {
        format!("{TEMP_CONVERSATION_PREFIX}{target}")
    }
}

pub fn is_temp_conversation_id(id: &str) -> bool {
    id.starts_with(TEMP_CONVERSATION_PREFIX)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }

    pub fn from_name(s: &str) -> Self {
        match s {
            "admin" => Role::Admin,
            _ => Role::User,
        }
    }
}
