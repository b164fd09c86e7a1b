use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::{FileMetadata, MessageKind, SystemEffect};
use crate::types::{ConversationId, MessageId, Role, UserId};

/// All events a client may send over its socket.
///
/// Encoded as JSON `{ "event": "<kebab-name>", "data": { ... } }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    SendMessage(SendMessage),
    RequestMessages(RequestMessages),
    ReadMessage(ReadMessage),
    Typing(TypingUpdate),
    SearchMessages(SearchMessages),
    FetchSurroundingMessages(FetchSurroundingMessages),
    CreateGroup(CreateGroup),
    EditGroup(EditGroup),
    ExitGroup(ExitGroup),
    UpdateGroupImage(UpdateGroupImage),
}

impl ClientEvent {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Event name, used for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::SendMessage(_) => "send-message",
            ClientEvent::RequestMessages(_) => "request-messages",
            ClientEvent::ReadMessage(_) => "read-message",
            ClientEvent::Typing(_) => "typing",
            ClientEvent::SearchMessages(_) => "search-messages",
            ClientEvent::FetchSurroundingMessages(_) => "fetch-surrounding-messages",
            ClientEvent::CreateGroup(_) => "create-group",
            ClientEvent::EditGroup(_) => "edit-group",
            ClientEvent::ExitGroup(_) => "exit-group",
            ClientEvent::UpdateGroupImage(_) => "update-group-image",
        }
    }
}

/// A chat message as submitted by its author.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    /// Real conversation id or a `temp-chat-<target>` placeholder
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub target_user_id: Option<UserId>,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub file_metadata: Option<FileMetadata>,
    pub client_timestamp: DateTime<Utc>,
    /// Id of the optimistic bubble on the client
    #[serde(default)]
    pub client_temp_id: Option<String>,
}

fn first_page() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMessages {
    pub conversation_id: ConversationId,
    #[serde(default = "first_page")]
    pub page: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadMessage {
    pub conversation_id: ConversationId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingUpdate {
    pub conversation_id: ConversationId,
    pub typing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchMessages {
    pub search_term: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchSurroundingMessages {
    pub message_id: MessageId,
    #[serde(default)]
    pub range: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroup {
    pub name: String,
    #[serde(default)]
    pub participant_ids: Vec<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditGroup {
    pub group_id: ConversationId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub participant_ids: Option<Vec<UserId>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitGroup {
    pub group_id: ConversationId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateGroupImage {
    pub group_id: ConversationId,
    pub url: String,
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

/// All events the server pushes to a connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    ConversationCreated(ConversationCreated),
    NewMessage(NewMessage),
    RemovedFromGroup(RemovedFromGroup),
    GroupUpdated(GroupUpdated),
    GroupCreated(GroupCreated),
    Typing(TypingNotice),
    MessagesResponse(MessagesResponse),
    SearchResults(SearchResults),
    SurroundingMessages(SurroundingMessages),
    DeliveryError(DeliveryError),
    Error(ErrorNotice),
    UserStatusChange(UserStatusChange),
    AllUsers(Vec<UserSummary>),
    OnlineUsers(Vec<UserId>),
    ConversationSnapshot(ConversationSnapshot),
}

impl ServerEvent {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Public profile of a directory user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: UserId,
    pub name: String,
    pub avatar_url: String,
    pub last_seen: Option<DateTime<Utc>>,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupView {
    pub name: String,
    pub avatar_url: String,
    pub admin: UserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationView {
    pub id: ConversationId,
    pub is_group: bool,
    pub participants: Vec<UserSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupView>,
    pub last_message_timestamp: DateTime<Utc>,
}

/// A message as seen by one particular recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<UserSummary>,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_metadata: Option<FileMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<SystemEffect>,
    pub timestamp: DateTime<Utc>,
    pub is_read: bool,
    /// Only present on the author's own copy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_temp_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationCreated {
    pub conversation: ConversationView,
    pub messages: Vec<MessageView>,
    /// The recipient authored the first message and should select this chat
    pub set_active: bool,
    /// Placeholder id the recipient's client should replace with the real id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaces_temp_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub message: MessageView,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovedFromGroup {
    pub conversation_id: ConversationId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupUpdated {
    pub conversation: ConversationView,
    /// Full backlog, sent only to newly added members
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<MessageView>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupCreated {
    pub conversation: ConversationView,
    pub messages: Vec<MessageView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingNotice {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub typing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub total_count: u64,
    pub total_pages: u64,
    pub current_page: u32,
    pub first_unread_message_id: Option<MessageId>,
    pub has_next_page: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesResponse {
    pub conversation_id: ConversationId,
    /// History page, newest first
    pub messages: Vec<MessageView>,
    /// Messages after the reader's marker, oldest first (first page only)
    pub unread_messages: Vec<MessageView>,
    pub page_info: PageInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    #[serde(flatten)]
    pub message: MessageView,
    /// History page (at the configured page size) that contains this message
    pub page: u64,
    pub count_after: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResults {
    pub messages: Vec<SearchHit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurroundingMessages {
    pub message_id: MessageId,
    pub messages: Vec<MessageView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryError {
    pub client_temp_id: Option<String>,
    pub conversation_id: Option<String>,
    pub details: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorNotice {
    pub message: String,
    pub details: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStatusChange {
    pub user_id: UserId,
    pub is_online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSnapshot {
    pub conversation: ConversationView,
    pub unread_count: u64,
    pub first_unread_message_id: Option<MessageId>,
    pub last_message: Option<MessageView>,
}

/// Page number holding a message that has `count_after` newer messages.
pub fn page_for_position(count_after: u64, page_size: u32) -> u64 {
    let page_size = u64::from(page_size.max(1));
    (count_after + 1).div_ceil(page_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_message_decodes_from_client_json() {
        let target = UserId::new();
        let raw = format!(
            r#"{{"event":"send-message","data":{{"targetUserId":"{target}","content":"hi","clientTimestamp":"2024-05-01T10:00:00Z","clientTempId":"x1"}}}}"#
        );

        match ClientEvent::from_json(&raw).unwrap() {
            ClientEvent::SendMessage(msg) => {
                assert_eq!(msg.target_user_id, Some(target));
                assert_eq!(msg.kind, MessageKind::Text);
                assert_eq!(msg.content.as_deref(), Some("hi"));
                assert_eq!(msg.client_temp_id.as_deref(), Some("x1"));
                assert!(msg.conversation_id.is_none());
            }
            other => panic!("unexpected event: {}", other.name()),
        }
    }

    #[test]
    fn test_request_messages_defaults_to_first_page() {
        let id = ConversationId::new();
        let raw = format!(r#"{{"event":"request-messages","data":{{"conversationId":"{id}"}}}}"#);
        match ClientEvent::from_json(&raw).unwrap() {
            ClientEvent::RequestMessages(req) => assert_eq!(req.page, 1),
            other => panic!("unexpected event: {}", other.name()),
        }
    }

    #[test]
    fn test_unknown_event_is_rejected() {
        assert!(ClientEvent::from_json(r#"{"event":"launch-rockets","data":{}}"#).is_err());
    }

    #[test]
    fn test_server_event_uses_kebab_names() {
        let event = ServerEvent::DeliveryError(DeliveryError {
            client_temp_id: Some("x1".into()),
            conversation_id: None,
            details: "boom".into(),
        });
        let json: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(json["event"], "delivery-error");
        assert_eq!(json["data"]["clientTempId"], "x1");
    }

    #[test]
    fn test_page_for_position() {
        assert_eq!(page_for_position(0, 20), 1);
        assert_eq!(page_for_position(19, 20), 1);
        assert_eq!(page_for_position(20, 20), 2);
        assert_eq!(page_for_position(45, 20), 3);
    }
}
