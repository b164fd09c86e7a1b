//! The chat engine.
//!
//! One [`ChatEngine`] is shared by every socket. Each inbound event carries
//! the verified user id and the originating connection; handlers consult
//! the store, then fan results out through the [`PresenceRegistry`].
//!
//! Storage work happens in short synchronous sections under the database
//! lock. Events are built inside those sections and emitted after the lock
//! is released.

mod groups;
mod ingest;
mod reading;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use jive_shared::constants::DEFAULT_AVATAR;
use jive_shared::protocol::{
    ClientEvent, ConversationSnapshot, ConversationView, GroupView, MessageView, ServerEvent,
    UserStatusChange, UserSummary,
};
use jive_shared::{ConversationId, MessageBody, UserId};
use jive_store::{Conversation, Database, Message, StoreError, User};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::error::ChatError;
use crate::images::ImageStorage;
use crate::presence::{ConnectionHandle, PresenceRegistry};

use self::ingest::PendingSessions;

/// Tunables the engine reads on every request.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub page_size: u32,
    pub search_limit: u32,
    pub surrounding_range: u32,
    pub default_group_image: String,
}

impl From<&ServerConfig> for EngineSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            page_size: config.page_size,
            search_limit: config.search_limit,
            surrounding_range: config.surrounding_range,
            default_group_image: config.default_group_image.clone(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

pub struct ChatEngine {
    db: Arc<Mutex<Database>>,
    presence: PresenceRegistry,
    pending: PendingSessions,
    images: Arc<dyn ImageStorage>,
    settings: EngineSettings,
}

impl ChatEngine {
    pub fn new(
        db: Arc<Mutex<Database>>,
        images: Arc<dyn ImageStorage>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            db,
            presence: PresenceRegistry::new(),
            pending: PendingSessions::default(),
            images,
            settings,
        }
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    /// Look up a directory user. Used by the handshake.
    pub async fn find_user(&self, id: UserId) -> Result<User, ChatError> {
        Ok(self.db.lock().await.get_user(id)?)
    }

    /// Route one decoded client event to its handler.
    ///
    /// Message submissions report their own failures as `delivery-error`
    /// events, so they never return an error here.
    pub async fn dispatch(
        &self,
        user: UserId,
        origin: &ConnectionHandle,
        event: ClientEvent,
    ) -> Result<(), ChatError> {
        match event {
            ClientEvent::SendMessage(req) => {
                self.send_message(user, origin, req).await;
                Ok(())
            }
            ClientEvent::RequestMessages(req) => self.request_messages(user, origin, req).await,
            ClientEvent::ReadMessage(req) => {
                self.mark_as_read(user, req.conversation_id).await.map(|_| ())
            }
            ClientEvent::Typing(req) => self.typing(user, req).await,
            ClientEvent::SearchMessages(req) => self.search(user, origin, req).await,
            ClientEvent::FetchSurroundingMessages(req) => {
                self.surrounding(user, origin, req).await
            }
            ClientEvent::CreateGroup(req) => self.create_group(user, req).await.map(|_| ()),
            ClientEvent::EditGroup(req) => self.edit_group(user, req).await,
            ClientEvent::ExitGroup(req) => self.exit_group(user, req.group_id).await,
            ClientEvent::UpdateGroupImage(req) => self.update_group_image(user, req).await,
        }
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    /// Register a new connection and send it the initial state: the user
    /// directory, who is online, and one snapshot per conversation.
    pub async fn on_connect(&self, user: &User, handle: ConnectionHandle) -> Result<(), ChatError> {
        if let Some(previous) = self
            .presence
            .set_online(user.id, handle.clone(), user_summary(user))
            .await
        {
            tracing::info!(user = %user.id, replaced = %previous.id(), "connection replaced");
        }

        self.presence
            .broadcast(&ServerEvent::UserStatusChange(UserStatusChange {
                user_id: user.id,
                is_online: true,
                last_seen: None,
            }))
            .await;

        let online = self.presence.online_user_ids().await;
        let (all_users, snapshots) = {
            let db = self.db.lock().await;
            let all_users: Vec<UserSummary> = db.list_users()?.iter().map(user_summary).collect();
            let mut snapshots = Vec::new();
            for conversation in db.list_conversations_for_user(user.id)? {
                snapshots.push(conversation_snapshot(&db, &conversation, user.id)?);
            }
            (all_users, snapshots)
        };

        // Waits on a full queue; the writer task is already draining it.
        handle.deliver(ServerEvent::AllUsers(all_users)).await;
        handle.deliver(ServerEvent::OnlineUsers(online)).await;
        for snapshot in snapshots {
            if !handle.deliver(ServerEvent::ConversationSnapshot(snapshot)).await {
                tracing::debug!(user = %user.id, "connection closed during initial sync");
                break;
            }
        }
        Ok(())
    }

    /// Clear presence, record `last_seen` and tell everyone. Disconnects of
    /// connections that were already replaced are ignored.
    pub async fn on_disconnect(&self, user: UserId, connection: Uuid) {
        if !self.presence.set_offline(user, connection).await {
            tracing::debug!(user = %user, %connection, "stale connection closed");
            return;
        }

        let now = Utc::now();
        let recorded = self.db.lock().await.set_last_seen(user, now);
        if let Err(e) = recorded {
            tracing::error!(user = %user, error = %e, "failed to record last seen");
        }

        self.presence
            .broadcast(&ServerEvent::UserStatusChange(UserStatusChange {
                user_id: user,
                is_online: false,
                last_seen: Some(now),
            }))
            .await;
    }

    // ------------------------------------------------------------------
    // Fan-out
    // ------------------------------------------------------------------

    /// Send to the user's active connection. Offline users are skipped.
    async fn emit(&self, user: UserId, event: ServerEvent) -> bool {
        match self.presence.lookup(user).await {
            Some(handle) => handle.send(event),
            None => {
                tracing::debug!(user = %user, "recipient offline, skipping");
                false
            }
        }
    }

    async fn emit_all(&self, events: Vec<(UserId, ServerEvent)>) {
        for (user, event) in events {
            self.emit(user, event).await;
        }
    }
}

// ----------------------------------------------------------------------
// Lookups
// ----------------------------------------------------------------------

fn not_found(what: &str, id: impl std::fmt::Display, e: StoreError) -> ChatError {
    match e {
        StoreError::NotFound => ChatError::NotFound(format!("{what} {id}")),
        other => other.into(),
    }
}

fn load_conversation(db: &Database, id: ConversationId) -> Result<Conversation, ChatError> {
    db.get_conversation(id).map_err(|e| not_found("conversation", id, e))
}

/// The conversation, provided `user` takes part in it.
fn load_membership(db: &Database, id: ConversationId, user: UserId) -> Result<Conversation, ChatError> {
    let conversation = load_conversation(db, id)?;
    if !conversation.is_participant(user) {
        return Err(ChatError::Authorization(format!(
            "user {user} is not a participant of conversation {id}"
        )));
    }
    Ok(conversation)
}

// ----------------------------------------------------------------------
// Views
//
// Related records are fetched explicitly, in batches, by the functions
// below. Store lookups never load them as a side effect.
// ----------------------------------------------------------------------

fn user_summary(user: &User) -> UserSummary {
    UserSummary {
        id: user.id,
        name: user.name.clone(),
        avatar_url: if user.avatar_url.is_empty() {
            DEFAULT_AVATAR.to_string()
        } else {
            user.avatar_url.clone()
        },
        last_seen: user.last_seen,
        role: user.role,
    }
}

fn user_summaries(db: &Database, ids: &[UserId]) -> Result<HashMap<UserId, UserSummary>, ChatError> {
    Ok(db
        .get_users(ids)?
        .iter()
        .map(|user| (user.id, user_summary(user)))
        .collect())
}

fn conversation_view(db: &Database, conversation: &Conversation) -> Result<ConversationView, ChatError> {
    let participants = db
        .get_users(&conversation.participants)?
        .iter()
        .map(user_summary)
        .collect();

    Ok(ConversationView {
        id: conversation.id,
        is_group: conversation.is_group(),
        participants,
        group: conversation.group.as_ref().map(|group| GroupView {
            name: group.name.clone(),
            avatar_url: group.avatar_url.clone(),
            admin: group.admin,
            created_at: group.created_at,
        }),
        last_message_timestamp: conversation.last_message_at,
    })
}

/// `message` as seen by `viewer`.
fn message_view(
    message: &Message,
    viewer: UserId,
    senders: &HashMap<UserId, UserSummary>,
) -> MessageView {
    let mut view = MessageView {
        id: message.id,
        conversation_id: message.conversation_id,
        sender_id: message.sender,
        sender: senders.get(&message.sender).cloned(),
        kind: message.body.kind(),
        content: None,
        image_url: None,
        file_metadata: None,
        action: None,
        effect: None,
        timestamp: message.timestamp,
        is_read: message.is_read_by(viewer),
        client_temp_id: None,
    };

    match &message.body {
        MessageBody::Text { content } => view.content = Some(content.clone()),
        MessageBody::Image { image_url } => view.image_url = Some(image_url.clone()),
        MessageBody::File(file) => view.file_metadata = Some(file.clone()),
        MessageBody::System { action, effect } => {
            view.action = Some(action.clone());
            view.effect = Some(effect.clone());
        }
    }
    view
}

fn message_views(db: &Database, messages: &[Message], viewer: UserId) -> Result<Vec<MessageView>, ChatError> {
    let mut sender_ids: Vec<UserId> = messages.iter().map(|m| m.sender).collect();
    sender_ids.sort();
    sender_ids.dedup();
    let senders = user_summaries(db, &sender_ids)?;

    Ok(messages
        .iter()
        .map(|message| message_view(message, viewer, &senders))
        .collect())
}

fn conversation_snapshot(
    db: &Database,
    conversation: &Conversation,
    viewer: UserId,
) -> Result<ConversationSnapshot, ChatError> {
    let last_read = conversation.last_read_for(viewer);
    let unread_count = db.count_messages_after(conversation.id, last_read)?;
    let first_unread = db.first_message_after(conversation.id, last_read)?;
    let last_message = match db.latest_message(conversation.id)? {
        Some(message) => message_views(db, std::slice::from_ref(&message), viewer)?.pop(),
        None => None,
    };

    Ok(ConversationSnapshot {
        conversation: conversation_view(db, conversation)?,
        unread_count,
        first_unread_message_id: first_unread.map(|m| m.id),
        last_message,
    })
}


#[cfg(test)]
mod tests {
    use super::testing::{drain, Harness};
    use super::*;
    use jive_shared::protocol::SendMessage;
    use jive_shared::MessageKind;

    #[tokio::test]
    async fn test_connect_sends_directory_and_snapshots() {
        let h = Harness::new();
        let alice = h.user("alice").await;
        let bob = h.user("bob").await;
        let (_alice_handle, mut alice_rx) = h.connect(&alice).await;

        // Bob already has a conversation with Alice containing one unread.
        {
            let db = h.db.lock().await;
            let (conversation, _) = db
                .find_or_create_direct_conversation(alice.id, bob.id, Utc::now())
                .unwrap();
            db.append_message(&jive_store::NewMessage {
                conversation_id: conversation.id,
                sender: alice.id,
                body: MessageBody::Text { content: "hey".into() },
                timestamp: Utc::now(),
            })
            .unwrap();
        }

        let (handle, mut rx) = ConnectionHandle::channel();
        h.engine.on_connect(&bob, handle).await.unwrap();

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(e, ServerEvent::AllUsers(users) if users.len() == 2)));
        assert!(events.iter().any(|e| matches!(e, ServerEvent::OnlineUsers(ids) if ids.len() == 2)));
        let snapshot = events
            .iter()
            .find_map(|e| match e {
                ServerEvent::ConversationSnapshot(s) => Some(s),
                _ => None,
            })
            .expect("snapshot");
        assert_eq!(snapshot.unread_count, 1);
        assert!(snapshot.first_unread_message_id.is_some());
        assert_eq!(
            snapshot.last_message.as_ref().and_then(|m| m.content.as_deref()),
            Some("hey")
        );

        assert!(drain(&mut alice_rx)
            .iter()
            .any(|e| matches!(e, ServerEvent::UserStatusChange(s) if s.user_id == bob.id && s.is_online)));
    }

    #[tokio::test]
    async fn test_connect_delivers_every_snapshot_past_queue_capacity() {
        let h = Harness::new();
        let alice = h.user("alice").await;
        let conversations = jive_shared::constants::OUTBOUND_QUEUE_CAPACITY + 44;
        for i in 0..conversations {
            let peer = h.user(&format!("peer{i}")).await;
            h.db
                .lock()
                .await
                .find_or_create_direct_conversation(alice.id, peer.id, Utc::now())
                .unwrap();
        }

        let (handle, mut rx) = ConnectionHandle::channel();
        let reader = tokio::spawn(async move {
            let mut snapshots = 0;
            while snapshots < conversations {
                match rx.recv().await {
                    Some(ServerEvent::ConversationSnapshot(_)) => snapshots += 1,
                    Some(_) => {}
                    None => break,
                }
            }
            snapshots
        });

        h.engine.on_connect(&alice, handle).await.unwrap();
        let delivered = tokio::time::timeout(std::time::Duration::from_secs(10), reader)
            .await
            .expect("reader timed out")
            .unwrap();
        assert_eq!(delivered, conversations);
    }

    #[tokio::test]
    async fn test_disconnect_records_last_seen_and_broadcasts() {
        let h = Harness::new();
        let alice = h.user("alice").await;
        let bob = h.user("bob").await;
        let (alice_handle, _alice_rx) = h.connect(&alice).await;
        let (_bob_handle, mut bob_rx) = h.connect(&bob).await;

        // A stale id changes nothing.
        h.engine.on_disconnect(alice.id, Uuid::new_v4()).await;
        assert!(h.engine.presence().lookup(alice.id).await.is_some());
        assert!(drain(&mut bob_rx).is_empty());

        h.engine.on_disconnect(alice.id, alice_handle.id()).await;
        assert!(h.engine.presence().lookup(alice.id).await.is_none());
        assert!(h.db.lock().await.get_user(alice.id).unwrap().last_seen.is_some());

        let events = drain(&mut bob_rx);
        assert!(matches!(
            events.as_slice(),
            [ServerEvent::UserStatusChange(s)] if s.user_id == alice.id && !s.is_online && s.last_seen.is_some()
        ));
    }

    #[tokio::test]
    async fn test_dispatch_routes_send_message() {
        let h = Harness::new();
        let alice = h.user("alice").await;
        let bob = h.user("bob").await;
        let (alice_handle, mut alice_rx) = h.connect(&alice).await;

        let event = ClientEvent::SendMessage(SendMessage {
            conversation_id: None,
            target_user_id: Some(bob.id),
            kind: MessageKind::Text,
            content: Some("hello".into()),
            image_url: None,
            file_metadata: None,
            client_timestamp: Utc::now(),
            client_temp_id: Some("t1".into()),
        });
        h.engine.dispatch(alice.id, &alice_handle, event).await.unwrap();

        assert!(matches!(
            drain(&mut alice_rx).as_slice(),
            [ServerEvent::ConversationCreated(_)]
        ));
    }
}
