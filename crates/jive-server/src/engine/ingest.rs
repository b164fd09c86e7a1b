//! Message ingestion.
//!
//! The first message to an unborn direct conversation has to create it.
//! Several messages can arrive for the same pair before that row exists, so
//! ingestion is single-flight per [`SessionKey`]: the first submitter
//! becomes the resolver and drains the queue, later submitters only
//! enqueue. A session entry exists exactly while its resolver runs.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use jive_shared::protocol::{
    ConversationCreated, DeliveryError, NewMessage as NewMessageEvent, SendMessage, ServerEvent,
};
use jive_shared::{ConversationId, ConversationRef, MessageBody, UserId};
use jive_store::{Conversation, Database, NewMessage};

use super::{conversation_view, load_conversation, message_view, not_found, user_summaries, ChatEngine};
use crate::error::ChatError;
use crate::presence::ConnectionHandle;

/// Identity of an ingestion session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum SessionKey {
    Conversation(ConversationId),
    /// Direct chat that may not exist yet. The pair is ordered so both
    /// directions share one session.
    Direct(UserId, UserId),
}

impl SessionKey {
    pub(crate) fn new(sender: UserId, target: ConversationRef) -> Self {
        match target {
            ConversationRef::Existing(id) => SessionKey::Conversation(id),
            ConversationRef::Pending { target } if sender <= target => {
                SessionKey::Direct(sender, target)
            }
            ConversationRef::Pending { target } => SessionKey::Direct(target, sender),
        }
    }
}

/// A validated submission waiting for its conversation.
#[derive(Debug)]
pub(crate) struct QueuedMessage {
    pub sender: UserId,
    pub origin: ConnectionHandle,
    pub body: MessageBody,
    pub client_timestamp: DateTime<Utc>,
    pub client_temp_id: Option<String>,
    /// Conversation id as the client named it
    pub conversation_hint: Option<String>,
}

impl QueuedMessage {
    fn delivery_error(&self, error: &ChatError) -> ServerEvent {
        delivery_error(self.client_temp_id.clone(), self.conversation_hint.clone(), error)
    }
}

fn delivery_error(
    client_temp_id: Option<String>,
    conversation_id: Option<String>,
    error: &ChatError,
) -> ServerEvent {
    ServerEvent::DeliveryError(DeliveryError {
        client_temp_id,
        conversation_id,
        details: error.to_string(),
    })
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Admission {
    /// The caller must drain the session.
    Leader,
    /// A resolver is already running and will pick the message up.
    Queued,
}

#[derive(Default)]
pub(crate) struct PendingSessions {
    // Held only for map edits, never across an await.
    sessions: Mutex<HashMap<SessionKey, Vec<QueuedMessage>>>,
}

impl PendingSessions {
    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionKey, Vec<QueuedMessage>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn enqueue(&self, key: SessionKey, message: QueuedMessage) -> Admission {
        let mut sessions = self.sessions();
        match sessions.get_mut(&key) {
            Some(queue) => {
                queue.push(message);
                Admission::Queued
            }
            None => {
                sessions.insert(key, vec![message]);
                Admission::Leader
            }
        }
    }

    /// Everything queued since the last call. Returns `None` once the queue
    /// is empty, removing the entry under the same lock so the next
    /// submission elects a new resolver.
    pub(crate) fn take_batch(&self, key: SessionKey) -> Option<Vec<QueuedMessage>> {
        let mut sessions = self.sessions();
        match sessions.get_mut(&key) {
            Some(queue) if !queue.is_empty() => Some(std::mem::take(queue)),
            Some(_) => {
                sessions.remove(&key);
                None
            }
            None => None,
        }
    }

    /// Drop the session, returning whatever was still queued.
    pub(crate) fn abandon(&self, key: SessionKey) -> Vec<QueuedMessage> {
        self.sessions().remove(&key).unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }
}

/// Held by a running resolver. If the resolver unwinds or is cancelled
/// before its queue runs dry, the session is abandoned and its queued
/// senders get a `delivery-error` instead of waiting on a dead entry.
struct DrainGuard<'a> {
    pending: &'a PendingSessions,
    key: SessionKey,
    finished: bool,
}

impl<'a> DrainGuard<'a> {
    fn new(pending: &'a PendingSessions, key: SessionKey) -> Self {
        Self { pending, key, finished: false }
    }

    /// The entry is already gone. Disarm so a newer resolver's session for
    /// the same key is left alone.
    fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let orphaned = self.pending.abandon(self.key);
        tracing::error!(key = ?self.key, dropped = orphaned.len(), "resolver stopped early, session abandoned");
        let error = ChatError::Storage("message processing was interrupted".into());
        for message in &orphaned {
            message.origin.send(message.delivery_error(&error));
        }
    }
}

impl ChatEngine {
    /// Accept a `send-message` event. Failures go back to `origin` as
    /// `delivery-error` events tagged with the client's temporary id.
    pub(super) async fn send_message(&self, sender: UserId, origin: &ConnectionHandle, req: SendMessage) {
        let client_temp_id = req.client_temp_id.clone();
        let conversation_hint = req.conversation_id.clone();

        let (target, body, client_timestamp) = match validate_submission(sender, req) {
            Ok(parts) => parts,
            Err(e) => {
                tracing::warn!(user = %sender, error = %e, "rejected message");
                origin.send(delivery_error(client_temp_id, conversation_hint, &e));
                return;
            }
        };

        let key = SessionKey::new(sender, target);
        let message = QueuedMessage {
            sender,
            origin: origin.clone(),
            body,
            client_timestamp,
            client_temp_id,
            conversation_hint,
        };

        match self.pending.enqueue(key, message) {
            Admission::Leader => self.drain_session(key).await,
            Admission::Queued => {
                tracing::debug!(user = %sender, ?key, "queued behind running resolver");
            }
        }
    }

    /// Resolve the session's conversation, then persist everything queued
    /// for it, batch by batch, until the queue stays empty.
    pub(crate) async fn drain_session(&self, key: SessionKey) {
        let guard = DrainGuard::new(&self.pending, key);

        // Nothing is taken until the conversation exists, so messages that
        // arrive during resolution are ordered with the first one.
        let (mut conversation, mut announce_creation) = match self.resolve_session(key, None).await {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::warn!(?key, error = %e, "session resolution failed");
                self.fail_session(key, Vec::new(), &e);
                guard.finish();
                return;
            }
        };

        let mut refresh = false;
        while let Some(mut batch) = self.pending.take_batch(key) {
            // Stable: equal client timestamps keep arrival order.
            batch.sort_by_key(|m| m.client_timestamp);

            // Later batches see membership changes made in between.
            if refresh {
                match self.resolve_session(key, Some(conversation.id)).await {
                    Ok((current, _)) => conversation = current,
                    Err(e) => {
                        tracing::warn!(?key, error = %e, "conversation reload failed");
                        self.fail_session(key, batch, &e);
                        guard.finish();
                        return;
                    }
                }
            }
            refresh = true;

            let mut authors: Vec<UserId> = batch.iter().map(|m| m.sender).collect();
            authors.sort();
            authors.dedup();

            for message in &batch {
                match self.persist(&conversation, message, announce_creation, &authors).await {
                    Ok(events) => {
                        announce_creation = false;
                        self.emit_all(events).await;
                    }
                    Err(e) => {
                        tracing::warn!(conversation = %conversation.id, user = %message.sender, error = %e, "message not delivered");
                        message.origin.send(message.delivery_error(&e));
                    }
                }
            }
        }
        guard.finish();
    }

    /// Abandon the session and report `taken` plus everything still queued.
    fn fail_session(&self, key: SessionKey, mut taken: Vec<QueuedMessage>, error: &ChatError) {
        taken.extend(self.pending.abandon(key));
        for message in &taken {
            message.origin.send(message.delivery_error(error));
        }
    }

    /// Find the session's conversation, creating the direct chat if needed.
    /// The flag is `true` only if this call created it.
    async fn resolve_session(
        &self,
        key: SessionKey,
        known: Option<ConversationId>,
    ) -> Result<(Conversation, bool), ChatError> {
        let db = self.db.lock().await;
        if let Some(id) = known {
            return Ok((db.get_conversation(id)?, false));
        }

        match key {
            SessionKey::Conversation(id) => load_conversation(&db, id).map(|c| (c, false)),
            SessionKey::Direct(a, b) => {
                ensure_user(&db, a)?;
                ensure_user(&db, b)?;
                let (conversation, created) = db.find_or_create_direct_conversation(a, b, Utc::now())?;
                if created {
                    tracing::info!(conversation = %conversation.id, "direct conversation created");
                }
                Ok((conversation, created))
            }
        }
    }

    /// Append one message and build its fan-out.
    async fn persist(
        &self,
        conversation: &Conversation,
        message: &QueuedMessage,
        announce_creation: bool,
        authors: &[UserId],
    ) -> Result<Vec<(UserId, ServerEvent)>, ChatError> {
        if !conversation.is_participant(message.sender) {
            return Err(ChatError::Authorization(
                "not a participant of this conversation".into(),
            ));
        }

        let db = self.db.lock().await;
        let stored = db.append_message(&NewMessage {
            conversation_id: conversation.id,
            sender: message.sender,
            body: message.body.clone(),
            timestamp: message.client_timestamp,
        })?;
        db.touch_last_message(conversation.id, stored.timestamp)?;
        tracing::debug!(conversation = %conversation.id, message = %stored.id, "message persisted");

        let senders = user_summaries(&db, &[message.sender])?;
        let view_for = |participant: UserId| {
            let mut view = message_view(&stored, participant, &senders);
            if participant == message.sender {
                view.client_temp_id = message.client_temp_id.clone();
            }
            view
        };

        let mut events = Vec::with_capacity(conversation.participants.len());
        if announce_creation {
            let summary = conversation_view(&db, &db.get_conversation(conversation.id)?)?;
            for &participant in &conversation.participants {
                let replaces_temp_id = if authors.contains(&participant) {
                    conversation
                        .participants
                        .iter()
                        .find(|&&other| other != participant)
                        .map(|&other| ConversationRef::temp_id_for(other))
                } else {
                    None
                };
                events.push((
                    participant,
                    ServerEvent::ConversationCreated(ConversationCreated {
                        conversation: summary.clone(),
                        messages: vec![view_for(participant)],
                        set_active: participant == message.sender,
                        replaces_temp_id,
                    }),
                ));
            }
        } else {
            for &participant in &conversation.participants {
                events.push((
                    participant,
                    ServerEvent::NewMessage(NewMessageEvent {
                        conversation_id: conversation.id,
                        message: view_for(participant),
                    }),
                ));
            }
        }
        Ok(events)
    }
}

fn validate_submission(
    sender: UserId,
    req: SendMessage,
) -> Result<(ConversationRef, MessageBody, DateTime<Utc>), ChatError> {
    let target = ConversationRef::resolve(req.conversation_id.as_deref(), req.target_user_id)?;
    if target == (ConversationRef::Pending { target: sender }) {
        return Err(ChatError::Validation("cannot start a conversation with yourself".into()));
    }
    let body = MessageBody::from_client(req.kind, req.content, req.image_url, req.file_metadata)?;
    Ok((target, body, req.client_timestamp))
}

fn ensure_user(db: &Database, id: UserId) -> Result<(), ChatError> {
    db.get_user(id).map(|_| ()).map_err(|e| not_found("user", id, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{drain, Harness};
    use chrono::Duration;
    use futures::future::join_all;
    use jive_shared::MessageKind;

    fn text(target: Option<UserId>, conversation_id: Option<String>, content: &str, at: DateTime<Utc>, temp: &str) -> SendMessage {
        SendMessage {
            conversation_id,
            target_user_id: target,
            kind: MessageKind::Text,
            content: Some(content.to_string()),
            image_url: None,
            file_metadata: None,
            client_timestamp: at,
            client_temp_id: Some(temp.to_string()),
        }
    }

    fn queued(sender: UserId, origin: &ConnectionHandle, content: &str, at: DateTime<Utc>, temp: &str) -> QueuedMessage {
        QueuedMessage {
            sender,
            origin: origin.clone(),
            body: MessageBody::Text { content: content.to_string() },
            client_timestamp: at,
            client_temp_id: Some(temp.to_string()),
            conversation_hint: None,
        }
    }

    #[test]
    fn test_session_key_ignores_direction() {
        let a = UserId::new();
        let b = UserId::new();
        assert_eq!(
            SessionKey::new(a, ConversationRef::Pending { target: b }),
            SessionKey::new(b, ConversationRef::Pending { target: a })
        );
        let id = ConversationId::new();
        assert_eq!(
            SessionKey::new(a, ConversationRef::Existing(id)),
            SessionKey::Conversation(id)
        );
    }

    #[test]
    fn test_pending_session_lifecycle() {
        let pending = PendingSessions::default();
        let (origin, _rx) = ConnectionHandle::channel();
        let user = UserId::new();
        let key = SessionKey::Conversation(ConversationId::new());
        let now = Utc::now();

        assert_eq!(pending.enqueue(key, queued(user, &origin, "a", now, "1")), Admission::Leader);
        assert_eq!(pending.enqueue(key, queued(user, &origin, "b", now, "2")), Admission::Queued);

        assert_eq!(pending.take_batch(key).map(|b| b.len()), Some(2));
        // Entry survives an in-flight drain.
        assert_eq!(pending.enqueue(key, queued(user, &origin, "c", now, "3")), Admission::Queued);
        assert_eq!(pending.take_batch(key).map(|b| b.len()), Some(1));

        assert!(pending.take_batch(key).is_none());
        assert!(pending.is_empty());
        assert_eq!(pending.enqueue(key, queued(user, &origin, "d", now, "4")), Admission::Leader);
    }

    fn failed_temp_ids(rx: &mut tokio::sync::mpsc::Receiver<ServerEvent>) -> Vec<String> {
        drain(rx)
            .into_iter()
            .filter_map(|e| match e {
                ServerEvent::DeliveryError(d) => d.client_temp_id,
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_panicking_resolver_releases_its_session() {
        let pending = std::sync::Arc::new(PendingSessions::default());
        let (origin, mut rx) = ConnectionHandle::channel();
        let user = UserId::new();
        let key = SessionKey::Conversation(ConversationId::new());
        let now = Utc::now();

        pending.enqueue(key, queued(user, &origin, "a", now, "1"));
        pending.enqueue(key, queued(user, &origin, "b", now, "2"));

        let resolver = tokio::spawn({
            let pending = pending.clone();
            async move {
                let _guard = DrainGuard::new(&pending, key);
                panic!("resolver blew up");
            }
        });
        assert!(resolver.await.unwrap_err().is_panic());

        assert!(pending.is_empty());
        assert_eq!(failed_temp_ids(&mut rx), vec!["1".to_string(), "2".to_string()]);
        // The next submission elects a new resolver instead of queueing forever.
        assert_eq!(pending.enqueue(key, queued(user, &origin, "c", now, "3")), Admission::Leader);
    }

    #[test]
    fn test_finished_guard_leaves_newer_session_alone() {
        let pending = PendingSessions::default();
        let (origin, mut rx) = ConnectionHandle::channel();
        let user = UserId::new();
        let key = SessionKey::Conversation(ConversationId::new());

        let guard = DrainGuard::new(&pending, key);
        // A newer resolver took over after this one drained the queue.
        assert_eq!(pending.enqueue(key, queued(user, &origin, "a", Utc::now(), "1")), Admission::Leader);
        guard.finish();

        assert!(!pending.is_empty());
        assert!(failed_temp_ids(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_first_message_announces_new_conversation() {
        let h = Harness::new();
        let alice = h.user("alice").await;
        let bob = h.user("bob").await;
        let (alice_handle, mut alice_rx) = h.connect(&alice).await;
        let (bob_handle, mut bob_rx) = h.connect(&bob).await;

        h.engine
            .send_message(alice.id, &alice_handle, text(Some(bob.id), None, "hi bob", Utc::now(), "t1"))
            .await;

        let alice_events = drain(&mut alice_rx);
        let created = match alice_events.as_slice() {
            [ServerEvent::ConversationCreated(c)] => c,
            other => panic!("unexpected events: {other:?}"),
        };
        assert!(created.set_active);
        assert_eq!(created.replaces_temp_id, Some(ConversationRef::temp_id_for(bob.id)));
        assert_eq!(created.messages.len(), 1);
        assert!(created.messages[0].is_read);
        assert_eq!(created.messages[0].client_temp_id.as_deref(), Some("t1"));
        assert_eq!(created.conversation.participants.len(), 2);

        let bob_events = drain(&mut bob_rx);
        let created = match bob_events.as_slice() {
            [ServerEvent::ConversationCreated(c)] => c,
            other => panic!("unexpected events: {other:?}"),
        };
        assert!(!created.set_active);
        assert!(created.replaces_temp_id.is_none());
        assert!(!created.messages[0].is_read);
        assert!(created.messages[0].client_temp_id.is_none());
        let conversation_id = created.conversation.id;

        // Follow-ups are plain new-message events.
        h.engine
            .send_message(
                bob.id,
                &bob_handle,
                text(None, Some(conversation_id.to_string()), "hi alice", Utc::now(), "t2"),
            )
            .await;
        match drain(&mut alice_rx).as_slice() {
            [ServerEvent::NewMessage(m)] => {
                assert_eq!(m.conversation_id, conversation_id);
                assert!(!m.message.is_read);
                assert!(m.message.client_temp_id.is_none());
            }
            other => panic!("unexpected events: {other:?}"),
        }
        match drain(&mut bob_rx).as_slice() {
            [ServerEvent::NewMessage(m)] => assert!(m.message.is_read),
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_burst_creates_exactly_one_conversation() {
        let h = Harness::new();
        let alice = h.user("alice").await;
        let bob = h.user("bob").await;
        let (alice_handle, mut alice_rx) = h.connect(&alice).await;
        let (bob_handle, _bob_rx) = h.connect(&bob).await;

        let start = Utc::now();
        let mut sends = Vec::new();
        for i in 0..5 {
            let at = start + Duration::milliseconds(i);
            sends.push(h.engine.send_message(
                alice.id,
                &alice_handle,
                text(Some(bob.id), None, &format!("a{i}"), at, &format!("a{i}")),
            ));
            sends.push(h.engine.send_message(
                bob.id,
                &bob_handle,
                text(Some(alice.id), None, &format!("b{i}"), at, &format!("b{i}")),
            ));
        }
        join_all(sends).await;

        let db = h.db.lock().await;
        let ids = db.conversation_ids_for_user(alice.id).unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(db.list_messages(ids[0]).unwrap().len(), 10);
        assert!(h.engine.pending.is_empty());

        let created = drain(&mut alice_rx)
            .into_iter()
            .filter(|e| matches!(e, ServerEvent::ConversationCreated(_)))
            .count();
        assert_eq!(created, 1);
    }

    #[tokio::test]
    async fn test_batch_is_persisted_in_client_order() {
        let h = Harness::new();
        let alice = h.user("alice").await;
        let bob = h.user("bob").await;
        let (alice_handle, _alice_rx) = h.connect(&alice).await;

        let key = SessionKey::new(alice.id, ConversationRef::Pending { target: bob.id });
        let now = Utc::now();
        // The later message reaches the server first.
        h.engine
            .pending
            .enqueue(key, queued(alice.id, &alice_handle, "second", now, "m2"));
        h.engine
            .pending
            .enqueue(key, queued(alice.id, &alice_handle, "first", now - Duration::seconds(1), "m1"));
        h.engine.drain_session(key).await;

        let db = h.db.lock().await;
        let (conversation, created) = db
            .find_or_create_direct_conversation(alice.id, bob.id, Utc::now())
            .unwrap();
        assert!(!created);
        let contents: Vec<_> = db
            .list_messages(conversation.id)
            .unwrap()
            .iter()
            .filter_map(|m| m.body.content().map(str::to_string))
            .collect();
        assert_eq!(contents, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_message_queued_during_resolution_is_ordered_with_the_first() {
        let h = Harness::new();
        let alice = h.user("alice").await;
        let bob = h.user("bob").await;
        let (alice_handle, _alice_rx) = h.connect(&alice).await;
        let (_bob_handle, mut bob_rx) = h.connect(&bob).await;
        let now = Utc::now();

        // Stall resolution so the earlier-stamped message arrives while the
        // resolver waits on the store.
        let store = h.db.lock().await;
        let resolver = tokio::spawn({
            let engine = h.engine.clone();
            let origin = alice_handle.clone();
            let sender = alice.id;
            let later = text(Some(bob.id), None, "m2", now, "t2");
            async move { engine.send_message(sender, &origin, later).await }
        });
        while h.engine.pending.is_empty() {
            tokio::task::yield_now().await;
        }
        h.engine
            .send_message(
                alice.id,
                &alice_handle,
                text(Some(bob.id), None, "m1", now - Duration::seconds(1), "t1"),
            )
            .await;
        drop(store);
        resolver.await.unwrap();

        let seen: Vec<String> = drain(&mut bob_rx)
            .into_iter()
            .filter_map(|e| match e {
                ServerEvent::ConversationCreated(c) => {
                    Some(format!("created:{}", c.messages[0].content.clone().unwrap_or_default()))
                }
                ServerEvent::NewMessage(m) => {
                    Some(format!("new:{}", m.message.content.unwrap_or_default()))
                }
                _ => None,
            })
            .collect();
        assert_eq!(seen, vec!["created:m1".to_string(), "new:m2".to_string()]);
        assert!(h.engine.pending.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_target_fails_the_whole_batch() {
        let h = Harness::new();
        let alice = h.user("alice").await;
        let (alice_handle, mut alice_rx) = h.connect(&alice).await;

        let key = SessionKey::new(alice.id, ConversationRef::Pending { target: UserId::new() });
        let now = Utc::now();
        h.engine.pending.enqueue(key, queued(alice.id, &alice_handle, "one", now, "x1"));
        h.engine.pending.enqueue(key, queued(alice.id, &alice_handle, "two", now, "x2"));
        h.engine.drain_session(key).await;

        assert_eq!(failed_temp_ids(&mut alice_rx), vec!["x1".to_string(), "x2".to_string()]);
        assert!(h.engine.pending.is_empty());
    }

    #[tokio::test]
    async fn test_outsider_cannot_post_to_conversation() {
        let h = Harness::new();
        let alice = h.user("alice").await;
        let bob = h.user("bob").await;
        let mallory = h.user("mallory").await;
        let (mallory_handle, mut mallory_rx) = h.connect(&mallory).await;

        let conversation = {
            let db = h.db.lock().await;
            db.find_or_create_direct_conversation(alice.id, bob.id, Utc::now()).unwrap().0
        };

        h.engine
            .send_message(
                mallory.id,
                &mallory_handle,
                text(None, Some(conversation.id.to_string()), "let me in", Utc::now(), "m1"),
            )
            .await;

        match drain(&mut mallory_rx).as_slice() {
            [ServerEvent::DeliveryError(d)] => {
                assert_eq!(d.client_temp_id.as_deref(), Some("m1"));
                assert_eq!(d.conversation_id, Some(conversation.id.to_string()));
            }
            other => panic!("unexpected events: {other:?}"),
        }
        assert!(h.db.lock().await.list_messages(conversation.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_payload_is_reported_not_queued() {
        let h = Harness::new();
        let alice = h.user("alice").await;
        let bob = h.user("bob").await;
        let (alice_handle, mut alice_rx) = h.connect(&alice).await;

        h.engine
            .send_message(alice.id, &alice_handle, text(Some(bob.id), None, "   ", Utc::now(), "e1"))
            .await;
        h.engine
            .send_message(alice.id, &alice_handle, text(Some(alice.id), None, "me", Utc::now(), "e2"))
            .await;

        let errors = drain(&mut alice_rx)
            .into_iter()
            .filter(|e| matches!(e, ServerEvent::DeliveryError(_)))
            .count();
        assert_eq!(errors, 2);
        assert!(h.engine.pending.is_empty());
        assert!(h.db.lock().await.conversation_ids_for_user(alice.id).unwrap().is_empty());
    }
}
