//! Group lifecycle: creation, edits, exits and avatar changes.
//!
//! Every change is narrated in the group's own log with system messages,
//! which fan out like ordinary messages after the membership events.

use chrono::Utc;
use jive_shared::protocol::{
    CreateGroup, EditGroup, GroupCreated, GroupUpdated, NewMessage as NewMessageEvent,
    RemovedFromGroup, ServerEvent, UpdateGroupImage,
};
use jive_shared::{ConversationId, MessageBody, SystemEffect, UserId};
use jive_store::{Conversation, Database, NewMessage};

use super::{conversation_view, load_conversation, message_views, not_found, ChatEngine};
use crate::error::ChatError;
use crate::images;

impl ChatEngine {
    /// Create a group administered by `user`, who is always a member.
    pub(super) async fn create_group(
        &self,
        user: UserId,
        req: CreateGroup,
    ) -> Result<Conversation, ChatError> {
        let name = req.name.trim();
        if name.is_empty() {
            return Err(ChatError::Validation("group name must not be empty".into()));
        }
        let mut participants = unique(req.participant_ids);
        if !participants.contains(&user) {
            participants.push(user);
        }

        let (group, events) = {
            let db = self.db.lock().await;
            ensure_users(&db, &participants)?;
            let group = db.create_group(
                name,
                &self.settings.default_group_image,
                user,
                &participants,
                Utc::now(),
            )?;

            let view = conversation_view(&db, &group)?;
            let mut events: Vec<(UserId, ServerEvent)> = group
                .participants
                .iter()
                .map(|&member| {
                    let created = GroupCreated {
                        conversation: view.clone(),
                        messages: Vec::new(),
                    };
                    (member, ServerEvent::GroupCreated(created))
                })
                .collect();
            events.extend(append_notices(
                &db,
                &group,
                user,
                vec![MessageBody::system("created group", SystemEffect::Data { text: name.to_string() })],
            )?);
            (group, events)
        };

        tracing::info!(group = %group.id, admin = %user, members = group.participants.len(), "group created");
        self.emit_all(events).await;
        Ok(group)
    }

    /// Rename and/or replace the member list. Admin only.
    ///
    /// Removed members are told to drop the group. Added members receive
    /// the full backlog with their update; everyone else gets metadata only.
    pub(super) async fn edit_group(&self, user: UserId, req: EditGroup) -> Result<(), ChatError> {
        let events = {
            let db = self.db.lock().await;
            let mut group = load_group_as_admin(&db, req.group_id, user)?;
            let mut notices = Vec::new();

            let new_name = req.name.as_deref().map(str::trim).filter(|n| !n.is_empty());
            if let (Some(name), Some(info)) = (new_name, group.group.as_mut()) {
                if info.name != name {
                    info.name = name.to_string();
                    notices.push(MessageBody::system(
                        "changed group name to",
                        SystemEffect::Data { text: name.to_string() },
                    ));
                }
            }

            let mut removed = Vec::new();
            let mut added = Vec::new();
            if let Some(requested) = req.participant_ids {
                let mut wanted = unique(requested);
                if !wanted.contains(&user) {
                    wanted.push(user);
                }

                removed = group
                    .participants
                    .iter()
                    .filter(|member| !wanted.contains(member))
                    .copied()
                    .collect();
                added = wanted
                    .iter()
                    .filter(|candidate| !group.participants.contains(candidate))
                    .copied()
                    .collect();
                ensure_users(&db, &added)?;
                group.participants = wanted;

                if !removed.is_empty() {
                    notices.push(MessageBody::system("removed", SystemEffect::Users { users: removed.clone() }));
                }
                if !added.is_empty() {
                    notices.push(MessageBody::system("added", SystemEffect::Users { users: added.clone() }));
                }
            }

            db.save_group(&group)?;

            let mut events: Vec<(UserId, ServerEvent)> = removed
                .iter()
                .map(|&gone| {
                    let notice = RemovedFromGroup { conversation_id: group.id };
                    (gone, ServerEvent::RemovedFromGroup(notice))
                })
                .collect();
            events.extend(group_updates(&db, &group, &added)?);
            events.extend(append_notices(&db, &group, user, notices)?);

            tracing::info!(
                group = %group.id,
                added = added.len(),
                removed = removed.len(),
                "group edited"
            );
            events
        };

        self.emit_all(events).await;
        Ok(())
    }

    /// Leave a group. The first remaining member inherits the admin role;
    /// the last member out deletes the group.
    pub(super) async fn exit_group(&self, user: UserId, group_id: ConversationId) -> Result<(), ChatError> {
        let events = {
            let db = self.db.lock().await;
            let mut group = load_group(&db, group_id)?;
            if !group.is_participant(user) {
                return Err(ChatError::Authorization(format!(
                    "user {user} is not a member of group {group_id}"
                )));
            }
            group.participants.retain(|&member| member != user);

            match group.participants.first().copied() {
                None => {
                    db.delete_conversation(group_id)?;
                    tracing::info!(group = %group_id, "group dissolved");
                    None
                }
                Some(successor) => {
                    if let Some(info) = group.group.as_mut() {
                        if info.admin == user {
                            info.admin = successor;
                            tracing::info!(group = %group_id, admin = %successor, "group admin reassigned");
                        }
                    }
                    db.save_group(&group)?;

                    let mut events = append_notices(
                        &db,
                        &group,
                        user,
                        vec![MessageBody::system("left group", SystemEffect::Data { text: String::new() })],
                    )?;
                    events.extend(group_updates(&db, &group, &[])?);
                    Some(events)
                }
            }
        };

        self.emit(
            user,
            ServerEvent::RemovedFromGroup(RemovedFromGroup { conversation_id: group_id }),
        )
        .await;
        if let Some(events) = events {
            self.emit_all(events).await;
        }
        Ok(())
    }

    /// Swap the group avatar. Admin only. The previous image is queued for
    /// removal unless it is the platform default.
    pub(super) async fn update_group_image(
        &self,
        user: UserId,
        req: UpdateGroupImage,
    ) -> Result<(), ChatError> {
        let url = req.url.trim();
        if url.is_empty() {
            return Err(ChatError::Validation("image url must not be empty".into()));
        }

        let (previous, events) = {
            let db = self.db.lock().await;
            let mut group = load_group_as_admin(&db, req.group_id, user)?;
            let previous = match group.group.as_mut() {
                Some(info) => std::mem::replace(&mut info.avatar_url, url.to_string()),
                None => String::new(),
            };
            db.save_group(&group)?;

            let mut events = append_notices(
                &db,
                &group,
                user,
                vec![MessageBody::system("changed group image", SystemEffect::Data { text: String::new() })],
            )?;
            events.extend(group_updates(&db, &group, &[])?);
            (previous, events)
        };

        if !previous.is_empty() && previous != url && previous != self.settings.default_group_image {
            images::spawn_mark_for_removal(self.images.clone(), previous, req.group_id.to_string());
        }

        self.emit_all(events).await;
        Ok(())
    }
}

fn load_group(db: &Database, id: ConversationId) -> Result<Conversation, ChatError> {
    let conversation = load_conversation(db, id)?;
    if !conversation.is_group() {
        return Err(ChatError::Validation(format!("conversation {id} is not a group")));
    }
    Ok(conversation)
}

fn load_group_as_admin(db: &Database, id: ConversationId, user: UserId) -> Result<Conversation, ChatError> {
    let group = load_group(db, id)?;
    if !group.is_admin(user) {
        return Err(ChatError::Authorization("only the group admin can edit the group".into()));
    }
    Ok(group)
}

fn ensure_users(db: &Database, ids: &[UserId]) -> Result<(), ChatError> {
    for &id in ids {
        db.get_user(id).map_err(|e| not_found("user", id, e))?;
    }
    Ok(())
}

/// Order-preserving dedup.
fn unique(ids: Vec<UserId>) -> Vec<UserId> {
    let mut seen = Vec::with_capacity(ids.len());
    for id in ids {
        if !seen.contains(&id) {
            seen.push(id);
        }
    }
    seen
}

/// `group-updated` for every current member. Members listed in `added`
/// also get the whole log.
fn group_updates(
    db: &Database,
    group: &Conversation,
    added: &[UserId],
) -> Result<Vec<(UserId, ServerEvent)>, ChatError> {
    let view = conversation_view(db, group)?;
    let backlog = if added.is_empty() {
        Vec::new()
    } else {
        db.list_messages(group.id)?
    };

    let mut events = Vec::with_capacity(group.participants.len());
    for &member in &group.participants {
        let messages = if added.contains(&member) {
            Some(message_views(db, &backlog, member)?)
        } else {
            None
        };
        let update = GroupUpdated {
            conversation: view.clone(),
            messages,
        };
        events.push((member, ServerEvent::GroupUpdated(update)));
    }
    Ok(events)
}

/// Append system messages authored by `actor` and build their fan-out to
/// the current members.
fn append_notices(
    db: &Database,
    group: &Conversation,
    actor: UserId,
    notices: Vec<MessageBody>,
) -> Result<Vec<(UserId, ServerEvent)>, ChatError> {
    let mut appended = Vec::with_capacity(notices.len());
    for body in notices {
        let message = db.append_message(&NewMessage {
            conversation_id: group.id,
            sender: actor,
            body,
            timestamp: Utc::now(),
        })?;
        db.touch_last_message(group.id, message.timestamp)?;
        appended.push(message);
    }
    if appended.is_empty() {
        return Ok(Vec::new());
    }

    let mut events = Vec::new();
    for &member in &group.participants {
        for view in message_views(db, &appended, member)? {
            let event = NewMessageEvent {
                conversation_id: group.id,
                message: view,
            };
            events.push((member, ServerEvent::NewMessage(event)));
        }
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{drain, Harness};
    use jive_shared::constants::DEFAULT_GROUP_IMAGE;
    use jive_store::User;
    use std::time::Duration;

    async fn group_of(h: &Harness, admin: &User, others: &[&User], name: &str) -> Conversation {
        h.engine
            .create_group(
                admin.id,
                CreateGroup {
                    name: name.into(),
                    participant_ids: others.iter().map(|u| u.id).collect(),
                },
            )
            .await
            .unwrap()
    }

    fn actions(db: &Database, group: ConversationId) -> Vec<String> {
        db.list_messages(group)
            .unwrap()
            .into_iter()
            .filter_map(|m| match m.body {
                MessageBody::System { action, .. } => Some(action),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_create_group_adds_creator_and_announces() {
        let h = Harness::new();
        let alice = h.user("alice").await;
        let bob = h.user("bob").await;
        let (_bob_handle, mut bob_rx) = h.connect(&bob).await;

        let group = group_of(&h, &alice, &[&bob, &bob], "climbers").await;
        assert_eq!(group.participants, vec![bob.id, alice.id]);
        assert!(group.is_admin(alice.id));
        assert_eq!(group.group.as_ref().unwrap().avatar_url, DEFAULT_GROUP_IMAGE);

        let events = drain(&mut bob_rx);
        assert_eq!(events.len(), 2);
        match &events[0] {
            ServerEvent::GroupCreated(created) => {
                assert_eq!(created.conversation.id, group.id);
                assert!(created.messages.is_empty());
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match &events[1] {
            ServerEvent::NewMessage(m) => {
                assert_eq!(m.message.action.as_deref(), Some("created group"));
                assert_eq!(m.message.effect, Some(SystemEffect::Data { text: "climbers".into() }));
                assert_eq!(m.message.sender_id, alice.id);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_create_group_rejects_bad_input() {
        let h = Harness::new();
        let alice = h.user("alice").await;

        let err = h
            .engine
            .create_group(alice.id, CreateGroup { name: "  ".into(), participant_ids: vec![] })
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));

        let err = h
            .engine
            .create_group(alice.id, CreateGroup { name: "ghosts".into(), participant_ids: vec![UserId::new()] })
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_edit_group_requires_admin() {
        let h = Harness::new();
        let alice = h.user("alice").await;
        let bob = h.user("bob").await;
        let group = group_of(&h, &alice, &[&bob], "team").await;

        let err = h
            .engine
            .edit_group(
                bob.id,
                EditGroup { group_id: group.id, name: Some("mutiny".into()), participant_ids: Some(vec![bob.id]) },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Authorization(_)));

        let db = h.db.lock().await;
        let stored = db.get_conversation(group.id).unwrap();
        assert_eq!(stored.group.unwrap().name, "team");
        assert_eq!(stored.participants.len(), 2);
    }

    #[tokio::test]
    async fn test_edit_group_diffs_members() {
        let h = Harness::new();
        let alice = h.user("alice").await;
        let bob = h.user("bob").await;
        let carol = h.user("carol").await;
        let dave = h.user("dave").await;
        let group = group_of(&h, &alice, &[&bob, &carol], "team").await;

        let (_bob_handle, mut bob_rx) = h.connect(&bob).await;
        let (_carol_handle, mut carol_rx) = h.connect(&carol).await;
        let (_dave_handle, mut dave_rx) = h.connect(&dave).await;

        // Admin omitted on purpose; the edit keeps them.
        h.engine
            .edit_group(
                alice.id,
                EditGroup {
                    group_id: group.id,
                    name: Some("new team".into()),
                    participant_ids: Some(vec![bob.id, dave.id]),
                },
            )
            .await
            .unwrap();

        let carol_events = drain(&mut carol_rx);
        assert!(matches!(
            carol_events.as_slice(),
            [ServerEvent::RemovedFromGroup(r)] if r.conversation_id == group.id
        ));

        let bob_events = drain(&mut bob_rx);
        match &bob_events[0] {
            ServerEvent::GroupUpdated(update) => {
                assert!(update.messages.is_none());
                assert_eq!(update.conversation.group.as_ref().unwrap().name, "new team");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(bob_events.len(), 4);

        let dave_events = drain(&mut dave_rx);
        match &dave_events[0] {
            ServerEvent::GroupUpdated(update) => {
                let backlog = update.messages.as_ref().expect("backlog for added member");
                assert_eq!(backlog.len(), 1);
                assert_eq!(backlog[0].action.as_deref(), Some("created group"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        let notices: Vec<_> = dave_events[1..]
            .iter()
            .filter_map(|e| match e {
                ServerEvent::NewMessage(m) => m.message.action.clone(),
                _ => None,
            })
            .collect();
        assert_eq!(notices, ["changed group name to", "removed", "added"]);

        let db = h.db.lock().await;
        let stored = db.get_conversation(group.id).unwrap();
        assert_eq!(stored.participants, vec![bob.id, dave.id, alice.id]);
        assert_eq!(
            actions(&db, group.id),
            ["created group", "changed group name to", "removed", "added"]
        );
    }

    #[tokio::test]
    async fn test_admin_exit_promotes_first_member() {
        let h = Harness::new();
        let alice = h.user("alice").await;
        let bob = h.user("bob").await;
        let carol = h.user("carol").await;
        let group = group_of(&h, &alice, &[&bob, &carol], "team").await;

        let (_alice_handle, mut alice_rx) = h.connect(&alice).await;
        let (_bob_handle, mut bob_rx) = h.connect(&bob).await;
        let (_carol_handle, mut carol_rx) = h.connect(&carol).await;

        h.engine.exit_group(alice.id, group.id).await.unwrap();

        assert!(matches!(
            drain(&mut alice_rx).as_slice(),
            [ServerEvent::RemovedFromGroup(r)] if r.conversation_id == group.id
        ));
        for rx in [&mut bob_rx, &mut carol_rx] {
            let events = drain(rx);
            let update = events
                .iter()
                .find_map(|e| match e {
                    ServerEvent::GroupUpdated(u) => Some(u),
                    _ => None,
                })
                .expect("group update");
            assert_eq!(update.conversation.group.as_ref().unwrap().admin, bob.id);
            assert!(events.iter().any(|e| matches!(
                e,
                ServerEvent::NewMessage(m) if m.message.action.as_deref() == Some("left group")
            )));
        }

        let db = h.db.lock().await;
        let stored = db.get_conversation(group.id).unwrap();
        assert_eq!(stored.participants, vec![bob.id, carol.id]);
        assert!(stored.is_admin(bob.id));
    }

    #[tokio::test]
    async fn test_last_exit_dissolves_group() {
        let h = Harness::new();
        let alice = h.user("alice").await;
        let group = group_of(&h, &alice, &[], "solo").await;
        let (_alice_handle, mut alice_rx) = h.connect(&alice).await;

        h.engine.exit_group(alice.id, group.id).await.unwrap();

        assert!(matches!(
            drain(&mut alice_rx).as_slice(),
            [ServerEvent::RemovedFromGroup(_)]
        ));
        let missing = h.db.lock().await.get_conversation(group.id);
        assert!(matches!(missing, Err(jive_store::StoreError::NotFound)));

        let err = h.engine.exit_group(alice.id, group.id).await.unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_exit_direct_conversation_is_rejected() {
        let h = Harness::new();
        let alice = h.user("alice").await;
        let bob = h.user("bob").await;
        let direct = {
            let db = h.db.lock().await;
            db.find_or_create_direct_conversation(alice.id, bob.id, Utc::now()).unwrap().0
        };

        let err = h.engine.exit_group(alice.id, direct.id).await.unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
    }

    #[tokio::test]
    async fn test_image_update_queues_previous_custom_image() {
        let h = Harness::new();
        let alice = h.user("alice").await;
        let bob = h.user("bob").await;
        let group = group_of(&h, &alice, &[&bob], "team").await;
        let (_bob_handle, mut bob_rx) = h.connect(&bob).await;

        let first = "https://img.example/first.png";
        h.engine
            .update_group_image(alice.id, UpdateGroupImage { group_id: group.id, url: first.into() })
            .await
            .unwrap();
        let events = drain(&mut bob_rx);
        assert!(events.iter().any(|e| matches!(
            e,
            ServerEvent::GroupUpdated(u) if u.conversation.group.as_ref().unwrap().avatar_url == first
        )));

        h.engine
            .update_group_image(
                alice.id,
                UpdateGroupImage { group_id: group.id, url: "https://img.example/second.png".into() },
            )
            .await
            .unwrap();

        let mut removals = Vec::new();
        for _ in 0..50 {
            removals = h.db.lock().await.list_image_removals().unwrap();
            if !removals.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // The default image is never queued, only the first custom one.
        assert_eq!(removals.len(), 1);
        assert_eq!(removals[0].image_url, first);
        assert_eq!(removals[0].reference_id, group.id.to_string());

        let err = h
            .engine
            .update_group_image(bob.id, UpdateGroupImage { group_id: group.id, url: "x".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Authorization(_)));
    }
}
