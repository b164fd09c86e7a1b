//! CRUD operations for [`Conversation`] records, their participants and
//! per-user read markers.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use jive_shared::{ConversationId, UserId};
use rusqlite::{params, Connection, OptionalExtension};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{
    from_millis, normalize, parse_uuid, to_millis, Conversation, GroupInfo,
};

const CONVERSATION_COLUMNS: &str =
    "id, group_name, group_avatar_url, group_admin, group_created_at, last_message_at";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Create a group conversation. Duplicate participant ids are dropped.
    pub fn create_group(
        &self,
        name: &str,
        avatar_url: &str,
        admin: UserId,
        participants: &[UserId],
        now: DateTime<Utc>,
    ) -> Result<Conversation> {
        let participants = dedup(participants);
        if participants.is_empty() {
            return Err(StoreError::Invalid("a group needs at least one participant".into()));
        }

        let id = ConversationId::new();
        let tx = self.conn().unchecked_transaction()?;
        tx.execute(
            "INSERT INTO conversations
                 (id, is_group, direct_key, group_name, group_avatar_url, group_admin,
                  group_created_at, last_message_at)
             VALUES (?1, 1, NULL, ?2, ?3, ?4, ?5, ?5)",
            params![
                id.to_string(),
                name,
                avatar_url,
                admin.to_string(),
                to_millis(now),
            ],
        )?;
        insert_participants(&tx, id, &participants)?;
        tx.commit()?;

        tracing::debug!(conversation = %id, members = participants.len(), "group created");
        self.get_conversation(id)
    }

    /// Find the direct conversation between two users, creating it if absent.
    ///
    /// The insert is keyed on the unordered user pair, so concurrent callers
    /// for the same pair always end up with the same row. The returned flag
    /// is `true` only for the caller whose insert created it.
    pub fn find_or_create_direct_conversation(
        &self,
        a: UserId,
        b: UserId,
        now: DateTime<Utc>,
    ) -> Result<(Conversation, bool)> {
        if a == b {
            return Err(StoreError::Invalid(
                "a direct conversation needs two distinct users".into(),
            ));
        }

        let id = ConversationId::new();
        let tx = self.conn().unchecked_transaction()?;
        let inserted = tx.execute(
            "INSERT INTO conversations (id, is_group, direct_key, last_message_at)
             VALUES (?1, 0, ?2, ?3)
             ON CONFLICT(direct_key) DO NOTHING",
            params![id.to_string(), direct_key(a, b), to_millis(now)],
        )?;
        if inserted == 1 {
            insert_participants(&tx, id, &[a, b])?;
        }
        tx.commit()?;

        let conversation = self
            .find_direct_conversation(a, b)?
            .ok_or(StoreError::NotFound)?;
        Ok((conversation, inserted == 1))
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_conversation(&self, id: ConversationId) -> Result<Conversation> {
        let (group, last_message_at) = self
            .conn()
            .query_row(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
                params![id.to_string()],
                row_to_header,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })?;

        Ok(Conversation {
            id,
            participants: self.load_participants(id)?,
            group,
            last_message_at,
            last_read: self.load_read_markers(id)?,
        })
    }

    pub fn find_direct_conversation(&self, a: UserId, b: UserId) -> Result<Option<Conversation>> {
        let id: Option<String> = self
            .conn()
            .query_row(
                "SELECT id FROM conversations WHERE direct_key = ?1",
                params![direct_key(a, b)],
                |row| row.get(0),
            )
            .optional()?;

        match id {
            Some(id) => {
                let id = ConversationId(uuid::Uuid::parse_str(&id)?);
                Ok(Some(self.get_conversation(id)?))
            }
            None => Ok(None),
        }
    }

    /// Ids of every conversation the user participates in, most recently
    /// active first.
    pub fn conversation_ids_for_user(&self, user: UserId) -> Result<Vec<ConversationId>> {
        let mut stmt = self.conn().prepare(
            "SELECT c.id
             FROM conversations c
             JOIN conversation_participants p ON p.conversation_id = c.id
             WHERE p.user_id = ?1
             ORDER BY c.last_message_at DESC",
        )?;
        let rows = stmt.query_map(params![user.to_string()], |row| {
            let raw: String = row.get(0)?;
            Ok(ConversationId(parse_uuid(0, &raw)?))
        })?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    pub fn list_conversations_for_user(&self, user: UserId) -> Result<Vec<Conversation>> {
        self.conversation_ids_for_user(user)?
            .into_iter()
            .map(|id| self.get_conversation(id))
            .collect()
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Persist a group's metadata and participant list.
    ///
    /// Read markers of users who are no longer members are dropped.
    pub fn save_group(&self, conversation: &Conversation) -> Result<()> {
        let group = conversation
            .group
            .as_ref()
            .ok_or_else(|| StoreError::Invalid("not a group conversation".into()))?;
        let participants = dedup(&conversation.participants);
        if participants.is_empty() {
            return Err(StoreError::Invalid(
                "an empty group must be deleted, not saved".into(),
            ));
        }

        let id = conversation.id.to_string();
        let tx = self.conn().unchecked_transaction()?;
        let affected = tx.execute(
            "UPDATE conversations
             SET group_name = ?1, group_avatar_url = ?2, group_admin = ?3
             WHERE id = ?4 AND is_group = 1",
            params![group.name, group.avatar_url, group.admin.to_string(), id],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }

        tx.execute(
            "DELETE FROM conversation_participants WHERE conversation_id = ?1",
            params![id],
        )?;
        insert_participants(&tx, conversation.id, &participants)?;
        tx.execute(
            "DELETE FROM conversation_reads
             WHERE conversation_id = ?1
               AND user_id NOT IN (
                   SELECT user_id FROM conversation_participants WHERE conversation_id = ?1
               )",
            params![id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Move the conversation's last-activity timestamp forward. Never moves
    /// it backwards.
    pub fn touch_last_message(&self, id: ConversationId, at: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "UPDATE conversations SET last_message_at = MAX(last_message_at, ?1) WHERE id = ?2",
            params![to_millis(at), id.to_string()],
        )?;
        Ok(())
    }

    /// Advance `user`'s read marker to `at` and add them to the read-by set
    /// of every message up to the marker.
    ///
    /// The marker never regresses: the effective value is
    /// `max(existing, at)`, which is returned.
    pub fn mark_conversation_read(
        &self,
        id: ConversationId,
        user: UserId,
        at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let conversation = id.to_string();
        let user = user.to_string();

        let tx = self.conn().unchecked_transaction()?;
        tx.execute(
            "INSERT INTO conversation_reads (conversation_id, user_id, last_read)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(conversation_id, user_id)
             DO UPDATE SET last_read = MAX(last_read, excluded.last_read)",
            params![conversation, user, to_millis(normalize(at))],
        )?;
        let marker: i64 = tx.query_row(
            "SELECT last_read FROM conversation_reads WHERE conversation_id = ?1 AND user_id = ?2",
            params![conversation, user],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO message_reads (message_id, user_id)
             SELECT id, ?2 FROM messages WHERE conversation_id = ?1 AND timestamp <= ?3",
            params![conversation, user, marker],
        )?;
        tx.commit()?;

        Ok(from_millis(marker))
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Delete a conversation together with its messages.  Returns `true`
    /// if a row was deleted.
    pub fn delete_conversation(&self, id: ConversationId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM conversations WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(affected > 0)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn load_participants(&self, id: ConversationId) -> Result<Vec<UserId>> {
        let mut stmt = self.conn().prepare(
            "SELECT user_id FROM conversation_participants
             WHERE conversation_id = ?1
             ORDER BY position ASC",
        )?;
        let rows = stmt.query_map(params![id.to_string()], |row| {
            let raw: String = row.get(0)?;
            Ok(UserId(parse_uuid(0, &raw)?))
        })?;

        let mut participants = Vec::new();
        for row in rows {
            participants.push(row?);
        }
        Ok(participants)
    }

    fn load_read_markers(&self, id: ConversationId) -> Result<HashMap<UserId, DateTime<Utc>>> {
        let mut stmt = self.conn().prepare(
            "SELECT user_id, last_read FROM conversation_reads WHERE conversation_id = ?1",
        )?;
        let rows = stmt.query_map(params![id.to_string()], |row| {
            let raw: String = row.get(0)?;
            let last_read: i64 = row.get(1)?;
            Ok((UserId(parse_uuid(0, &raw)?), from_millis(last_read)))
        })?;

        let mut markers = HashMap::new();
        for row in rows {
            let (user, at) = row?;
            markers.insert(user, at);
        }
        Ok(markers)
    }
}

/// Order-independent key identifying the direct chat between two users.
fn direct_key(a: UserId, b: UserId) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{lo}:{hi}")
}

fn dedup(ids: &[UserId]) -> Vec<UserId> {
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        if !out.contains(id) {
            out.push(*id);
        }
    }
    out
}

fn insert_participants(conn: &Connection, id: ConversationId, participants: &[UserId]) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO conversation_participants (conversation_id, user_id, position)
         VALUES (?1, ?2, ?3)",
    )?;
    for (position, user) in participants.iter().enumerate() {
        stmt.execute(params![id.to_string(), user.to_string(), position as i64])?;
    }
    Ok(())
}

/// Map a conversation row to its group metadata and activity timestamp.
fn row_to_header(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Option<GroupInfo>, DateTime<Utc>)> {
    let name: Option<String> = row.get(1)?;
    let avatar_url: Option<String> = row.get(2)?;
    let admin: Option<String> = row.get(3)?;
    let created_at: Option<i64> = row.get(4)?;
    let last_message_at: i64 = row.get(5)?;

    let group = match (name, admin) {
        (Some(name), Some(admin)) => Some(GroupInfo {
            name,
            avatar_url: avatar_url.unwrap_or_default(),
            admin: UserId(parse_uuid(3, &admin)?),
            created_at: created_at.map(from_millis).unwrap_or_default(),
        }),
        _ => None,
    };

    Ok((group, from_millis(last_message_at)))
}
