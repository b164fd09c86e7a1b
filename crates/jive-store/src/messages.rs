//! Message log access: append, paginated history, unread accounting,
//! search and context windows.
//!
//! Ordering within a conversation is `(timestamp, seq)`; `seq` is the
//! insertion order and breaks ties between equal timestamps.

use chrono::{DateTime, Utc};
use jive_shared::{
    ConversationId, FileMetadata, MessageBody, MessageId, MessageKind, SystemEffect, UserId,
};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension};

use crate::database::{placeholders, Database};
use crate::error::{Result, StoreError};
use crate::models::{
    conversion_err, from_millis, normalize, parse_uuid, to_millis, Message, MessagePage, NewMessage,
};

const MESSAGE_SELECT: &str = "SELECT m.id, m.conversation_id, m.sender_id, m.kind, m.content,
        m.image_url, m.file_name, m.file_size, m.file_mime, m.file_url, m.action, m.effect,
        m.timestamp,
        (SELECT group_concat(r.user_id) FROM message_reads r WHERE r.message_id = m.id)
     FROM messages m";

impl Database {
    /// Append a message to its conversation's log.
    ///
    /// Assigns a fresh id, truncates the timestamp to stored precision and
    /// seeds `read_by` with the sender.
    pub fn append_message(&self, msg: &NewMessage) -> Result<Message> {
        let id = MessageId::new();
        let timestamp = normalize(msg.timestamp);
        let columns = BodyColumns::from_body(&msg.body)?;

        let tx = self.conn().unchecked_transaction()?;
        tx.execute(
            "INSERT INTO messages
                 (id, conversation_id, sender_id, kind, content, image_url,
                  file_name, file_size, file_mime, file_url, action, effect, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                id.to_string(),
                msg.conversation_id.to_string(),
                msg.sender.to_string(),
                msg.body.kind().as_str(),
                columns.content,
                columns.image_url,
                columns.file_name,
                columns.file_size,
                columns.file_mime,
                columns.file_url,
                columns.action,
                columns.effect,
                to_millis(timestamp),
            ],
        )?;
        tx.execute(
            "INSERT INTO message_reads (message_id, user_id) VALUES (?1, ?2)",
            params![id.to_string(), msg.sender.to_string()],
        )?;
        tx.commit()?;

        Ok(Message {
            id,
            conversation_id: msg.conversation_id,
            sender: msg.sender,
            body: msg.body.clone(),
            timestamp,
            read_by: vec![msg.sender],
        })
    }

    pub fn get_message(&self, id: MessageId) -> Result<Message> {
        self.conn()
            .query_row(
                &format!("{MESSAGE_SELECT} WHERE m.id = ?1"),
                params![id.to_string()],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// One page of history bounded above by `upper_bound`, newest first.
    ///
    /// Pages are 1-based; page 0 is treated as page 1.
    pub fn page_messages(
        &self,
        conversation: ConversationId,
        page: u32,
        page_size: u32,
        upper_bound: DateTime<Utc>,
    ) -> Result<MessagePage> {
        let page = page.max(1);
        let page_size = page_size.max(1);
        let bound = to_millis(upper_bound);

        let total_count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1 AND timestamp <= ?2",
            params![conversation.to_string(), bound],
            |row| row.get(0),
        )?;
        let total_count = total_count.max(0) as u64;

        let offset = i64::from(page - 1) * i64::from(page_size);
        let messages = self.query_messages(
            &format!(
                "{MESSAGE_SELECT}
                 WHERE m.conversation_id = ?1 AND m.timestamp <= ?2
                 ORDER BY m.timestamp DESC, m.seq DESC
                 LIMIT ?3 OFFSET ?4"
            ),
            params![conversation.to_string(), bound, i64::from(page_size), offset],
        )?;

        Ok(MessagePage {
            messages,
            total_count,
            total_pages: total_count.div_ceil(u64::from(page_size)),
            current_page: page,
        })
    }

    /// Messages strictly after `after`, oldest first.
    pub fn messages_after(
        &self,
        conversation: ConversationId,
        after: DateTime<Utc>,
    ) -> Result<Vec<Message>> {
        self.query_messages(
            &format!(
                "{MESSAGE_SELECT}
                 WHERE m.conversation_id = ?1 AND m.timestamp > ?2
                 ORDER BY m.timestamp ASC, m.seq ASC"
            ),
            params![conversation.to_string(), to_millis(after)],
        )
    }

    pub fn count_messages_after(
        &self,
        conversation: ConversationId,
        after: DateTime<Utc>,
    ) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1 AND timestamp > ?2",
            params![conversation.to_string(), to_millis(after)],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// The earliest message strictly after `after`.
    pub fn first_message_after(
        &self,
        conversation: ConversationId,
        after: DateTime<Utc>,
    ) -> Result<Option<Message>> {
        Ok(self
            .conn()
            .query_row(
                &format!(
                    "{MESSAGE_SELECT}
                     WHERE m.conversation_id = ?1 AND m.timestamp > ?2
                     ORDER BY m.timestamp ASC, m.seq ASC
                     LIMIT 1"
                ),
                params![conversation.to_string(), to_millis(after)],
                row_to_message,
            )
            .optional()?)
    }

    pub fn latest_message(&self, conversation: ConversationId) -> Result<Option<Message>> {
        Ok(self
            .conn()
            .query_row(
                &format!(
                    "{MESSAGE_SELECT}
                     WHERE m.conversation_id = ?1
                     ORDER BY m.timestamp DESC, m.seq DESC
                     LIMIT 1"
                ),
                params![conversation.to_string()],
                row_to_message,
            )
            .optional()?)
    }

    /// The full log, oldest first.
    pub fn list_messages(&self, conversation: ConversationId) -> Result<Vec<Message>> {
        self.query_messages(
            &format!(
                "{MESSAGE_SELECT}
                 WHERE m.conversation_id = ?1
                 ORDER BY m.timestamp ASC, m.seq ASC"
            ),
            params![conversation.to_string()],
        )
    }

    /// Case-insensitive substring search over message content in the given
    /// conversations, newest first.
    pub fn search_messages(
        &self,
        conversations: &[ConversationId],
        term: &str,
        limit: u32,
    ) -> Result<Vec<Message>> {
        if conversations.is_empty() || term.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let sql = format!(
            "{MESSAGE_SELECT}
             WHERE m.conversation_id IN ({})
               AND instr(lower(m.content), lower(?1)) > 0
             ORDER BY m.timestamp DESC, m.seq DESC
             LIMIT ?2",
            placeholders(3, conversations.len())
        );

        let mut values = vec![Value::Text(term.to_string()), Value::Integer(i64::from(limit))];
        values.extend(conversations.iter().map(|id| Value::Text(id.to_string())));

        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), row_to_message)?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// How many messages in the same conversation are strictly newer.
    pub fn count_newer_than(&self, message: &Message) -> Result<u64> {
        self.count_messages_after(message.conversation_id, message.timestamp)
    }

    /// Up to `range` messages on each side of `message`, plus the message
    /// itself, in chronological order.
    pub fn messages_around(&self, message: &Message, range: u32) -> Result<Vec<Message>> {
        let conversation = message.conversation_id.to_string();
        let ts = to_millis(message.timestamp);
        let id = message.id.to_string();
        let range = i64::from(range);

        let mut before = self.query_messages(
            &format!(
                "{MESSAGE_SELECT}
                 WHERE m.conversation_id = ?1
                   AND (m.timestamp < ?2
                        OR (m.timestamp = ?2 AND m.seq < (SELECT seq FROM messages WHERE id = ?3)))
                 ORDER BY m.timestamp DESC, m.seq DESC
                 LIMIT ?4"
            ),
            params![conversation, ts, id, range],
        )?;
        before.reverse();

        let after = self.query_messages(
            &format!(
                "{MESSAGE_SELECT}
                 WHERE m.conversation_id = ?1
                   AND (m.timestamp > ?2
                        OR (m.timestamp = ?2 AND m.seq > (SELECT seq FROM messages WHERE id = ?3)))
                 ORDER BY m.timestamp ASC, m.seq ASC
                 LIMIT ?4"
            ),
            params![conversation, ts, id, range],
        )?;

        let mut window = before;
        window.push(message.clone());
        window.extend(after);
        Ok(window)
    }

    fn query_messages(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(sql)?;
        let rows = stmt.query_map(params, row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }
}

/// Flattened column values of a [`MessageBody`].
#[derive(Default)]
struct BodyColumns {
    content: Option<String>,
    image_url: Option<String>,
    file_name: Option<String>,
    file_size: Option<i64>,
    file_mime: Option<String>,
    file_url: Option<String>,
    action: Option<String>,
    effect: Option<String>,
}

impl BodyColumns {
    fn from_body(body: &MessageBody) -> Result<Self> {
        Ok(match body {
            MessageBody::Text { content } => BodyColumns {
                content: Some(content.clone()),
                ..Default::default()
            },
            MessageBody::Image { image_url } => BodyColumns {
                image_url: Some(image_url.clone()),
                ..Default::default()
            },
            MessageBody::File(file) => BodyColumns {
                file_name: Some(file.name.clone()),
                file_size: Some(i64::try_from(file.size).unwrap_or(i64::MAX)),
                file_mime: Some(file.mime.clone()),
                file_url: Some(file.url.clone()),
                ..Default::default()
            },
            MessageBody::System { action, effect } => BodyColumns {
                action: Some(action.clone()),
                effect: Some(serde_json::to_string(effect)?),
                ..Default::default()
            },
        })
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id: String = row.get(0)?;
    let conversation_id: String = row.get(1)?;
    let sender_id: String = row.get(2)?;
    let kind: String = row.get(3)?;
    let timestamp: i64 = row.get(12)?;
    let read_by: Option<String> = row.get(13)?;

    let body = match MessageKind::parse(&kind).map_err(|e| conversion_err(3, e))? {
        MessageKind::Text => MessageBody::Text {
            content: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        },
        MessageKind::Image => MessageBody::Image {
            image_url: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        },
        MessageKind::File => MessageBody::File(FileMetadata {
            name: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
            size: row.get::<_, Option<i64>>(7)?.unwrap_or(0).max(0) as u64,
            mime: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
            url: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
        }),
        MessageKind::System => {
            let raw: String = row.get(11)?;
            let effect: SystemEffect =
                serde_json::from_str(&raw).map_err(|e| conversion_err(11, e))?;
            MessageBody::System {
                action: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
                effect,
            }
        }
    };

    let read_by = match read_by {
        Some(list) => list
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| parse_uuid(13, s).map(UserId))
            .collect::<rusqlite::Result<Vec<_>>>()?,
        None => Vec::new(),
    };

    Ok(Message {
        id: MessageId(parse_uuid(0, &id)?),
        conversation_id: ConversationId(parse_uuid(1, &conversation_id)?),
        sender: UserId(parse_uuid(2, &sender_id)?),
        body,
        timestamp: from_millis(timestamp),
        read_by,
    })
}
