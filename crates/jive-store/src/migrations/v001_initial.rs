//! v001 -- Initial schema creation.
//!
//! Creates the user directory, conversations with their participants and
//! read markers, and the message log with its read-by sets.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
///
/// All timestamps are unix milliseconds (UTC).
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users (directory)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id         TEXT PRIMARY KEY NOT NULL,   -- UUID
    name       TEXT NOT NULL,
    avatar_url TEXT NOT NULL,
    role       TEXT NOT NULL DEFAULT 'user',
    last_seen  INTEGER,
    created_at INTEGER NOT NULL
);

-- ----------------------------------------------------------------
-- Conversations
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    id               TEXT PRIMARY KEY NOT NULL,  -- UUID
    is_group         INTEGER NOT NULL,           -- boolean 0/1
    direct_key       TEXT UNIQUE,                -- "<min>:<max>" user pair, NULL for groups
    group_name       TEXT,
    group_avatar_url TEXT,
    group_admin      TEXT,
    group_created_at INTEGER,
    last_message_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS conversation_participants (
    conversation_id TEXT NOT NULL,               -- FK -> conversations(id)
    user_id         TEXT NOT NULL,
    position        INTEGER NOT NULL,            -- preserves participant order

    PRIMARY KEY (conversation_id, user_id),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_participants_user
    ON conversation_participants(user_id);

CREATE TABLE IF NOT EXISTS conversation_reads (
    conversation_id TEXT NOT NULL,               -- FK -> conversations(id)
    user_id         TEXT NOT NULL,
    last_read       INTEGER NOT NULL,

    PRIMARY KEY (conversation_id, user_id),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    seq             INTEGER PRIMARY KEY AUTOINCREMENT,  -- arrival order, breaks timestamp ties
    id              TEXT NOT NULL UNIQUE,               -- UUID
    conversation_id TEXT NOT NULL,                      -- FK -> conversations(id)
    sender_id       TEXT NOT NULL,
    kind            TEXT NOT NULL,                      -- text | image | file | system
    content         TEXT,
    image_url       TEXT,
    file_name       TEXT,
    file_size       INTEGER,
    file_mime       TEXT,
    file_url        TEXT,
    action          TEXT,
    effect          TEXT,                               -- JSON SystemEffect
    timestamp       INTEGER NOT NULL,

    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_ts
    ON messages(conversation_id, timestamp, seq);

CREATE TABLE IF NOT EXISTS message_reads (
    message_id TEXT NOT NULL,                    -- FK -> messages(id)
    user_id    TEXT NOT NULL,

    PRIMARY KEY (message_id, user_id),
    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
