use rusqlite::Connection;

const UP_SQL: &str = r#"
-- Images queued for deletion by the storage cleanup job
CREATE TABLE IF NOT EXISTS image_removals (
    id           TEXT PRIMARY KEY NOT NULL,  -- UUID
    image_url    TEXT NOT NULL,
    reference_id TEXT NOT NULL,              -- owning entity (e.g. group id)
    marked_at    INTEGER NOT NULL,

    UNIQUE (image_url, reference_id)
);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
