//! Images queued for deletion by the storage cleanup job.

use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use crate::database::Database;
use crate::error::Result;
use crate::models::{from_millis, parse_uuid, to_millis, ImageRemoval};

impl Database {
    /// Queue `image_url` for deletion on behalf of `reference_id` (the
    /// conversation that used it). Returns `false` if already queued.
    pub fn mark_image_for_removal(
        &self,
        image_url: &str,
        reference_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO image_removals (id, image_url, reference_id, marked_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![Uuid::new_v4().to_string(), image_url, reference_id, to_millis(at)],
        )?;
        Ok(affected > 0)
    }

    /// All queued removals, oldest first.
    pub fn list_image_removals(&self) -> Result<Vec<ImageRemoval>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, image_url, reference_id, marked_at
             FROM image_removals
             ORDER BY marked_at ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            let marked_at: i64 = row.get(3)?;
            Ok(ImageRemoval {
                id: parse_uuid(0, &id)?,
                image_url: row.get(1)?,
                reference_id: row.get(2)?,
                marked_at: from_millis(marked_at),
            })
        })?;

        let mut removals = Vec::new();
        for row in rows {
            removals.push(row?);
        }
        Ok(removals)
    }
}
