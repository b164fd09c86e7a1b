//! User directory access.
//!
//! Accounts are created by the external account system; the chat engine
//! reads profiles and records `last_seen` when a user disconnects.

use chrono::{DateTime, Utc};
use jive_shared::{Role, UserId};
use rusqlite::{params, params_from_iter};

use crate::database::{placeholders, Database};
use crate::error::{Result, StoreError};
use crate::models::{from_millis, parse_uuid, to_millis, User};

const USER_COLUMNS: &str = "id, name, avatar_url, role, last_seen, created_at";

impl Database {
    /// Insert a user or refresh the profile fields of an existing one.
    pub fn upsert_user(&self, user: &User) -> Result<()> {
        self.conn().execute(
            "INSERT INTO users (id, name, avatar_url, role, last_seen, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 avatar_url = excluded.avatar_url,
                 role = excluded.role",
            params![
                user.id.to_string(),
                user.name,
                user.avatar_url,
                user.role.as_str(),
                user.last_seen.map(to_millis),
                to_millis(user.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_user(&self, id: UserId) -> Result<User> {
        self.conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id.to_string()],
                row_to_user,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Batch lookup. Unknown ids are skipped; order follows `ids`.
    pub fn get_users(&self, ids: &[UserId]) -> Result<Vec<User>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id IN ({})",
            placeholders(1, ids.len())
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(ids.iter().map(|id| id.to_string())), row_to_user)?;

        let mut found = Vec::new();
        for row in rows {
            found.push(row?);
        }

        let mut ordered = Vec::with_capacity(found.len());
        for id in ids {
            if ordered.iter().any(|u: &User| u.id == *id) {
                continue;
            }
            if let Some(pos) = found.iter().position(|u| u.id == *id) {
                ordered.push(found.swap_remove(pos));
            }
        }
        Ok(ordered)
    }

    /// All users, ordered by name.
    pub fn list_users(&self) -> Result<Vec<User>> {
        let mut stmt = self
            .conn()
            .prepare(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY name ASC"))?;
        let rows = stmt.query_map([], row_to_user)?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }

    /// Record when a user was last connected. Returns `false` for unknown users.
    pub fn set_last_seen(&self, id: UserId, at: DateTime<Utc>) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE users SET last_seen = ?1 WHERE id = ?2",
            params![to_millis(at), id.to_string()],
        )?;
        Ok(affected > 0)
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let id_str: String = row.get(0)?;
    let name: String = row.get(1)?;
    let avatar_url: String = row.get(2)?;
    let role: String = row.get(3)?;
    let last_seen: Option<i64> = row.get(4)?;
    let created_at: i64 = row.get(5)?;

    Ok(User {
        id: UserId(parse_uuid(0, &id_str)?),
        name,
        avatar_url,
        last_seen: last_seen.map(from_millis),
        role: Role::from_name(&role),
        created_at: from_millis(created_at),
    })
}
