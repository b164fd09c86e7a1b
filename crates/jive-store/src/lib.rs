//! # jive-store
//!
//! Durable storage for the Jive chat engine, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for the user
//! directory, conversations, messages, and deferred image removals.
//! Related entities are never loaded implicitly: callers that need sender
//! profiles for a batch of messages ask for them with
//! [`Database::get_users`].

pub mod conversations;
pub mod database;
pub mod image_removals;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod users;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
