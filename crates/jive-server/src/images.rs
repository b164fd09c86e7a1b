//! Deferred image removal.
//!
//! Replaced group avatars are not deleted inline. They are queued for the
//! storage cleanup job through an [`ImageStorage`] implementation.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use jive_store::{Database, StoreError};
use tokio::sync::Mutex;

#[async_trait]
pub trait ImageStorage: Send + Sync {
    /// Queue `image_url`, previously used by `reference_id`, for deletion.
    async fn mark_for_removal(&self, image_url: &str, reference_id: &str) -> Result<(), StoreError>;
}

/// Queues removals in the chat database's `image_removals` table.
pub struct StoreImageStorage {
    db: Arc<Mutex<Database>>,
}

impl StoreImageStorage {
    pub fn new(db: Arc<Mutex<Database>>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ImageStorage for StoreImageStorage {
    async fn mark_for_removal(&self, image_url: &str, reference_id: &str) -> Result<(), StoreError> {
        let queued = self
            .db
            .lock()
            .await
            .mark_image_for_removal(image_url, reference_id, Utc::now())?;
        if !queued {
            tracing::debug!(url = image_url, reference = reference_id, "image already queued for removal");
        }
        Ok(())
    }
}

/// Fire-and-forget removal. Failures are logged, never surfaced.
pub fn spawn_mark_for_removal(storage: Arc<dyn ImageStorage>, image_url: String, reference_id: String) {
    tokio::spawn(async move {
        match storage.mark_for_removal(&image_url, &reference_id).await {
            Ok(()) => tracing::info!(url = %image_url, reference = %reference_id, "marked old image for removal"),
            Err(e) => tracing::error!(url = %image_url, error = %e, "failed to mark image for removal"),
        }
    });
}
