//! History pagination, read markers, typing indicators, search and
//! context windows.

use chrono::{DateTime, Utc};
use jive_shared::protocol::{
    page_for_position, FetchSurroundingMessages, MessagesResponse, PageInfo, RequestMessages,
    SearchHit, SearchMessages, SearchResults, ServerEvent, SurroundingMessages, TypingNotice,
    TypingUpdate,
};
use jive_shared::{ConversationId, UserId};

use super::{load_membership, message_views, not_found, ChatEngine};
use crate::error::ChatError;
use crate::presence::ConnectionHandle;

/// Upper bound on a client-requested context window.
const MAX_SURROUNDING_RANGE: u32 = 100;

impl ChatEngine {
    /// Answer `request-messages` with one page of already-read history and,
    /// on the first page, everything after the reader's marker.
    pub(super) async fn request_messages(
        &self,
        user: UserId,
        origin: &ConnectionHandle,
        req: RequestMessages,
    ) -> Result<(), ChatError> {
        let page_size = self.settings.page_size;

        let response = {
            let db = self.db.lock().await;
            let conversation = load_membership(&db, req.conversation_id, user)?;
            let last_read = conversation.last_read_for(user);

            let page = db.page_messages(conversation.id, req.page, page_size, last_read)?;
            let unread = if page.current_page == 1 {
                db.messages_after(conversation.id, last_read)?
            } else {
                Vec::new()
            };
            let first_unread = match unread.first() {
                Some(message) => Some(message.id),
                None => db.first_message_after(conversation.id, last_read)?.map(|m| m.id),
            };

            MessagesResponse {
                conversation_id: conversation.id,
                messages: message_views(&db, &page.messages, user)?,
                unread_messages: message_views(&db, &unread, user)?,
                page_info: PageInfo {
                    total_count: page.total_count,
                    total_pages: page.total_pages,
                    current_page: page.current_page,
                    first_unread_message_id: first_unread,
                    has_next_page: u64::from(page.current_page) < page.total_pages,
                },
            }
        };

        origin.deliver(ServerEvent::MessagesResponse(response)).await;
        Ok(())
    }

    /// Advance the caller's read marker to now. Never moves it backwards.
    pub(super) async fn mark_as_read(
        &self,
        user: UserId,
        conversation: ConversationId,
    ) -> Result<DateTime<Utc>, ChatError> {
        let db = self.db.lock().await;
        load_membership(&db, conversation, user)?;
        let marker = db.mark_conversation_read(conversation, user, Utc::now())?;
        tracing::debug!(user = %user, conversation = %conversation, "marked as read");
        Ok(marker)
    }

    pub(super) async fn typing(&self, user: UserId, req: TypingUpdate) -> Result<(), ChatError> {
        let participants = {
            let db = self.db.lock().await;
            load_membership(&db, req.conversation_id, user)?.participants
        };

        let notice = TypingNotice {
            conversation_id: req.conversation_id,
            user_id: user,
            typing: req.typing,
        };
        let events = participants
            .into_iter()
            .map(|participant| (participant, ServerEvent::Typing(notice.clone())))
            .collect();
        self.emit_all(events).await;
        Ok(())
    }

    /// Substring search over the caller's conversations. Each hit carries
    /// the history page it would appear on.
    pub(super) async fn search(
        &self,
        user: UserId,
        origin: &ConnectionHandle,
        req: SearchMessages,
    ) -> Result<(), ChatError> {
        let term = req.search_term.trim();
        if term.is_empty() {
            origin.deliver(ServerEvent::SearchResults(SearchResults { messages: Vec::new() })).await;
            return Ok(());
        }

        let hits = {
            let db = self.db.lock().await;
            let conversations = db.conversation_ids_for_user(user)?;
            let messages = db.search_messages(&conversations, term, self.settings.search_limit)?;
            let views = message_views(&db, &messages, user)?;

            let mut hits = Vec::with_capacity(messages.len());
            for (message, view) in messages.iter().zip(views) {
                let count_after = db.count_newer_than(message)?;
                hits.push(SearchHit {
                    message: view,
                    page: page_for_position(count_after, self.settings.page_size),
                    count_after,
                });
            }
            hits
        };

        tracing::debug!(user = %user, hits = hits.len(), "search");
        origin.deliver(ServerEvent::SearchResults(SearchResults { messages: hits })).await;
        Ok(())
    }

    /// Messages bracketing a search hit, oldest first.
    pub(super) async fn surrounding(
        &self,
        user: UserId,
        origin: &ConnectionHandle,
        req: FetchSurroundingMessages,
    ) -> Result<(), ChatError> {
        let range = req
            .range
            .unwrap_or(self.settings.surrounding_range)
            .min(MAX_SURROUNDING_RANGE);

        let messages = {
            let db = self.db.lock().await;
            let target = db
                .get_message(req.message_id)
                .map_err(|e| not_found("message", req.message_id, e))?;
            load_membership(&db, target.conversation_id, user)?;
            let window = db.messages_around(&target, range)?;
            message_views(&db, &window, user)?
        };

        origin
            .deliver(ServerEvent::SurroundingMessages(SurroundingMessages {
                message_id: req.message_id,
                messages,
            }))
            .await;
        Ok(())
    }
}
