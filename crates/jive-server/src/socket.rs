//! WebSocket transport.
//!
//! The handshake is authenticated before the upgrade. After that each
//! connection runs two halves: a writer task draining the connection's
//! outbound queue, and a reader loop that decodes frames and hands them to
//! the engine one at a time.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use jive_shared::protocol::{ClientEvent, ErrorNotice, ServerEvent};
use jive_shared::UserId;
use jive_store::User;
use tracing::{debug, error, info, warn};

use crate::api::AppState;
use crate::auth::bearer_token;
use crate::engine::ChatEngine;
use crate::error::{ChatError, ServerError};
use crate::presence::ConnectionHandle;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Response, ServerError> {
    let user = authenticate(&state, params.get("token").map(String::as_str), &headers).await?;
    info!(user = %user.id, name = %user.name, "websocket connection established");
    Ok(ws.on_upgrade(move |socket| connection_loop(socket, user, state)))
}

/// Resolve the handshake token to a directory user.
async fn authenticate(
    state: &AppState,
    query_token: Option<&str>,
    headers: &HeaderMap,
) -> Result<User, ServerError> {
    let Some(token) = bearer_token(query_token, headers) else {
        warn!("handshake without token");
        return Err(ServerError::Unauthorized("missing authentication token".into()));
    };

    let user_id = state.verifier.verify(&token).map_err(|e| {
        warn!(error = %e, "handshake rejected");
        e
    })?;

    match state.engine.find_user(user_id).await {
        Ok(user) => Ok(user),
        Err(ChatError::NotFound(_)) => {
            warn!(user = %user_id, "token for unknown user");
            Err(ServerError::Unauthorized("unknown user".into()))
        }
        Err(e) => Err(ServerError::Internal(e.to_string())),
    }
}

async fn connection_loop(socket: WebSocket, user: User, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (handle, mut outbound) = ConnectionHandle::channel();
    let connection = handle.id();

    let writer = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            let text = match event.to_json() {
                Ok(text) => text,
                Err(e) => {
                    error!(error = %e, "failed to encode server event");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    if let Err(e) = state.engine.on_connect(&user, handle.clone()).await {
        report(&handle, &e);
    }

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if !state.event_limiter.check(user.id).await {
                    warn!(user = %user.id, "event rate limit exceeded");
                    handle.send(ServerEvent::Error(ErrorNotice {
                        message: "Rate limited".into(),
                        details: "too many events, slow down".into(),
                    }));
                    continue;
                }
                handle_frame(&state.engine, user.id, &handle, &text).await;
            }
            Ok(Message::Close(_)) => {
                debug!(user = %user.id, "close frame received");
                break;
            }
            // Pings are answered by the transport.
            Ok(_) => {}
            Err(e) => {
                warn!(user = %user.id, error = %e, "websocket error");
                break;
            }
        }
    }

    state.engine.on_disconnect(user.id, connection).await;
    writer.abort();
    info!(user = %user.id, %connection, "websocket connection closed");
}

/// Decode and dispatch one frame. Any failure, including a panicking
/// handler, becomes an error event on this connection only.
async fn handle_frame(engine: &Arc<ChatEngine>, user: UserId, origin: &ConnectionHandle, text: &str) {
    let event = match ClientEvent::from_json(text) {
        Ok(event) => event,
        Err(e) => {
            report(origin, &ChatError::Validation(format!("malformed event: {e}")));
            return;
        }
    };
    let name = event.name();
    debug!(user = %user, event = name, "client event");

    let task = {
        let engine = engine.clone();
        let origin = origin.clone();
        tokio::spawn(async move { engine.dispatch(user, &origin, event).await })
    };

    match task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => report(origin, &e),
        Err(e) => {
            error!(user = %user, event = name, error = %e, "event handler aborted");
            report(origin, &ChatError::Storage("internal error".into()));
        }
    }
}

fn report(origin: &ConnectionHandle, error: &ChatError) {
    match error {
        ChatError::Storage(_) => error!(error = %error, "chat operation failed"),
        _ => warn!(error = %error, "chat operation rejected"),
    }
    origin.send(ServerEvent::Error(ErrorNotice {
        message: error.label().to_string(),
        details: error.to_string(),
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tests::issue;
    use crate::config::ServerConfig;
    use crate::engine::testing::{drain, Harness};
    use axum::http::HeaderValue;

    fn far_future() -> u64 {
        (chrono::Utc::now().timestamp() + 3600) as u64
    }

    #[tokio::test]
    async fn test_authenticate_accepts_query_or_header_token() {
        let h = Harness::new();
        let alice = h.user("alice").await;
        let config = ServerConfig::default();
        let token = issue(&config.jwt_secret, alice.id, far_future());
        let state = AppState::new(h.engine.clone(), config);

        let user = authenticate(&state, Some(&token), &HeaderMap::new()).await.unwrap();
        assert_eq!(user.id, alice.id);

        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_str(&format!("Bearer {token}")).unwrap());
        let user = authenticate(&state, None, &headers).await.unwrap();
        assert_eq!(user.id, alice.id);
    }

    #[tokio::test]
    async fn test_authenticate_rejects_bad_handshakes() {
        let h = Harness::new();
        let config = ServerConfig::default();
        let stranger = issue(&config.jwt_secret, UserId::new(), far_future());
        let forged = issue("some-other-secret", UserId::new(), far_future());
        let state = AppState::new(h.engine.clone(), config);

        for token in [None, Some(stranger.as_str()), Some(forged.as_str())] {
            let err = authenticate(&state, token, &HeaderMap::new()).await.unwrap_err();
            assert!(matches!(err, ServerError::Unauthorized(_)), "{err:?}");
        }
    }

    #[tokio::test]
    async fn test_bad_frames_become_error_events() {
        let h = Harness::new();
        let alice = h.user("alice").await;
        let (handle, mut rx) = h.connect(&alice).await;

        handle_frame(&h.engine, alice.id, &handle, "not json").await;
        let unknown = format!(
            r#"{{"event":"read-message","data":{{"conversationId":"{}"}}}}"#,
            jive_shared::ConversationId::new()
        );
        handle_frame(&h.engine, alice.id, &handle, &unknown).await;

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        match (&events[0], &events[1]) {
            (ServerEvent::Error(malformed), ServerEvent::Error(missing)) => {
                assert_eq!(malformed.message, "Invalid request");
                assert_eq!(missing.message, "Not found");
            }
            other => panic!("unexpected events: {other:?}"),
        }

        // The connection keeps working after a failure.
        assert!(h.engine.presence().lookup(alice.id).await.is_some());
    }
}
