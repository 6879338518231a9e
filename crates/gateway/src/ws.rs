//! WebSocket endpoint.
//!
//! Flow:
//! 1. Client connects to `GET /ws` and sends `hello` with its protocol
//!    version and initial subscriptions.
//! 2. Unsupported versions get `unsupported_protocol_version` and a close.
//! 3. The connection registers with the hub; an outbound pump drains its
//!    bounded channel into the socket (flagging `desync` after drops).
//! 4. Inbound `text_input` and `control` messages route into the hub.
//!
//! Disconnects drop subscriptions only; active runs keep going.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};

use crate::protocol::{
    ClientMessage, ControlAction, ErrorBody, ServerMessage, PROTOCOL_VERSION,
};
use crate::state::AppState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    // ── Handshake ──────────────────────────────────────────────────
    let hello = match wait_for_hello(&mut stream).await {
        Some(h) => h,
        None => {
            tracing::debug!("connection closed before hello");
            return;
        }
    };
    let (protocol_version, subscriptions) = hello;
    if protocol_version != PROTOCOL_VERSION {
        let _ = send_json(
            &mut sink,
            &ServerMessage::Error(ErrorBody {
                code: "unsupported_protocol_version".into(),
                message: format!(
                    "protocol version {protocol_version} is not supported (server speaks {PROTOCOL_VERSION})"
                ),
                details: None,
            }),
        )
        .await;
        let _ = sink.close().await;
        return;
    }

    let (handle, mut rx) = state.hub.subs.register();
    for session_id in &subscriptions {
        state.hub.subscribe_connection(session_id, handle.id);
    }
    handle.push(ServerMessage::Subscribed {
        session_ids: subscriptions,
    });
    tracing::info!(connection_id = handle.id, "client connected");

    // ── Outbound pump ──────────────────────────────────────────────
    let pump_handle = handle.clone();
    let pump = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if send_json(&mut sink, &msg).await.is_err() {
                break;
            }
            if pump_handle.take_desynced() {
                if send_json(&mut sink, &ServerMessage::Desync).await.is_err() {
                    break;
                }
            }
        }
    });

    // ── Inbound loop ───────────────────────────────────────────────
    while let Some(Ok(frame)) = stream.next().await {
        let text = match frame {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let msg: ClientMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                handle.push(ServerMessage::Error(ErrorBody {
                    code: "invalid_event".into(),
                    message: format!("unparseable client message: {e}"),
                    details: None,
                }));
                continue;
            }
        };

        match msg {
            ClientMessage::TextInput { session_id, text } => {
                // Make sure the sender sees this session's stream.
                state.hub.subscribe_connection(&session_id, handle.id);
                if let Err(e) = state
                    .hub
                    .handle_text_input(&session_id, &text, Some(handle.id))
                    .await
                {
                    tracing::warn!(%session_id, code = e.code(), error = %e, "text input rejected");
                    handle.push(ServerMessage::Error(ErrorBody::from_error(&e)));
                }
            }
            ClientMessage::Control { action: ControlAction::Cancel, .. } => {
                for session_id in state.hub.subs.sessions_of(handle.id) {
                    if state.hub.cancel_active_run(&session_id) {
                        tracing::debug!(%session_id, "client cancelled active run");
                    }
                }
            }
            ClientMessage::Subscribe { session_id } => {
                state.hub.subscribe_connection(&session_id, handle.id);
                handle.push(ServerMessage::Subscribed {
                    session_ids: vec![session_id],
                });
            }
            ClientMessage::Hello { .. } => {
                // Duplicate hello after the handshake is a no-op.
            }
        }
    }

    state.hub.subs.unregister(handle.id);
    pump.abort();
    tracing::info!(connection_id = handle.id, "client disconnected");
}

async fn wait_for_hello(
    stream: &mut (impl futures_util::Stream<Item = Result<Message, axum::Error>> + Unpin),
) -> Option<(u32, Vec<String>)> {
    while let Some(Ok(frame)) = stream.next().await {
        let text = match frame {
            Message::Text(text) => text,
            Message::Close(_) => return None,
            _ => continue,
        };
        if let Ok(ClientMessage::Hello { protocol_version, subscriptions }) =
            serde_json::from_str(&text)
        {
            let session_ids = subscriptions.map(|s| s.session_ids()).unwrap_or_default();
            return Some((protocol_version, session_ids));
        }
        // Anything before hello is ignored.
    }
    None
}

async fn send_json(
    sink: &mut SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(msg).unwrap_or_else(|_| "{}".to_owned());
    sink.send(Message::Text(json)).await
}
