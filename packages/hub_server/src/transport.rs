use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};
use group_hub::{Attachment, Outbound, Outbox, Session, parse_close_message};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::AppState;

/// Map a queued hub frame onto a websocket message.
fn to_ws_message(frame: Outbound) -> Message {
    match frame {
        Outbound::Message(bytes) => match String::from_utf8(bytes) {
            Ok(text) => Message::Text(text.into()),
            Err(e) => Message::Binary(e.into_bytes().into()),
        },
        Outbound::Close(payload) => Message::Close(parse_close_message(&payload).map(
            |(code, reason)| CloseFrame {
                code,
                reason: reason.into(),
            },
        )),
    }
}

/// Drive one upgraded socket for its whole lifetime.
///
/// Registers the session with the hub, forwards queued frames until either
/// side closes, then reports the disconnect.
pub async fn serve_socket(socket: WebSocket, attachment: Attachment, state: AppState) {
    let (session, outbound) = Session::new(attachment);
    state.metrics.connection_opened();
    state.hub.handle_connect(session.clone()).await;

    pump(socket, &session, outbound, &state).await;

    state.hub.handle_disconnect(&session).await;
    state.metrics.connection_closed();
    debug!(
        group = session.group(),
        id = session.attachment().id(),
        "websocket closed"
    );
}

async fn pump(
    socket: WebSocket,
    session: &Arc<Session>,
    mut outbound: Outbox,
    state: &AppState,
) {
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                let closing = matches!(frame, Outbound::Close(_));
                if let Err(e) = sender.send(to_ws_message(frame)).await {
                    debug!(session_id = %session.id(), "websocket send failed: {}", e);
                    state.metrics.websocket_error();
                    break;
                }
                if closing {
                    break;
                }
                state.metrics.message_sent();
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(session_id = %session.id(), "websocket error: {}", e);
                        state.metrics.websocket_error();
                        break;
                    }
                    // Clients only listen; anything they send is dropped.
                    Some(Ok(_)) => state.metrics.message_received(),
                }
            }
        }
    }
}
