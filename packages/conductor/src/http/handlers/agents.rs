use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::instrument;

use conductor_types::{AgentId, ClientEnvelope, ClientFrame};

use crate::http::state::HttpState;
use crate::subsystems::session::SessionManager;

/// Dispatch-stream endpoint: one WebSocket per agent, bridged onto the
/// session manager's channel pair.
#[instrument(level = "debug", skip(state, ws))]
pub async fn handle_agent_session(
    State(state): State<HttpState>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| agent_session(state, socket))
}

async fn agent_session(state: HttpState, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (inbound_tx, inbound_rx) = mpsc::channel::<ClientEnvelope>(64);
    let (outbound_tx, mut outbound_rx) = mpsc::channel(SessionManager::outbound_buffer());

    let sessions = state.control.sessions.clone();
    let session = tokio::spawn(async move {
        sessions.run_session(inbound_rx, outbound_tx).await;
    });

    // writer half: server frames out as JSON text
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(err) => {
                    tracing::error!("failed to encode server frame: {err}");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    // reader half: parse frames, remember who this is, watch for the
    // explicit close that takes the agent offline immediately
    let mut agent_id: Option<AgentId> = None;
    let mut explicit_close = false;
    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientEnvelope>(&text) {
                Ok(envelope) => {
                    if let ClientFrame::Register {
                        agent_id: registered,
                        ..
                    } = &envelope.frame
                    {
                        agent_id = Some(*registered);
                    }
                    if inbound_tx.send(envelope).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!("undecodable client frame: {err}");
                    break;
                }
            },
            Ok(Message::Close(_)) => {
                explicit_close = true;
                break;
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
    drop(inbound_tx);

    if explicit_close {
        if let Some(agent_id) = agent_id {
            state.control.sessions.explicit_disconnect(agent_id).await;
        }
    }

    let _ = session.await;
    let _ = writer.await;
}
