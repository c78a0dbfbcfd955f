use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use tracing::instrument;

use conductor_types::Topic;

use crate::http::auth::BearerAuth;
use crate::http::state::HttpState;
use crate::http::types::SubscribeQuery;

/// Server-streaming subscription endpoint. Anonymous connections may only
/// watch `global`; everything else needs the configured token.
#[instrument(level = "debug", skip(state, ws))]
pub async fn handle_subscribe(
    State(state): State<HttpState>,
    Query(query): Query<SubscribeQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let topics: Result<Vec<Topic>, _> = query
        .topics
        .split(',')
        .map(str::trim)
        .filter(|topic| !topic.is_empty())
        .map(str::parse)
        .collect();
    let topics = match topics {
        Ok(topics) if !topics.is_empty() => topics,
        Ok(_) => return (StatusCode::BAD_REQUEST, "no topics requested").into_response(),
        Err(err) => return (StatusCode::BAD_REQUEST, format!("{err}")).into_response(),
    };

    if let Some(expected) = &state.config.bearer_token {
        let auth = BearerAuth::new(expected);
        let authorized = query
            .token
            .as_deref()
            .map(|token| auth.matches(token))
            .unwrap_or(false);
        if !authorized && topics.iter().any(|topic| *topic != Topic::Global) {
            return (
                StatusCode::UNAUTHORIZED,
                "anonymous subscribers may only watch the global topic",
            )
                .into_response();
        }
    }

    ws.on_upgrade(move |socket| subscriber_session(state, topics, socket))
}

async fn subscriber_session(state: HttpState, topics: Vec<Topic>, socket: WebSocket) {
    let mut subscription = state.control.bus.subscribe(topics);
    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            maybe = subscription.rx.recv() => {
                match maybe {
                    Some(event) => {
                        let text = match serde_json::to_string(&event) {
                            Ok(text) => text,
                            Err(err) => {
                                tracing::error!("failed to encode event: {err}");
                                continue;
                            }
                        };
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        // the bus dropped us for falling behind
                        let _ = ws_tx
                            .send(Message::Close(Some(CloseFrame {
                                code: 1013,
                                reason: "slow_consumer".into(),
                            })))
                            .await;
                        return;
                    }
                }
            }
            maybe = ws_rx.next() => {
                match maybe {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    state.control.bus.unsubscribe(subscription.id);
}
