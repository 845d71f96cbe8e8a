use std::{convert::Infallible, time::Duration};

use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::{
        Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures_util::{SinkExt, StreamExt};
use kiln_core::{
    realtime::Subscription,
    types::{JobEvent, OwnerId},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::jobs::CategoryQuery;
use crate::infra::{app_state::AppState, owner::Owner};

fn default_keep_alive() -> KeepAlive {
    KeepAlive::new()
        .interval(Duration::from_secs(15))
        .text("keep-alive")
}

/// GET /api/v1/realtime/ws
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Owner(owner): Owner,
    Query(query): Query<CategoryQuery>,
) -> Response {
    // Subscribe before the upgrade so no update between handshake and first
    // poll is lost.
    let subscription = state.hub().subscribe(owner.clone(), query.category);
    let shutdown = state.shutdown.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, subscription, owner, shutdown))
}

async fn handle_socket(
    socket: WebSocket,
    mut subscription: Subscription,
    owner: OwnerId,
    shutdown: CancellationToken,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let subscriber = subscription.id();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(owner = %owner, %subscriber, "closing websocket for shutdown");
                break;
            }
            event = subscription.recv() => {
                // The hub drops subscribers that fall behind.
                let Some(event) = event else {
                    debug!(owner = %owner, %subscriber, "subscription closed by hub");
                    break;
                };
                let Ok(text) = serde_json::to_string(&event) else {
                    continue;
                };
                if ws_sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(owner = %owner, %subscriber, "websocket error: {e}");
                    break;
                }
            },
        }
    }

    let _ = ws_sender.close().await;
    debug!(owner = %owner, %subscriber, "websocket subscriber detached");
}

fn sse_event(event: &JobEvent) -> Option<Event> {
    let data = serde_json::to_string(event).ok()?;
    Some(Event::default().event(event.kind()).data(data))
}

/// GET /api/v1/realtime/events
pub async fn events_sse_handler(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Query(query): Query<CategoryQuery>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.hub().subscribe(owner, query.category);
    let shutdown = state.shutdown.clone().cancelled_owned();

    let stream = async_stream::stream! {
        let mut live = std::pin::pin!(subscription.into_stream().take_until(shutdown));
        while let Some(event) = live.next().await {
            if let Some(frame) = sse_event(&event) {
                yield Ok::<Event, Infallible>(frame);
            }
        }
    };

    Sse::new(stream).keep_alive(default_keep_alive())
}
