// WebSocket live feed: same poll-and-push feed as SSE, one text frame per newer record.

use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{Duration, timeout};

use super::{AppState, FeedQuery};
use crate::distribution::LiveUpdate;

pub(super) const WS_PING_INTERVAL: Duration = Duration::from_secs(30);
pub(super) const WS_SEND_TIMEOUT: Duration = Duration::from_secs(10);

pub(super) async fn ws_metrics(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<FeedQuery>,
) -> Response {
    let agent_id = match query.required_agent_id() {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };
    ws.on_upgrade(move |socket| async move {
        tracing::info!(agent_id = %agent_id, "Client connected to live stream (ws)");
        let rx = state
            .distribution
            .subscribe(agent_id.clone(), state.shutdown.child_token());
        stream_metrics(socket, rx).await;
        tracing::info!(agent_id = %agent_id, "Client left live stream (ws)");
    })
}

/// Forward feed updates until the feed ends or a send fails. Returning drops the
/// receiver, which stops the feed.
async fn stream_metrics(mut socket: WebSocket, mut rx: mpsc::Receiver<LiveUpdate>) {
    let mut ping_interval = tokio::time::interval_at(
        tokio::time::Instant::now() + WS_PING_INTERVAL,
        WS_PING_INTERVAL,
    );
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            update = rx.recv() => {
                let Some(update) = update else {
                    let _ = timeout(WS_SEND_TIMEOUT, socket.send(Message::Close(None))).await;
                    break;
                };
                let r = timeout(WS_SEND_TIMEOUT, socket.send(Message::Text(update.payload.into()))).await;
                if r.is_err() || r.unwrap_or(Ok(())).is_err() {
                    break;
                }
            }
            _ = ping_interval.tick() => {
                let r = timeout(WS_SEND_TIMEOUT, socket.send(Message::Ping(Bytes::new()))).await;
                if r.is_err() || r.unwrap_or(Ok(())).is_err() {
                    break;
                }
            }
        }
    }
}
