// Server-sent events live feed: one `data: <record json>` event per newer record.

use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures_util::Stream;
use std::convert::Infallible;

use super::{ApiError, AppState, FeedQuery};

/// GET /api/metrics/stream?agent_id=. Ends when the client disconnects (the
/// feed notices the dropped receiver) or on server shutdown.
pub(super) async fn metrics_stream(
    State(state): State<AppState>,
    Query(query): Query<FeedQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let agent_id = query.required_agent_id()?;
    tracing::info!(agent_id = %agent_id, "Client connected to live stream (sse)");

    let rx = state
        .distribution
        .subscribe(agent_id, state.shutdown.child_token());
    let events = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|update| (Ok::<_, Infallible>(Event::default().data(update.payload)), rx))
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
