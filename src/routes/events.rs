use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::app_state::AppState;
use crate::services::events::{EventHub, ServerEvent};

/// Registration that is released when the SSE stream is dropped.
struct Subscription {
    hub: Arc<EventHub>,
    client_id: String,
    rx: mpsc::Receiver<ServerEvent>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.rx.close();
        self.hub.release(&self.client_id);
    }
}

/// GET /api/events/{client_id}: server-sent progress events for one client.
pub async fn subscribe(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let hub = state.events().clone();
    let rx = hub.register(&client_id);
    tracing::info!(client_id = %client_id, "Event stream opened");

    let subscription = Subscription { hub, client_id, rx };
    let events = stream::unfold(subscription, |mut sub| async move {
        let event = sub.rx.recv().await?;
        let sse = Event::default()
            .event(event.event)
            .data(event.data.to_string());
        Some((Ok::<_, Infallible>(sse), sub))
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}
