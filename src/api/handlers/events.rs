//! Operation event stream via Server-Sent Events.

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use serde_json::json;
use std::convert::Infallible;
use tokio::sync::broadcast;

use crate::api::AppState;
use crate::error::Result;
use crate::services::oplog_service::OpEvent;

/// Stream operation log events.
///
/// Late subscribers must also query: the stream starts at subscription
/// time. A `lagged` event means the client fell behind the buffer and must
/// requery before trusting the stream again.
#[utoipa::path(
    get,
    path = "/events/operations",
    context_path = "/api/v1",
    tag = "events",
    responses((status = 200, description = "SSE stream of operation events"))
)]
pub async fn operation_events(
    State(state): State<AppState>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let mut rx = state.oplog.subscribe();

    let stream = async_stream::stream! {
        yield Ok(Event::default().event("connected").data(r#"{"status":"ok"}"#));

        loop {
            match rx.recv().await {
                Ok(op_event) => {
                    let (name, data) = match op_event {
                        OpEvent::Created(op) => (
                            "operation.created",
                            serde_json::to_string(&op).unwrap_or_default(),
                        ),
                        OpEvent::Updated(op) => (
                            "operation.updated",
                            serde_json::to_string(&op).unwrap_or_default(),
                        ),
                        OpEvent::Deleted(ids) => (
                            "operation.deleted",
                            json!({ "ids": ids }).to_string(),
                        ),
                        OpEvent::KeepAlive => ("keep_alive", "{}".to_string()),
                    };
                    yield Ok(Event::default().event(name).data(data));
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    yield Ok(Event::default()
                        .event("lagged")
                        .data(format!(r#"{{"missed":{missed}}}"#)));
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("ping"),
    ))
}
