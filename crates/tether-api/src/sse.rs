//! Server-Sent Events endpoint for live scheduler activity.
//!
//! Subscribes to the broadcast `EventBus` and forwards each `PipelineEvent`
//! as a JSON-encoded SSE event:
//! ```text
//! event: pipeline_event
//! data: {"timestamp":"...","kind":{"InterruptRaised":{...}}}
//!
//! ```
//!
//! An optional `?task=TASK-0007` query narrows the stream to one task.

use axum::{
    extract::{Query, State},
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, Sse},
    },
};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tether_core::task::TaskId;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::{ApiState, AppError, parse_id};

#[derive(Deserialize)]
pub(crate) struct StreamQuery {
    task: Option<String>,
}

/// GET /api/v1/events/stream
///
/// Keep-alive comments go out every 15 seconds. A client that falls behind
/// gets a `lagged` event with the number of skipped events.
pub(crate) async fn event_stream(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<StreamQuery>,
) -> Result<impl IntoResponse, AppError> {
    let only: Option<TaskId> = query.task.as_deref().map(parse_id).transpose()?;
    let stream = BroadcastStream::new(state.event_bus.subscribe());

    let sse_stream = stream.filter_map(move |result| match result {
        Ok(event) => {
            if only.is_some() && event.task_id() != only {
                return None;
            }
            let json = serde_json::to_string(&event).ok()?;
            Some(Ok::<_, Infallible>(
                Event::default().event("pipeline_event").data(json),
            ))
        }
        Err(BroadcastStreamRecvError::Lagged(n)) => {
            tracing::debug!(skipped = n, "SSE client lagged, skipping events");
            Some(Ok(Event::default()
                .event("lagged")
                .data(format!("{{\"skipped\":{n}}}"))))
        }
    });

    Ok(Sse::new(sse_stream).keep_alive(KeepAlive::default()))
}
