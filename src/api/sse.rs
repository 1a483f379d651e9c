//! Server-Sent Events for streamed completions

use super::types::ChatCompletionChunk;
use crate::runner::{TurnError, TurnResult};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream, StreamExt};
use serde::Serialize;
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::DropGuard;

/// Identity shared by every chunk of one completion
pub struct ChunkMeta {
    pub id: String,
    pub created: i64,
    pub model: String,
}

/// Turn a running completion into an SSE response.
///
/// Emits the role chunk, one chunk per delta, then either the closing chunk
/// or an error frame, and finally `[DONE]`. `cancel_guard` lives as long as
/// the response stream, so a client disconnect cancels the turn.
pub fn completion_stream(
    meta: ChunkMeta,
    deltas: mpsc::UnboundedReceiver<String>,
    outcome: oneshot::Receiver<Result<TurnResult, TurnError>>,
    cancel_guard: DropGuard,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let opening = stream::once(futures::future::ready(json_event(
        &ChatCompletionChunk::role(&meta.id, meta.created, &meta.model),
    )));

    let content = {
        let id = meta.id.clone();
        let model = meta.model.clone();
        let created = meta.created;
        UnboundedReceiverStream::new(deltas).map(move |text| {
            json_event(&ChatCompletionChunk::content(&id, created, &model, text))
        })
    };

    let closing = stream::once(async move {
        let _guard = cancel_guard;
        match outcome.await {
            Ok(Ok(result)) => json_event(&ChatCompletionChunk::finish(
                &meta.id,
                meta.created,
                &meta.model,
                &result,
            )),
            Ok(Err(e)) => error_event(e.kind(), &e.to_string()),
            Err(_) => error_event("internal_error", "turn ended without a result"),
        }
    });

    let done = stream::once(futures::future::ready(Event::default().data("[DONE]")));

    let events = opening.chain(content).chain(closing).chain(done).map(Ok);

    Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

fn json_event<T: Serialize>(payload: &T) -> Event {
    match serde_json::to_string(payload) {
        Ok(data) => Event::default().data(data),
        Err(e) => error_event("internal_error", &e.to_string()),
    }
}

fn error_event(kind: &str, message: &str) -> Event {
    Event::default().data(
        json!({
            "error": {
                "message": message,
                "type": kind,
            }
        })
        .to_string(),
    )
}
