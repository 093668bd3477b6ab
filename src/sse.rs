use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{BoxStream, Stream, StreamExt};

use crate::models::StreamEvent;

/// Serializes a `StreamEvent` sequence as `data: <json>\n\n`, `text/event-stream`.
/// The stream ends naturally once the pipeline yields `Done` or `Error` —
/// there is no explicit terminator frame, matching the teacher's
/// `chat_stream_handler` which relies on `Sse`'s own framing.
pub fn into_sse_response(
    events: BoxStream<'static, StreamEvent>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let frames = events.map(|event| {
        let json = serde_json::to_string(&event).unwrap_or_else(|_| {
            r#"{"type":"error","content":"event serialization failed","data":null}"#.to_string()
        });
        Ok(Event::default().data(json))
    });

    Sse::new(frames).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[tokio::test]
    async fn events_serialize_with_tagged_type() {
        let events: Vec<StreamEvent> = vec![StreamEvent::message("hi"), StreamEvent::Done];
        let boxed: BoxStream<'static, StreamEvent> = stream::iter(events).boxed();
        let _ = into_sse_response(boxed);
    }
}
