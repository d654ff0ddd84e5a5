use axum::body::{Body, Bytes};
use futures::Stream;
use serde::Serialize;
use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// One line of a streamed response. Load streams emit `Progress` lines and
/// end with exactly one `Ok` or `Fail`; generation streams emit `Chunk`
/// lines with the same terminators. Cancellation ends a stream with `Ok`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum StreamEvent {
    Progress { module: usize, num_modules: usize },
    Chunk { text: String },
    Ok,
    Fail { error: String },
}

impl StreamEvent {
    /// Newline-delimited JSON, consumed incrementally by the browser.
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap();
        line.push('\n');
        line
    }
}

pub type EventSender = mpsc::UnboundedSender<StreamEvent>;

/// Channel for a streaming endpoint: the worker task sends events while it
/// holds the API gate, the receiving half feeds the response body.
pub fn event_channel() -> (EventSender, EventStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, EventStream { stream: UnboundedReceiverStream::new(rx) })
}

pub struct EventStream {
    stream: UnboundedReceiverStream<StreamEvent>,
}

impl EventStream {
    pub fn into_body(self) -> Body {
        Body::from_stream(self)
    }
}

impl Stream for EventStream {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.get_mut().stream).poll_next(cx) {
            Poll::Ready(Some(event)) => Poll::Ready(Some(Ok(Bytes::from(event.to_line())))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn test_wire_format() {
        assert_eq!(
            StreamEvent::Progress { module: 3, num_modules: 7 }.to_line(),
            "{\"result\":\"progress\",\"module\":3,\"num_modules\":7}\n"
        );
        assert_eq!(StreamEvent::Ok.to_line(), "{\"result\":\"ok\"}\n");
        assert_eq!(
            StreamEvent::Fail { error: "out of memory".to_string() }.to_line(),
            "{\"result\":\"fail\",\"error\":\"out of memory\"}\n"
        );
        assert_eq!(
            StreamEvent::Chunk { text: "hi".to_string() }.to_line(),
            "{\"result\":\"chunk\",\"text\":\"hi\"}\n"
        );
    }

    #[tokio::test]
    async fn test_events_flow_through_channel_in_order() {
        let (tx, mut stream) = event_channel();
        tx.send(StreamEvent::Progress { module: 0, num_modules: 2 }).unwrap();
        tx.send(StreamEvent::Progress { module: 1, num_modules: 2 }).unwrap();
        tx.send(StreamEvent::Ok).unwrap();
        drop(tx);

        let mut lines = String::new();
        while let Some(Ok(chunk)) = stream.next().await {
            lines.push_str(std::str::from_utf8(&chunk).unwrap());
        }
        let collected: Vec<&str> = lines.lines().collect();
        assert_eq!(collected.len(), 3);
        assert!(collected[0].contains("\"module\":0"));
        assert!(collected[1].contains("\"module\":1"));
        assert_eq!(collected[2], "{\"result\":\"ok\"}");
    }
}
