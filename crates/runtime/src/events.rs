//! Events emitted while a turn is processed.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use policy::PermissionRequest;
use tokio::sync::mpsc;

use crate::model::{ToolCall, ToolResult};

/// Something that happened during a turn, in order.
///
/// Every turn ends with exactly one of `Done`, `Aborted` or
/// `RoundLimitExceeded`.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// Streamed assistant text.
    ContentDelta(String),
    ToolCallsRequested(Vec<ToolCall>),
    /// Emitted in the order the calls were requested.
    ToolResult(ToolResult),
    /// The user is being asked about a call.
    PermissionRequested(PermissionRequest),
    Done { text: String },
    Aborted { reason: String },
    RoundLimitExceeded { rounds: u32 },
}

impl TurnEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done { .. } | Self::Aborted { .. } | Self::RoundLimitExceeded { .. }
        )
    }
}

/// Producer side, owned by the loop for one turn.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<TurnEvent>,
}

impl EventSink {
    /// Send an event. A consumer that went away is not an error.
    pub fn emit(&self, event: TurnEvent) {
        let _ = self.tx.send(event);
    }
}

/// Consumer side. Ends once the sink is dropped.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<TurnEvent>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<TurnEvent> {
        self.rx.recv().await
    }

    /// Drain whatever is already queued without waiting.
    pub fn try_recv(&mut self) -> Option<TurnEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for EventStream {
    type Item = TurnEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Create a connected sink and stream.
pub fn event_channel() -> (EventSink, EventStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink { tx }, EventStream { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn stream_ends_when_sink_dropped() {
        let (sink, stream) = event_channel();
        sink.emit(TurnEvent::ContentDelta("hi".into()));
        sink.emit(TurnEvent::Done { text: "hi".into() });
        drop(sink);

        let events: Vec<_> = stream.collect().await;
        assert_eq!(events.len(), 2);
        assert!(!events[0].is_terminal());
        assert!(events[1].is_terminal());
    }

    #[test]
    fn emit_after_consumer_gone_is_silent() {
        let (sink, stream) = event_channel();
        drop(stream);
        sink.emit(TurnEvent::Aborted { reason: "x".into() });
    }
}
