//! Server-sent event framing shared by the streaming clients.
//!
//! [`SseDecoder`] turns raw body bytes into frames. [`pump`] drives a
//! dialect-specific [`StreamState`] over a response body and forwards the
//! events it produces into the caller's sink.

use futures::StreamExt;
use pincer_core::error::ProviderError;
use pincer_core::provider::StreamEvent;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One dispatched event: optional `event:` name plus joined `data:` lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental decoder for `text/event-stream` bodies.
///
/// Bytes may be split anywhere, including inside a UTF-8 sequence; lines
/// are only decoded once complete.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of body bytes and collect every frame it completes.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(bytes);
        let mut frames = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(frame) = self.process_line(line) {
                frames.push(frame);
            }
        }

        frames
    }

    /// Flush whatever is pending when the body ends without a blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if !self.buffer.is_empty() {
            let raw = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches('\r').to_string();
            if let Some(frame) = self.process_line(&line) {
                return Some(frame);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame { event, data })
    }
}

/// Whether a stream should keep reading after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Stop,
}

/// Per-response parser state for one wire dialect.
///
/// Owned by exactly one streaming call and consumed by [`StreamState::finish`].
pub(crate) trait StreamState {
    /// Interpret one frame, pushing any events it yields.
    fn on_frame(
        &mut self,
        frame: SseFrame,
        events: &mut Vec<StreamEvent>,
    ) -> Result<Flow, ProviderError>;

    /// Build the terminal `done` event.
    fn finish(self) -> StreamEvent;
}

/// Read `response` to the end, feeding frames through `state` and
/// forwarding events into `sink`. Sends exactly one `done` on success.
pub(crate) async fn pump<S: StreamState>(
    provider: &str,
    response: reqwest::Response,
    mut state: S,
    sink: &mpsc::Sender<StreamEvent>,
    cancel: &CancellationToken,
) -> Result<(), ProviderError> {
    let mut body = response.bytes_stream();
    let mut decoder = SseDecoder::new();
    let mut events = Vec::new();
    let mut stopped = false;

    while !stopped {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            chunk = body.next() => chunk,
        };

        let frames = match chunk {
            Some(Ok(bytes)) => decoder.feed(&bytes),
            Some(Err(e)) => return Err(ProviderError::StreamInterrupted(e.to_string())),
            None => {
                stopped = true;
                decoder.finish().into_iter().collect()
            }
        };

        for frame in frames {
            if state.on_frame(frame, &mut events)? == Flow::Stop {
                stopped = true;
            }
            if !forward(provider, sink, &mut events).await {
                return Ok(());
            }
            if stopped {
                break;
            }
        }
    }

    if sink.send(state.finish()).await.is_err() {
        debug!(provider, "Stream receiver dropped before done");
    }
    Ok(())
}

/// Send buffered events; `false` when the receiver is gone.
async fn forward(
    provider: &str,
    sink: &mpsc::Sender<StreamEvent>,
    events: &mut Vec<StreamEvent>,
) -> bool {
    for event in events.drain(..) {
        if sink.send(event).await.is_err() {
            debug!(provider, "Stream receiver dropped");
            return false;
        }
    }
    true
}

/// Report a failed stream with one best-effort `error` event.
pub(crate) fn report_failure(
    sink: &mpsc::Sender<StreamEvent>,
    result: Result<(), ProviderError>,
) -> Result<(), ProviderError> {
    if let Err(e) = &result {
        let _ = sink.try_send(StreamEvent::Error {
            message: e.to_string(),
        });
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_data_frame() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed(b"data: {\"a\":1}\n\n");
        assert_eq!(
            frames,
            vec![SseFrame {
                event: None,
                data: "{\"a\":1}".into()
            }]
        );
    }

    #[test]
    fn named_event_frame() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed(b"event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("message_stop"));
        assert_eq!(frames[0].data, "{\"type\":\"message_stop\"}");
    }

    #[test]
    fn frames_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: hel").is_empty());
        assert!(decoder.feed(b"lo\r\n").is_empty());
        let frames = decoder.feed(b"\r\ndata: again\n\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, "hello");
        assert_eq!(frames[1].data, "again");
    }

    #[test]
    fn multibyte_character_split() {
        let mut decoder = SseDecoder::new();
        let text = "data: héllo\n\n".as_bytes();
        let (a, b) = text.split_at(8);
        assert!(decoder.feed(a).is_empty());
        let frames = decoder.feed(b);
        assert_eq!(frames[0].data, "héllo");
    }

    #[test]
    fn comments_and_unknown_fields_ignored() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed(b": keep-alive\nid: 7\nretry: 100\ndata:x\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "x");
    }

    #[test]
    fn multiline_data_joined() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed(b"data: one\ndata: two\n\n");
        assert_eq!(frames[0].data, "one\ntwo");
    }

    #[test]
    fn blank_lines_without_data_dispatch_nothing() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"\n\nevent: ping\n\n").is_empty());
    }

    #[test]
    fn finish_flushes_unterminated_frame() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: [DONE]").is_empty());
        let frame = decoder.finish().unwrap();
        assert_eq!(frame.data, "[DONE]");
        assert!(decoder.finish().is_none());
    }

    #[tokio::test]
    async fn failure_report_sends_error_event() {
        let (tx, mut rx) = mpsc::channel(4);
        let result = report_failure(&tx, Err(ProviderError::StreamInterrupted("reset".into())));
        assert!(result.is_err());
        drop(tx);

        match rx.recv().await {
            Some(StreamEvent::Error { message }) => assert!(message.contains("reset")),
            other => panic!("expected error event, got {other:?}"),
        }
        assert!(rx.recv().await.is_none());
    }
}
