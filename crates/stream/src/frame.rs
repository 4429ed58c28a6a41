//! One push event (`event` name plus JSON `data`) and its conversion to axum's SSE event.
//!
//! `parse_frames` reads the `text/event-stream` wire form back, for clients and tests.

use axum::response::sse::Event;

/// An event as handed to a [`Transport`](crate::Transport). `event: None` is the
/// generic message event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    pub fn new(event: Option<&str>, data: impl Into<String>) -> Self {
        Self { event: event.map(str::to_string), data: data.into() }
    }

    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_str(&self.data).ok()
    }

    /// axum splits `data` on line feeds into several `data:` lines.
    pub fn into_event(self) -> Event {
        let mut event = Event::default();
        if let Some(name) = self.event {
            // a line break in the name would start a new field
            event = event.event(name.replace(['\n', '\r'], ""));
        }
        // SSE has no way to carry a bare carriage return
        event.data(self.data.replace('\r', ""))
    }
}

/// Drain complete blocks from `buf`, leaving any partial block in place.
pub fn parse_frames(buf: &mut String) -> Vec<SseFrame> {
    let mut out = Vec::new();
    while let Some(end) = buf.find("\n\n") {
        let block: String = buf.drain(..end + 2).collect();
        let mut event = None;
        let mut data: Vec<&str> = Vec::new();
        for line in block.lines() {
            if let Some(v) = line.strip_prefix("event:") {
                event = Some(v.trim_start().to_string());
            } else if let Some(v) = line.strip_prefix("data:") {
                data.push(v.strip_prefix(' ').unwrap_or(v));
            }
        }
        if event.is_some() || !data.is_empty() {
            out.push(SseFrame { event, data: data.join("\n") });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::sse::Sse;
    use axum::response::IntoResponse;
    use http_body_util::BodyExt;
    use std::convert::Infallible;

    async fn wire(frames: Vec<SseFrame>) -> String {
        let events = frames.into_iter().map(|f| Ok::<_, Infallible>(f.into_event()));
        let body = Sse::new(futures::stream::iter(events)).into_response().into_body();
        String::from_utf8(body.collect().await.unwrap().to_bytes().to_vec()).unwrap()
    }

    #[tokio::test]
    async fn named_and_generic_frames() {
        let mut text = wire(vec![SseFrame::new(Some("heartbeat"), "{}"), SseFrame::new(None, "{\"a\":1}")]).await;
        assert_eq!(text.matches("event:").count(), 1);
        let frames = parse_frames(&mut text);
        assert_eq!(frames, vec![SseFrame::new(Some("heartbeat"), "{}"), SseFrame::new(None, "{\"a\":1}")]);
        assert!(text.is_empty());
    }

    #[tokio::test]
    async fn multiline_payload_round_trips_through_several_data_lines() {
        let mut text = wire(vec![SseFrame::new(Some("bad\nname"), "a\r\nb")]).await;
        assert_eq!(text.matches("data:").count(), 2);
        let frames = parse_frames(&mut text);
        assert_eq!(frames, vec![SseFrame::new(Some("badname"), "a\nb")]);
    }

    #[test]
    fn parse_keeps_partial_block() {
        let mut buf = String::from("event: connection\ndata: {\"x\":1}\n\ndata: [1,");
        let frames = parse_frames(&mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("connection"));
        assert_eq!(frames[0].json().unwrap()["x"], 1);
        assert_eq!(buf, "data: [1,");
        buf.push_str("2]\n\n");
        let frames = parse_frames(&mut buf);
        assert_eq!(frames[0].event, None);
        assert_eq!(frames[0].data, "[1,2]");
    }
}
