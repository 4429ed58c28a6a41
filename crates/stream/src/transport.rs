use std::sync::Mutex;

use async_trait::async_trait;
use axum::response::sse::Event;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::frame::SseFrame;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("transport io: {0}")]
    Io(#[from] std::io::Error),
}

/// Outward byte sink for one client connection.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Write one complete event.
    async fn write(&self, frame: SseFrame) -> Result<(), TransportError>;

    /// Close the transport. Must tolerate repeated calls.
    fn close(&self);
}

/// Transport over a bounded channel of axum SSE events; the receiver is the
/// stream handed to `Sse::new`.
///
/// Writes wait for channel capacity, so a slow client pushes back on the writer.
pub struct ChannelTransport {
    tx: Mutex<Option<mpsc::Sender<Event>>>,
    shutdown: CancellationToken,
}

/// Create a transport and the event stream it feeds.
pub fn channel(capacity: usize) -> (ChannelTransport, ReceiverStream<Event>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let transport = ChannelTransport { tx: Mutex::new(Some(tx)), shutdown: CancellationToken::new() };
    (transport, ReceiverStream::new(rx))
}

impl ChannelTransport {
    fn sender(&self) -> Option<mpsc::Sender<Event>> {
        self.tx.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Token cancelled when the body stream is dropped (client went away) or the
    /// transport is closed. Must be called within a tokio runtime.
    pub fn disconnect_signal(&self) -> CancellationToken {
        let token = CancellationToken::new();
        match self.sender() {
            None => token.cancel(),
            Some(tx) => {
                let signal = token.clone();
                let shutdown = self.shutdown.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = tx.closed() => {}
                        _ = shutdown.cancelled() => {}
                    }
                    signal.cancel();
                });
            }
        }
        token
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn write(&self, frame: SseFrame) -> Result<(), TransportError> {
        let tx = self.sender().ok_or(TransportError::Closed)?;
        tx.send(frame.into_event()).await.map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        self.tx.lock().unwrap_or_else(|p| p.into_inner()).take();
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn write_fails_once_body_is_dropped() {
        let (transport, body) = channel(4);
        let signal = transport.disconnect_signal();
        transport.write(SseFrame::new(None, "a")).await.unwrap();
        drop(body);
        assert!(matches!(transport.write(SseFrame::new(None, "b")).await, Err(TransportError::Closed)));
        tokio::time::timeout(std::time::Duration::from_secs(1), signal.cancelled()).await.unwrap();
    }

    #[tokio::test]
    async fn close_ends_the_body_and_tolerates_repeats() {
        let (transport, mut body) = channel(4);
        let _signal = transport.disconnect_signal();
        transport.write(SseFrame::new(Some("connection"), "{}")).await.unwrap();
        transport.close();
        transport.close();
        assert!(body.next().await.is_some());
        assert!(matches!(transport.write(SseFrame::new(None, "late")).await, Err(TransportError::Closed)));
        let end = tokio::time::timeout(std::time::Duration::from_secs(1), body.next()).await.unwrap();
        assert!(end.is_none());
    }
}
