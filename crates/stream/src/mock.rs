//! Transport that records `(event, data)` frames in memory, with scripted write failures.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::frame::SseFrame;
use crate::transport::{Transport, TransportError};

#[derive(Default)]
pub struct RecordingTransport {
    written: Mutex<Vec<SseFrame>>,
    attempts: AtomicUsize,
    fail_from: Option<usize>,
    broken: AtomicBool,
    closes: AtomicUsize,
    notify: Notify,
}

impl RecordingTransport {
    pub fn new() -> Self { Self::default() }

    /// The `n`th write attempt (1-based) and every later one fail.
    pub fn failing_on(n: usize) -> Self {
        Self { fail_from: Some(n.max(1)), ..Self::default() }
    }

    /// Fail every write from now on, as a vanished client would.
    pub fn break_now(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    /// Number of `write` calls, successful or not.
    pub fn attempts(&self) -> usize { self.attempts.load(Ordering::SeqCst) }

    pub fn close_count(&self) -> usize { self.closes.load(Ordering::SeqCst) }

    /// Successfully written frames, in write order.
    pub fn frames(&self) -> Vec<SseFrame> {
        self.written.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Wait until at least `n` frames were written; returns what is there after `timeout`.
    pub async fn wait_for_frames(&self, n: usize, timeout: Duration) -> Vec<SseFrame> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            let frames = self.frames();
            if frames.len() >= n {
                return frames;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.frames();
            }
        }
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn write(&self, frame: SseFrame) -> Result<(), TransportError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.broken.load(Ordering::SeqCst) || self.fail_from.is_some_and(|n| attempt >= n) {
            return Err(TransportError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "client went away")));
        }
        self.written.lock().unwrap_or_else(|p| p.into_inner()).push(frame);
        self.notify.notify_waiters();
        Ok(())
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}
