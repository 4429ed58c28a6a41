//! In-memory control plane for tests and demos.
//!
//! Every successful `watch` call produces a [`MockFeed`]; take it with
//! [`MockControlPlane::next_feed`] and push raw lines through it. Dropping the
//! feed closes the upstream stream.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::json;
use tether_core::WatchDescriptor;
use tokio::sync::mpsc;

use crate::upstream::{ByteStream, ControlPlane};
use crate::WatchError;

type Chunk = Result<Bytes, WatchError>;

/// Producer side of one mocked watch connection.
#[derive(Debug)]
pub struct MockFeed {
    descriptor: WatchDescriptor,
    tx: mpsc::UnboundedSender<Chunk>,
}

impl MockFeed {
    pub fn descriptor(&self) -> &WatchDescriptor { &self.descriptor }

    /// Push raw bytes exactly as given (no framing added).
    pub fn send_raw(&self, chunk: impl Into<Bytes>) -> bool {
        self.tx.send(Ok(chunk.into())).is_ok()
    }

    pub fn send_line(&self, line: &str) -> bool {
        self.send_raw(format!("{}\n", line))
    }

    /// Push one watch line `{"type": kind, "object": object}`.
    pub fn send_event(&self, kind: &str, object: serde_json::Value) -> bool {
        self.send_line(&json!({ "type": kind, "object": object }).to_string())
    }

    /// Push an `ERROR` line carrying a Status object.
    pub fn send_status_error(&self, code: u16, message: &str) -> bool {
        self.send_event("ERROR", json!({ "kind": "Status", "status": "Failure", "code": code, "message": message }))
    }

    /// Fail the stream mid-flight, as a dropped connection would.
    pub fn fail(&self, message: &str) -> bool {
        self.tx.send(Err(WatchError::Stream(message.to_string()))).is_ok()
    }

    /// False once the consuming watch has gone away.
    pub fn is_connected(&self) -> bool { !self.tx.is_closed() }

    /// Close the stream from the server side.
    pub fn close(self) {}
}

pub struct MockControlPlane {
    feeds_tx: mpsc::UnboundedSender<MockFeed>,
    feeds_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MockFeed>>,
    connect_failures: Mutex<VecDeque<String>>,
    lists: Mutex<HashMap<String, serde_json::Value>>,
    watched: Mutex<Vec<WatchDescriptor>>,
}

impl Default for MockControlPlane {
    fn default() -> Self {
        let (feeds_tx, feeds_rx) = mpsc::unbounded_channel();
        Self {
            feeds_tx,
            feeds_rx: tokio::sync::Mutex::new(feeds_rx),
            connect_failures: Mutex::new(VecDeque::new()),
            lists: Mutex::new(HashMap::new()),
            watched: Mutex::new(Vec::new()),
        }
    }
}

impl MockControlPlane {
    pub fn new() -> Self { Self::default() }

    /// Make the next `watch` call fail to connect with `message`.
    pub fn fail_next_connect(&self, message: &str) {
        self.connect_failures.lock().unwrap_or_else(|p| p.into_inner()).push_back(message.to_string());
    }

    /// Serve `items` from `list` for the descriptor's collection path.
    pub fn set_list(&self, descriptor: &WatchDescriptor, items: Vec<serde_json::Value>, resource_version: &str) {
        let list = json!({
            "kind": "List",
            "apiVersion": "v1",
            "metadata": { "resourceVersion": resource_version },
            "items": items,
        });
        self.lists.lock().unwrap_or_else(|p| p.into_inner()).insert(descriptor.collection_path(), list);
    }

    /// Descriptors passed to `watch`, in call order (including failed connects).
    pub fn watch_calls(&self) -> Vec<WatchDescriptor> {
        self.watched.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Wait for the next opened watch connection.
    pub async fn next_feed(&self) -> Option<MockFeed> {
        self.feeds_rx.lock().await.recv().await
    }
}

#[async_trait]
impl ControlPlane for MockControlPlane {
    async fn watch(&self, descriptor: &WatchDescriptor) -> Result<ByteStream, WatchError> {
        descriptor.validate()?;
        self.watched.lock().unwrap_or_else(|p| p.into_inner()).push(descriptor.clone());
        if let Some(message) = self.connect_failures.lock().unwrap_or_else(|p| p.into_inner()).pop_front() {
            return Err(WatchError::Connect(message));
        }
        let (tx, rx) = mpsc::unbounded_channel::<Chunk>();
        let _ = self.feeds_tx.send(MockFeed { descriptor: descriptor.clone(), tx });
        let stream = futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|chunk| (chunk, rx)) });
        Ok(stream.boxed())
    }

    async fn list(&self, descriptor: &WatchDescriptor) -> Result<serde_json::Value, WatchError> {
        let lists = self.lists.lock().unwrap_or_else(|p| p.into_inner());
        Ok(lists.get(&descriptor.collection_path()).cloned().unwrap_or_else(|| {
            json!({ "kind": "List", "apiVersion": "v1", "metadata": { "resourceVersion": "0" }, "items": [] })
        }))
    }
}
