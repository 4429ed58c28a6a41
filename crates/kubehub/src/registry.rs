//! Watch registry: owns live watch connections keyed by [`WatchKey`].
//!
//! One task per open connection pumps the upstream body, decodes lines and
//! delivers envelopes to the caller's [`WatchSink`]. The Active-Watch Set is the
//! only shared mutable state; every delivery re-checks it under the same lock
//! that `cancel`/`stop_all` take, so once a cancel returns no further event from
//! that connection reaches the sink.
//!
//! The registry never retries. A terminal error (ERROR line, malformed line,
//! stream failure or server close) is delivered once as an error envelope and
//! the key is removed; re-listing and re-watching is the caller's policy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures::StreamExt;
use metrics::{counter, gauge};
use tether_core::{decode_line, Envelope, WatchDescriptor, WatchKey};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::pump::LineSplitter;
use crate::upstream::{ByteStream, ControlPlane};
use crate::WatchError;

/// Lifecycle of one connection instance. `Stopped` and `Errored` are terminal;
/// a later `start_watch` for the same key starts a fresh instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Connecting,
    Streaming,
    Stopped,
    Errored,
}

impl WatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WatchState::Stopped | WatchState::Errored)
    }
}

/// Receiver of decoded envelopes.
///
/// Called while the registry lock is held: implementations must not call back
/// into the registry synchronously (hand off through a channel instead).
/// Error envelopes go to both `on_event` and `on_error`.
pub trait WatchSink: Send + Sync + 'static {
    fn on_event(&self, envelope: Envelope);
    fn on_error(&self, _error: &WatchError) {}
}

impl WatchSink for mpsc::UnboundedSender<Envelope> {
    fn on_event(&self, envelope: Envelope) {
        let _ = self.send(envelope);
    }
}

impl<S: WatchSink + ?Sized> WatchSink for Arc<S> {
    fn on_event(&self, envelope: Envelope) { (**self).on_event(envelope) }
    fn on_error(&self, error: &WatchError) { (**self).on_error(error) }
}

/// Closure-based sink; see [`callbacks`].
pub struct Callbacks<E, R> {
    on_event: E,
    on_error: Option<R>,
}

/// Build a sink from an event closure, optionally extended with `.on_error(..)`.
pub fn callbacks<E>(on_event: E) -> Callbacks<E, fn(&WatchError)>
where
    E: Fn(Envelope) + Send + Sync + 'static,
{
    Callbacks { on_event, on_error: None }
}

impl<E, R> Callbacks<E, R> {
    pub fn on_error<R2>(self, on_error: R2) -> Callbacks<E, R2>
    where
        R2: Fn(&WatchError) + Send + Sync + 'static,
    {
        Callbacks { on_event: self.on_event, on_error: Some(on_error) }
    }
}

impl<E, R> WatchSink for Callbacks<E, R>
where
    E: Fn(Envelope) + Send + Sync + 'static,
    R: Fn(&WatchError) + Send + Sync + 'static,
{
    fn on_event(&self, envelope: Envelope) { (self.on_event)(envelope) }
    fn on_error(&self, error: &WatchError) {
        if let Some(f) = &self.on_error { f(error) }
    }
}

struct ActiveWatch {
    generation: u64,
    task: Option<JoinHandle<()>>,
    state: watch::Sender<WatchState>,
}

impl ActiveWatch {
    fn stop(self) {
        if let Some(task) = self.task { task.abort(); }
        self.state.send_replace(WatchState::Stopped);
    }
}

type ActiveSet = HashMap<WatchKey, ActiveWatch>;

struct Shared {
    upstream: Arc<dyn ControlPlane>,
    active: Mutex<ActiveSet>,
    next_generation: AtomicU64,
}

fn is_current(active: &ActiveSet, key: &WatchKey, generation: u64) -> bool {
    active.get(key).map_or(false, |w| w.generation == generation)
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ActiveSet> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Remove `key` only if it is still owned by `generation`.
    fn remove(&self, key: &WatchKey, generation: u64) -> bool {
        let mut active = self.lock();
        if !is_current(&active, key, generation) {
            return false;
        }
        if let Some(w) = active.remove(key) { w.stop(); }
        gauge!("watch_active", active.len() as f64);
        true
    }

    fn deliver(&self, key: &WatchKey, generation: u64, envelope: Envelope, sink: &dyn WatchSink) -> bool {
        let active = self.lock();
        if !is_current(&active, key, generation) {
            counter!("watch_stale_events_total", 1u64);
            debug!(key = %key, generation, "dropping event from stopped watch");
            return false;
        }
        counter!("watch_events_total", 1u64, "type" => envelope.kind.as_str());
        sink.on_event(envelope);
        true
    }

    fn terminate(&self, key: &WatchKey, generation: u64, envelope: Envelope, error: WatchError, sink: &dyn WatchSink) {
        let mut active = self.lock();
        if !is_current(&active, key, generation) {
            debug!(key = %key, generation, "terminal event for stopped watch dropped");
            return;
        }
        // Running inside the watch task itself: detach rather than abort.
        let entry = active.remove(key);
        gauge!("watch_active", active.len() as f64);
        counter!("watch_errors_total", 1u64);
        warn!(key = %key, error = %error, "watch terminated");
        sink.on_event(envelope);
        sink.on_error(&error);
        if let Some(w) = entry { w.state.send_replace(WatchState::Errored); }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let active = self.active.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        for (_, w) in active.drain() { w.stop(); }
    }
}

/// Cancel handle for one `start_watch` call. Clonable; `cancel` is idempotent
/// and only ever removes the registration it was issued for.
#[derive(Debug, Clone)]
pub struct WatchHandle {
    key: WatchKey,
    registration: Option<(Weak<Shared>, u64)>,
    state: watch::Receiver<WatchState>,
    connect_error: Option<WatchError>,
}

impl WatchHandle {
    pub fn key(&self) -> &WatchKey { &self.key }

    /// False when the connection never opened; `cancel` is then a no-op.
    pub fn is_registered(&self) -> bool { self.registration.is_some() }

    pub fn connect_error(&self) -> Option<&WatchError> { self.connect_error.as_ref() }

    pub fn state(&self) -> WatchState { *self.state.borrow() }

    /// Resolve once this connection instance reaches `Stopped` or `Errored`.
    pub async fn terminated(&self) -> WatchState {
        let mut rx = self.state.clone();
        loop {
            let current = *rx.borrow_and_update();
            if current.is_terminal() {
                return current;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }

    /// Remove this watch from the Active-Watch Set. Returns true only for the
    /// call that actually removed it.
    pub fn cancel(&self) -> bool {
        let Some((shared, generation)) = &self.registration else { return false };
        let Some(shared) = shared.upgrade() else { return false };
        let removed = shared.remove(&self.key, *generation);
        if removed {
            info!(key = %self.key, generation, "watch cancelled");
        }
        removed
    }
}

/// Registry of live watches. Cheap to clone; pass it to whatever opens watches
/// and call [`WatchRegistry::stop_all`] at shutdown.
#[derive(Clone)]
pub struct WatchRegistry {
    shared: Arc<Shared>,
}

impl WatchRegistry {
    pub fn new(upstream: Arc<dyn ControlPlane>) -> Self {
        Self {
            shared: Arc::new(Shared {
                upstream,
                active: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Open a watch for `descriptor`, replacing any watch already open for the same key.
    ///
    /// If the connection cannot be established, `sink.on_error` is called once and the
    /// returned handle is unregistered.
    pub async fn start_watch<S: WatchSink>(&self, descriptor: WatchDescriptor, sink: S) -> WatchHandle {
        let key = descriptor.key();
        let sink: Arc<dyn WatchSink> = Arc::new(sink);
        let (state_tx, state_rx) = watch::channel(WatchState::Connecting);

        if self.stop_key(&key) {
            info!(key = %key, "replacing existing watch");
        }
        counter!("watch_started_total", 1u64);

        let opened = match descriptor.validate() {
            Ok(()) => self.shared.upstream.watch(&descriptor).await,
            Err(e) => Err(WatchError::from(e)),
        };
        let stream = match opened {
            Ok(stream) => stream,
            Err(err) => {
                counter!("watch_connect_failures_total", 1u64);
                warn!(key = %key, error = %err, "watch connect failed");
                state_tx.send_replace(WatchState::Errored);
                sink.on_error(&err);
                return WatchHandle { key, registration: None, state: state_rx, connect_error: Some(err) };
            }
        };

        let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        {
            let mut active = self.shared.lock();
            state_tx.send_replace(WatchState::Streaming);
            // The task blocks on this lock before its first delivery, so the entry is in place first.
            let task = tokio::spawn(pump(Arc::downgrade(&self.shared), key.clone(), generation, stream, sink));
            let entry = ActiveWatch { generation, task: Some(task), state: state_tx };
            if let Some(prev) = active.insert(key.clone(), entry) {
                debug!(key = %key, superseded = prev.generation, "concurrent start replaced watch");
                prev.stop();
            }
            gauge!("watch_active", active.len() as f64);
        }
        info!(key = %key, generation, rv = ?descriptor.resource_version, "watch streaming");
        WatchHandle {
            key,
            registration: Some((Arc::downgrade(&self.shared), generation)),
            state: state_rx,
            connect_error: None,
        }
    }

    fn stop_key(&self, key: &WatchKey) -> bool {
        let mut active = self.shared.lock();
        let stopped = match active.remove(key) {
            Some(w) => { w.stop(); true }
            None => false,
        };
        gauge!("watch_active", active.len() as f64);
        stopped
    }

    /// Stop every watch. Intended for process shutdown.
    pub fn stop_all(&self) -> usize {
        let mut active = self.shared.lock();
        let n = active.len();
        for (_, w) in active.drain() { w.stop(); }
        gauge!("watch_active", 0.0);
        info!(stopped = n, "all watches stopped");
        n
    }

    pub fn active_count(&self) -> usize { self.shared.lock().len() }

    pub fn active_keys(&self) -> Vec<WatchKey> {
        let mut keys: Vec<WatchKey> = self.shared.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn is_active(&self, key: &WatchKey) -> bool { self.shared.lock().contains_key(key) }

    /// List the descriptor's collection; the usual step before re-watching after an error.
    pub async fn list(&self, descriptor: &WatchDescriptor) -> Result<serde_json::Value, WatchError> {
        descriptor.validate()?;
        self.shared.upstream.list(descriptor).await
    }
}

enum Flow {
    Continue,
    Stop,
    Terminal(Envelope, WatchError),
}

fn handle_line(registry: &Shared, key: &WatchKey, generation: u64, line: &str, sink: &dyn WatchSink) -> Flow {
    match decode_line(line) {
        None => Flow::Continue,
        Some(env) if env.is_error() => {
            let message = env.error.clone().unwrap_or_default();
            Flow::Terminal(env, WatchError::Upstream(message))
        }
        Some(env) => {
            if registry.deliver(key, generation, env, sink) { Flow::Continue } else { Flow::Stop }
        }
    }
}

async fn pump(shared: Weak<Shared>, key: WatchKey, generation: u64, mut stream: ByteStream, sink: Arc<dyn WatchSink>) {
    let mut lines = LineSplitter::default();
    let (envelope, error) = 'pump: loop {
        let next = stream.next().await;
        let Some(registry) = shared.upgrade() else { return };
        match next {
            Some(Ok(chunk)) => {
                lines.push(&chunk);
                while let Some(line) = lines.next_line() {
                    match handle_line(&registry, &key, generation, &line, &*sink) {
                        Flow::Continue => {}
                        Flow::Stop => return,
                        Flow::Terminal(env, err) => break 'pump (env, err),
                    }
                }
            }
            Some(Err(err)) => break 'pump (Envelope::error(err.to_string(), None), err),
            None => {
                if let Some(tail) = lines.finish() {
                    match handle_line(&registry, &key, generation, &tail, &*sink) {
                        Flow::Continue => {}
                        Flow::Stop => return,
                        Flow::Terminal(env, err) => break 'pump (env, err),
                    }
                }
                let message = "watch stream closed by server";
                break 'pump (Envelope::error(message, None), WatchError::Stream(message.to_string()));
            }
        }
    };
    if let Some(registry) = shared.upgrade() {
        registry.terminate(&key, generation, envelope, error, &*sink);
    }
}
