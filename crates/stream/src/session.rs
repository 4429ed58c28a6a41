//! Push-stream session over one [`Transport`].
//!
//! State only ever moves `active -> inactive`. Every failure mode collapses to
//! `send` returning `false`; producers only decide whether to keep producing.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use metrics::{counter, decrement_gauge, increment_gauge};
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::frame::SseFrame;
use crate::transport::Transport;

/// Sent once when the session opens.
pub const CONNECTION_EVENT: &str = "connection";
/// Sent on every heartbeat tick.
pub const HEARTBEAT_EVENT: &str = "heartbeat";
/// Sent when the connect hook fails.
pub const ERROR_EVENT: &str = "error";

type ConnectHook = Box<dyn FnOnce(PushSession) -> BoxFuture<'static, anyhow::Result<()>> + Send>;
type CleanupHook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
pub struct SessionOptions {
    heartbeat: Option<Duration>,
    on_connect: Option<ConnectHook>,
    on_cleanup: Option<CleanupHook>,
}

impl SessionOptions {
    pub fn new() -> Self { Self::default() }

    /// Heartbeat period; zero disables.
    pub fn heartbeat(mut self, every: Duration) -> Self {
        self.heartbeat = (!every.is_zero()).then_some(every);
        self
    }

    /// Runs in its own task after open. An error (or panic) is reported to the
    /// client as one `error` event; the session stays active.
    pub fn on_connect<F, Fut>(mut self, hook: F) -> Self
    where
        F: FnOnce(PushSession) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_connect = Some(Box::new(move |session| hook(session).boxed()));
        self
    }

    /// Runs exactly once on teardown.
    pub fn on_cleanup<F>(mut self, hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_cleanup = Some(Box::new(hook));
        self
    }
}

struct SessionInner {
    id: Uuid,
    active: AtomicBool,
    started: AtomicBool,
    torn_down: AtomicBool,
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    on_cleanup: Mutex<Option<CleanupHook>>,
}

impl SessionInner {
    fn stop_heartbeat(&self) {
        let task = self.heartbeat.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(task) = task {
            task.abort();
        }
    }

    fn teardown(&self, reason: &str) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.active.store(false, Ordering::SeqCst);
        self.stop_heartbeat();
        let hook = self.on_cleanup.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(hook) = hook {
            if std::panic::catch_unwind(AssertUnwindSafe(hook)).is_err() {
                warn!(session = %self.id, "cleanup hook panicked");
            }
        }
        self.transport.close();
        decrement_gauge!("sse_sessions_active", 1.0);
        info!(session = %self.id, reason, "push session closed");
    }
}

/// Handle to an open push stream. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct PushSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for PushSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushSession")
            .field("id", &self.inner.id)
            .field("active", &self.is_active())
            .finish()
    }
}

impl PushSession {
    /// Open a session: send the `connection` event, start the heartbeat, spawn the
    /// connect hook, and arm teardown on `abort`.
    pub async fn open(transport: Arc<dyn Transport>, abort: CancellationToken, options: SessionOptions) -> PushSession {
        let SessionOptions { heartbeat, on_connect, on_cleanup } = options;
        let session = PushSession {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4(),
                active: AtomicBool::new(true),
                started: AtomicBool::new(false),
                torn_down: AtomicBool::new(false),
                transport,
                cancel: abort.child_token(),
                heartbeat: Mutex::new(None),
                on_cleanup: Mutex::new(on_cleanup),
            }),
        };
        increment_gauge!("sse_sessions_active", 1.0);
        info!(session = %session.id(), heartbeat_ms = ?heartbeat.map(|d| d.as_millis()), "push session opened");

        let supervisor = session.clone();
        tokio::spawn(async move {
            supervisor.inner.cancel.cancelled().await;
            supervisor.inner.teardown("client disconnected");
        });

        let hello = json!({ "sessionId": session.id(), "ts": now_rfc3339() });
        if session.send(&hello, Some(CONNECTION_EVENT)).await {
            session.inner.started.store(true, Ordering::SeqCst);
        }

        if let Some(every) = heartbeat {
            if session.is_active() {
                let task = tokio::spawn(heartbeat_loop(session.clone(), every));
                *session.inner.heartbeat.lock().unwrap_or_else(|p| p.into_inner()) = Some(task);
                // teardown may have raced the spawn
                if !session.is_active() {
                    session.inner.stop_heartbeat();
                }
            }
        }

        if let Some(hook) = on_connect {
            tokio::spawn(run_connect_hook(session.clone(), hook));
        }
        session
    }

    pub fn id(&self) -> Uuid { self.inner.id }

    pub fn is_active(&self) -> bool { self.inner.active.load(Ordering::SeqCst) }

    /// True once the `connection` event reached the transport.
    pub fn has_started(&self) -> bool { self.inner.started.load(Ordering::SeqCst) }

    /// Serialize `data` and write it as one event. Returns `false` without any I/O
    /// when inactive; a failed write marks the session inactive.
    pub async fn send<T: Serialize + ?Sized>(&self, data: &T, event: Option<&str>) -> bool {
        if !self.is_active() {
            return false;
        }
        let payload = match serde_json::to_string(data) {
            Ok(p) => p,
            Err(e) => {
                warn!(session = %self.id(), error = %e, "dropping unserializable push payload");
                return false;
            }
        };
        match self.inner.transport.write(SseFrame::new(event, payload)).await {
            Ok(()) => true,
            Err(e) => {
                counter!("sse_send_failures_total", 1u64);
                if self.inner.active.swap(false, Ordering::SeqCst) {
                    warn!(session = %self.id(), error = %e, "push stream write failed; session inactive");
                }
                self.inner.stop_heartbeat();
                false
            }
        }
    }

    /// Explicit cancellation: same teardown as a client disconnect.
    pub fn close(&self) {
        self.inner.cancel.cancel();
        self.inner.teardown("closed by server");
    }

    /// Resolves once the disconnect signal fired or `close` was called.
    pub async fn closed(&self) {
        self.inner.cancel.cancelled().await
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

async fn heartbeat_loop(session: PushSession, every: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if !session.send(&json!({ "ts": now_rfc3339() }), Some(HEARTBEAT_EVENT)).await {
            debug!(session = %session.id(), "heartbeat failed; timer stopped");
            break;
        }
        counter!("sse_heartbeats_total", 1u64);
    }
}

async fn run_connect_hook(session: PushSession, hook: ConnectHook) {
    let message = match tokio::spawn(hook(session.clone())).await {
        Ok(Ok(())) => return,
        Ok(Err(e)) => format!("{:#}", e),
        Err(e) if e.is_panic() => "connect hook panicked".to_string(),
        Err(_) => return,
    };
    warn!(session = %session.id(), error = %message, "connect hook failed");
    let _ = session.send(&json!({ "message": message }), Some(ERROR_EVENT)).await;
}
