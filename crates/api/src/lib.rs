//! Tether API: joins the watch registry to push sessions and serves them over HTTP.
//!
//! One client connection is one [`PushSession`]. The session's connect hook
//! starts the requested watches; every envelope is forwarded as a generic data
//! event; the session's cleanup cancels exactly the watches it started.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use metrics::counter;
use tether_core::{Envelope, WatchDescriptor};
use tether_kubehub::{WatchHandle, WatchRegistry};
use tether_stream::{PushSession, SessionOptions, Transport};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod routes;

pub use routes::{router, AppState};

/// Watches owned by one session. Once `closed`, late registrations are cancelled
/// immediately instead of leaking past cleanup.
#[derive(Default)]
struct SessionWatches {
    closed: bool,
    handles: Vec<WatchHandle>,
}

impl SessionWatches {
    fn adopt(&mut self, handle: WatchHandle) -> bool {
        if self.closed {
            handle.cancel();
            return false;
        }
        self.handles.push(handle);
        true
    }

    fn close(&mut self) -> Vec<WatchHandle> {
        self.closed = true;
        std::mem::take(&mut self.handles)
    }
}

type SharedWatches = Arc<Mutex<SessionWatches>>;

fn is_released(watches: &SharedWatches) -> bool {
    watches.lock().unwrap_or_else(|p| p.into_inner()).closed
}

#[derive(Clone)]
pub struct Bridge {
    registry: WatchRegistry,
    heartbeat: Duration,
}

impl Bridge {
    /// `heartbeat` of zero disables heartbeats.
    pub fn new(registry: WatchRegistry, heartbeat: Duration) -> Self { Self { registry, heartbeat } }

    pub fn registry(&self) -> &WatchRegistry { &self.registry }

    pub fn heartbeat(&self) -> Duration { self.heartbeat }

    /// Open a push session that streams every descriptor's events until the
    /// client disconnects or the session is closed.
    pub async fn open(&self, transport: Arc<dyn Transport>, abort: CancellationToken, descriptors: Vec<WatchDescriptor>) -> PushSession {
        counter!("bridge_sessions_total", 1u64);
        let watches: SharedWatches = Arc::new(Mutex::new(SessionWatches::default()));
        let registry = self.registry.clone();
        let started = watches.clone();
        let stopped = watches;
        let options = SessionOptions::new()
            .heartbeat(self.heartbeat)
            .on_connect(move |session| start_watches(registry, session, descriptors, started))
            .on_cleanup(move || {
                let handles = stopped.lock().unwrap_or_else(|p| p.into_inner()).close();
                let cancelled = handles.iter().filter(|h| h.cancel()).count();
                debug!(watches = handles.len(), cancelled, "session watches released");
            });
        PushSession::open(transport, abort, options).await
    }
}

async fn start_watches(
    registry: WatchRegistry,
    session: PushSession,
    descriptors: Vec<WatchDescriptor>,
    watches: SharedWatches,
) -> anyhow::Result<()> {
    let mut failures = Vec::new();
    for descriptor in descriptors {
        let (tx, rx) = mpsc::unbounded_channel::<Envelope>();
        let handle = registry.start_watch(descriptor, tx).await;
        let key = handle.key().clone();
        if let Some(err) = handle.connect_error() {
            failures.push(format!("{}: {}", key, err));
            continue;
        }
        if !watches.lock().unwrap_or_else(|p| p.into_inner()).adopt(handle.clone()) {
            debug!(%key, "session closed while watch was starting");
            return Ok(());
        }
        info!(session = %session.id(), %key, "session watch started");
        tokio::spawn(forward(session.clone(), rx, handle, registry.clone(), watches.clone()));
    }
    if failures.is_empty() {
        Ok(())
    } else {
        warn!(session = %session.id(), failed = failures.len(), "session watches failed to start");
        Err(anyhow!("failed to start watch: {}", failures.join("; ")))
    }
}

/// Relay envelopes until the watch ends (its sink is dropped) or the session
/// stops accepting writes.
///
/// A watch that ends without an error envelope was stopped by someone other than
/// this session (a newer watch for the same key, or `stop_all`); the client gets
/// one error envelope for it. A session that stops accepting writes releases the
/// watch right away instead of waiting for its disconnect signal.
async fn forward(
    session: PushSession,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    handle: WatchHandle,
    registry: WatchRegistry,
    watches: SharedWatches,
) {
    while let Some(envelope) = rx.recv().await {
        let terminal = envelope.is_error();
        if !session.send(&envelope, None).await {
            if handle.cancel() {
                debug!(session = %session.id(), key = %handle.key(), "session stopped accepting events; watch released");
            }
            return;
        }
        if terminal {
            return;
        }
    }
    if is_released(&watches) || !session.is_active() {
        return;
    }
    let key = handle.key();
    let message = if registry.is_active(key) {
        counter!("bridge_watches_superseded_total", 1u64);
        format!("watch replaced by a newer watch for {}", key)
    } else {
        format!("watch for {} was stopped", key)
    };
    warn!(session = %session.id(), %key, "{}", message);
    let _ = session.send(&Envelope::error(message, None), None).await;
}
