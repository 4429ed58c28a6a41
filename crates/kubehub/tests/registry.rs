#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tether_kubehub::{
    callbacks, resources, EventKind, MockControlPlane, MockFeed, ResourceKind, ResourceWatch, WatchDescriptor, WatchRegistry,
    WatchState,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

fn demo_agents() -> WatchDescriptor {
    WatchDescriptor::new("tether.dev", "v1alpha1", "agents").namespace("demo")
}

fn setup() -> (Arc<MockControlPlane>, WatchRegistry) {
    let mock = Arc::new(MockControlPlane::new());
    let registry = WatchRegistry::new(mock.clone());
    (mock, registry)
}

async fn feed(mock: &MockControlPlane) -> MockFeed {
    timeout(Duration::from_secs(2), mock.next_feed()).await.expect("feed in time").expect("feed")
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(Duration::from_secs(2), rx.recv()).await.expect("event in time").expect("channel open")
}

#[tokio::test]
async fn delivers_decoded_events_in_order() {
    let (mock, registry) = setup();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = registry.start_watch(demo_agents(), tx).await;
    assert!(handle.is_registered());
    assert_eq!(handle.state(), WatchState::Streaming);

    let f = feed(&mock).await;
    assert_eq!(f.descriptor().namespace.as_deref(), Some("demo"));
    f.send_event("ADDED", json!({"metadata": {"name": "x", "namespace": "demo", "resourceVersion": "1"}}));
    f.send_event("MODIFIED", json!({"metadata": {"name": "x", "namespace": "demo", "resourceVersion": "2"}}));
    f.send_event("DELETED", json!({"metadata": {"name": "x", "namespace": "demo", "resourceVersion": "3"}}));

    let kinds: Vec<EventKind> = vec![recv(&mut rx).await.kind, recv(&mut rx).await.kind, recv(&mut rx).await.kind];
    assert_eq!(kinds, vec![EventKind::Added, EventKind::Modified, EventKind::Deleted]);
    assert_eq!(registry.active_count(), 1);
    assert_eq!(registry.active_keys(), vec![demo_agents().key()]);
}

#[tokio::test]
async fn lines_split_across_chunks_are_reassembled() {
    let (mock, registry) = setup();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _handle = registry.start_watch(demo_agents(), tx).await;
    let f = feed(&mock).await;
    f.send_raw(r#"{"type":"ADDED","obj"#);
    f.send_raw(r#"ect":{"metadata":{"name":"split"}}}"#);
    f.send_raw("\n\n");
    let env = recv(&mut rx).await;
    assert_eq!(env.name(), Some("split"));
}

#[tokio::test]
async fn cancel_is_idempotent() {
    let (mock, registry) = setup();
    let (tx, _rx) = mpsc::unbounded_channel();
    let handle = registry.start_watch(demo_agents(), tx).await;
    let _f = feed(&mock).await;
    assert_eq!(registry.active_count(), 1);

    let removals = (0..5).filter(|_| handle.cancel()).count();
    assert_eq!(removals, 1);
    assert_eq!(registry.active_count(), 0);
    assert_eq!(handle.state(), WatchState::Stopped);
    // clones share the same registration
    assert!(!handle.clone().cancel());
}

#[tokio::test]
async fn no_events_after_cancel() {
    let (mock, registry) = setup();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = registry.start_watch(demo_agents(), tx).await;
    let f = feed(&mock).await;
    handle.cancel();
    f.send_event("ADDED", json!({"metadata": {"name": "late"}}));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn superseded_watch_events_are_suppressed() {
    let (mock, registry) = setup();
    let (first_tx, mut first_rx) = mpsc::unbounded_channel();
    let first = registry.start_watch(demo_agents(), first_tx).await;
    let first_feed = feed(&mock).await;

    let (second_tx, mut second_rx) = mpsc::unbounded_channel();
    let second = registry.start_watch(demo_agents(), second_tx).await;
    let second_feed = feed(&mock).await;

    assert_eq!(first.state(), WatchState::Stopped);
    assert_eq!(registry.active_count(), 1);

    first_feed.send_event("ADDED", json!({"metadata": {"name": "stale"}}));
    second_feed.send_event("ADDED", json!({"metadata": {"name": "fresh"}}));

    assert_eq!(recv(&mut second_rx).await.name(), Some("fresh"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(first_rx.try_recv().is_err());
    assert!(second_rx.try_recv().is_err());

    // the stale handle cannot cancel the replacement
    assert!(!first.cancel());
    assert!(registry.is_active(second.key()));
}

#[tokio::test]
async fn error_line_yields_error_envelope_and_removes_watch() {
    let (mock, registry) = setup();
    let errors = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = {
        let errors = errors.clone();
        let seen = seen.clone();
        callbacks(move |env| seen.lock().unwrap().push(env)).on_error(move |_e| {
            errors.fetch_add(1, Ordering::SeqCst);
        })
    };
    let handle = registry.start_watch(demo_agents(), sink).await;
    let f = feed(&mock).await;
    f.send_status_error(410, "too old resource version");

    assert_eq!(timeout(Duration::from_secs(2), handle.terminated()).await.unwrap(), WatchState::Errored);
    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].kind, EventKind::Error);
    assert!(!seen[0].error.as_deref().unwrap_or("").is_empty());
    assert!(seen[0].resource().is_none());
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert_eq!(registry.active_count(), 0);
    // already removed: cancel is a quiet no-op
    assert!(!handle.cancel());
}

#[tokio::test]
async fn server_close_is_a_terminal_error() {
    let (mock, registry) = setup();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = registry.start_watch(demo_agents().timeout_seconds(5), tx).await;
    let f = feed(&mock).await;
    f.send_event("ADDED", json!({"metadata": {"name": "a"}}));
    f.close();

    assert_eq!(recv(&mut rx).await.kind, EventKind::Added);
    let closing = recv(&mut rx).await;
    assert!(closing.is_error());
    assert!(closing.error.unwrap().contains("closed"));
    assert_eq!(handle.terminated().await, WatchState::Errored);
    assert_eq!(registry.active_count(), 0);
}

#[tokio::test]
async fn stream_failure_is_a_terminal_error() {
    let (mock, registry) = setup();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _handle = registry.start_watch(demo_agents(), tx).await;
    let f = feed(&mock).await;
    f.fail("connection reset by peer");
    let env = recv(&mut rx).await;
    assert!(env.error.unwrap().contains("connection reset"));
    assert_eq!(registry.active_count(), 0);
}

#[tokio::test]
async fn connect_failure_reports_once_and_registers_nothing() {
    let (mock, registry) = setup();
    mock.fail_next_connect("forbidden: agents is forbidden");
    let errors = Arc::new(AtomicUsize::new(0));
    let events = Arc::new(AtomicUsize::new(0));
    let sink = {
        let errors = errors.clone();
        let events = events.clone();
        callbacks(move |_| { events.fetch_add(1, Ordering::SeqCst); }).on_error(move |e| {
            assert!(e.is_connect());
            errors.fetch_add(1, Ordering::SeqCst);
        })
    };
    let handle = registry.start_watch(demo_agents(), sink).await;
    assert!(!handle.is_registered());
    assert!(handle.connect_error().is_some());
    assert_eq!(handle.state(), WatchState::Errored);
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert_eq!(events.load(Ordering::SeqCst), 0);
    assert_eq!(registry.active_count(), 0);
    assert!(!handle.cancel());
}

#[tokio::test]
async fn malformed_descriptor_never_reaches_upstream() {
    let (mock, registry) = setup();
    let (tx, _rx) = mpsc::unbounded_channel();
    let handle = registry.start_watch(WatchDescriptor::new("tether.dev", "v1alpha1", "agents").namespace("a/b"), tx).await;
    assert!(!handle.is_registered());
    assert!(mock.watch_calls().is_empty());
}

#[tokio::test]
async fn restart_after_error_begins_fresh() {
    let (mock, registry) = setup();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let first = registry.start_watch(demo_agents(), tx.clone()).await;
    feed(&mock).await.send_status_error(500, "boom");
    assert_eq!(first.terminated().await, WatchState::Errored);
    assert!(recv(&mut rx).await.is_error());

    let second = registry.start_watch(demo_agents().resource_version("41"), tx).await;
    assert_eq!(second.state(), WatchState::Streaming);
    let f = feed(&mock).await;
    assert_eq!(f.descriptor().resource_version.as_deref(), Some("41"));
    f.send_event("ADDED", json!({"metadata": {"name": "again"}}));
    assert_eq!(recv(&mut rx).await.name(), Some("again"));
}

#[tokio::test]
async fn stop_all_clears_the_active_set() {
    let (mock, registry) = setup();
    let (tx, _rx) = mpsc::unbounded_channel();
    let a = registry.start_watch(demo_agents(), tx.clone()).await;
    let b = registry.start_watch(demo_agents().labels("team=blue"), tx).await;
    let _fa = feed(&mock).await;
    let _fb = feed(&mock).await;
    assert_eq!(registry.active_count(), 2);
    assert_eq!(registry.stop_all(), 2);
    assert_eq!(registry.active_count(), 0);
    assert_eq!(a.state(), WatchState::Stopped);
    assert!(!b.cancel());
}

#[tokio::test]
async fn adapter_preserves_registry_contract() {
    let (mock, registry) = setup();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let opts = ResourceWatch::in_namespace("demo");
    let handle = resources::watch_models(&registry, &opts, tx).await;
    let f = feed(&mock).await;
    assert_eq!(f.descriptor().collection_path(), "/apis/tether.dev/v1alpha1/namespaces/demo/models");
    f.send_event("ADDED", json!({"metadata": {"name": "gpt"}}));
    assert_eq!(recv(&mut rx).await.name(), Some("gpt"));
    assert!(handle.cancel());
    assert!(!handle.cancel());
    assert_eq!(registry.active_count(), 0);
}

#[tokio::test]
async fn list_passes_through_for_relist() {
    let (mock, registry) = setup();
    let opts = ResourceWatch::in_namespace("demo");
    mock.set_list(&ResourceKind::Persona.descriptor(&opts), vec![json!({"metadata": {"name": "p1"}})], "77");
    let list = resources::list_personas(&registry, &opts).await.unwrap();
    assert_eq!(list["metadata"]["resourceVersion"], "77");
    assert_eq!(list["items"][0]["metadata"]["name"], "p1");
}
