use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use realtime_sync::core::{
    BackoffPolicy, ChannelStatus, ChangeEvent, ChangeKind, ConnectionState, NetworkStatus,
    RefreshScope, Topic, TopicId,
};
use realtime_sync::probe::{NetworkSource, ProbeConfig};
use realtime_sync::sync::{SyncEngine, SyncEngineArgs, SyncHandle};
use realtime_sync::testing::{MockFeedTransport, MockFeedServer, RecordingRefreshSink, StaticReachability};
use realtime_sync::transport::{FeedCommand, FeedEvent, FeedTransport};
use tokio::sync::mpsc;

async fn wait_for<T, F>(handle: &SyncHandle<T>, timeout: Duration, predicate: F) -> ConnectionState
where
    T: FeedTransport,
    F: Fn(&ConnectionState) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        let state = handle.snapshot();
        if predicate(&state) {
            return state;
        }
        if Instant::now() >= deadline {
            panic!("timed out waiting for state (last={state:?})");
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

async fn recv_scope(rx: &mut mpsc::UnboundedReceiver<RefreshScope>) -> RefreshScope {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("refresh within deadline")
        .expect("refresh channel open")
}

async fn ack_subscribes(server: &mut MockFeedServer, count: usize) {
    for _ in 0..count {
        match server.recv_command(Duration::from_secs(2)).await {
            Some(FeedCommand::Subscribe { request_id, .. }) => {
                server
                    .push_event(FeedEvent::Subscribed {
                        request_id,
                        subscription_id: request_id,
                    })
                    .unwrap();
            }
            other => panic!("expected subscribe, got {other:?}"),
        }
    }
}

fn change(topic: &str) -> FeedEvent {
    FeedEvent::Change(ChangeEvent {
        topic: TopicId::from(topic),
        kind: ChangeKind::Update,
        payload: Bytes::from_static(b"{}"),
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn change_bursts_collapse_into_one_invalidate() {
    let (transport, mut server) = MockFeedTransport::channel_pair();
    let (refresh, mut refreshes) = RecordingRefreshSink::channel();
    let (reporter, network) = NetworkSource::manual(NetworkStatus::Offline);

    let handled = Arc::new(AtomicUsize::new(0));
    let handled_in_topic = Arc::clone(&handled);

    let handle = SyncEngine::start(SyncEngineArgs {
        url: "mock://feed".to_string(),
        transport,
        network,
        reachability: Arc::new(StaticReachability(true)),
        lifecycle: None,
        refresh,
        backoff: BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(40)),
        probe: ProbeConfig {
            check_interval: Duration::from_secs(3600),
            check_timeout: Duration::from_secs(1),
        },
        refresh_debounce: Duration::from_millis(50),
    });

    let _signals = handle
        .register_topic(Topic::new("signals").on_change(move |event| {
            assert_eq!(event.topic.as_str(), "signals");
            handled_in_topic.fetch_add(1, Ordering::SeqCst);
        }))
        .await
        .unwrap();
    let _prices = handle.register_topic(Topic::new("prices")).await.unwrap();

    reporter.online();
    ack_subscribes(&mut server, 2).await;
    wait_for(&handle, Duration::from_secs(2), |s| {
        s.channel_status == ChannelStatus::Subscribed && s.active_topics.len() == 2
    })
    .await;

    // Connecting always dispatches one full refresh first.
    assert_eq!(recv_scope(&mut refreshes).await, RefreshScope::Full);

    // A burst of changes on two topics inside one debounce window.
    server.push_event(change("signals")).unwrap();
    server.push_event(change("prices")).unwrap();

    assert_eq!(
        recv_scope(&mut refreshes).await,
        RefreshScope::keys(["prices", "signals"])
    );
    assert!(
        tokio::time::timeout(Duration::from_millis(150), refreshes.recv())
            .await
            .is_err(),
        "burst must produce exactly one invalidate"
    );
    assert_eq!(handled.load(Ordering::SeqCst), 1, "handler runs per change");

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_refresh_absorbs_a_pending_partial_request() {
    let (transport, _server) = MockFeedTransport::channel_pair();
    let (refresh, mut refreshes) = RecordingRefreshSink::channel();
    let (_reporter, network) = NetworkSource::manual(NetworkStatus::Offline);

    let handle = SyncEngine::start(SyncEngineArgs {
        url: "mock://feed".to_string(),
        transport,
        network,
        reachability: Arc::new(StaticReachability(true)),
        lifecycle: None,
        refresh,
        backoff: BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(40)),
        probe: ProbeConfig {
            check_interval: Duration::from_secs(3600),
            check_timeout: Duration::from_secs(1),
        },
        refresh_debounce: Duration::from_millis(50),
    });

    // Engine idle (offline): only explicit requests drive the dispatcher.
    handle
        .request_refresh(RefreshScope::keys(["signals"]))
        .await
        .unwrap();
    handle.request_refresh(RefreshScope::Full).await.unwrap();

    assert_eq!(recv_scope(&mut refreshes).await, RefreshScope::Full);
    assert!(
        tokio::time::timeout(Duration::from_millis(150), refreshes.recv())
            .await
            .is_err(),
        "merged request must invalidate once"
    );

    // An empty key set is itself a full-refresh request.
    handle
        .request_refresh(RefreshScope::keys(Vec::<String>::new()))
        .await
        .unwrap();
    assert_eq!(recv_scope(&mut refreshes).await, RefreshScope::Full);

    handle.shutdown().await;
}
