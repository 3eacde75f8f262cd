use std::sync::Arc;
use std::time::{Duration, Instant};

use realtime_sync::core::{
    BackoffPolicy, ChannelStatus, ConnectionState, NetworkStatus, SyncError, Topic, TopicFilter,
};
use realtime_sync::probe::{NetworkSource, ProbeConfig};
use realtime_sync::sync::{SyncEngine, SyncEngineArgs, SyncHandle};
use realtime_sync::testing::{MockFeedTransport, MockFeedServer, RecordingRefreshSink, StaticReachability};
use realtime_sync::transport::{FeedCommand, FeedEvent, FeedTransport};

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

fn start_engine(
    transport: MockFeedTransport,
) -> (
    SyncHandle<MockFeedTransport>,
    realtime_sync::probe::NetworkReporter,
) {
    let (refresh, _refreshes) = RecordingRefreshSink::channel();
    let (reporter, network) = NetworkSource::manual(NetworkStatus::Offline);
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
        refresh_debounce: Duration::from_millis(20),
    });
    (handle, reporter)
}

async fn expect_subscribe(server: &mut MockFeedServer, topic: &str) -> u64 {
    match server.recv_command(Duration::from_secs(2)).await {
        Some(FeedCommand::Subscribe {
            request_id,
            topic: got,
            ..
        }) => {
            assert_eq!(got.as_str(), topic);
            request_id
        }
        other => panic!("expected subscribe for {topic}, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn five_consumers_before_open_yield_one_subscribe() {
    let (transport, mut server) = MockFeedTransport::channel_pair();
    let (handle, reporter) = start_engine(transport);

    let mut handles = Vec::new();
    for _ in 0..5 {
        handles.push(handle.register_topic(Topic::new("signals")).await.unwrap());
    }

    reporter.online();

    let request_id = expect_subscribe(&mut server, "signals").await;
    server
        .push_event(FeedEvent::Subscribed {
            request_id,
            subscription_id: 7,
        })
        .unwrap();

    wait_for(&handle, Duration::from_secs(2), |s| {
        s.channel_status == ChannelStatus::Subscribed && !s.active_topics.is_empty()
    })
    .await;

    assert!(
        server.recv_command(Duration::from_millis(150)).await.is_none(),
        "coalesced consumers must produce exactly one subscribe"
    );

    // Non-last consumers leaving must not touch the transport.
    for handle_to_drop in handles.drain(..4) {
        handle.unregister_topic(handle_to_drop).await.unwrap();
    }
    assert!(
        server.recv_command(Duration::from_millis(150)).await.is_none(),
        "unregistering a non-last consumer triggers no unsubscribe"
    );

    // The last one releases the transport subscription.
    let last = handles.pop().unwrap();
    handle.unregister_topic(last).await.unwrap();
    match server.recv_command(Duration::from_secs(2)).await {
        Some(FeedCommand::Unsubscribe { subscription_id }) => assert_eq!(subscription_id, 7),
        other => panic!("expected unsubscribe, got {other:?}"),
    }
    assert!(
        server.recv_command(Duration::from_millis(150)).await.is_none(),
        "exactly one unsubscribe for the last consumer"
    );

    let state = handle.snapshot();
    assert!(state.active_topics.is_empty());

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn registering_while_subscribed_issues_the_subscribe_immediately() {
    let (transport, mut server) = MockFeedTransport::channel_pair();
    let (handle, reporter) = start_engine(transport);

    reporter.online();
    wait_for(&handle, Duration::from_secs(2), |s| {
        s.channel_status == ChannelStatus::Subscribed
    })
    .await;

    let _topic = handle.register_topic(Topic::new("prices")).await.unwrap();
    let request_id = expect_subscribe(&mut server, "prices").await;
    server
        .push_event(FeedEvent::Subscribed {
            request_id,
            subscription_id: 11,
        })
        .unwrap();

    wait_for(&handle, Duration::from_secs(2), |s| {
        s.active_topics.iter().any(|t| t.as_str() == "prices")
    })
    .await;

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_registrations_surface_programmer_errors() {
    let (transport, _server) = MockFeedTransport::channel_pair();
    let (handle, _reporter) = start_engine(transport);

    assert!(matches!(
        handle.register_topic(Topic::new("")).await,
        Err(SyncError::InvalidTopic(_))
    ));

    let _first = handle.register_topic(Topic::new("signals")).await.unwrap();
    let conflicting = Topic::new("signals").with_filter(TopicFilter {
        source: Some("signal_rows".to_string()),
        predicate: None,
    });
    assert!(matches!(
        handle.register_topic(conflicting).await,
        Err(SyncError::InvalidTopic(_))
    ));

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_subscription_retries_alone_without_dropping_the_feed() {
    let (transport, mut server) = MockFeedTransport::channel_pair();
    let (handle, reporter) = start_engine(transport);

    let _signals = handle.register_topic(Topic::new("signals")).await.unwrap();
    let _prices = handle.register_topic(Topic::new("prices")).await.unwrap();
    reporter.online();

    // Reject one topic, accept the other.
    let mut rejected_topic = None;
    for _ in 0..2 {
        match server.recv_command(Duration::from_secs(2)).await {
            Some(FeedCommand::Subscribe {
                request_id, topic, ..
            }) => {
                if rejected_topic.is_none() {
                    rejected_topic = Some(topic.clone());
                    server
                        .push_event(FeedEvent::SubscribeRejected {
                            request_id,
                            message: "not authorized yet".to_string(),
                        })
                        .unwrap();
                } else {
                    server
                        .push_event(FeedEvent::Subscribed {
                            request_id,
                            subscription_id: request_id,
                        })
                        .unwrap();
                }
            }
            other => panic!("expected subscribe, got {other:?}"),
        }
    }
    let rejected_topic = rejected_topic.unwrap();

    // The connection stays up with the accepted topic active.
    let state = wait_for(&handle, Duration::from_secs(2), |s| {
        s.channel_status == ChannelStatus::Subscribed && s.active_topics.len() == 1
    })
    .await;
    assert!(!state.active_topics.contains(&rejected_topic));

    // The rejected topic retries by itself on the same connection.
    match server.recv_command(Duration::from_secs(2)).await {
        Some(FeedCommand::Subscribe {
            request_id, topic, ..
        }) => {
            assert_eq!(topic, rejected_topic);
            server
                .push_event(FeedEvent::Subscribed {
                    request_id,
                    subscription_id: request_id,
                })
                .unwrap();
        }
        other => panic!("expected scoped retry subscribe, got {other:?}"),
    }

    wait_for(&handle, Duration::from_secs(2), |s| s.active_topics.len() == 2).await;
    assert_eq!(server.open_count(), 1, "rejection must not tear down the feed");

    handle.shutdown().await;
}
