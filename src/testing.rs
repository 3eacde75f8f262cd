//! Reusable test utilities for exercising the sync engine without a real
//! backend.
//!
//! This module is intended for integration tests in downstream crates that
//! need to drive `SyncEngine` deterministically, including scripted connect
//! failures and server-side feed drops.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::{Sink, Stream};
use tokio::sync::mpsc;

use crate::core::{RefreshHook, RefreshScope, RefreshSink, SyncError, SyncResult};
use crate::probe::ReachabilityCheck;
use crate::transport::{FeedCommand, FeedConnectFuture, FeedEvent, FeedTransport};

struct NewSession {
    command_rx: mpsc::UnboundedReceiver<FeedCommand>,
}

struct MockShared {
    opens: AtomicUsize,
    fail_opens: AtomicUsize,
    open_delay_ms: AtomicU64,
    session: Mutex<Option<NewSession>>,
    event_tx: Mutex<Option<mpsc::UnboundedSender<Result<FeedEvent, SyncError>>>>,
}

/// In-memory feed transport paired with a [`MockFeedServer`] control handle.
///
/// Create both sides with [`MockFeedTransport::channel_pair`]; each successful
/// `open` replaces the server's session wires, so reconnects can be observed
/// connection by connection.
#[derive(Clone)]
pub struct MockFeedTransport {
    shared: Arc<MockShared>,
}

impl MockFeedTransport {
    pub fn channel_pair() -> (Self, MockFeedServer) {
        let shared = Arc::new(MockShared {
            opens: AtomicUsize::new(0),
            fail_opens: AtomicUsize::new(0),
            open_delay_ms: AtomicU64::new(0),
            session: Mutex::new(None),
            event_tx: Mutex::new(None),
        });
        (
            Self {
                shared: Arc::clone(&shared),
            },
            MockFeedServer {
                shared,
                command_rx: None,
            },
        )
    }
}

impl FeedTransport for MockFeedTransport {
    type Events = MockEventStream;
    type Commands = MockCommandSink;

    fn open(&self, _url: String) -> FeedConnectFuture<Self::Events, Self::Commands> {
        let shared = Arc::clone(&self.shared);
        Box::pin(async move {
            shared.opens.fetch_add(1, Ordering::SeqCst);
            let delay = Duration::from_millis(shared.open_delay_ms.load(Ordering::Relaxed));
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let should_fail = shared
                .fail_opens
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if should_fail {
                return Err(SyncError::ConnectionFailed("mock open rejected".to_string()));
            }

            let (event_tx, event_rx) = mpsc::unbounded_channel();
            let (command_tx, command_rx) = mpsc::unbounded_channel();
            *shared.event_tx.lock().expect("mock lock poisoned") = Some(event_tx);
            *shared.session.lock().expect("mock lock poisoned") = Some(NewSession { command_rx });

            Ok((
                MockEventStream { rx: event_rx },
                MockCommandSink { tx: command_tx },
            ))
        })
    }
}

/// Server-side test handle paired with [`MockFeedTransport`].
pub struct MockFeedServer {
    shared: Arc<MockShared>,
    command_rx: Option<mpsc::UnboundedReceiver<FeedCommand>>,
}

impl MockFeedServer {
    /// Number of `open` calls observed, successful or not.
    pub fn open_count(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }

    /// Reject the next `n` open attempts with a connection failure.
    pub fn fail_next_opens(&self, n: usize) {
        self.shared.fail_opens.store(n, Ordering::SeqCst);
    }

    /// Delay every `open` resolution, so tests can interleave events with an
    /// in-flight handshake.
    pub fn set_open_delay(&self, delay: Duration) {
        self.shared
            .open_delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    fn refresh_session(&mut self) {
        if let Some(session) = self.shared.session.lock().expect("mock lock poisoned").take() {
            self.command_rx = Some(session.command_rx);
        }
    }

    /// Receive the next command written by the engine, across reconnects.
    /// Returns `None` when the deadline passes.
    pub async fn recv_command(&mut self, timeout: Duration) -> Option<FeedCommand> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            self.refresh_session();
            if let Some(rx) = self.command_rx.as_mut() {
                match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Ok(Some(command)) => return Some(command),
                    // Engine dropped this connection's sink; wait for the next one.
                    Ok(None) => self.command_rx = None,
                    Err(_) => return None,
                }
            } else if tokio::time::Instant::now() >= deadline {
                return None;
            } else {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    }

    /// Push an event to the engine on the current connection.
    pub fn push_event(&self, event: FeedEvent) -> SyncResult<()> {
        let guard = self.shared.event_tx.lock().expect("mock lock poisoned");
        let Some(tx) = guard.as_ref() else {
            return Err(SyncError::InvalidState("no open mock feed".to_string()));
        };
        tx.send(Ok(event))
            .map_err(|_| SyncError::InvalidState("mock feed receiver dropped".to_string()))
    }

    /// Surface a read failure on the current connection.
    pub fn push_error(&self, error: SyncError) -> SyncResult<()> {
        let guard = self.shared.event_tx.lock().expect("mock lock poisoned");
        let Some(tx) = guard.as_ref() else {
            return Err(SyncError::InvalidState("no open mock feed".to_string()));
        };
        tx.send(Err(error))
            .map_err(|_| SyncError::InvalidState("mock feed receiver dropped".to_string()))
    }

    /// Simulate a server-side socket drop: the engine's event stream ends.
    pub fn drop_feed(&self) {
        *self.shared.event_tx.lock().expect("mock lock poisoned") = None;
    }
}

/// Event side of the mock connection.
pub struct MockEventStream {
    rx: mpsc::UnboundedReceiver<Result<FeedEvent, SyncError>>,
}

impl Stream for MockEventStream {
    type Item = Result<FeedEvent, SyncError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Command side of the mock connection.
pub struct MockCommandSink {
    tx: mpsc::UnboundedSender<FeedCommand>,
}

impl Sink<FeedCommand> for MockCommandSink {
    type Error = SyncError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: FeedCommand) -> Result<(), Self::Error> {
        self.get_mut()
            .tx
            .send(item)
            .map_err(|_| SyncError::TransportError {
                context: "mock_feed_write",
                error: "mock command channel closed".to_string(),
            })
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}

/// Reachability check that always reports the same answer.
#[derive(Clone, Copy, Debug)]
pub struct StaticReachability(pub bool);

impl ReachabilityCheck for StaticReachability {
    fn check(&self) -> Pin<Box<dyn Future<Output = bool> + Send>> {
        let ok = self.0;
        Box::pin(async move { ok })
    }
}

/// Reachability check that counts how often it runs.
pub struct CountingReachability {
    checks: Arc<AtomicUsize>,
    result: bool,
}

impl CountingReachability {
    pub fn new(result: bool) -> Self {
        Self {
            checks: Arc::new(AtomicUsize::new(0)),
            result,
        }
    }

    pub fn counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.checks)
    }
}

impl ReachabilityCheck for CountingReachability {
    fn check(&self) -> Pin<Box<dyn Future<Output = bool> + Send>> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        let ok = self.result;
        Box::pin(async move { ok })
    }
}

/// Refresh sink that records every invalidation it receives.
pub struct RecordingRefreshSink {
    tx: mpsc::UnboundedSender<RefreshScope>,
}

impl RecordingRefreshSink {
    pub fn channel() -> (RefreshHook, mpsc::UnboundedReceiver<RefreshScope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl RefreshSink for RecordingRefreshSink {
    fn invalidate(
        &self,
        scope: RefreshScope,
    ) -> Pin<Box<dyn Future<Output = SyncResult<()>> + Send>> {
        let tx = self.tx.clone();
        Box::pin(async move {
            tx.send(scope)
                .map_err(|_| SyncError::RefreshFailed("recording receiver dropped".to_string()))
        })
    }
}
