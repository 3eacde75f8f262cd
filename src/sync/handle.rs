use kameo::error::SendError;
use kameo::prelude::ActorRef;
use tokio::sync::watch;

use crate::core::{
    ConnectionState, RefreshScope, SyncError, SyncResult, SyncStatsSnapshot, Topic, TopicHandle,
};
use crate::sync::actor::{
    GetSyncStats, RegisterTopic, RequestRefresh, RetryConnection, SyncEngine, UnregisterTopic,
};
use crate::transport::FeedTransport;

/// Connection status API handed to UI-layer callers.
///
/// Snapshots are always current; `watch_state` is the push-notification
/// equivalent of an `on_state_change` listener — dropping the receiver
/// unsubscribes.
pub struct SyncHandle<T>
where
    T: FeedTransport,
{
    actor: ActorRef<SyncEngine<T>>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl<T> Clone for SyncHandle<T>
where
    T: FeedTransport,
{
    fn clone(&self) -> Self {
        Self {
            actor: self.actor.clone(),
            state_rx: self.state_rx.clone(),
        }
    }
}

fn engine_unavailable() -> SyncError {
    SyncError::EngineUnavailable("sync engine is not running".to_string())
}

impl<T> SyncHandle<T>
where
    T: FeedTransport,
{
    pub(crate) fn new(
        actor: ActorRef<SyncEngine<T>>,
        state_rx: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self { actor, state_rx }
    }

    /// Current connection state, synchronously.
    pub fn snapshot(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Watch channel notified on every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Register a consumer for live updates on a topic.
    pub async fn register_topic(&self, topic: Topic) -> SyncResult<TopicHandle> {
        match self.actor.ask(RegisterTopic(topic)).await {
            Ok(handle) => Ok(handle),
            Err(SendError::HandlerError(err)) => Err(err),
            Err(_) => Err(engine_unavailable()),
        }
    }

    /// Drop one registration; the transport unsubscribes when the last
    /// consumer of the topic is gone.
    pub async fn unregister_topic(&self, handle: TopicHandle) -> SyncResult<()> {
        self.actor
            .tell(UnregisterTopic(handle))
            .send()
            .await
            .map_err(|_| engine_unavailable())
    }

    /// User-triggered reconnect; pending backoff is skipped but the attempt
    /// counter is preserved.
    pub async fn retry_connection(&self) -> SyncResult<()> {
        self.actor
            .tell(RetryConnection)
            .send()
            .await
            .map_err(|_| engine_unavailable())
    }

    /// Ask the data layer to refetch the given resources (coalesced with any
    /// other requests inside the debounce window).
    pub async fn request_refresh(&self, scope: RefreshScope) -> SyncResult<()> {
        self.actor
            .tell(RequestRefresh(scope))
            .send()
            .await
            .map_err(|_| engine_unavailable())
    }

    /// Engine activity counters.
    pub async fn stats(&self) -> SyncResult<SyncStatsSnapshot> {
        self.actor
            .ask(GetSyncStats)
            .await
            .map_err(|_| engine_unavailable())
    }

    /// Stop the engine, canceling every pending timer and closing the feed.
    pub async fn shutdown(self) {
        let _ = self.actor.stop_gracefully().await;
        self.actor.wait_for_shutdown().await;
    }
}
