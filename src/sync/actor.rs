//! The reconnection controller.
//!
//! One kameo actor owns the change-feed connection, the `ConnectionState`
//! snapshot and every retry timer; probe, lifecycle and transport events all
//! funnel through its mailbox, so transitions are atomic with respect to each
//! other. Async completions carry the connection generation (or retry epoch)
//! they belong to and are dropped when a newer event superseded them — an
//! `opened` that lands after the network went offline closes itself instead of
//! reporting `Subscribed`.

use std::time::{Duration, SystemTime};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use kameo::prelude::{Actor, ActorRef, Context, Message as KameoMessage, WeakActorRef};

use crate::core::{
    BackoffPolicy, ChannelStatus, ConnectionState, FeedDisconnectCause, NetworkStatus,
    RefreshHook, RefreshScope, SyncError, SyncResult, SyncStats, SyncStatsSnapshot, Topic,
    TopicHandle, TopicId, TopicRegistry, UnregisterOutcome,
};
use crate::lifecycle::{LifecycleBridge, LifecycleEvent, LifecycleSource};
use crate::probe::{ConnectivityProbe, NetworkSource, ProbeConfig, ProbeEvent, ReachabilityHook};
use crate::sync::dispatcher::RefreshDispatcher;
use crate::sync::handle::SyncHandle;
use crate::transport::{FeedCommand, FeedEvent, FeedTransport};

/// Arguments passed when constructing a sync engine instance.
pub struct SyncEngineArgs<T>
where
    T: FeedTransport,
{
    pub url: String,
    pub transport: T,
    pub network: NetworkSource,
    pub reachability: ReachabilityHook,
    pub lifecycle: Option<LifecycleSource>,
    pub refresh: RefreshHook,
    pub backoff: BackoffPolicy,
    pub probe: ProbeConfig,
    pub refresh_debounce: Duration,
}

/// The consolidated realtime engine actor.
pub struct SyncEngine<T>
where
    T: FeedTransport,
{
    url: String,
    transport: T,
    backoff: BackoffPolicy,
    registry: TopicRegistry,
    dispatcher: RefreshDispatcher,
    probe: ConnectivityProbe,
    lifecycle: LifecycleBridge,
    stats: SyncStats,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    actor_ref: ActorRef<Self>,
    /// Bumped whenever the connection is torn down; async completions carrying
    /// an older generation are stale.
    generation: u64,
    /// Bumped whenever the retry timer is canceled; fired timers from an older
    /// epoch are stale.
    retry_epoch: u64,
    commands: Option<T::Commands>,
    open_task: Option<JoinHandle<()>>,
    reader_task: Option<JoinHandle<()>>,
    retry_timer: Option<JoinHandle<()>>,
}

impl<T> SyncEngine<T>
where
    T: FeedTransport,
{
    /// Spawn the engine and return the handle consumers use.
    pub fn start(args: SyncEngineArgs<T>) -> SyncHandle<T> {
        let (state_tx, state_rx) = watch::channel(ConnectionState::default());
        let actor = SyncEngine::spawn((args, state_tx));
        SyncHandle::new(actor, state_rx)
    }
}

impl<T> Actor for SyncEngine<T>
where
    T: FeedTransport,
{
    type Args = (SyncEngineArgs<T>, watch::Sender<ConnectionState>);
    type Error = SyncError;

    fn name() -> &'static str {
        "SyncEngine"
    }

    async fn on_start(args: Self::Args, ctx: ActorRef<Self>) -> SyncResult<Self> {
        let (
            SyncEngineArgs {
                url,
                transport,
                network,
                reachability,
                lifecycle,
                refresh,
                backoff,
                probe: probe_config,
                refresh_debounce,
            },
            state_tx,
        ) = args;

        let mut probe = ConnectivityProbe::new(network, reachability, probe_config);
        probe.start(ctx.clone());

        let mut bridge = LifecycleBridge::default();
        if let Some(source) = lifecycle {
            bridge.start(source, ctx.clone());
        }

        Ok(Self {
            url,
            transport,
            backoff,
            registry: TopicRegistry::new(),
            dispatcher: RefreshDispatcher::new(refresh, refresh_debounce),
            probe,
            lifecycle: bridge,
            stats: SyncStats::new(),
            state: ConnectionState::default(),
            state_tx,
            actor_ref: ctx,
            generation: 0,
            retry_epoch: 0,
            commands: None,
            open_task: None,
            reader_task: None,
            retry_timer: None,
        })
    }

    async fn on_stop(
        &mut self,
        _ctx: WeakActorRef<Self>,
        _reason: kameo::error::ActorStopReason,
    ) -> SyncResult<()> {
        self.cancel_retry();
        self.dispatcher.cancel();
        self.probe.stop();
        self.lifecycle.stop();
        if self.has_connection() {
            self.stats.record_disconnect(&FeedDisconnectCause::Shutdown);
        }
        self.teardown_connection();
        self.state.channel_status = ChannelStatus::Disconnected;
        self.publish();
        Ok(())
    }

    fn on_panic(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        err: kameo::prelude::PanicError,
    ) -> impl std::future::Future<
        Output = Result<std::ops::ControlFlow<kameo::prelude::ActorStopReason>, Self::Error>,
    > + Send {
        async move {
            tracing::error!(error = ?err, "SyncEngine panicked");
            Ok(std::ops::ControlFlow::Break(
                kameo::prelude::ActorStopReason::Panicked(err),
            ))
        }
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Manual retry: cancels any pending backoff timer and re-attempts
/// immediately without resetting the attempt counter.
pub struct RetryConnection;

/// Explicit refresh request from a consumer.
pub struct RequestRefresh(pub RefreshScope);

/// Register a consumer for a topic.
pub struct RegisterTopic(pub Topic);

/// Remove one consumer registration.
pub struct UnregisterTopic(pub TopicHandle);

/// Snapshot of engine activity counters.
pub struct GetSyncStats;

pub(crate) struct FeedOpened<T: FeedTransport> {
    pub(crate) generation: u64,
    pub(crate) events: T::Events,
    pub(crate) commands: T::Commands,
}

pub(crate) struct FeedFailed {
    pub(crate) generation: u64,
    pub(crate) error: String,
}

pub(crate) struct FeedSignal {
    pub(crate) generation: u64,
    pub(crate) event: FeedEvent,
}

pub(crate) struct FeedLost {
    pub(crate) generation: u64,
    pub(crate) cause: FeedDisconnectCause,
}

pub(crate) struct RetryTimerFired {
    pub(crate) epoch: u64,
}

pub(crate) struct TopicRetry {
    pub(crate) topic: TopicId,
    pub(crate) generation: u64,
}

pub(crate) struct FlushRefresh;

impl<T> KameoMessage<ProbeEvent> for SyncEngine<T>
where
    T: FeedTransport,
{
    type Reply = ();

    async fn handle(&mut self, event: ProbeEvent, _ctx: &mut Context<Self, Self::Reply>) {
        match event {
            ProbeEvent::Network(status) => self.handle_network_changed(status),
            ProbeEvent::Reachability(ok) => {
                if self.state.backend_reachable != ok {
                    debug!(reachable = ok, "backend reachability changed");
                    self.state.backend_reachable = ok;
                    self.publish();
                }
            }
        }
    }
}

impl<T> KameoMessage<LifecycleEvent> for SyncEngine<T>
where
    T: FeedTransport,
{
    type Reply = ();

    async fn handle(&mut self, event: LifecycleEvent, _ctx: &mut Context<Self, Self::Reply>) {
        match event {
            LifecycleEvent::Foregrounded => {
                self.stats.record_foreground();
                // Re-check reachability now instead of waiting for the next tick.
                let _ = self.probe.spawn_check(self.actor_ref.clone());

                if self.state.channel_status != ChannelStatus::Subscribed {
                    info!("app foregrounded while not subscribed, forcing reconnect");
                    self.cancel_retry();
                    if self.has_connection() {
                        self.stats
                            .record_disconnect(&FeedDisconnectCause::Foregrounded);
                    }
                    self.teardown_connection();
                    self.state.channel_status = ChannelStatus::Disconnected;
                    if self.state.network.is_online() {
                        self.begin_connect();
                    }
                }

                // Missed-event detection during background periods cannot be
                // trusted, even when the state still claims subscribed.
                self.request_refresh(RefreshScope::Full);
                self.publish();
            }
            LifecycleEvent::Backgrounded => {
                self.stats.record_background();
                debug!("app backgrounded");
            }
        }
    }
}

impl<T> KameoMessage<RetryConnection> for SyncEngine<T>
where
    T: FeedTransport,
{
    type Reply = ();

    async fn handle(&mut self, _msg: RetryConnection, _ctx: &mut Context<Self, Self::Reply>) {
        self.cancel_retry();
        match self.state.channel_status {
            // Single-flight: nothing to retry while connecting or live.
            ChannelStatus::Connecting | ChannelStatus::Subscribed => {}
            ChannelStatus::Disconnected | ChannelStatus::Error => {
                if self.state.network.is_online() {
                    info!(attempt = self.state.attempt, "manual retry requested");
                    self.begin_connect();
                    self.publish();
                }
            }
        }
    }
}

impl<T> KameoMessage<RequestRefresh> for SyncEngine<T>
where
    T: FeedTransport,
{
    type Reply = ();

    async fn handle(&mut self, msg: RequestRefresh, _ctx: &mut Context<Self, Self::Reply>) {
        self.request_refresh(msg.0);
    }
}

impl<T> KameoMessage<RegisterTopic> for SyncEngine<T>
where
    T: FeedTransport,
{
    type Reply = SyncResult<TopicHandle>;

    async fn handle(
        &mut self,
        msg: RegisterTopic,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let (handle, newly_added) = self.registry.register(msg.0)?;
        if newly_added && self.commands.is_some() {
            let topic = handle.topic().clone();
            if let Err(err) = self.issue_subscribe(&topic).await {
                self.handle_feed_lost(FeedDisconnectCause::CommandFailed {
                    error: err.to_string(),
                })
                .await;
            }
        }
        Ok(handle)
    }
}

impl<T> KameoMessage<UnregisterTopic> for SyncEngine<T>
where
    T: FeedTransport,
{
    type Reply = ();

    async fn handle(&mut self, msg: UnregisterTopic, _ctx: &mut Context<Self, Self::Reply>) {
        let handle = msg.0;
        match self.registry.unregister(&handle) {
            UnregisterOutcome::Removed { subscription_id } => {
                self.state.active_topics.remove(handle.topic());
                if let Some(subscription_id) = subscription_id {
                    self.send_unsubscribe(subscription_id).await;
                }
                self.publish();
            }
            UnregisterOutcome::Retained => {}
            UnregisterOutcome::Unknown => {
                debug!(topic = %handle.topic(), "unregister for unknown handle");
            }
        }
    }
}

impl<T> KameoMessage<GetSyncStats> for SyncEngine<T>
where
    T: FeedTransport,
{
    type Reply = SyncStatsSnapshot;

    async fn handle(
        &mut self,
        _msg: GetSyncStats,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.stats
            .snapshot(self.dispatcher.dispatched(), self.dispatcher.errors())
    }
}

impl<T> KameoMessage<FeedOpened<T>> for SyncEngine<T>
where
    T: FeedTransport,
{
    type Reply = ();

    async fn handle(&mut self, msg: FeedOpened<T>, _ctx: &mut Context<Self, Self::Reply>) {
        if msg.generation != self.generation || !self.state.network.is_online() {
            // Superseded while the handshake was in flight: close, never surface.
            debug!("discarding stale feed connection");
            tokio::spawn(close_commands(msg.commands));
            return;
        }

        self.open_task = None;
        self.commands = Some(msg.commands);
        self.spawn_reader(msg.events);

        self.state.channel_status = ChannelStatus::Subscribed;
        self.state.attempt = 0;
        self.state.last_connected_at = Some(SystemTime::now());
        self.stats.record_connected();
        info!(topics = self.registry.len(), "change feed connected");
        self.publish();

        if let Err(err) = self.resubscribe_all().await {
            self.handle_feed_lost(FeedDisconnectCause::CommandFailed {
                error: err.to_string(),
            })
            .await;
            return;
        }

        // Events may have been missed while disconnected.
        self.request_refresh(RefreshScope::Full);
    }
}

impl<T> KameoMessage<FeedFailed> for SyncEngine<T>
where
    T: FeedTransport,
{
    type Reply = ();

    async fn handle(&mut self, msg: FeedFailed, _ctx: &mut Context<Self, Self::Reply>) {
        if msg.generation != self.generation {
            return;
        }
        self.open_task = None;
        self.handle_feed_lost(FeedDisconnectCause::HandshakeFailed { message: msg.error })
            .await;
    }
}

impl<T> KameoMessage<FeedSignal> for SyncEngine<T>
where
    T: FeedTransport,
{
    type Reply = ();

    async fn handle(&mut self, msg: FeedSignal, _ctx: &mut Context<Self, Self::Reply>) {
        if msg.generation != self.generation {
            return;
        }
        match msg.event {
            FeedEvent::Change(change) => {
                self.stats.record_change();
                let consumers = self.registry.dispatch(&change);
                if consumers == 0 {
                    debug!(topic = %change.topic, "change event for unregistered topic");
                }
                if let Some(scope) = self.registry.refresh_scope_for(&change.topic) {
                    self.request_refresh(scope);
                }
            }
            FeedEvent::Subscribed {
                request_id,
                subscription_id,
            } => match self.registry.confirm_subscribe(request_id, subscription_id) {
                Some(topic) => {
                    debug!(topic = %topic, subscription_id, "topic subscribed");
                    self.state.active_topics.insert(topic);
                    self.publish();
                }
                None => {
                    // Consumer unregistered while the ack was in flight; the
                    // backend still holds a subscription nobody wants.
                    self.send_unsubscribe(subscription_id).await;
                }
            },
            FeedEvent::SubscribeRejected {
                request_id,
                message,
            } => {
                self.handle_subscribe_rejected(request_id, message);
            }
            FeedEvent::Closed { reason } => {
                self.handle_feed_lost(FeedDisconnectCause::RemoteClosed { reason })
                    .await;
            }
        }
    }
}

impl<T> KameoMessage<FeedLost> for SyncEngine<T>
where
    T: FeedTransport,
{
    type Reply = ();

    async fn handle(&mut self, msg: FeedLost, _ctx: &mut Context<Self, Self::Reply>) {
        if msg.generation != self.generation {
            return;
        }
        self.handle_feed_lost(msg.cause).await;
    }
}

impl<T> KameoMessage<RetryTimerFired> for SyncEngine<T>
where
    T: FeedTransport,
{
    type Reply = ();

    async fn handle(&mut self, msg: RetryTimerFired, _ctx: &mut Context<Self, Self::Reply>) {
        if msg.epoch != self.retry_epoch {
            return;
        }
        self.retry_timer = None;
        // Resumption while offline is driven by the online transition instead.
        if !self.state.network.is_online() {
            return;
        }
        self.begin_connect();
        self.publish();
    }
}

impl<T> KameoMessage<TopicRetry> for SyncEngine<T>
where
    T: FeedTransport,
{
    type Reply = ();

    async fn handle(&mut self, msg: TopicRetry, _ctx: &mut Context<Self, Self::Reply>) {
        if msg.generation != self.generation {
            return;
        }
        if !self.registry.take_backoff(&msg.topic) {
            return;
        }
        if self.commands.is_some() {
            if let Err(err) = self.issue_subscribe(&msg.topic).await {
                self.handle_feed_lost(FeedDisconnectCause::CommandFailed {
                    error: err.to_string(),
                })
                .await;
            }
        }
    }
}

impl<T> KameoMessage<FlushRefresh> for SyncEngine<T>
where
    T: FeedTransport,
{
    type Reply = ();

    async fn handle(&mut self, _msg: FlushRefresh, _ctx: &mut Context<Self, Self::Reply>) {
        self.dispatcher.flush();
    }
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

impl<T> SyncEngine<T>
where
    T: FeedTransport,
{
    fn publish(&mut self) {
        let next = self.state.clone();
        self.state_tx.send_if_modified(move |current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn handle_network_changed(&mut self, status: NetworkStatus) {
        if status == self.state.network {
            return;
        }
        self.state.network = status;
        if status.is_online() {
            info!("network online");
            if self.state.channel_status == ChannelStatus::Disconnected {
                self.state.attempt = 0;
                self.begin_connect();
            }
        } else {
            info!("network offline, closing change feed");
            self.cancel_retry();
            if self.has_connection() {
                self.stats.record_disconnect(&FeedDisconnectCause::NetworkLost);
            }
            self.teardown_connection();
            self.state.channel_status = ChannelStatus::Disconnected;
        }
        self.publish();
    }

    fn has_connection(&self) -> bool {
        self.open_task.is_some() || self.commands.is_some()
    }

    /// Open the transport connection unless one is already connecting or open.
    fn begin_connect(&mut self) {
        if !self.state.network.is_online() {
            return;
        }
        if self.open_task.is_some() || self.commands.is_some() {
            return;
        }

        self.state.channel_status = ChannelStatus::Connecting;
        let generation = self.generation;
        let transport = self.transport.clone();
        let url = self.url.clone();
        let actor_ref = self.actor_ref.clone();
        self.open_task = Some(tokio::spawn(async move {
            match transport.open(url).await {
                Ok((events, commands)) => {
                    let _ = actor_ref
                        .tell(FeedOpened::<T> {
                            generation,
                            events,
                            commands,
                        })
                        .send()
                        .await;
                }
                Err(err) => {
                    let _ = actor_ref
                        .tell(FeedFailed {
                            generation,
                            error: err.to_string(),
                        })
                        .send()
                        .await;
                }
            }
        }));
    }

    fn spawn_reader(&mut self, events: T::Events) {
        let actor_ref = self.actor_ref.clone();
        let generation = self.generation;
        let mut events = events;
        self.reader_task = Some(tokio::spawn(async move {
            loop {
                match events.next().await {
                    Some(Ok(event)) => {
                        if actor_ref
                            .tell(FeedSignal { generation, event })
                            .send()
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Some(Err(err)) => {
                        let _ = actor_ref
                            .tell(FeedLost {
                                generation,
                                cause: FeedDisconnectCause::ReadFailure {
                                    error: err.to_string(),
                                },
                            })
                            .send()
                            .await;
                        return;
                    }
                    None => {
                        let _ = actor_ref
                            .tell(FeedLost {
                                generation,
                                cause: FeedDisconnectCause::RemoteClosed { reason: None },
                            })
                            .send()
                            .await;
                        return;
                    }
                }
            }
        }));
    }

    /// Release every connection-scoped resource and invalidate in-flight work.
    fn teardown_connection(&mut self) {
        if let Some(task) = self.open_task.take() {
            task.abort();
        }
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        if let Some(commands) = self.commands.take() {
            tokio::spawn(close_commands(commands));
        }
        self.registry.reset_links();
        self.state.active_topics.clear();
        self.generation = self.generation.wrapping_add(1);
    }

    async fn handle_feed_lost(&mut self, cause: FeedDisconnectCause) {
        self.teardown_connection();
        self.stats.record_disconnect(&cause);

        if !self.state.network.is_online() {
            self.state.channel_status = ChannelStatus::Disconnected;
            self.publish();
            return;
        }

        self.state.channel_status = ChannelStatus::Error;
        self.state.attempt = self.state.attempt.saturating_add(1);
        let delay = self.backoff.delay(self.state.attempt);
        warn!(
            attempt = self.state.attempt,
            delay_ms = delay.as_millis() as u64,
            cause = cause.label(),
            detail = cause.detail().unwrap_or(""),
            "change feed lost, retrying after backoff"
        );
        self.schedule_retry(delay);
        self.publish();
    }

    fn schedule_retry(&mut self, delay: Duration) {
        self.cancel_retry();
        let epoch = self.retry_epoch;
        let actor_ref = self.actor_ref.clone();
        self.retry_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = actor_ref.tell(RetryTimerFired { epoch }).send().await;
        }));
    }

    fn cancel_retry(&mut self) {
        self.retry_epoch = self.retry_epoch.wrapping_add(1);
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
    }

    /// Re-issue a subscribe for every queued topic, exactly once per topic.
    async fn resubscribe_all(&mut self) -> SyncResult<()> {
        for topic in self.registry.idle_topics() {
            self.issue_subscribe(&topic).await?;
        }
        Ok(())
    }

    async fn issue_subscribe(&mut self, topic: &TopicId) -> SyncResult<()> {
        let Some((request_id, filter)) = self.registry.begin_subscribe(topic) else {
            return Ok(());
        };
        let Some(commands) = self.commands.as_mut() else {
            return Ok(());
        };
        debug!(topic = %topic, request_id, "subscribing");
        commands
            .send(FeedCommand::Subscribe {
                request_id,
                topic: topic.clone(),
                filter,
            })
            .await
    }

    fn handle_subscribe_rejected(&mut self, request_id: u64, message: String) {
        let Some((topic, failures)) = self.registry.fail_subscribe(request_id) else {
            return;
        };
        self.stats.record_subscribe_failure();
        let delay = self.backoff.delay(failures);
        warn!(
            topic = %topic,
            attempt = failures,
            delay_ms = delay.as_millis() as u64,
            message = %message,
            "topic subscription rejected, retrying after backoff"
        );

        let generation = self.generation;
        let actor_ref = self.actor_ref.clone();
        let retry_topic = topic.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = actor_ref
                .tell(TopicRetry {
                    topic: retry_topic,
                    generation,
                })
                .send()
                .await;
        });
        self.registry.set_backoff(&topic, timer);
    }

    /// Fire-and-forget: the connection may already be dead, in which case the
    /// reader notices before we do.
    async fn send_unsubscribe(&mut self, subscription_id: u64) {
        let Some(commands) = self.commands.as_mut() else {
            return;
        };
        if let Err(err) = commands
            .send(FeedCommand::Unsubscribe { subscription_id })
            .await
        {
            warn!(subscription_id, error = %err, "unsubscribe failed");
        }
    }

    fn request_refresh(&mut self, scope: RefreshScope) {
        let actor_ref = self.actor_ref.clone();
        self.dispatcher.request(scope, move |delay| {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = actor_ref.tell(FlushRefresh).send().await;
            })
        });
    }
}

async fn close_commands<C>(mut commands: C)
where
    C: futures_util::Sink<FeedCommand, Error = SyncError> + Unpin + Send + 'static,
{
    let _ = commands.close().await;
}
