//! Connectivity probe: the single source of truth for "is the network up" and
//! "is the backend reachable".
//!
//! Network status comes from a pluggable [`NetworkSource`] the host platform
//! feeds; backend reachability comes from a lightweight periodic check that
//! never errors — failures and timeouts simply report `false`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use kameo::prelude::{Actor, ActorRef, Message as KameoMessage};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::core::{NetworkStatus, SyncError, SyncResult};

/// Probe events delivered into the engine mailbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeEvent {
    Network(NetworkStatus),
    Reachability(bool),
}

/// Timing knobs for the periodic reachability check.
#[derive(Clone, Copy, Debug)]
pub struct ProbeConfig {
    pub check_interval: Duration,
    pub check_timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            check_timeout: Duration::from_secs(5),
        }
    }
}

/// Backend reachability check. Implementations must be infallible: any
/// failure mode is reported as `false`.
pub trait ReachabilityCheck: Send + Sync + 'static {
    fn check(&self) -> Pin<Box<dyn Future<Output = bool> + Send>>;
}

/// Convenient alias for passing around boxed reachability checks.
pub type ReachabilityHook = Arc<dyn ReachabilityCheck>;

/// HEAD request against the backend endpoint.
///
/// Any completed response counts as reachable unless the backend itself is
/// failing (5xx); transport errors and timeouts are `false`.
pub struct HttpReachability {
    client: reqwest::Client,
    url: String,
}

impl HttpReachability {
    pub fn new(url: impl Into<String>, timeout: Duration) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| {
                SyncError::InvalidState(format!("failed to build reachability client: {err}"))
            })?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl ReachabilityCheck for HttpReachability {
    fn check(&self) -> Pin<Box<dyn Future<Output = bool> + Send>> {
        let request = self.client.head(&self.url);
        Box::pin(async move {
            match request.send().await {
                Ok(response) => !response.status().is_server_error(),
                Err(_) => false,
            }
        })
    }
}

/// Host-platform strategy reporting raw network reachability.
pub struct NetworkSource {
    rx: watch::Receiver<NetworkStatus>,
    _keepalive: Option<watch::Sender<NetworkStatus>>,
}

impl NetworkSource {
    /// Channel pair for hosts that bridge their own online/offline
    /// notifications into the engine.
    pub fn manual(initial: NetworkStatus) -> (NetworkReporter, Self) {
        let (tx, rx) = watch::channel(initial);
        (
            NetworkReporter { tx: Arc::new(tx) },
            Self {
                rx,
                _keepalive: None,
            },
        )
    }

    /// For hosts without a native network notifier: the link is assumed up
    /// and the reachability check is the only liveness signal.
    pub fn always_online() -> Self {
        let (tx, rx) = watch::channel(NetworkStatus::Online);
        Self {
            rx,
            _keepalive: Some(tx),
        }
    }

    fn receiver(&self) -> watch::Receiver<NetworkStatus> {
        self.rx.clone()
    }
}

/// Handle the host platform uses to push network transitions.
#[derive(Clone)]
pub struct NetworkReporter {
    tx: Arc<watch::Sender<NetworkStatus>>,
}

impl NetworkReporter {
    pub fn set(&self, status: NetworkStatus) {
        let _ = self.tx.send(status);
    }

    pub fn online(&self) {
        self.set(NetworkStatus::Online);
    }

    pub fn offline(&self) {
        self.set(NetworkStatus::Offline);
    }
}

async fn run_check(check: &dyn ReachabilityCheck, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, check.check())
        .await
        .unwrap_or(false)
}

/// Owns the network watcher and the periodic reachability task for the
/// engine's lifetime; both are released on `stop`.
pub struct ConnectivityProbe {
    config: ProbeConfig,
    check: ReachabilityHook,
    network: NetworkSource,
    watcher_task: Option<JoinHandle<()>>,
    checker_task: Option<JoinHandle<()>>,
}

impl ConnectivityProbe {
    pub fn new(network: NetworkSource, check: ReachabilityHook, config: ProbeConfig) -> Self {
        Self {
            config,
            check,
            network,
            watcher_task: None,
            checker_task: None,
        }
    }

    /// Start both probe tasks, delivering events into the given actor. The
    /// current network status is delivered immediately so the engine never
    /// waits for a transition to learn the initial state.
    pub fn start<A>(&mut self, actor: ActorRef<A>)
    where
        A: Actor + KameoMessage<ProbeEvent>,
    {
        let mut network_rx = self.network.receiver();
        let watcher_actor = actor.clone();
        self.watcher_task = Some(tokio::spawn(async move {
            let mut current = *network_rx.borrow();
            if watcher_actor
                .tell(ProbeEvent::Network(current))
                .send()
                .await
                .is_err()
            {
                return;
            }
            while network_rx.changed().await.is_ok() {
                let next = *network_rx.borrow_and_update();
                if next == current {
                    continue;
                }
                current = next;
                if watcher_actor
                    .tell(ProbeEvent::Network(next))
                    .send()
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }));

        let network_rx = self.network.receiver();
        let check = Arc::clone(&self.check);
        let config = self.config;
        self.checker_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                // Probing an offline device only burns the radio.
                if !network_rx.borrow().is_online() {
                    continue;
                }
                let ok = run_check(check.as_ref(), config.check_timeout).await;
                if actor.tell(ProbeEvent::Reachability(ok)).send().await.is_err() {
                    return;
                }
            }
        }));
    }

    /// One-off reachability check, used when the app returns to foreground
    /// instead of waiting for the next periodic tick.
    pub fn spawn_check<A>(&self, actor: ActorRef<A>) -> JoinHandle<()>
    where
        A: Actor + KameoMessage<ProbeEvent>,
    {
        let check = Arc::clone(&self.check);
        let timeout = self.config.check_timeout;
        tokio::spawn(async move {
            let ok = run_check(check.as_ref(), timeout).await;
            let _ = actor.tell(ProbeEvent::Reachability(ok)).send().await;
        })
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.watcher_task.take() {
            task.abort();
        }
        if let Some(task) = self.checker_task.take() {
            task.abort();
        }
    }
}

impl Drop for ConnectivityProbe {
    fn drop(&mut self) {
        self.stop();
    }
}
