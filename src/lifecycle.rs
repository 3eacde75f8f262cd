//! Lifecycle bridge: adapts host-application signals (app foregrounded or
//! backgrounded, tab visibility) into engine inputs.
//!
//! A backgrounded client's transport connection may be silently dropped by the
//! OS without any close event, so returning to foreground triggers an
//! immediate reachability re-check and an unconditional full refresh.

use kameo::prelude::{Actor, ActorRef, Message as KameoMessage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Host lifecycle transitions relevant to the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    Foregrounded,
    Backgrounded,
}

/// Channel pair connecting the host platform's lifecycle callbacks to the
/// engine.
pub fn lifecycle_channel() -> (LifecycleReporter, LifecycleSource) {
    let (tx, rx) = mpsc::unbounded_channel();
    (LifecycleReporter { tx }, LifecycleSource { rx })
}

/// Handle the host uses to push lifecycle transitions.
#[derive(Clone)]
pub struct LifecycleReporter {
    tx: mpsc::UnboundedSender<LifecycleEvent>,
}

impl LifecycleReporter {
    pub fn foregrounded(&self) {
        let _ = self.tx.send(LifecycleEvent::Foregrounded);
    }

    pub fn backgrounded(&self) {
        let _ = self.tx.send(LifecycleEvent::Backgrounded);
    }
}

/// Receiving side handed to the engine at construction.
pub struct LifecycleSource {
    rx: mpsc::UnboundedReceiver<LifecycleEvent>,
}

/// Forwards lifecycle events into the engine mailbox for the engine's
/// lifetime; released on `stop`.
#[derive(Default)]
pub(crate) struct LifecycleBridge {
    task: Option<JoinHandle<()>>,
}

impl LifecycleBridge {
    pub(crate) fn start<A>(&mut self, mut source: LifecycleSource, actor: ActorRef<A>)
    where
        A: Actor + KameoMessage<LifecycleEvent>,
    {
        self.task = Some(tokio::spawn(async move {
            while let Some(event) = source.rx.recv().await {
                if actor.tell(event).send().await.is_err() {
                    return;
                }
            }
        }));
    }

    pub(crate) fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
