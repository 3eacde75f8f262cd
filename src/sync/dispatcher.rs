use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::warn;

use crate::core::{RefreshHook, RefreshScope};

/// Debounced, deduplicated bridge to the application's data re-fetch layer.
///
/// Requests within the debounce window merge into one pending scope; the first
/// request of a burst schedules a single flush. The dispatcher owns only its
/// timer — refetching itself is delegated to the [`RefreshHook`], and its
/// errors are logged, never retried, so an outage cannot amplify into an
/// unbounded retry queue.
pub struct RefreshDispatcher {
    sink: RefreshHook,
    debounce: Duration,
    pending: Option<RefreshScope>,
    flush_task: Option<JoinHandle<()>>,
    dispatched: u64,
    errors: Arc<AtomicU64>,
}

impl RefreshDispatcher {
    pub fn new(sink: RefreshHook, debounce: Duration) -> Self {
        Self {
            sink,
            debounce,
            pending: None,
            flush_task: None,
            dispatched: 0,
            errors: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Merge a request into the pending scope. `schedule` is invoked with the
    /// debounce delay only when no flush is already scheduled; the returned
    /// handle is kept so teardown can cancel it.
    pub fn request<F>(&mut self, scope: RefreshScope, schedule: F)
    where
        F: FnOnce(Duration) -> JoinHandle<()>,
    {
        self.pending = Some(match self.pending.take() {
            Some(pending) => pending.merge(scope),
            None => scope,
        });
        if self.flush_task.is_none() {
            self.flush_task = Some(schedule(self.debounce));
        }
    }

    /// Debounce timer fired: dispatch the accumulated scope once.
    ///
    /// Returns whether anything was dispatched.
    pub fn flush(&mut self) -> bool {
        self.flush_task = None;
        let Some(scope) = self.pending.take() else {
            return false;
        };

        self.dispatched += 1;
        let sink = Arc::clone(&self.sink);
        let errors = Arc::clone(&self.errors);
        tokio::spawn(async move {
            if let Err(err) = sink.invalidate(scope).await {
                errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %err, "refresh invalidation failed");
            }
        });
        true
    }

    /// Drop the pending scope and cancel any scheduled flush.
    pub fn cancel(&mut self) {
        if let Some(task) = self.flush_task.take() {
            task.abort();
        }
        self.pending = None;
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::mpsc;

    use super::*;
    use crate::core::{RefreshSink, SyncError, SyncResult};

    struct RecordingSink {
        tx: mpsc::UnboundedSender<RefreshScope>,
        fail: bool,
    }

    impl RefreshSink for RecordingSink {
        fn invalidate(
            &self,
            scope: RefreshScope,
        ) -> Pin<Box<dyn Future<Output = SyncResult<()>> + Send>> {
            let tx = self.tx.clone();
            let fail = self.fail;
            Box::pin(async move {
                let _ = tx.send(scope);
                if fail {
                    Err(SyncError::RefreshFailed("sink rejected".to_string()))
                } else {
                    Ok(())
                }
            })
        }
    }

    fn dispatcher(fail: bool) -> (RefreshDispatcher, mpsc::UnboundedReceiver<RefreshScope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            RefreshDispatcher::new(Arc::new(RecordingSink { tx, fail }), Duration::from_millis(50)),
            rx,
        )
    }

    fn noop_schedule(_: Duration) -> JoinHandle<()> {
        tokio::spawn(async {})
    }

    #[tokio::test]
    async fn burst_requests_merge_into_one_flush() {
        let (mut dispatcher, mut rx) = dispatcher(false);
        let schedules = Arc::new(AtomicUsize::new(0));

        for keys in [["signals"], ["prices"]] {
            let schedules = Arc::clone(&schedules);
            dispatcher.request(RefreshScope::keys(keys), move |_| {
                schedules.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async {})
            });
        }

        assert_eq!(schedules.load(Ordering::SeqCst), 1, "one flush per burst");
        assert!(dispatcher.flush());
        assert_eq!(
            rx.recv().await,
            Some(RefreshScope::keys(["signals", "prices"]))
        );
        assert_eq!(dispatcher.dispatched(), 1);
    }

    #[tokio::test]
    async fn full_refresh_absorbs_pending_partial_request() {
        let (mut dispatcher, mut rx) = dispatcher(false);
        dispatcher.request(RefreshScope::keys(["signals"]), noop_schedule);
        dispatcher.request(RefreshScope::Full, noop_schedule);

        assert!(dispatcher.flush());
        assert_eq!(rx.recv().await, Some(RefreshScope::Full));
    }

    #[tokio::test]
    async fn flush_without_pending_is_a_no_op() {
        let (mut dispatcher, _rx) = dispatcher(false);
        assert!(!dispatcher.flush());
        assert_eq!(dispatcher.dispatched(), 0);
    }

    #[tokio::test]
    async fn cancel_drops_pending_scope() {
        let (mut dispatcher, _rx) = dispatcher(false);
        dispatcher.request(RefreshScope::Full, noop_schedule);
        dispatcher.cancel();
        assert!(!dispatcher.flush());
    }

    #[tokio::test]
    async fn sink_errors_are_counted_not_propagated() {
        let (mut dispatcher, mut rx) = dispatcher(true);
        dispatcher.request(RefreshScope::Full, noop_schedule);
        assert!(dispatcher.flush());

        assert_eq!(rx.recv().await, Some(RefreshScope::Full));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(dispatcher.errors(), 1);
    }
}
