use std::future::Future;
use std::pin::Pin;

use futures_util::{Sink, Stream};

use crate::core::{ChangeEvent, SyncError, TopicFilter, TopicId};

pub mod websocket;

/// Boxed connect future returned by feed transports.
pub type FeedConnectFuture<E, C> =
    Pin<Box<dyn Future<Output = Result<(E, C), SyncError>> + Send>>;

/// Transport boundary for the backend change feed.
///
/// The engine is the only caller: it opens at most one connection at a time
/// and owns both halves until the feed is torn down. Implementations can be
/// swapped (reference websocket vs the in-memory mock) while the reconnect
/// logic stays unchanged.
pub trait FeedTransport: Clone + Send + Sync + 'static {
    type Events: Stream<Item = Result<FeedEvent, SyncError>> + Send + Unpin + 'static;
    type Commands: Sink<FeedCommand, Error = SyncError> + Send + Sync + Unpin + 'static;

    fn open(&self, url: String) -> FeedConnectFuture<Self::Events, Self::Commands>;
}

/// Commands the engine issues against an open feed.
#[derive(Clone, Debug, PartialEq)]
pub enum FeedCommand {
    Subscribe {
        request_id: u64,
        topic: TopicId,
        filter: TopicFilter,
    },
    Unsubscribe {
        subscription_id: u64,
    },
}

/// Events surfaced by an open feed. The end of the event stream means the
/// remote closed without a close notice; an `Err` item means the read failed.
#[derive(Clone, Debug)]
pub enum FeedEvent {
    Change(ChangeEvent),
    Subscribed {
        request_id: u64,
        subscription_id: u64,
    },
    SubscribeRejected {
        request_id: u64,
        message: String,
    },
    Closed {
        reason: Option<String>,
    },
}
