use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience result alias for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Canonical error surface shared across the engine.
///
/// Environmental failures (network, transport, backend) never reach callers as
/// errors; they become `ConnectionState`. The variants surfaced through the
/// public API are programmer errors and engine-unavailable conditions.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Subscription failed: {message}, topic={topic}")]
    SubscriptionFailed { topic: String, message: String },

    #[error("Transport error ({context}): {error}")]
    TransportError {
        context: &'static str,
        error: String,
    },

    #[error("Parse failed: {0}")]
    ParseFailed(String),

    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Timeout: {context}")]
    Timeout { context: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Refresh failed: {0}")]
    RefreshFailed(String),

    #[error("Engine unavailable: {0}")]
    EngineUnavailable(String),
}

/// Identifier of a logical subscription (e.g. `"signals"`, `"prices"`).
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicId(String);

impl TopicId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TopicId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TopicId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Server-side description of which changes a topic cares about.
///
/// `source` names the backing collection when it differs from the topic id;
/// `predicate` is an opaque row filter evaluated by the backend.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicFilter {
    pub source: Option<String>,
    pub predicate: Option<String>,
}

/// What happened to a record, as reported by the change feed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    Other,
}

impl ChangeKind {
    pub fn parse(kind: &str) -> Self {
        if kind.eq_ignore_ascii_case("insert") {
            ChangeKind::Insert
        } else if kind.eq_ignore_ascii_case("update") {
            ChangeKind::Update
        } else if kind.eq_ignore_ascii_case("delete") {
            ChangeKind::Delete
        } else {
            ChangeKind::Other
        }
    }
}

/// A single change delivered on a topic. The payload is the raw record as
/// serialized by the backend; consumers parse what they need.
#[derive(Clone, Debug)]
pub struct ChangeEvent {
    pub topic: TopicId,
    pub kind: ChangeKind,
    pub payload: Bytes,
}

/// Per-consumer callback invoked with each change event on a topic.
pub type ChangeHandler = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// A named logical subscription registered by a consumer.
///
/// Multiple consumers may register the same id; the registry coalesces them
/// into one transport subscription and reference-counts the consumers.
#[derive(Clone)]
pub struct Topic {
    id: TopicId,
    filter: TopicFilter,
    refresh_keys: Vec<String>,
    handler: Option<ChangeHandler>,
}

impl Topic {
    /// New topic whose refresh keys default to the topic id itself.
    pub fn new(id: impl Into<TopicId>) -> Self {
        let id = id.into();
        let refresh_keys = vec![id.as_str().to_string()];
        Self {
            id,
            filter: TopicFilter::default(),
            refresh_keys,
            handler: None,
        }
    }

    pub fn with_filter(mut self, filter: TopicFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Resource keys the dispatcher invalidates when this topic changes.
    pub fn with_refresh_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.refresh_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn on_change<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn id(&self) -> &TopicId {
        &self.id
    }

    pub(crate) fn into_parts(self) -> (TopicId, TopicFilter, Vec<String>, Option<ChangeHandler>) {
        (self.id, self.filter, self.refresh_keys, self.handler)
    }
}

/// Proof of a single registration; passing it back unregisters that consumer.
///
/// Deliberately not `Clone`: one handle, one deregistration.
#[derive(Debug)]
pub struct TopicHandle {
    pub(crate) topic: TopicId,
    pub(crate) consumer: u64,
}

impl TopicHandle {
    pub fn topic(&self) -> &TopicId {
        &self.topic
    }
}

/// Which resources a refresh request covers.
///
/// An empty key set is a full refresh, and `Full` absorbs any partial scope it
/// is merged with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefreshScope {
    Full,
    Keys(BTreeSet<String>),
}

impl RefreshScope {
    pub fn keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: BTreeSet<String> = keys.into_iter().map(Into::into).collect();
        if set.is_empty() {
            RefreshScope::Full
        } else {
            RefreshScope::Keys(set)
        }
    }

    pub fn merge(self, other: RefreshScope) -> RefreshScope {
        match (self, other) {
            (RefreshScope::Keys(mut a), RefreshScope::Keys(b)) => {
                a.extend(b);
                RefreshScope::Keys(a)
            }
            _ => RefreshScope::Full,
        }
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        matches!(self, RefreshScope::Full)
    }
}

/// The application's data re-fetch interface.
///
/// Invalidation errors are logged and swallowed by the dispatcher; a later
/// change event or reconnection naturally re-triggers the refetch.
pub trait RefreshSink: Send + Sync + 'static {
    fn invalidate(&self, scope: RefreshScope) -> Pin<Box<dyn Future<Output = SyncResult<()>> + Send>>;
}

/// Convenient alias for passing around boxed refresh sinks.
pub type RefreshHook = Arc<dyn RefreshSink>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_key_set_means_full_refresh() {
        assert!(RefreshScope::keys(Vec::<String>::new()).is_full());
        assert!(!RefreshScope::keys(["signals"]).is_full());
    }

    #[test]
    fn merge_unions_keys_and_full_absorbs() {
        let merged = RefreshScope::keys(["a"]).merge(RefreshScope::keys(["b"]));
        assert_eq!(merged, RefreshScope::keys(["a", "b"]));

        assert!(RefreshScope::keys(["a"]).merge(RefreshScope::Full).is_full());
        assert!(RefreshScope::Full.merge(RefreshScope::keys(["a"])).is_full());
        assert!(RefreshScope::Full.merge(RefreshScope::Full).is_full());
    }

    #[test]
    fn change_kind_parse_is_case_insensitive() {
        assert_eq!(ChangeKind::parse("INSERT"), ChangeKind::Insert);
        assert_eq!(ChangeKind::parse("update"), ChangeKind::Update);
        assert_eq!(ChangeKind::parse("Delete"), ChangeKind::Delete);
        assert_eq!(ChangeKind::parse("truncate"), ChangeKind::Other);
    }

    #[test]
    fn topic_defaults_refresh_keys_to_its_id() {
        let topic = Topic::new("signals");
        let (id, filter, keys, handler) = topic.into_parts();
        assert_eq!(id.as_str(), "signals");
        assert_eq!(filter, TopicFilter::default());
        assert_eq!(keys, vec!["signals".to_string()]);
        assert!(handler.is_none());
    }
}
